//! Errors raised while encoding, decoding or validating MQTT data.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    #[error("remaining length {0} exceeds the protocol maximum")]
    PayloadTooLong(usize),

    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },

    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),

    #[error("invalid header flags {flags:#06b} for {packet}")]
    InvalidFlags { packet: &'static str, flags: u8 },

    #[error("invalid QoS {0}")]
    InvalidQoS(u8),

    #[error("invalid connect flags {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("invalid connect return code {0}")]
    InvalidConnectReturnCode(u8),

    #[error("invalid subscribe return code {0:#04x}")]
    InvalidSubscribeReturnCode(u8),

    #[error("unsupported protocol '{name}' level {level}")]
    UnsupportedProtocol { name: String, level: u8 },

    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("packet body ended early")]
    UnexpectedEof,

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("packet identifier must be nonzero")]
    ZeroPacketId,

    #[error("subscribe or unsubscribe without topic filters")]
    EmptyFilterList,

    #[error("invalid topic name '{0}'")]
    InvalidTopicName(String),

    #[error("invalid topic filter '{0}'")]
    InvalidTopicFilter(String),
}

/// Convenience alias for protocol results.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
