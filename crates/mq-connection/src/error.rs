//! MQTT connection error types.
//!
//! Two channels carry failures: [`MqttError`] values returned from façade
//! calls (and recorded as an [`ErrorCode`] readable via `last_error()`), and
//! [`ErrorCode`]s handed to the connection-failed / interrupted callbacks.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use mq_protocol::ProtocolError;
use thiserror::Error;

/// Errors that can occur during MQTT operations.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not connected")]
    NotConnected,

    #[error("bootstrap unavailable: {0}")]
    Bootstrap(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected {0} packet")]
    UnexpectedPacket(&'static str),

    #[error("all packet identifiers are in flight")]
    PacketIdsExhausted,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("no ping response within {0:?}")]
    PingTimeout(Duration),

    #[error("session released")]
    Released,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for MqttError {
    fn from(e: std::io::Error) -> Self {
        MqttError::Io(e.to_string())
    }
}

impl MqttError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MqttError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            MqttError::InvalidState(_) => ErrorCode::InvalidState,
            MqttError::NotConnected => ErrorCode::NotConnected,
            MqttError::Bootstrap(_) => ErrorCode::BootstrapUnavailable,
            MqttError::Connection(_) => ErrorCode::ConnectionFailed,
            MqttError::Timeout(_) => ErrorCode::Timeout,
            MqttError::Tls(_) => ErrorCode::Tls,
            MqttError::Protocol(_) | MqttError::UnexpectedPacket(_) => ErrorCode::Protocol,
            MqttError::PacketIdsExhausted => ErrorCode::PacketIdsExhausted,
            MqttError::ConnectionClosed => ErrorCode::ConnectionClosed,
            MqttError::PingTimeout(_) => ErrorCode::PingTimeout,
            MqttError::Released => ErrorCode::Released,
            MqttError::Config(_) => ErrorCode::Config,
            MqttError::Io(_) => ErrorCode::Io,
        }
    }
}

/// Convenience alias for MQTT results.
pub type MqttResult<T> = Result<T, MqttError>;

/// Stable numeric error code. `Success` is zero; everything else is nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ErrorCode {
    #[default]
    Success = 0,
    InvalidArgument = 1,
    InvalidState = 2,
    NotConnected = 3,
    BootstrapUnavailable = 4,
    ConnectionFailed = 5,
    Timeout = 6,
    Tls = 7,
    Protocol = 8,
    PacketIdsExhausted = 9,
    ConnectionClosed = 10,
    PingTimeout = 11,
    Released = 12,
    Config = 13,
    Io = 14,
}

impl ErrorCode {
    const ALL: [ErrorCode; 15] = [
        ErrorCode::Success,
        ErrorCode::InvalidArgument,
        ErrorCode::InvalidState,
        ErrorCode::NotConnected,
        ErrorCode::BootstrapUnavailable,
        ErrorCode::ConnectionFailed,
        ErrorCode::Timeout,
        ErrorCode::Tls,
        ErrorCode::Protocol,
        ErrorCode::PacketIdsExhausted,
        ErrorCode::ConnectionClosed,
        ErrorCode::PingTimeout,
        ErrorCode::Released,
        ErrorCode::Config,
        ErrorCode::Io,
    ];

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Unknown raw values map to `Io`, the least specific failure.
    pub fn from_raw(raw: i32) -> Self {
        Self::ALL
            .into_iter()
            .find(|code| code.as_raw() == raw)
            .unwrap_or(ErrorCode::Io)
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.as_raw())
    }
}

/// Thread-safe "last error" slot shared by the façades.
#[derive(Debug, Default)]
pub(crate) struct LastError(AtomicI32);

impl LastError {
    pub(crate) fn new(code: ErrorCode) -> Self {
        Self(AtomicI32::new(code.as_raw()))
    }

    pub(crate) fn get(&self) -> ErrorCode {
        ErrorCode::from_raw(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, code: ErrorCode) {
        self.0.store(code.as_raw(), Ordering::Release);
    }

    /// Record the outcome of a call and pass it through.
    pub(crate) fn record<T>(&self, result: MqttResult<T>) -> MqttResult<T> {
        match &result {
            Ok(_) => self.set(ErrorCode::Success),
            Err(e) => self.set(e.code()),
        }
        result
    }
}
