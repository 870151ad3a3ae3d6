//! MQTT 3.1.1 control packets.
//!
//! These are plain data types; [`crate::codec`] turns them into bytes and
//! back. Payloads are `Bytes` so a publish can be handed to the engine,
//! retained for resend, and shared with callbacks without copying.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::qos::QoS;

/// Control packet type, the high nibble of the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::ConnAck => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::PubAck => "PUBACK",
            PacketType::PubRec => "PUBREC",
            PacketType::PubRel => "PUBREL",
            PacketType::PubComp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::SubAck => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::UnsubAck => "UNSUBACK",
            PacketType::PingReq => "PINGREQ",
            PacketType::PingResp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            other => return Err(ProtocolError::InvalidPacketType(other)),
        })
    }
}

// ─── Connection ───

/// Broker answer to CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn is_accepted(self) -> bool {
        self == ConnectReturnCode::Accepted
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUsernameOrPassword,
            5 => ConnectReturnCode::NotAuthorized,
            other => return Err(ProtocolError::InvalidConnectReturnCode(other)),
        })
    }
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectReturnCode::Accepted => "accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadUsernameOrPassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

/// Message the broker publishes for a client that vanishes without DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Credentials carried in CONNECT.
#[derive(Clone, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Login")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    /// Keep-alive interval in seconds; zero disables it.
    pub keep_alive: u16,
    pub will: Option<LastWill>,
    pub login: Option<Login>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

// ─── Publish ───

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Zero for QoS 0; nonzero otherwise.
    pub pkid: u16,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            pkid: 0,
            payload: payload.into(),
        }
    }
}

// ─── Subscriptions ───

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self {
            path: path.into(),
            qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// Per-filter answer in SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub(crate) const FAILURE: u8 = 0x80;

    pub fn as_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos.as_u8(),
            SubscribeReturnCode::Failure => Self::FAILURE,
        }
    }
}

impl TryFrom<u8> for SubscribeReturnCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::FAILURE => Ok(SubscribeReturnCode::Failure),
            0..=2 => Ok(SubscribeReturnCode::Success(QoS::try_from(value)?)),
            other => Err(ProtocolError::InvalidSubscribeReturnCode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filters: Vec<String>,
}

// ─── Packet ───

/// Any MQTT 3.1.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier carried by this packet, if any.
    pub fn pkid(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) if p.qos != QoS::AtMostOnce => Some(p.pkid),
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => Some(*id),
            Packet::Subscribe(s) => Some(s.pkid),
            Packet::SubAck(s) => Some(s.pkid),
            Packet::Unsubscribe(u) => Some(u.pkid),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_round_trips_through_nibble() {
        for nibble in 1..=14u8 {
            let kind = PacketType::try_from(nibble).unwrap();
            assert_eq!(kind as u8, nibble);
        }
        assert_eq!(
            PacketType::try_from(0),
            Err(ProtocolError::InvalidPacketType(0))
        );
        assert_eq!(
            PacketType::try_from(15),
            Err(ProtocolError::InvalidPacketType(15))
        );
    }

    #[test]
    fn connect_return_codes() {
        assert!(ConnectReturnCode::Accepted.is_accepted());
        assert!(!ConnectReturnCode::NotAuthorized.is_accepted());
        assert_eq!(
            ConnectReturnCode::try_from(4).unwrap(),
            ConnectReturnCode::BadUsernameOrPassword
        );
        assert!(ConnectReturnCode::try_from(6).is_err());
    }

    #[test]
    fn subscribe_return_codes() {
        assert_eq!(
            SubscribeReturnCode::try_from(1).unwrap(),
            SubscribeReturnCode::Success(QoS::AtLeastOnce)
        );
        assert_eq!(
            SubscribeReturnCode::try_from(0x80).unwrap(),
            SubscribeReturnCode::Failure
        );
        assert!(SubscribeReturnCode::try_from(0x03).is_err());
        assert_eq!(SubscribeReturnCode::Failure.as_u8(), 0x80);
    }

    #[test]
    fn login_debug_hides_password() {
        let login = Login {
            username: "device".into(),
            password: Some("hunter2".into()),
        };
        let text = format!("{login:?}");
        assert!(text.contains("device"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn pkid_of_qos0_publish_is_none() {
        let publish = Publish::new("a/b", QoS::AtMostOnce, "x");
        assert_eq!(Packet::Publish(publish).pkid(), None);
        assert_eq!(Packet::PubRel(9).pkid(), Some(9));
        assert_eq!(Packet::PingReq.pkid(), None);
    }
}
