//! Engine seam.
//!
//! The façades talk to an MQTT engine only through [`Engine`] and
//! [`Session`]. Requests go in synchronously (they enqueue and return);
//! everything the engine learns later comes back as [`EngineEvent`]s on the
//! channel supplied when the session was created.

use std::sync::Arc;
use std::time::Duration;

use mq_protocol::{
    ConnectReturnCode, LastWill, Login, Publish, SubscribeFilter, SubscribeReturnCode,
};
use tokio::sync::mpsc;

use crate::error::{ErrorCode, MqttResult};
use crate::socket::SocketOptions;
use crate::tls::TlsConnectionOptions;

mod eventloop;
pub mod mock;
pub mod native;
pub(crate) mod packet_id;
mod state;
mod transport;

pub use mock::{MockEngine, MockRequest, MockSession};
pub use native::NativeEngine;

/// Sender half the engine pushes session events into.
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

// ── Options ───────────────────────────────────────────────────

/// Where and how a session connects.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub socket: SocketOptions,
    pub tls: Option<TlsConnectionOptions>,
}

/// Reconnect policy applied after an established connection is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOptions {
    pub enabled: bool,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(128),
        }
    }
}

impl ReconnectOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay after `delay`: doubled, clamped to `[min_backoff, max_backoff]`.
    pub fn next_backoff(&self, delay: Duration) -> Duration {
        delay
            .saturating_mul(2)
            .clamp(self.min_backoff, self.max_backoff.max(self.min_backoff))
    }
}

/// Parameters of one connect request.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub clean_session: bool,
    /// Zero disables keep-alive pings.
    pub keep_alive_secs: u16,
    pub ping_timeout: Duration,
    pub reconnect: ReconnectOptions,
    /// Largest incoming packet accepted, fixed header included.
    pub max_packet_size: usize,
}

impl ConnectOptions {
    pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

    pub fn new(client_id: impl Into<String>, clean_session: bool, keep_alive_secs: u16) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            keep_alive_secs,
            ping_timeout: Duration::from_millis(3000),
            reconnect: ReconnectOptions::default(),
            max_packet_size: Self::DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }
}

// ── Events ────────────────────────────────────────────────────

/// Connection lifecycle, tagged with the connect attempt it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The attempt ended without a usable connection. Terminal.
    ConnectionFailed(ErrorCode),
    /// CONNACK arrived. Terminal unless the code is `Accepted`.
    ConnAck {
        code: ConnectReturnCode,
        session_present: bool,
    },
    /// An established connection dropped; the engine is reconnecting.
    Interrupted(ErrorCode),
    /// A requested disconnect finished. Terminal.
    Disconnected,
}

impl LifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            LifecycleEvent::ConnectionFailed(_) | LifecycleEvent::Disconnected => true,
            LifecycleEvent::ConnAck { code, .. } => !code.is_accepted(),
            LifecycleEvent::Interrupted(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Lifecycle {
        attempt: u64,
        event: LifecycleEvent,
    },
    /// Incoming application message.
    Publish(Publish),
    SubAck {
        packet_id: u16,
        return_codes: Vec<SubscribeReturnCode>,
    },
    UnsubAck {
        packet_id: u16,
    },
    /// Outgoing publish finished its QoS flow (written, PUBACK or PUBCOMP).
    PublishComplete {
        packet_id: u16,
    },
}

// ── Traits ────────────────────────────────────────────────────

/// Factory for MQTT sessions.
pub trait Engine: Send + Sync {
    fn new_session(&self, endpoint: Endpoint, events: EventSender) -> MqttResult<Arc<dyn Session>>;
}

/// One MQTT session. All methods are non-blocking.
pub trait Session: Send + Sync {
    fn set_will(&self, will: LastWill) -> MqttResult<()>;

    fn set_login(&self, login: Login) -> MqttResult<()>;

    /// Start connecting. Returns the attempt number that tags the resulting
    /// lifecycle events.
    fn connect(&self, options: ConnectOptions) -> MqttResult<u64>;

    fn disconnect(&self) -> MqttResult<()>;

    /// Returns the packet identifier of the SUBSCRIBE.
    fn subscribe(&self, filter: SubscribeFilter) -> MqttResult<u16>;

    /// Returns the packet identifier of the UNSUBSCRIBE.
    fn unsubscribe(&self, filter: String) -> MqttResult<u16>;

    /// Returns the packet identifier, or a local one for QoS 0.
    fn publish(&self, publish: Publish) -> MqttResult<u16>;

    fn ping(&self) -> MqttResult<()>;

    /// Tear the session down without DISCONNECT and stop emitting events.
    fn release(&self);
}
