//! MQTT client and connection façades.
//!
//! - `ClientBootstrap`: the tokio runtime engine tasks and callbacks run on
//! - `MqttClient`: owns an engine context, creates connections
//! - `MqttConnection`: one MQTT session plus its callbacks
//! - `Engine` / `Session` traits with the native MQTT 3.1.1 engine and a
//!   `MockEngine` for tests without a broker

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod handler;
pub mod socket;
pub mod tls;

// Re-exports for convenience.
pub use bootstrap::ClientBootstrap;
pub use client::MqttClient;
pub use config::{ConnectionConfig, ReconnectConfig};
pub use connection::{ConnectionHandle, MqttConnection};
pub use engine::{
    ConnectOptions, Endpoint, Engine, EngineEvent, LifecycleEvent, MockEngine, MockRequest,
    MockSession, NativeEngine, ReconnectOptions, Session,
};
pub use error::{ErrorCode, MqttError, MqttResult};
pub use socket::SocketOptions;
pub use tls::TlsConnectionOptions;

pub use bytes::Bytes;
pub use mq_protocol::{ConnectReturnCode, QoS};
