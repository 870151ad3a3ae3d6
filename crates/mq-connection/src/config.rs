use std::time::Duration;

use serde::Deserialize;

use crate::engine::{ConnectOptions, ReconnectOptions};
use crate::error::{MqttError, MqttResult};
use crate::socket::SocketOptions;
use crate::tls::TlsConnectionOptions;

/// MQTT connection configuration, loadable from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// MQTT broker hostname.
    pub broker_host: String,
    /// MQTT broker port. Defaults to 1883, or 8883 when `use_tls` is set.
    #[serde(default)]
    pub broker_port: Option<u16>,
    /// MQTT client ID (should be unique per client).
    #[serde(default)]
    pub client_id: String,
    /// Enable TLS. When false, connects plaintext.
    #[serde(default)]
    pub use_tls: bool,
    /// Path to a CA certificate (PEM) trusted in addition to the web PKI roots.
    #[serde(default)]
    pub ca_cert_path: String,
    /// Path to the client X.509 certificate (PEM), for mutual TLS.
    #[serde(default)]
    pub client_cert_path: String,
    /// Path to the client private key (PEM).
    #[serde(default)]
    pub client_key_path: String,
    /// Keep-alive interval in seconds; 0 disables PINGREQ scheduling.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// TCP connect and CONNACK timeout.
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long to wait for PINGRESP before treating the link as lost.
    #[serde(default = "default_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// `[reconnect]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,
    #[serde(default = "default_min_backoff")]
    pub min_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            min_backoff_secs: default_min_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

fn default_keepalive() -> u16 {
    30
}

fn default_clean_session() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_reconnect_enabled() -> bool {
    true
}

fn default_min_backoff() -> u64 {
    1
}

fn default_max_backoff() -> u64 {
    128
}

impl ConnectionConfig {
    pub fn port(&self) -> u16 {
        self.broker_port
            .unwrap_or(if self.use_tls { 8883 } else { 1883 })
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..SocketOptions::default()
        }
    }

    /// TLS options when `use_tls` is set; reads the PEM files named in the config.
    pub fn tls_options(&self) -> MqttResult<Option<TlsConnectionOptions>> {
        if !self.use_tls {
            return Ok(None);
        }
        TlsConnectionOptions::from_config(self).map(Some)
    }

    pub fn connect_options(&self) -> MqttResult<ConnectOptions> {
        if self.reconnect.min_backoff_secs > self.reconnect.max_backoff_secs {
            return Err(MqttError::Config(format!(
                "reconnect.min_backoff_secs ({}) exceeds max_backoff_secs ({})",
                self.reconnect.min_backoff_secs, self.reconnect.max_backoff_secs
            )));
        }
        let mut options =
            ConnectOptions::new(&self.client_id, self.clean_session, self.keepalive_secs);
        options.ping_timeout = Duration::from_millis(self.ping_timeout_ms);
        options.reconnect = ReconnectOptions {
            enabled: self.reconnect.enabled,
            min_backoff: Duration::from_secs(self.reconnect.min_backoff_secs),
            max_backoff: Duration::from_secs(self.reconnect.max_backoff_secs),
        };
        Ok(options)
    }
}
