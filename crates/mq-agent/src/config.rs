//! Agent configuration, loadable from TOML.

use mq_connection::{ConnectionConfig, QoS};
use serde::Deserialize;

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// MQTT connection settings.
    pub mqtt: ConnectionConfig,
    /// Topic filters subscribed after every CONNACK.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    /// Where heartbeats go. None disables them.
    #[serde(default)]
    pub heartbeat_topic: Option<String>,
    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Last will registered before connecting.
    #[serde(default)]
    pub will: Option<WillConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    pub filter: String,
    #[serde(default)]
    pub qos: QoS,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WillConfig {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl AgentConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Client id from the config, or a generated `mq-agent-<uuid>` when empty.
    pub fn client_id(&self) -> String {
        if self.mqtt.client_id.is_empty() {
            format!("mq-agent-{}", uuid::Uuid::now_v7().simple())
        } else {
            self.mqtt.client_id.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_config() {
        let toml = r#"
[mqtt]
broker_host = "localhost"
client_id = "agent-001"
"#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.mqtt.broker_host, "localhost");
        assert_eq!(config.mqtt.port(), 1883); // default
        assert_eq!(config.heartbeat_interval_secs, 30); // default
        assert!(config.subscriptions.is_empty());
        assert!(config.heartbeat_topic.is_none());
        assert!(config.will.is_none());
        assert_eq!(config.client_id(), "agent-001");
    }

    #[test]
    fn deserialize_full_config() {
        let toml = r#"
heartbeat_topic = "agents/agent-042/heartbeat"
heartbeat_interval_secs = 15

[mqtt]
broker_host = "broker.example.com"
broker_port = 8883
client_id = "agent-042"
use_tls = true
ca_cert_path = "/certs/ca.pem"
keepalive_secs = 60
username = "agent"
password = "secret"

[mqtt.reconnect]
max_backoff_secs = 30

[[subscriptions]]
filter = "commands/agent-042/#"
qos = 1

[[subscriptions]]
filter = "broadcast/+"

[will]
topic = "agents/agent-042/status"
payload = "offline"
qos = 1
retain = true
"#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.mqtt.port(), 8883);
        assert!(config.mqtt.use_tls);
        assert_eq!(config.mqtt.keepalive_secs, 60);
        assert_eq!(config.mqtt.username.as_deref(), Some("agent"));
        assert_eq!(config.mqtt.reconnect.max_backoff_secs, 30);
        assert_eq!(config.mqtt.reconnect.min_backoff_secs, 1);
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert_eq!(config.subscriptions.len(), 2);
        assert_eq!(config.subscriptions[0].qos, QoS::AtLeastOnce);
        assert_eq!(config.subscriptions[1].qos, QoS::AtMostOnce);

        let will = config.will.unwrap();
        assert_eq!(will.topic, "agents/agent-042/status");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn invalid_qos_is_rejected() {
        let toml = r#"
[mqtt]
broker_host = "localhost"

[[subscriptions]]
filter = "a"
qos = 3
"#;
        assert!(toml::from_str::<AgentConfig>(toml).is_err());
    }

    #[test]
    fn empty_client_id_is_generated() {
        let toml = r#"
[mqtt]
broker_host = "localhost"
"#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        let first = config.client_id();
        assert!(first.starts_with("mq-agent-"));
        assert_ne!(first, config.client_id());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(AgentConfig::from_file("/nonexistent/agent.toml").is_err());
    }
}
