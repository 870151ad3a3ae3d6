//! mq-agent: connects to an MQTT broker, subscribes to the configured
//! filters, logs what arrives and publishes a periodic heartbeat.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use mq_agent::agent::Agent;
use mq_agent::config::AgentConfig;
use mq_agent::heartbeat;
use mq_connection::{ClientBootstrap, MqttClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mq-agent starting");

    // ── Load config ─────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/mq-agent/agent.toml".to_string());

    let config = AgentConfig::from_file(&config_path)?;
    tracing::info!(
        broker_host = %config.mqtt.broker_host,
        port = config.mqtt.port(),
        subscriptions = config.subscriptions.len(),
        "config loaded"
    );

    // ── MQTT client ─────────────────────────────────────────────
    let bootstrap = ClientBootstrap::current()?;
    let client = MqttClient::new(&bootstrap);
    let heartbeat_topic = config.heartbeat_topic.clone();
    let heartbeat_interval = Duration::from_secs(config.heartbeat_interval_secs);

    let mut agent = Agent::new(&client, config)?;
    let handle = agent
        .handle()
        .ok_or_else(|| anyhow::anyhow!("agent connection is not valid"))?;
    let client_id = agent.client_id().to_string();
    agent.connect()?;

    // ── Heartbeat ───────────────────────────────────────────────
    let start_time = tokio::time::Instant::now();
    let heartbeat = async {
        match heartbeat_topic {
            Some(topic) => {
                heartbeat::run(handle, topic, client_id, heartbeat_interval, start_time).await
            }
            None => {
                tracing::info!("heartbeat disabled");
                std::future::pending::<()>().await
            }
        }
    };

    tracing::info!("mq-agent ready");

    let shutdown = tokio::select! {
        // Lifecycle events until the session ends
        result = agent.run() => Some(result),
        () = heartbeat => {
            tracing::error!("heartbeat loop exited unexpectedly");
            None
        }
        // Graceful shutdown on SIGINT
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            None
        }
    };
    let result = match shutdown {
        Some(result) => result,
        None => agent.shutdown(Duration::from_secs(5)).await,
    };

    tracing::info!("mq-agent stopped");
    result
}
