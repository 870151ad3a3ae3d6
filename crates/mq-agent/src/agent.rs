//! Agent connection: wires config-driven subscriptions and logging into an
//! `MqttConnection` and reports lifecycle through a channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mq_connection::{
    ConnectReturnCode, ConnectionHandle, ErrorCode, MqttClient, MqttConnection,
};
use tokio::sync::mpsc;

use crate::config::{AgentConfig, SubscriptionConfig};
use crate::inbox::{self, Payload};

/// Something the agent's connection reported.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Connected { session_present: bool },
    Refused(ConnectReturnCode),
    ConnectionFailed(ErrorCode),
    Interrupted(ErrorCode),
    Disconnected,
    Subscribed { filter: String, packet_id: u16 },
    Message { topic: String, payload: Payload },
}

pub struct Agent {
    connection: MqttConnection,
    config: AgentConfig,
    client_id: String,
    events: mpsc::UnboundedReceiver<AgentEvent>,
}

impl Agent {
    /// Create the connection, register the will and install handlers.
    /// Does not connect.
    pub fn new(client: &MqttClient, config: AgentConfig) -> anyhow::Result<Self> {
        let connection = client
            .new_connection_from_config(&config.mqtt)
            .with_context(|| {
                format!(
                    "failed to create connection to {}:{}",
                    config.mqtt.broker_host,
                    config.mqtt.port()
                )
            })?;

        if let Some(will) = &config.will {
            connection.set_will(&will.topic, will.qos, will.retain, will.payload.clone())?;
        }

        let (tx, events) = mpsc::unbounded_channel();
        install_handlers(&connection, Arc::new(config.subscriptions.clone()), tx);

        let client_id = config.client_id();
        Ok(Self {
            connection,
            config,
            client_id,
            events,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.connection.handle()
    }

    /// Start connecting with the configured options.
    pub fn connect(&self) -> anyhow::Result<()> {
        let mut options = self.config.mqtt.connect_options()?;
        options.client_id = self.client_id.clone();
        tracing::info!(
            host = %self.connection.host(),
            port = self.connection.port(),
            client_id = %self.client_id,
            "agent connecting"
        );
        self.connection.connect_with(options)?;
        Ok(())
    }

    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Drive the agent until the session ends for good.
    ///
    /// Returns `Ok` after a requested disconnect, an error when the broker
    /// refuses the connection or the connection attempt fails.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        while let Some(event) = self.next_event().await {
            match event {
                AgentEvent::Connected { session_present } => {
                    tracing::info!(session_present, "agent connected");
                }
                AgentEvent::Interrupted(code) => {
                    tracing::warn!(error = %code, "connection interrupted, reconnecting");
                }
                AgentEvent::Subscribed { filter, packet_id } => {
                    tracing::info!(%filter, packet_id, "subscription acknowledged");
                }
                AgentEvent::Message { .. } => {}
                AgentEvent::Refused(code) => {
                    anyhow::bail!("broker refused connection: {code}");
                }
                AgentEvent::ConnectionFailed(code) => {
                    anyhow::bail!("connection failed: {code}");
                }
                AgentEvent::Disconnected => return Ok(()),
            }
        }
        anyhow::bail!("agent event channel closed")
    }

    /// Disconnect and wait up to `timeout` for the session to close.
    pub async fn shutdown(&mut self, timeout: Duration) -> anyhow::Result<()> {
        if let Err(e) = self.connection.disconnect() {
            tracing::debug!(error = %e, "nothing to disconnect");
            return Ok(());
        }
        let closed = async {
            while let Some(event) = self.events.recv().await {
                if matches!(
                    event,
                    AgentEvent::Disconnected | AgentEvent::ConnectionFailed(_)
                ) {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, closed)
            .await
            .context("timed out waiting for disconnect")?;
        tracing::info!(client_id = %self.client_id, "agent disconnected");
        Ok(())
    }
}

fn install_handlers(
    connection: &MqttConnection,
    subscriptions: Arc<Vec<SubscriptionConfig>>,
    tx: mpsc::UnboundedSender<AgentEvent>,
) {
    let events = tx.clone();
    connection.set_on_connack(move |handle, code, session_present| {
        if !code.is_accepted() {
            tracing::warn!(%code, "broker refused connection");
            let _ = events.send(AgentEvent::Refused(code));
            return;
        }
        let _ = events.send(AgentEvent::Connected { session_present });
        subscribe_all(handle, &subscriptions, &events);
    });

    let events = tx.clone();
    connection.set_on_connection_failed(move |_, code| {
        tracing::error!(error = %code, "connection attempt failed");
        let _ = events.send(AgentEvent::ConnectionFailed(code));
    });

    let events = tx.clone();
    connection.set_on_interrupted(move |_, code| {
        let _ = events.send(AgentEvent::Interrupted(code));
    });

    connection.set_on_disconnect(move |_| {
        let _ = tx.send(AgentEvent::Disconnected);
    });
}

/// Subscribe every configured filter. Called on each accepted CONNACK.
fn subscribe_all(
    handle: &ConnectionHandle,
    subscriptions: &[SubscriptionConfig],
    events: &mpsc::UnboundedSender<AgentEvent>,
) {
    for subscription in subscriptions {
        let on_message = events.clone();
        let on_ack = events.clone();
        let filter = subscription.filter.clone();
        let packet_id = handle.subscribe(
            &subscription.filter,
            subscription.qos,
            move |_, topic, payload| {
                let payload = inbox::log_message(topic, payload);
                let _ = on_message.send(AgentEvent::Message {
                    topic: topic.to_string(),
                    payload,
                });
            },
            move |_, packet_id| {
                let _ = on_ack.send(AgentEvent::Subscribed {
                    filter: filter.clone(),
                    packet_id,
                });
            },
        );
        if packet_id == 0 {
            tracing::warn!(
                filter = %subscription.filter,
                error = %handle.last_error(),
                "failed to subscribe"
            );
        }
    }
}
