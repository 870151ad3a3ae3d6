//! Periodic heartbeat publisher.
//!
//! Publishes a JSON `Heartbeat` at a configurable interval so subscribers
//! know the agent is alive.

use std::time::Duration;

use chrono::{DateTime, Utc};
use mq_connection::{ConnectionHandle, QoS};
use serde::{Deserialize, Serialize};
use tokio::time;

/// Heartbeat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub client_id: String,
    pub sequence: u64,
    pub uptime_secs: u64,
    pub agent_version: String,
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(client_id: &str, sequence: u64, start_time: time::Instant) -> Self {
        Self {
            client_id: client_id.to_string(),
            sequence,
            uptime_secs: start_time.elapsed().as_secs(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Publish one heartbeat; returns the packet id, `0` when nothing was sent.
pub fn publish(connection: &ConnectionHandle, topic: &str, heartbeat: &Heartbeat) -> u16 {
    let payload = match serde_json::to_vec(heartbeat) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize heartbeat");
            return 0;
        }
    };
    let sequence = heartbeat.sequence;
    let packet_id = connection.publish(topic, QoS::AtLeastOnce, false, payload, move |_, id| {
        tracing::trace!(sequence, packet_id = id, "heartbeat acknowledged");
    });
    if packet_id == 0 {
        tracing::warn!(
            error = %connection.last_error(),
            sequence,
            "failed to publish heartbeat"
        );
    } else {
        tracing::debug!(uptime_secs = heartbeat.uptime_secs, sequence, "heartbeat sent");
    }
    packet_id
}

/// Run the heartbeat loop, publishing at `interval`.
///
/// Runs until the task is cancelled. Ticks while disconnected are logged
/// and skipped.
pub async fn run(
    connection: ConnectionHandle,
    topic: String,
    client_id: String,
    interval: Duration,
    start_time: time::Instant,
) {
    let mut ticker = time::interval(interval);
    // Skip the first tick (fires immediately).
    ticker.tick().await;

    let mut sequence = 0u64;
    loop {
        ticker.tick().await;
        sequence += 1;
        publish(&connection, &topic, &Heartbeat::new(&client_id, sequence, start_time));
    }
}
