//! Event-loop task of one native session.
//!
//! ```text
//! establish ──► connected ──(lost, reconnect on)──► backoff ──► establish
//!     │             │ disconnect                        │ disconnect
//!     ▼             ▼                                   ▼
//!  failed      Disconnected                        Disconnected
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use mq_protocol::{ConnAck, Connect, Packet};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, sleep, sleep_until, timeout};

use crate::engine::native::{SessionShared, Status};
use crate::engine::state::{Command, MqttState};
use crate::engine::transport::Transport;
use crate::engine::{ConnectOptions, EngineEvent, LifecycleEvent};
use crate::error::{MqttError, MqttResult};

/// Why the command queue interrupted a wait.
enum Stop {
    Disconnect,
    Released,
}

/// How a connected phase ended.
enum Exit {
    Stop(Stop),
    Lost(MqttError),
}

pub(crate) async fn run(
    shared: Arc<SessionShared>,
    connect: Connect,
    options: ConnectOptions,
    attempt: u64,
    commands: UnboundedReceiver<Command>,
) {
    EventLoop {
        shared,
        connect,
        options,
        attempt,
        commands,
        backlog: VecDeque::new(),
        state: MqttState::new(),
        frame: BytesMut::new(),
    }
    .run()
    .await;
}

struct EventLoop {
    shared: Arc<SessionShared>,
    connect: Connect,
    options: ConnectOptions,
    attempt: u64,
    commands: UnboundedReceiver<Command>,
    /// Requests queued before a connection loss, replayed after reconnect.
    backlog: VecDeque<Command>,
    state: MqttState,
    /// Encoded frame of the request being written.
    frame: BytesMut,
}

impl EventLoop {
    async fn run(mut self) {
        let mut delay = self.options.reconnect.min_backoff;
        let mut established = false;

        loop {
            let outcome = tokio::select! {
                result = establish(&self.shared, &self.connect, &self.options) => result,
                stop = watch_commands(&mut self.commands, &mut self.backlog) => {
                    return self.stop(stop);
                }
            };

            let (mut transport, ack) = match outcome {
                Ok(connection) => connection,
                Err(e) if !established => {
                    tracing::error!(
                        host = %self.shared.endpoint.host,
                        port = self.shared.endpoint.port,
                        client_id = %self.connect.client_id,
                        error = %e,
                        "MQTT connection failed"
                    );
                    return self.finish(LifecycleEvent::ConnectionFailed(e.code()));
                }
                Err(e) => {
                    tracing::warn!(
                        host = %self.shared.endpoint.host,
                        error = %e,
                        retry_in = ?delay,
                        "MQTT reconnect failed"
                    );
                    if let Some(stop) = self.pause(delay).await {
                        return self.stop(stop);
                    }
                    delay = self.options.reconnect.next_backoff(delay);
                    continue;
                }
            };

            if !ack.code.is_accepted() {
                tracing::warn!(
                    host = %self.shared.endpoint.host,
                    client_id = %self.connect.client_id,
                    code = %ack.code,
                    "MQTT connection refused"
                );
                transport.shutdown().await;
                return self.finish(LifecycleEvent::ConnAck {
                    code: ack.code,
                    session_present: ack.session_present,
                });
            }

            established = true;
            delay = self.options.reconnect.min_backoff;
            if !ack.session_present {
                self.state.session_lost();
            }
            self.shared.set_status(Status::Connected);
            tracing::info!(
                host = %self.shared.endpoint.host,
                port = self.shared.endpoint.port,
                client_id = %self.connect.client_id,
                session_present = ack.session_present,
                "MQTT connected"
            );
            self.shared.emit_lifecycle(
                self.attempt,
                LifecycleEvent::ConnAck {
                    code: ack.code,
                    session_present: ack.session_present,
                },
            );

            let error = match self.connected(&mut transport).await {
                Exit::Stop(stop) => return self.stop(stop),
                Exit::Lost(error) => error,
            };
            transport.shutdown().await;

            if !self.options.reconnect.enabled {
                tracing::warn!(
                    host = %self.shared.endpoint.host,
                    error = %error,
                    "MQTT connection lost"
                );
                return self.finish(LifecycleEvent::ConnectionFailed(error.code()));
            }

            tracing::warn!(
                host = %self.shared.endpoint.host,
                error = %error,
                retry_in = ?delay,
                "MQTT connection lost, reconnecting"
            );
            self.shared.set_status(Status::Reconnecting);
            self.shared
                .emit_lifecycle(self.attempt, LifecycleEvent::Interrupted(error.code()));
            if let Some(stop) = self.pause(delay).await {
                return self.stop(stop);
            }
            delay = self.options.reconnect.next_backoff(delay);
        }
    }

    /// Serve one established connection until it ends.
    async fn connected(&mut self, transport: &mut Transport) -> Exit {
        let keep_alive = Duration::from_secs(u64::from(self.options.keep_alive_secs));
        let mut ping_deadline: Option<Instant> = None;

        let resend = self.state.resend();
        if !resend.is_empty() {
            tracing::debug!(count = resend.len(), "resending unacknowledged requests");
        }
        for packet in &resend {
            if let Err(e) = transport.write(packet).await {
                return Exit::Lost(e);
            }
        }
        while let Some(command) = self.backlog.pop_front() {
            match self.execute(transport, command, &mut ping_deadline).await {
                Ok(None) => {}
                Ok(Some(exit)) => return exit,
                Err(e) => return Exit::Lost(e),
            }
        }

        let mut last_sent = Instant::now();
        loop {
            let next_ping = last_sent + keep_alive;
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Exit::Stop(Stop::Released);
                    };
                    match self.execute(transport, command, &mut ping_deadline).await {
                        Ok(None) => last_sent = Instant::now(),
                        Ok(Some(exit)) => return exit,
                        Err(e) => return Exit::Lost(e),
                    }
                }
                packet = transport.read() => {
                    match self.handle_incoming(transport, packet).await {
                        Ok(true) => ping_deadline = None,
                        Ok(false) => {}
                        Err(e) => return Exit::Lost(e),
                    }
                }
                _ = sleep_until(next_ping), if !keep_alive.is_zero() && ping_deadline.is_none() => {
                    if let Err(e) = transport.write(&Packet::PingReq).await {
                        return Exit::Lost(e);
                    }
                    tracing::debug!("keep-alive PINGREQ sent");
                    last_sent = Instant::now();
                    ping_deadline = Some(last_sent + self.options.ping_timeout);
                }
                _ = sleep_until(ping_deadline.unwrap_or(next_ping)), if ping_deadline.is_some() => {
                    return Exit::Lost(MqttError::PingTimeout(self.options.ping_timeout));
                }
            }
        }
    }

    /// Write one queued request. `Ok(Some(_))` ends the connected phase.
    async fn execute(
        &mut self,
        transport: &mut Transport,
        command: Command,
        ping_deadline: &mut Option<Instant>,
    ) -> MqttResult<Option<Exit>> {
        match command {
            Command::Publish(publish) => {
                let packet_id = publish.pkid;
                match self.state.outgoing_publish(publish, &mut self.frame) {
                    Ok(completed) => {
                        transport.write_frame(&self.frame).await?;
                        if let Some(packet_id) = completed {
                            self.shared.release_packet_id(packet_id);
                            self.shared.emit(EngineEvent::PublishComplete { packet_id });
                        }
                    }
                    Err(e) => self.reject(packet_id, &e),
                }
            }
            Command::Subscribe(subscribe) => {
                let packet_id = subscribe.pkid;
                match self.state.outgoing_subscribe(subscribe, &mut self.frame) {
                    Ok(()) => transport.write_frame(&self.frame).await?,
                    Err(e) => self.reject(packet_id, &e),
                }
            }
            Command::Unsubscribe(unsubscribe) => {
                let packet_id = unsubscribe.pkid;
                match self.state.outgoing_unsubscribe(unsubscribe, &mut self.frame) {
                    Ok(()) => transport.write_frame(&self.frame).await?,
                    Err(e) => self.reject(packet_id, &e),
                }
            }
            Command::Ping => {
                transport.write(&Packet::PingReq).await?;
                ping_deadline.get_or_insert(Instant::now() + self.options.ping_timeout);
            }
            Command::Disconnect => {
                if let Err(e) = transport.write(&Packet::Disconnect).await {
                    tracing::debug!(error = %e, "DISCONNECT not delivered");
                }
                transport.shutdown().await;
                return Ok(Some(Exit::Stop(Stop::Disconnect)));
            }
        }
        Ok(None)
    }

    /// A request that cannot be encoded is dropped: its id is freed and it
    /// never completes. The connection itself is unaffected.
    fn reject(&self, packet_id: u16, error: &MqttError) {
        tracing::warn!(packet_id, error = %error, "dropping request that cannot be encoded");
        self.shared.release_packet_id(packet_id);
    }

    /// Returns whether the packet was a PINGRESP.
    async fn handle_incoming(
        &mut self,
        transport: &mut Transport,
        packet: MqttResult<Packet>,
    ) -> MqttResult<bool> {
        let incoming = self.state.incoming(packet?)?;
        if let Some(reply) = &incoming.reply {
            transport.write(reply).await?;
        }
        if let Some(id) = incoming.released {
            self.shared.release_packet_id(id);
        }
        if let Some(event) = incoming.event {
            self.shared.emit(event);
        }
        Ok(incoming.pong)
    }

    /// Sleep before the next attempt unless the queue says stop.
    async fn pause(&mut self, delay: Duration) -> Option<Stop> {
        tokio::select! {
            _ = sleep(delay) => None,
            stop = watch_commands(&mut self.commands, &mut self.backlog) => Some(stop),
        }
    }

    fn stop(self, stop: Stop) {
        match stop {
            Stop::Disconnect => {
                tracing::info!(host = %self.shared.endpoint.host, "MQTT disconnected");
                self.finish(LifecycleEvent::Disconnected);
            }
            Stop::Released => {}
        }
    }

    fn finish(mut self, event: LifecycleEvent) {
        let discarded = self.state.clear() + self.backlog.len();
        if discarded > 0 {
            tracing::debug!(discarded, "discarding operations still in flight");
        }
        self.shared.finish(self.attempt, event);
    }
}

/// TCP (+TLS), CONNECT, then CONNACK within the socket connect timeout.
async fn establish(
    shared: &SessionShared,
    connect: &Connect,
    options: &ConnectOptions,
) -> MqttResult<(Transport, ConnAck)> {
    let endpoint = &shared.endpoint;
    let mut transport = Transport::connect(endpoint, options.max_packet_size).await?;
    transport.write(&Packet::Connect(connect.clone())).await?;

    let packet = timeout(endpoint.socket.connect_timeout, transport.read())
        .await
        .map_err(|_| MqttError::Timeout("waiting for CONNACK".into()))??;
    match packet {
        Packet::ConnAck(ack) => Ok((transport, ack)),
        other => Err(MqttError::UnexpectedPacket(other.packet_type().name())),
    }
}

/// Resolve once a disconnect is requested or the session is released;
/// anything else is parked in `backlog`.
async fn watch_commands(
    commands: &mut UnboundedReceiver<Command>,
    backlog: &mut VecDeque<Command>,
) -> Stop {
    loop {
        match commands.recv().await {
            Some(Command::Disconnect) => return Stop::Disconnect,
            Some(command) => backlog.push_back(command),
            None => return Stop::Released,
        }
    }
}
