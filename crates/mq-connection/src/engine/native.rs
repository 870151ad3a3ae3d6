//! Native MQTT 3.1.1 engine.
//!
//! Each session keeps its request-side state (status, will, login, packet
//! identifiers) behind a mutex shared with its event-loop task. A connect
//! spawns that task on the bootstrap runtime; requests reach it over an
//! unbounded channel so every `Session` call returns immediately.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mq_protocol::{Connect, LastWill, Login, Publish, Subscribe, SubscribeFilter, Unsubscribe};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bootstrap::{ClientBootstrap, EventLoopGroup};
use crate::engine::eventloop;
use crate::engine::packet_id::PacketIdAllocator;
use crate::engine::state::Command;
use crate::engine::{
    ConnectOptions, Endpoint, Engine, EngineEvent, EventSender, LifecycleEvent, Session,
};
use crate::error::{MqttError, MqttResult};

/// Engine that speaks MQTT 3.1.1 itself over tokio sockets.
pub struct NativeEngine {
    group: Arc<EventLoopGroup>,
}

impl NativeEngine {
    pub fn new(bootstrap: &ClientBootstrap) -> MqttResult<Self> {
        Ok(Self::with_group(bootstrap.group()?))
    }

    pub(crate) fn with_group(group: Arc<EventLoopGroup>) -> Self {
        Self { group }
    }
}

impl Engine for NativeEngine {
    fn new_session(&self, endpoint: Endpoint, events: EventSender) -> MqttResult<Arc<dyn Session>> {
        if endpoint.host.is_empty() {
            return Err(MqttError::InvalidArgument("host must not be empty".into()));
        }
        tracing::debug!(host = %endpoint.host, port = endpoint.port, "new MQTT session");
        Ok(Arc::new(NativeSession {
            shared: Arc::new(SessionShared {
                endpoint,
                events,
                group: self.group.clone(),
                inner: Mutex::new(SessionInner::default()),
            }),
        }))
    }
}

// ── Shared session state ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Status {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Released,
}

#[derive(Default)]
struct SessionInner {
    status: Status,
    will: Option<LastWill>,
    login: Option<Login>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
    packet_ids: PacketIdAllocator,
    attempt: u64,
}

pub(crate) struct SessionShared {
    pub(crate) endpoint: Endpoint,
    events: EventSender,
    group: Arc<EventLoopGroup>,
    inner: Mutex<SessionInner>,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> Status {
        self.lock().status
    }

    /// Event-loop transition. A pending disconnect or a release wins.
    pub(crate) fn set_status(&self, status: Status) {
        let mut inner = self.lock();
        if !matches!(inner.status, Status::Disconnecting | Status::Released) {
            inner.status = status;
        }
    }

    pub(crate) fn release_packet_id(&self, id: u16) {
        self.lock().packet_ids.release(id);
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        if self.status() == Status::Released {
            return;
        }
        if self.events.send(event).is_err() {
            tracing::trace!("event receiver dropped");
        }
    }

    pub(crate) fn emit_lifecycle(&self, attempt: u64, event: LifecycleEvent) {
        self.emit(EngineEvent::Lifecycle { attempt, event });
    }

    /// End of an attempt: back to idle, every packet id free, then the
    /// terminal event.
    /// The event is sent under the lock so it is queued ahead of anything
    /// a following `connect` produces.
    pub(crate) fn finish(&self, attempt: u64, event: LifecycleEvent) {
        let mut inner = self.lock();
        if inner.status == Status::Released {
            return;
        }
        inner.status = Status::Idle;
        inner.commands = None;
        inner.packet_ids.clear();
        if self
            .events
            .send(EngineEvent::Lifecycle { attempt, event })
            .is_err()
        {
            tracing::trace!("event receiver dropped");
        }
    }

    /// Allocate a packet id and queue the command built from it.
    fn submit(&self, command: impl FnOnce(u16) -> Command) -> MqttResult<u16> {
        let mut inner = self.lock();
        match inner.status {
            Status::Connected => {}
            Status::Released => return Err(MqttError::Released),
            _ => return Err(MqttError::NotConnected),
        }
        let id = inner
            .packet_ids
            .allocate()
            .ok_or(MqttError::PacketIdsExhausted)?;
        let queued = inner
            .commands
            .as_ref()
            .is_some_and(|tx| tx.send(command(id)).is_ok());
        if !queued {
            inner.packet_ids.release(id);
            return Err(MqttError::NotConnected);
        }
        Ok(id)
    }
}

// ── Session ───────────────────────────────────────────────────

pub(crate) struct NativeSession {
    shared: Arc<SessionShared>,
}

impl Session for NativeSession {
    fn set_will(&self, will: LastWill) -> MqttResult<()> {
        let mut inner = self.shared.lock();
        if inner.status == Status::Released {
            return Err(MqttError::Released);
        }
        inner.will = Some(will);
        Ok(())
    }

    fn set_login(&self, login: Login) -> MqttResult<()> {
        let mut inner = self.shared.lock();
        if inner.status == Status::Released {
            return Err(MqttError::Released);
        }
        inner.login = Some(login);
        Ok(())
    }

    fn connect(&self, options: ConnectOptions) -> MqttResult<u64> {
        if options.client_id.len() > usize::from(u16::MAX) {
            return Err(MqttError::InvalidArgument("client id is too long".into()));
        }

        let mut inner = self.shared.lock();
        match inner.status {
            Status::Idle => {}
            Status::Released => return Err(MqttError::Released),
            other => {
                return Err(MqttError::InvalidState(format!(
                    "cannot connect while {other:?}"
                )));
            }
        }

        inner.attempt += 1;
        let attempt = inner.attempt;
        let connect = Connect {
            client_id: options.client_id.clone(),
            clean_session: options.clean_session,
            keep_alive: options.keep_alive_secs,
            will: inner.will.clone(),
            login: inner.login.clone(),
        };
        tracing::info!(
            host = %self.shared.endpoint.host,
            port = self.shared.endpoint.port,
            client_id = %options.client_id,
            attempt,
            "connecting to MQTT broker"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        inner.commands = Some(tx);
        inner.status = Status::Connecting;
        let task = eventloop::run(self.shared.clone(), connect, options, attempt, rx);
        inner.task = Some(self.shared.group.spawn(task));
        Ok(attempt)
    }

    fn disconnect(&self) -> MqttResult<()> {
        let mut inner = self.shared.lock();
        match inner.status {
            Status::Connecting | Status::Connected | Status::Reconnecting => {}
            Status::Idle => return Err(MqttError::NotConnected),
            Status::Disconnecting => {
                return Err(MqttError::InvalidState("disconnect already in progress".into()));
            }
            Status::Released => return Err(MqttError::Released),
        }
        let queued = inner
            .commands
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Disconnect).is_ok());
        if !queued {
            return Err(MqttError::NotConnected);
        }
        inner.status = Status::Disconnecting;
        tracing::info!(host = %self.shared.endpoint.host, "disconnecting from MQTT broker");
        Ok(())
    }

    fn subscribe(&self, filter: SubscribeFilter) -> MqttResult<u16> {
        self.shared.submit(|pkid| {
            Command::Subscribe(Subscribe {
                pkid,
                filters: vec![filter],
            })
        })
    }

    fn unsubscribe(&self, filter: String) -> MqttResult<u16> {
        self.shared.submit(|pkid| {
            Command::Unsubscribe(Unsubscribe {
                pkid,
                filters: vec![filter],
            })
        })
    }

    fn publish(&self, publish: Publish) -> MqttResult<u16> {
        self.shared
            .submit(|pkid| Command::Publish(Publish { pkid, ..publish }))
    }

    fn ping(&self) -> MqttResult<()> {
        let inner = self.shared.lock();
        match inner.status {
            Status::Connected => {}
            Status::Released => return Err(MqttError::Released),
            _ => return Err(MqttError::NotConnected),
        }
        let queued = inner
            .commands
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Ping).is_ok());
        if queued {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }

    fn release(&self) {
        let task = {
            let mut inner = self.shared.lock();
            if inner.status == Status::Released {
                return;
            }
            inner.status = Status::Released;
            inner.commands = None;
            inner.packet_ids.clear();
            inner.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!(host = %self.shared.endpoint.host, "MQTT session released");
    }
}

impl Drop for NativeSession {
    fn drop(&mut self) {
        self.release();
    }
}
