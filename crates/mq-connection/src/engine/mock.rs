//! Mock engine for testing the façades without a broker.
//!
//! Records every request a session receives and lets the test inject the
//! events a real engine would produce.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mq_protocol::{LastWill, Login, Publish, SubscribeFilter};

use crate::engine::packet_id::PacketIdAllocator;
use crate::engine::{
    ConnectOptions, Endpoint, Engine, EngineEvent, EventSender, LifecycleEvent, Session,
};
use crate::error::{MqttError, MqttResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A recorded session call.
#[derive(Debug, Clone)]
pub enum MockRequest {
    SetWill(LastWill),
    SetLogin(Login),
    Connect(ConnectOptions),
    Disconnect,
    Subscribe { packet_id: u16, filter: SubscribeFilter },
    Unsubscribe { packet_id: u16, filter: String },
    Publish { packet_id: u16, publish: Publish },
    Ping,
    Release,
}

/// Mock implementation of the `Engine` trait.
#[derive(Default)]
pub struct MockEngine {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    refuse_sessions: Mutex<Option<String>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every session created so far, oldest first.
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        lock(&self.sessions).clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        lock(&self.sessions).last().cloned()
    }

    /// Make `new_session` fail with an invalid-argument error.
    pub fn refuse_sessions(&self, reason: impl Into<String>) {
        *lock(&self.refuse_sessions) = Some(reason.into());
    }
}

impl Engine for MockEngine {
    fn new_session(&self, endpoint: Endpoint, events: EventSender) -> MqttResult<Arc<dyn Session>> {
        if let Some(reason) = lock(&self.refuse_sessions).clone() {
            return Err(MqttError::InvalidArgument(reason));
        }
        let session = Arc::new(MockSession {
            endpoint,
            events,
            inner: Mutex::new(MockInner::default()),
        });
        lock(&self.sessions).push(session.clone());
        let session: Arc<dyn Session> = session;
        Ok(session)
    }
}

#[derive(Default)]
struct MockInner {
    requests: Vec<MockRequest>,
    connected: bool,
    released: bool,
    attempt: u64,
    packet_ids: PacketIdAllocator,
}

/// Session handed out by [`MockEngine`].
pub struct MockSession {
    endpoint: Endpoint,
    events: EventSender,
    inner: Mutex<MockInner>,
}

impl MockSession {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        lock(&self.inner).requests.clone()
    }

    pub fn last_request(&self) -> Option<MockRequest> {
        lock(&self.inner).requests.last().cloned()
    }

    /// Clear recorded requests.
    pub fn reset(&self) {
        lock(&self.inner).requests.clear();
    }

    pub fn set_connected(&self, connected: bool) {
        lock(&self.inner).connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    pub fn is_released(&self) -> bool {
        lock(&self.inner).released
    }

    /// Attempt number handed out by the latest `connect`.
    pub fn attempt(&self) -> u64 {
        lock(&self.inner).attempt
    }

    /// Inject an event. Ignored once the session is released.
    pub fn emit(&self, event: EngineEvent) {
        let mut inner = lock(&self.inner);
        if inner.released {
            return;
        }
        match &event {
            EngineEvent::Lifecycle { event, .. } => match event {
                LifecycleEvent::ConnAck { code, .. } => inner.connected = code.is_accepted(),
                _ => inner.connected = false,
            },
            EngineEvent::SubAck { packet_id, .. }
            | EngineEvent::UnsubAck { packet_id }
            | EngineEvent::PublishComplete { packet_id } => inner.packet_ids.release(*packet_id),
            EngineEvent::Publish(_) => {}
        }
        // Send under the lock so events keep their emission order.
        if self.events.send(event).is_err() {
            tracing::debug!("event receiver dropped, mock event discarded");
        }
    }

    /// Inject a lifecycle event for the latest attempt.
    pub fn emit_lifecycle(&self, event: LifecycleEvent) {
        let attempt = self.attempt();
        self.emit(EngineEvent::Lifecycle { attempt, event });
    }

    fn record(&self, request: MockRequest) -> MqttResult<()> {
        let mut inner = lock(&self.inner);
        if inner.released {
            return Err(MqttError::Released);
        }
        inner.requests.push(request);
        Ok(())
    }

    fn submit(&self, request: impl FnOnce(u16) -> MockRequest) -> MqttResult<u16> {
        let mut inner = lock(&self.inner);
        if inner.released {
            return Err(MqttError::Released);
        }
        if !inner.connected {
            return Err(MqttError::NotConnected);
        }
        let id = inner
            .packet_ids
            .allocate()
            .ok_or(MqttError::PacketIdsExhausted)?;
        inner.requests.push(request(id));
        Ok(id)
    }
}

impl Session for MockSession {
    fn set_will(&self, will: LastWill) -> MqttResult<()> {
        self.record(MockRequest::SetWill(will))
    }

    fn set_login(&self, login: Login) -> MqttResult<()> {
        self.record(MockRequest::SetLogin(login))
    }

    fn connect(&self, options: ConnectOptions) -> MqttResult<u64> {
        let mut inner = lock(&self.inner);
        if inner.released {
            return Err(MqttError::Released);
        }
        if inner.connected {
            return Err(MqttError::InvalidState("already connected".into()));
        }
        inner.attempt += 1;
        inner.requests.push(MockRequest::Connect(options));
        Ok(inner.attempt)
    }

    fn disconnect(&self) -> MqttResult<()> {
        self.record(MockRequest::Disconnect)
    }

    fn subscribe(&self, filter: SubscribeFilter) -> MqttResult<u16> {
        self.submit(|packet_id| MockRequest::Subscribe { packet_id, filter })
    }

    fn unsubscribe(&self, filter: String) -> MqttResult<u16> {
        self.submit(|packet_id| MockRequest::Unsubscribe { packet_id, filter })
    }

    fn publish(&self, publish: Publish) -> MqttResult<u16> {
        self.submit(|packet_id| MockRequest::Publish { packet_id, publish })
    }

    fn ping(&self) -> MqttResult<()> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        self.record(MockRequest::Ping)
    }

    fn release(&self) {
        let mut inner = lock(&self.inner);
        if inner.released {
            return;
        }
        inner.released = true;
        inner.connected = false;
        inner.requests.push(MockRequest::Release);
    }
}

#[cfg(test)]
mod tests {
    use mq_protocol::{ConnectReturnCode, QoS};
    use tokio::sync::mpsc;

    use super::*;
    use crate::socket::SocketOptions;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "mock".into(),
            port: 1883,
            socket: SocketOptions::default(),
            tls: None,
        }
    }

    #[test]
    fn records_requests_and_allocates_ids() {
        let engine = MockEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = engine.new_session(endpoint(), tx).unwrap();
        let mock = engine.last_session().unwrap();

        assert!(matches!(
            session.publish(Publish::new("t", QoS::AtMostOnce, "x")),
            Err(MqttError::NotConnected)
        ));

        let attempt = session.connect(ConnectOptions::new("c", true, 30)).unwrap();
        mock.emit_lifecycle(LifecycleEvent::ConnAck {
            code: ConnectReturnCode::Accepted,
            session_present: false,
        });
        assert!(mock.is_connected());
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::Lifecycle { attempt: a, .. } if a == attempt
        ));

        let first = session
            .subscribe(SubscribeFilter::new("a/#", QoS::AtLeastOnce))
            .unwrap();
        let second = session
            .publish(Publish::new("a/b", QoS::AtLeastOnce, "x"))
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let requests = mock.requests();
        assert_eq!(requests.len(), 3);
        assert!(matches!(requests[0], MockRequest::Connect(_)));
        assert!(matches!(
            &requests[1],
            MockRequest::Subscribe { packet_id: 1, filter } if filter.path == "a/#"
        ));
    }

    #[test]
    fn release_stops_events_and_requests() {
        let engine = MockEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = engine.new_session(endpoint(), tx).unwrap();
        let mock = engine.last_session().unwrap();

        session.release();
        session.release();
        assert!(mock.is_released());
        mock.emit_lifecycle(LifecycleEvent::Disconnected);
        assert!(rx.try_recv().is_err());
        assert!(matches!(session.ping(), Err(MqttError::NotConnected)));
        assert!(matches!(session.disconnect(), Err(MqttError::Released)));

        let releases = mock
            .requests()
            .iter()
            .filter(|r| matches!(r, MockRequest::Release))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn connected_flag_gates_requests() {
        let engine = MockEngine::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = engine.new_session(endpoint(), tx).unwrap();
        let mock = engine.last_session().unwrap();

        mock.set_connected(true);
        assert_eq!(session.publish(Publish::new("t", QoS::AtLeastOnce, "x")).unwrap(), 1);
        session.ping().unwrap();

        mock.set_connected(false);
        assert!(matches!(session.ping(), Err(MqttError::NotConnected)));

        // Emitting with no receiver is not an error for the caller.
        drop(rx);
        mock.emit(EngineEvent::PublishComplete { packet_id: 1 });
        mock.set_connected(true);
        assert_eq!(session.publish(Publish::new("t", QoS::AtLeastOnce, "x")).unwrap(), 2);
    }

    #[test]
    fn refused_sessions() {
        let engine = MockEngine::new();
        engine.refuse_sessions("no capacity");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = engine.new_session(endpoint(), tx).err().expect("should fail");
        assert!(err.to_string().contains("no capacity"));
        assert!(engine.sessions().is_empty());
    }
}
