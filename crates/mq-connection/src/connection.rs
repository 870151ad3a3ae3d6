//! Connection façade.
//!
//! [`MqttConnection`] owns one engine session plus the user's callbacks.
//! Requests are forwarded to the session and return at once; engine events
//! come back through a dispatcher task that looks handlers up under the
//! registry lock and invokes them after releasing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use mq_protocol::{
    ConnectReturnCode, LastWill, Login, Publish, QoS, SubscribeFilter, SubscribeReturnCode, codec,
    topic,
};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::bootstrap::EventLoopGroup;
use crate::client::ClientContext;
use crate::engine::{ConnectOptions, EngineEvent, LifecycleEvent, Session};
use crate::error::{ErrorCode, LastError, MqttError, MqttResult};
use crate::handler::{OnPublishReceived, Registry};

struct ConnectionInner {
    session: Arc<dyn Session>,
    host: String,
    port: u16,
    registry: Mutex<Registry>,
    last_error: LastError,
    released: AtomicBool,
    _client: Arc<ClientContext>,
}

/// Cloneable reference to a live connection, handed to every callback.
///
/// Handles do not own the session: once the [`MqttConnection`] is dropped,
/// every request through a handle fails with `Released`.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub(crate) fn new(
        session: Arc<dyn Session>,
        host: &str,
        port: u16,
        client: Arc<ClientContext>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                session,
                host: host.to_string(),
                port,
                registry: Mutex::new(Registry::default()),
                last_error: LastError::default(),
                released: AtomicBool::new(false),
                _client: client,
            }),
        }
    }

    /// Spawn the task that turns engine events into callbacks. It holds
    /// only a weak reference, so it never keeps the connection alive.
    pub(crate) fn start_dispatcher(
        &self,
        group: &EventLoopGroup,
        events: UnboundedReceiver<EngineEvent>,
    ) {
        group.spawn(dispatch(Arc::downgrade(&self.inner), events));
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record<T>(&self, result: MqttResult<T>) -> MqttResult<T> {
        self.inner.last_error.record(result)
    }

    fn ensure_live(&self) -> MqttResult<()> {
        if self.is_released() {
            return Err(MqttError::Released);
        }
        Ok(())
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn last_error(&self) -> ErrorCode {
        self.inner.last_error.get()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    // ── Handlers ──────────────────────────────────────────────

    pub fn set_on_connection_failed(
        &self,
        f: impl Fn(&ConnectionHandle, ErrorCode) + Send + Sync + 'static,
    ) {
        self.registry().on_connection_failed = Some(Arc::new(f));
    }

    pub fn set_on_connack(
        &self,
        f: impl Fn(&ConnectionHandle, ConnectReturnCode, bool) + Send + Sync + 'static,
    ) {
        self.registry().on_connack = Some(Arc::new(f));
    }

    pub fn set_on_disconnect(&self, f: impl Fn(&ConnectionHandle) + Send + Sync + 'static) {
        self.registry().on_disconnect = Some(Arc::new(f));
    }

    pub fn set_on_interrupted(
        &self,
        f: impl Fn(&ConnectionHandle, ErrorCode) + Send + Sync + 'static,
    ) {
        self.registry().on_interrupted = Some(Arc::new(f));
    }

    // ── Requests ──────────────────────────────────────────────

    /// Last will sent with the next CONNECT.
    pub fn set_will(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> MqttResult<()> {
        let result = self.ensure_live().and_then(|()| {
            topic::validate_topic_name(topic)
                .map_err(|e| MqttError::InvalidArgument(e.to_string()))?;
            let payload = payload.into();
            if payload.len() > usize::from(u16::MAX) {
                return Err(MqttError::InvalidArgument(format!(
                    "will payload of {} bytes exceeds {}",
                    payload.len(),
                    u16::MAX
                )));
            }
            self.inner.session.set_will(LastWill {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            })
        });
        self.record(result)
    }

    /// Credentials sent with the next CONNECT.
    pub fn set_login(&self, username: &str, password: Option<&str>) -> MqttResult<()> {
        let result = self.ensure_live().and_then(|()| {
            self.inner.session.set_login(Login {
                username: username.to_string(),
                password: password.map(str::to_string),
            })
        });
        self.record(result)
    }

    /// Start connecting with the default ping timeout and reconnect policy.
    pub fn connect(
        &self,
        client_id: &str,
        clean_session: bool,
        keep_alive_secs: u16,
    ) -> MqttResult<()> {
        self.connect_with(ConnectOptions::new(client_id, clean_session, keep_alive_secs))
    }

    /// Start connecting. Exactly one of the connack / connection-failed
    /// handlers in effect now fires for this attempt.
    pub fn connect_with(&self, options: ConnectOptions) -> MqttResult<()> {
        let result = self.ensure_live().and_then(|()| {
            let mut registry = self.registry();
            let attempt = self.inner.session.connect(options)?;
            registry.begin_attempt(attempt);
            Ok(())
        });
        self.record(result)
    }

    /// Graceful teardown; the disconnect handler in effect now fires once
    /// the session has closed.
    pub fn disconnect(&self) -> MqttResult<()> {
        let result = self.ensure_live().and_then(|()| {
            let mut registry = self.registry();
            self.inner.session.disconnect()?;
            registry.begin_disconnect();
            Ok(())
        });
        self.record(result)
    }

    /// Subscribe `filter`; returns the packet id or `0` on submission failure.
    pub fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        on_publish: impl Fn(&ConnectionHandle, &str, &Bytes) + Send + Sync + 'static,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> u16 {
        self.try_subscribe(filter, qos, on_publish, on_complete)
            .unwrap_or(0)
    }

    pub fn try_subscribe(
        &self,
        filter: &str,
        qos: QoS,
        on_publish: impl Fn(&ConnectionHandle, &str, &Bytes) + Send + Sync + 'static,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> MqttResult<u16> {
        let result = self.ensure_live().and_then(|()| {
            topic::validate_topic_filter(filter)
                .map_err(|e| MqttError::InvalidArgument(e.to_string()))?;
            let mut registry = self.registry();
            let packet_id = self
                .inner
                .session
                .subscribe(SubscribeFilter::new(filter, qos))?;
            let on_publish: OnPublishReceived = Arc::new(on_publish);
            registry.subscribe(filter, on_publish.clone());
            registry.subscribing(packet_id, filter, on_publish);
            registry.add_operation(packet_id, Arc::new(on_complete));
            tracing::debug!(filter, packet_id, "subscribe submitted");
            Ok(packet_id)
        });
        self.record(result)
    }

    /// Unsubscribe `filter`; its publish handler goes away on UNSUBACK.
    pub fn unsubscribe(
        &self,
        filter: &str,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> u16 {
        self.try_unsubscribe(filter, on_complete).unwrap_or(0)
    }

    pub fn try_unsubscribe(
        &self,
        filter: &str,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> MqttResult<u16> {
        let result = self.ensure_live().and_then(|()| {
            topic::validate_topic_filter(filter)
                .map_err(|e| MqttError::InvalidArgument(e.to_string()))?;
            let mut registry = self.registry();
            let packet_id = self.inner.session.unsubscribe(filter.to_string())?;
            registry.unsubscribing(packet_id, filter);
            registry.add_operation(packet_id, Arc::new(on_complete));
            tracing::debug!(filter, packet_id, "unsubscribe submitted");
            Ok(packet_id)
        });
        self.record(result)
    }

    /// Publish; returns the packet id (a local one for QoS 0) or `0`.
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> u16 {
        self.try_publish(topic, qos, retain, payload, on_complete)
            .unwrap_or(0)
    }

    pub fn try_publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> MqttResult<u16> {
        let result = self.ensure_live().and_then(|()| {
            topic::validate_topic_name(topic)
                .map_err(|e| MqttError::InvalidArgument(e.to_string()))?;
            let publish = Publish {
                retain,
                ..Publish::new(topic, qos, payload)
            };
            let len = codec::publish_remaining_length(&publish);
            if len > codec::MAX_REMAINING_LENGTH {
                return Err(MqttError::InvalidArgument(format!(
                    "publish of {len} bytes exceeds the MQTT packet limit"
                )));
            }
            let mut registry = self.registry();
            let packet_id = self.inner.session.publish(publish)?;
            registry.add_operation(packet_id, Arc::new(on_complete));
            tracing::debug!(topic, packet_id, %qos, "publish submitted");
            Ok(packet_id)
        });
        self.record(result)
    }

    /// Send an explicit PINGREQ.
    pub fn ping(&self) -> MqttResult<()> {
        let result = self
            .ensure_live()
            .and_then(|()| self.inner.session.ping());
        self.record(result)
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Release the session exactly once and drop every stored callback.
    fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.session.release();
        let pending = {
            let mut registry = self.registry();
            let pending = registry.pending_operations();
            *registry = Registry::default();
            pending
        };
        if pending > 0 {
            tracing::debug!(
                host = %self.inner.host,
                discarded = pending,
                "connection released with operations pending"
            );
        }
    }

    fn dispatch(&self, event: EngineEvent) {
        match event {
            EngineEvent::Lifecycle { attempt, event } => {
                let handlers = self
                    .registry()
                    .attempt_handlers(attempt, event.is_terminal());
                match event {
                    LifecycleEvent::ConnectionFailed(error) => {
                        if let Some(f) = handlers.on_connection_failed {
                            f(self, error);
                        }
                    }
                    LifecycleEvent::ConnAck {
                        code,
                        session_present,
                    } => {
                        if let Some(f) = handlers.on_connack {
                            f(self, code, session_present);
                        }
                    }
                    LifecycleEvent::Interrupted(error) => {
                        if let Some(f) = handlers.on_interrupted {
                            f(self, error);
                        }
                    }
                    LifecycleEvent::Disconnected => {
                        if let Some(f) = handlers.on_disconnect {
                            f(self);
                        }
                    }
                }
            }
            EngineEvent::Publish(publish) => {
                let handlers = self.registry().publish_handlers(&publish.topic);
                if handlers.is_empty() {
                    tracing::debug!(topic = %publish.topic, "publish matched no subscription");
                }
                for f in handlers {
                    f(self, &publish.topic, &publish.payload);
                }
            }
            EngineEvent::SubAck {
                packet_id,
                return_codes,
            } => {
                if return_codes.contains(&SubscribeReturnCode::Failure) {
                    let filter = self.registry().subscription_rejected(packet_id);
                    tracing::warn!(packet_id, ?filter, "broker rejected subscription");
                }
                self.complete(packet_id);
            }
            EngineEvent::UnsubAck { packet_id } | EngineEvent::PublishComplete { packet_id } => {
                self.complete(packet_id);
            }
        }
    }

    fn complete(&self, packet_id: u16) {
        let on_complete = self.registry().complete(packet_id);
        if let Some(f) = on_complete {
            f(self, packet_id);
        }
    }
}

/// Forward engine events to the connection's handlers until the session
/// is released or the engine drops its sender.
async fn dispatch(connection: Weak<ConnectionInner>, mut events: UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = connection.upgrade() else {
            break;
        };
        let handle = ConnectionHandle { inner };
        if handle.is_released() {
            break;
        }
        handle.dispatch(event);
    }
}

// ── MqttConnection ────────────────────────────────────────────

/// One MQTT connection. Dropping it releases the session.
///
/// `Default` is the invalid, moved-from state; `std::mem::take` moves a
/// connection out and leaves one of those behind.
pub struct MqttConnection {
    handle: Option<ConnectionHandle>,
    error: ErrorCode,
}

impl Default for MqttConnection {
    fn default() -> Self {
        Self::invalid(ErrorCode::InvalidState)
    }
}

impl MqttConnection {
    pub(crate) fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle: Some(handle),
            error: ErrorCode::Success,
        }
    }

    pub(crate) fn invalid(error: ErrorCode) -> Self {
        Self {
            handle: None,
            error,
        }
    }

    fn live(&self) -> MqttResult<&ConnectionHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| MqttError::InvalidState("connection is not valid".into()))
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_some()
    }

    pub fn last_error(&self) -> ErrorCode {
        self.handle
            .as_ref()
            .map_or(self.error, ConnectionHandle::last_error)
    }

    /// Cloneable handle for use from callbacks and other tasks.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.handle.clone()
    }

    pub fn host(&self) -> &str {
        self.handle.as_ref().map_or("", ConnectionHandle::host)
    }

    pub fn port(&self) -> u16 {
        self.handle.as_ref().map_or(0, ConnectionHandle::port)
    }

    pub fn set_on_connection_failed(
        &self,
        f: impl Fn(&ConnectionHandle, ErrorCode) + Send + Sync + 'static,
    ) {
        if let Some(handle) = &self.handle {
            handle.set_on_connection_failed(f);
        }
    }

    pub fn set_on_connack(
        &self,
        f: impl Fn(&ConnectionHandle, ConnectReturnCode, bool) + Send + Sync + 'static,
    ) {
        if let Some(handle) = &self.handle {
            handle.set_on_connack(f);
        }
    }

    pub fn set_on_disconnect(&self, f: impl Fn(&ConnectionHandle) + Send + Sync + 'static) {
        if let Some(handle) = &self.handle {
            handle.set_on_disconnect(f);
        }
    }

    pub fn set_on_interrupted(
        &self,
        f: impl Fn(&ConnectionHandle, ErrorCode) + Send + Sync + 'static,
    ) {
        if let Some(handle) = &self.handle {
            handle.set_on_interrupted(f);
        }
    }

    pub fn set_will(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> MqttResult<()> {
        self.live()?.set_will(topic, qos, retain, payload)
    }

    pub fn set_login(&self, username: &str, password: Option<&str>) -> MqttResult<()> {
        self.live()?.set_login(username, password)
    }

    pub fn connect(
        &self,
        client_id: &str,
        clean_session: bool,
        keep_alive_secs: u16,
    ) -> MqttResult<()> {
        self.live()?.connect(client_id, clean_session, keep_alive_secs)
    }

    pub fn connect_with(&self, options: ConnectOptions) -> MqttResult<()> {
        self.live()?.connect_with(options)
    }

    pub fn disconnect(&self) -> MqttResult<()> {
        self.live()?.disconnect()
    }

    pub fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        on_publish: impl Fn(&ConnectionHandle, &str, &Bytes) + Send + Sync + 'static,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> u16 {
        self.try_subscribe(filter, qos, on_publish, on_complete)
            .unwrap_or(0)
    }

    pub fn try_subscribe(
        &self,
        filter: &str,
        qos: QoS,
        on_publish: impl Fn(&ConnectionHandle, &str, &Bytes) + Send + Sync + 'static,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> MqttResult<u16> {
        self.live()?
            .try_subscribe(filter, qos, on_publish, on_complete)
    }

    pub fn unsubscribe(
        &self,
        filter: &str,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> u16 {
        self.try_unsubscribe(filter, on_complete).unwrap_or(0)
    }

    pub fn try_unsubscribe(
        &self,
        filter: &str,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> MqttResult<u16> {
        self.live()?.try_unsubscribe(filter, on_complete)
    }

    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> u16 {
        self.try_publish(topic, qos, retain, payload, on_complete)
            .unwrap_or(0)
    }

    pub fn try_publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
        on_complete: impl Fn(&ConnectionHandle, u16) + Send + Sync + 'static,
    ) -> MqttResult<u16> {
        self.live()?
            .try_publish(topic, qos, retain, payload, on_complete)
    }

    pub fn ping(&self) -> MqttResult<()> {
        self.live()?.ping()
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl std::fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnection")
            .field("handle", &self.handle)
            .field("last_error", &self.last_error())
            .finish()
    }
}
