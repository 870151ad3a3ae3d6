//! Event-loop group for MQTT clients.
//!
//! A bootstrap either owns a multi-thread tokio runtime or borrows the
//! handle of one the caller already runs. Engine tasks and callback
//! dispatchers are spawned on it. Clients and connections hold a shared
//! reference, so an owned runtime lives until the last of them is dropped.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::error::{ErrorCode, MqttError, MqttResult};

pub(crate) struct EventLoopGroup {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl EventLoopGroup {
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        // The last reference may be dropped from inside one of our own tasks,
        // where a blocking shutdown would panic.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Event-loop group handed to [`crate::MqttClient::new`].
pub struct ClientBootstrap {
    group: Option<Arc<EventLoopGroup>>,
    last_error: ErrorCode,
}

impl ClientBootstrap {
    /// Start an owned runtime with `threads` worker threads.
    ///
    /// Never panics: `threads == 0` or a runtime build failure yields an
    /// invalid bootstrap whose `last_error()` says why.
    pub fn new(threads: usize) -> Self {
        match Self::build(threads) {
            Ok(runtime) => Self {
                group: Some(Arc::new(EventLoopGroup {
                    handle: runtime.handle().clone(),
                    runtime: Some(runtime),
                })),
                last_error: ErrorCode::Success,
            },
            Err(e) => {
                tracing::error!(threads, error = %e, "failed to start MQTT event loop");
                Self {
                    group: None,
                    last_error: e.code(),
                }
            }
        }
    }

    /// Borrow an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            group: Some(Arc::new(EventLoopGroup {
                handle,
                runtime: None,
            })),
            last_error: ErrorCode::Success,
        }
    }

    /// Borrow the runtime the caller is running on.
    pub fn current() -> MqttResult<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|e| MqttError::Bootstrap(e.to_string()))
    }

    pub fn is_valid(&self) -> bool {
        self.group.is_some()
    }

    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    pub(crate) fn group(&self) -> MqttResult<Arc<EventLoopGroup>> {
        self.group
            .clone()
            .ok_or_else(|| MqttError::Bootstrap("bootstrap is not valid".into()))
    }

    fn build(threads: usize) -> MqttResult<Runtime> {
        if threads == 0 {
            return Err(MqttError::InvalidArgument(
                "bootstrap needs at least one thread".into(),
            ));
        }
        Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("mq-event-loop")
            .enable_all()
            .build()
            .map_err(|e| MqttError::Bootstrap(e.to_string()))
    }
}

impl std::fmt::Debug for ClientBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBootstrap")
            .field("valid", &self.is_valid())
            .field("last_error", &self.last_error)
            .finish()
    }
}
