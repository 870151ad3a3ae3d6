//! Client façade: one engine context bound to a bootstrap.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bootstrap::{ClientBootstrap, EventLoopGroup};
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionHandle, MqttConnection};
use crate::engine::{Endpoint, Engine, NativeEngine};
use crate::error::{ErrorCode, LastError, MqttError, MqttResult};
use crate::socket::SocketOptions;
use crate::tls::TlsConnectionOptions;

/// Engine plus the runtime its sessions run on. Shared by the client and
/// every connection it created.
pub(crate) struct ClientContext {
    engine: Arc<dyn Engine>,
    group: Arc<EventLoopGroup>,
}

/// Creates connections. Dropping the client does not affect connections
/// already created; they keep the engine context alive.
pub struct MqttClient {
    context: Option<Arc<ClientContext>>,
    last_error: LastError,
}

impl Default for MqttClient {
    fn default() -> Self {
        Self::invalid(ErrorCode::InvalidState)
    }
}

impl MqttClient {
    /// Client backed by the native engine.
    pub fn new(bootstrap: &ClientBootstrap) -> Self {
        match bootstrap.group() {
            Ok(group) => {
                let engine = Arc::new(NativeEngine::with_group(group.clone()));
                Self::valid(engine, group)
            }
            Err(e) => Self::failed(e),
        }
    }

    /// Client backed by any engine, e.g. [`crate::MockEngine`].
    pub fn with_engine(bootstrap: &ClientBootstrap, engine: Arc<dyn Engine>) -> Self {
        match bootstrap.group() {
            Ok(group) => Self::valid(engine, group),
            Err(e) => Self::failed(e),
        }
    }

    fn valid(engine: Arc<dyn Engine>, group: Arc<EventLoopGroup>) -> Self {
        Self {
            context: Some(Arc::new(ClientContext { engine, group })),
            last_error: LastError::default(),
        }
    }

    fn failed(error: MqttError) -> Self {
        tracing::error!(error = %error, "MQTT client initialization failed");
        Self::invalid(error.code())
    }

    fn invalid(code: ErrorCode) -> Self {
        Self {
            context: None,
            last_error: LastError::new(code),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.context.is_some()
    }

    pub fn last_error(&self) -> ErrorCode {
        self.last_error.get()
    }

    /// New connection to `host:port`. Never fails outright: on error the
    /// connection is invalid and both it and the client carry the code.
    pub fn new_connection(
        &self,
        host: &str,
        port: u16,
        socket: &SocketOptions,
        tls: Option<TlsConnectionOptions>,
    ) -> MqttConnection {
        match self.try_new_connection(host, port, socket, tls) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(host, port, error = %e, "failed to create MQTT connection");
                MqttConnection::invalid(e.code())
            }
        }
    }

    pub fn try_new_connection(
        &self,
        host: &str,
        port: u16,
        socket: &SocketOptions,
        tls: Option<TlsConnectionOptions>,
    ) -> MqttResult<MqttConnection> {
        let result = self.open(host, port, socket, tls);
        self.last_error.record(result)
    }

    /// Connection built from a config: socket and TLS options plus login.
    pub fn new_connection_from_config(
        &self,
        config: &ConnectionConfig,
    ) -> MqttResult<MqttConnection> {
        let tls = self.last_error.record(config.tls_options())?;
        let connection = self.try_new_connection(
            &config.broker_host,
            config.port(),
            &config.socket_options(),
            tls,
        )?;
        if let Some(username) = &config.username {
            connection.set_login(username, config.password.as_deref())?;
        }
        Ok(connection)
    }

    fn open(
        &self,
        host: &str,
        port: u16,
        socket: &SocketOptions,
        tls: Option<TlsConnectionOptions>,
    ) -> MqttResult<MqttConnection> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| MqttError::InvalidState("client is not valid".into()))?;
        if host.is_empty() {
            return Err(MqttError::InvalidArgument("host must not be empty".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Endpoint {
            host: host.to_string(),
            port,
            socket: socket.clone(),
            tls,
        };
        let session = context.engine.new_session(endpoint, tx)?;
        let handle = ConnectionHandle::new(session, host, port, context.clone());
        handle.start_dispatcher(&context.group, rx);
        Ok(MqttConnection::new(handle))
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("valid", &self.is_valid())
            .field("last_error", &self.last_error())
            .finish()
    }
}
