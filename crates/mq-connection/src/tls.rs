//! TLS options for broker connections.
//!
//! Loads an optional CA certificate plus an optional client certificate and
//! private key from PEM, builds a rustls `ClientConfig` on the ring provider
//! and hands it, unmodified, to the engine.

use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::ConnectionConfig;
use crate::error::{MqttError, MqttResult};

/// Opaque TLS settings passed through to the engine.
#[derive(Clone)]
pub struct TlsConnectionOptions {
    config: Arc<ClientConfig>,
    server_name: Option<String>,
}

impl std::fmt::Debug for TlsConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnectionOptions")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsConnectionOptions {
    /// Wrap a caller-built rustls config.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            server_name: None,
        }
    }

    /// Override the SNI / certificate name; the connection host is used otherwise.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Build from PEM data.
    ///
    /// `ca` certificates are trusted in addition to the web PKI roots.
    /// `client_auth` is a `(certificate chain, private key)` pair for mutual TLS.
    pub fn from_pem(ca: Option<&[u8]>, client_auth: Option<(&[u8], &[u8])>) -> MqttResult<Self> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.into(),
        };
        if let Some(ca) = ca {
            let certs = parse_certificates(ca, "CA cert")?;
            let (added, _ignored) = roots.add_parsable_certificates(certs);
            if added == 0 {
                return Err(MqttError::Tls("CA cert contains no usable certificate".into()));
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| MqttError::Tls(e.to_string()))?
            .with_root_certificates(roots);

        let config = match client_auth {
            Some((cert, key)) => {
                let chain = parse_certificates(cert, "client cert")?;
                let key = PrivateKeyDer::from_pem_slice(key)
                    .map_err(|e| MqttError::Tls(format!("invalid client key: {e}")))?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| MqttError::Tls(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Self::new(Arc::new(config)))
    }

    /// Build from the certificate file paths in the config.
    ///
    /// An empty `ca_cert_path` trusts the web PKI roots only. Client
    /// certificate and key must be given together.
    pub fn from_config(config: &ConnectionConfig) -> MqttResult<Self> {
        let ca = if config.ca_cert_path.is_empty() {
            None
        } else {
            Some(read_pem(&config.ca_cert_path, "CA cert")?)
        };

        let client_auth = match (
            config.client_cert_path.is_empty(),
            config.client_key_path.is_empty(),
        ) {
            (true, true) => None,
            (false, false) => Some((
                read_pem(&config.client_cert_path, "client cert")?,
                read_pem(&config.client_key_path, "client key")?,
            )),
            _ => {
                return Err(MqttError::Config(
                    "client_cert_path and client_key_path must be set together".into(),
                ));
            }
        };

        Self::from_pem(
            ca.as_deref(),
            client_auth
                .as_ref()
                .map(|(cert, key)| (cert.as_slice(), key.as_slice())),
        )
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    pub(crate) fn server_name(&self, host: &str) -> MqttResult<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        ServerName::try_from(name)
            .map_err(|e| MqttError::Tls(format!("invalid server name '{host}': {e}")))
    }
}

fn read_pem(path: &str, what: &str) -> MqttResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| MqttError::Tls(format!("failed to read {what} '{path}': {e}")))
}

fn parse_certificates(pem: &[u8], what: &str) -> MqttResult<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MqttError::Tls(format!("invalid {what}: {e}")))?;
    if certs.is_empty() {
        return Err(MqttError::Tls(format!("{what} contains no certificate")));
    }
    Ok(certs)
}
