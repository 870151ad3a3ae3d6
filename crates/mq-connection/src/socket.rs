//! Socket options handed to the engine with each new session.

use std::time::Duration;

/// Transport settings for one broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Bounds both the TCP connect (plus TLS handshake) and the CONNACK wait.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on the TCP socket.
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            nodelay: true,
        }
    }
}
