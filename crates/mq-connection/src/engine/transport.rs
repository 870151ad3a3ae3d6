//! Framed packet I/O over TCP or TLS.

use std::time::Duration;

use bytes::BytesMut;
use mq_protocol::{Packet, codec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::engine::Endpoint;
use crate::error::{MqttError, MqttResult};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) struct Transport {
    stream: Box<dyn AsyncStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_packet_size: usize,
}

impl Transport {
    /// Open TCP, then TLS when configured. Both steps share the socket
    /// connect timeout.
    pub(crate) async fn connect(endpoint: &Endpoint, max_packet_size: usize) -> MqttResult<Self> {
        let host = endpoint.host.as_str();
        let port = endpoint.port;
        let limit = endpoint.socket.connect_timeout;

        let tcp = timeout(limit, TcpStream::connect((host, port)))
            .await
            .map_err(|_| MqttError::Timeout(format!("TCP connect to {host}:{port}")))?
            .map_err(|e| MqttError::Connection(format!("{host}:{port}: {e}")))?;
        tcp.set_nodelay(endpoint.socket.nodelay)?;

        let stream: Box<dyn AsyncStream> = match &endpoint.tls {
            None => Box::new(tcp),
            Some(tls) => {
                let name = tls.server_name(host)?;
                let stream = timeout(limit, tls.connector().connect(name, tcp))
                    .await
                    .map_err(|_| MqttError::Timeout(format!("TLS handshake with {host}:{port}")))?
                    .map_err(|e| MqttError::Tls(format!("{host}:{port}: {e}")))?;
                Box::new(stream)
            }
        };

        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: BytesMut::with_capacity(4 * 1024),
            max_packet_size,
        })
    }

    pub(crate) async fn write(&mut self, packet: &Packet) -> MqttResult<()> {
        self.write_buf.clear();
        codec::encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        tracing::trace!(packet = packet.packet_type().name(), "sent");
        Ok(())
    }

    /// Write a frame that is already encoded.
    pub(crate) async fn write_frame(&mut self, frame: &[u8]) -> MqttResult<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        tracing::trace!(bytes = frame.len(), "sent frame");
        Ok(())
    }

    /// Next complete packet. Cancel safe: bytes already read stay buffered.
    pub(crate) async fn read(&mut self) -> MqttResult<Packet> {
        loop {
            if let Some(packet) = codec::decode(&mut self.read_buf, self.max_packet_size)? {
                tracing::trace!(packet = packet.packet_type().name(), "received");
                return Ok(packet);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(MqttError::ConnectionClosed);
            }
        }
    }

    /// Best-effort close; a peer that stopped reading cannot stall it.
    pub(crate) async fn shutdown(&mut self) {
        match timeout(SHUTDOWN_TIMEOUT, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "socket shutdown failed"),
            Err(_) => tracing::debug!("socket shutdown timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use mq_protocol::{ConnAck, ConnectReturnCode};
    use tokio::net::TcpListener;

    use super::*;
    use crate::socket::SocketOptions;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            host: "127.0.0.1".into(),
            port,
            socket: SocketOptions {
                connect_timeout: Duration::from_secs(2),
                nodelay: true,
            },
            tls: None,
        }
    }

    #[tokio::test]
    async fn reads_packets_split_across_segments() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut bytes = BytesMut::new();
            codec::encode(
                &Packet::ConnAck(ConnAck {
                    session_present: false,
                    code: ConnectReturnCode::Accepted,
                }),
                &mut bytes,
            )
            .unwrap();
            codec::encode(&Packet::PingResp, &mut bytes).unwrap();
            socket.write_all(&bytes[..1]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(&bytes[1..]).await.unwrap();
            socket.flush().await.unwrap();
        });

        let mut transport = Transport::connect(&endpoint(port), 1024).await.unwrap();
        assert!(matches!(transport.read().await.unwrap(), Packet::ConnAck(_)));
        assert_eq!(transport.read().await.unwrap(), Packet::PingResp);

        server.await.unwrap();
        let err = transport.read().await.unwrap_err();
        assert!(matches!(err, MqttError::ConnectionClosed));
    }

    #[tokio::test]
    async fn refused_port_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Transport::connect(&endpoint(port), 1024)
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, MqttError::Connection(_)), "{err}");
    }
}
