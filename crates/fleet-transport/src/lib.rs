// QUIC transport configuration and primitives.
use anyhow::{Context, Result};
use quinn::{ClientConfig, Connection, Endpoint, Incoming, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::Arc;

pub mod stream;
pub mod tls;

pub use tls::{ALPN_PROTOCOL, anonymous_client_config, mtls_client_config, mtls_server_config};

/// Transport-level configuration defaults.
///
/// ```
/// use fleet_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_frame_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    pub max_streams: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            max_streams: 256,
        }
    }
}

impl TransportConfig {
    fn quinn_transport_config(&self) -> quinn::TransportConfig {
        let mut config = quinn::TransportConfig::default();
        let streams = quinn::VarInt::from_u32(self.max_streams as u32);
        config.max_concurrent_bidi_streams(streams);
        // Calls only use bidirectional streams.
        config.max_concurrent_uni_streams(quinn::VarInt::from_u32(0));
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Stable connection identifier used for tracing/logging.
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone)]
/// Metadata about a live QUIC connection.
///
/// ```
/// use fleet_transport::{ConnectionId, ConnectionInfo};
/// use std::net::SocketAddr;
///
/// let info = ConnectionInfo {
///     id: ConnectionId(42),
///     peer_addr: "127.0.0.1:4433".parse::<SocketAddr>().expect("addr"),
/// };
/// assert_eq!(info.id.0, 42);
/// ```
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
}

/// QUIC server endpoint wrapper.
///
/// Incoming connections are handed out before their handshake so that one slow or
/// failing peer never holds up the accept loop.
#[derive(Debug)]
pub struct QuicServer {
    endpoint: Endpoint,
    transport: TransportConfig,
}

impl QuicServer {
    pub fn bind(
        addr: SocketAddr,
        mut server_config: ServerConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config();
        server_config.transport_config(Arc::new(quinn_transport));
        let endpoint = Endpoint::server(server_config, addr).context("bind QUIC server")?;
        tracing::debug!(addr = %addr, "QUIC server bound");
        Ok(Self {
            endpoint,
            transport,
        })
    }

    /// Wait for the next connection attempt. `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Handshake> {
        self.endpoint.accept().await.map(Handshake)
    }

    /// Refuse new connection attempts; established connections keep working.
    pub fn stop_accepting(&self) {
        tracing::debug!("QUIC server no longer accepting");
        self.endpoint.set_server_config(None);
    }

    /// Close every connection and wait for the peers to be notified.
    pub async fn shutdown(&self) {
        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
        self.endpoint.wait_idle().await;
        tracing::debug!("QUIC server endpoint idle");
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("read QUIC local address")
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }
}

/// A connection attempt whose TLS handshake has not run yet.
#[derive(Debug)]
pub struct Handshake(Incoming);

impl Handshake {
    pub fn remote_address(&self) -> SocketAddr {
        self.0.remote_address()
    }

    /// Run the handshake. Fails when the peer cannot be authenticated.
    pub async fn complete(self) -> Result<QuicConnection> {
        let connection = self.0.await.context("accept QUIC connection")?;
        QuicConnection::new(connection)
    }
}

/// QUIC client endpoint wrapper.
#[derive(Debug)]
pub struct QuicClient {
    endpoint: Endpoint,
    transport: TransportConfig,
}

impl QuicClient {
    pub fn bind(
        addr: SocketAddr,
        mut client_config: ClientConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        let quinn_transport = transport.quinn_transport_config();
        client_config.transport_config(Arc::new(quinn_transport));
        let mut endpoint = Endpoint::client(addr).context("bind QUIC client")?;
        endpoint.set_default_client_config(client_config);
        Ok(Self {
            endpoint,
            transport,
        })
    }

    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .context("initiate QUIC connection")?;
        let connection = connecting.await.context("establish QUIC connection")?;
        QuicConnection::new(connection)
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }
}

/// Active QUIC connection wrapper with convenience helpers.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    info: ConnectionInfo,
}

impl QuicConnection {
    fn new(connection: Connection) -> Result<Self> {
        let id = u64::try_from(connection.stable_id()).context("connection id")?;
        let info = ConnectionInfo {
            id: ConnectionId(id),
            peer_addr: connection.remote_address(),
        };
        Ok(Self {
            inner: connection,
            info,
        })
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Certificate chain the peer presented, leaf first, as verified by the handshake.
    ///
    /// `None` when the peer authenticated without a certificate.
    pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.inner
            .peer_identity()?
            .downcast::<Vec<CertificateDer<'static>>>()
            .ok()
            .map(|chain| *chain)
            .filter(|chain| !chain.is_empty())
    }

    /// Open a bidirectional stream to the peer.
    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.open_bi().await.context("open bidi stream")
    }

    /// Accept the next bidirectional stream from the peer.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.accept_bi().await.context("accept bidi stream")
    }

    pub fn close(&self, reason: &str) {
        self.inner.close(quinn::VarInt::from_u32(0), reason.as_bytes());
    }

    /// Resolves once the connection is closed by either side.
    pub async fn closed(&self) -> quinn::ConnectionError {
        self.inner.closed().await
    }
}
