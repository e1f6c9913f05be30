//! TCP listener and connector producing multiplexed sessions

use async_trait::async_trait;
use std::net::SocketAddr;
use tailnet_transport::{TransportConnector, TransportError, TransportListener, TransportResult};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::MuxConfig;
use crate::session::MuxSession;

/// Accepts TCP connections and wraps each in a server-side [`MuxSession`]
pub struct MuxListener {
    tcp_listener: TcpListener,
    config: MuxConfig,
}

impl std::fmt::Debug for MuxListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .finish()
    }
}

impl MuxListener {
    pub async fn bind(bind_addr: SocketAddr, config: MuxConfig) -> TransportResult<Self> {
        config.validate()?;

        let tcp_listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            TransportError::ConfigurationError(format!("Failed to bind {}: {}", bind_addr, e))
        })?;

        let local_addr = tcp_listener.local_addr().map_err(TransportError::IoError)?;
        info!("Mux listener bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            config,
        })
    }
}

#[async_trait]
impl TransportListener for MuxListener {
    type Connection = MuxSession;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        let (tcp_stream, remote_addr) = self
            .tcp_listener
            .accept()
            .await
            .map_err(TransportError::IoError)?;

        if let Err(e) = tcp_stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
        }

        debug!("Incoming TCP connection from {}", remote_addr);

        let session = MuxSession::server(tcp_stream, remote_addr, self.config.clone());
        Ok((session, remote_addr))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.tcp_listener
            .local_addr()
            .map_err(TransportError::IoError)
    }
}

/// Dials TCP connections and wraps each in a client-side [`MuxSession`]
#[derive(Debug, Clone, Default)]
pub struct MuxConnector {
    config: MuxConfig,
}

impl MuxConnector {
    pub fn new(config: MuxConfig) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

#[async_trait]
impl TransportConnector for MuxConnector {
    type Connection = MuxSession;

    async fn connect(&self, addr: SocketAddr) -> TransportResult<Self::Connection> {
        debug!("Connecting to coordinator at {}", addr);

        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;

        if let Err(e) = tcp_stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        info!("Connected to coordinator at {}", addr);

        Ok(MuxSession::client(tcp_stream, addr, self.config.clone()))
    }
}
