//! WebSocket listener for remote peers.
//!
//! # Connection Flow
//!
//! 1. Bind to `localhost:0` (random port) or a fixed address
//! 2. The remote peer connects to [`SocketListener::ws_url`]
//! 3. [`SocketListener::accept`] upgrades the TCP stream to a WebSocket
//! 4. The resulting [`SocketPort`] is handed to the hub, which waits for the
//!    identity handshake

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::socket::SocketPort;

// ============================================================================
// SocketListener
// ============================================================================

/// A bound WebSocket server accepting remote peers.
///
/// # Example
///
/// ```ignore
/// use std::net::{IpAddr, Ipv4Addr};
/// use context_bridge::transport::SocketListener;
///
/// let listener = SocketListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
/// println!("remote peers connect to {}", listener.ws_url());
///
/// let port = listener.accept().await?;
/// ```
#[derive(Debug)]
pub struct SocketListener {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Address the listener is bound to.
    local_addr: SocketAddr,
}

impl SocketListener {
    /// Binds to the specified address and port.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let addr = SocketAddr::new(ip, port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        debug!(port = local_addr.port(), "WebSocket listener bound");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the port the listener is bound to.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the bound socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL for this listener.
    ///
    /// Format: `ws://{ip}:{port}`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Accepts the next connection and completes the WebSocket upgrade.
    ///
    /// The port is named after the peer's socket address.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if accepting the TCP connection fails
    /// - [`Error::Transport`] if the WebSocket upgrade fails
    pub async fn accept(&self) -> Result<Arc<SocketPort>> {
        let (stream, addr) = self.listener.accept().await?;
        debug!(?addr, "TCP connection accepted");

        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::transport(format!("WebSocket upgrade failed: {e}")))?;

        info!(?addr, "WebSocket connection established");

        Ok(SocketPort::new(ws_stream, addr.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_bind_random_port() {
        let listener = SocketListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind should succeed");

        assert!(listener.port() > 0);
        assert_eq!(
            listener.ws_url(),
            format!("ws://127.0.0.1:{}", listener.port())
        );
    }

    #[tokio::test]
    async fn test_local_addr() {
        let listener = SocketListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind should succeed");

        let addr = listener.local_addr();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr.port(), listener.port());
    }
}
