//! Socket-based duplex channel.
//!
//! Wraps a WebSocket stream as a [`Port`] so a remote peer can join the
//! same channel layer as in-extension contexts. Each posted message is sent
//! as one binary frame.
//!
//! # Event Loop
//!
//! The port spawns a tokio task that handles:
//!
//! - Incoming frames (binary or text), handed to the port handler
//! - Outgoing messages queued by [`Port::post_message`]
//! - Close from either side, which tears the port down once

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

use super::port::{DisconnectHandler, MessageHandler, Port, PortCore};

// ============================================================================
// SocketCommand
// ============================================================================

/// Internal commands for the event loop.
enum SocketCommand {
    /// Send one message as a binary frame.
    Send(Vec<u8>),
    /// Close the socket.
    Shutdown,
}

// ============================================================================
// SocketPort
// ============================================================================

/// A [`Port`] over a WebSocket.
pub struct SocketPort {
    core: Arc<PortCore>,
    command_tx: mpsc::UnboundedSender<SocketCommand>,
}

impl fmt::Debug for SocketPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketPort")
            .field("name", &self.core.name())
            .field("connected", &self.core.is_connected())
            .finish()
    }
}

impl SocketPort {
    /// Wraps an established WebSocket stream.
    ///
    /// Spawns the event loop task internally.
    pub fn new<S>(ws_stream: WebSocketStream<S>, name: impl Into<String>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let core = PortCore::new(name);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_event_loop(
            ws_stream,
            command_rx,
            Arc::clone(&core),
        ));

        Arc::new(Self { core, command_tx })
    }

    /// Connects to a WebSocket URL and names the port after it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the connection or upgrade fails.
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        debug!(url, "Socket port connected");
        Ok(Self::new(ws_stream, url))
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_event_loop<S>(
        ws_stream: WebSocketStream<S>,
        mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
        core: Arc<PortCore>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming frames from the remote peer
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Binary(data))) => {
                            trace!(port = %core.name(), len = data.len(), "Frame received");
                            core.deliver(data.to_vec());
                        }

                        Some(Ok(Message::Text(text))) => {
                            core.deliver(text.as_bytes().to_vec());
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!(port = %core.name(), "WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            error!(port = %core.name(), error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!(port = %core.name(), "WebSocket stream ended");
                            break;
                        }

                        // Ignore Ping, Pong, raw frames
                        _ => {}
                    }
                }

                // Commands from the port handle
                command = command_rx.recv() => {
                    match command {
                        Some(SocketCommand::Send(data)) => {
                            if let Err(e) = ws_write.send(Message::Binary(data.into())).await {
                                warn!(port = %core.name(), error = %e, "Failed to send frame");
                                break;
                            }
                        }

                        Some(SocketCommand::Shutdown) => {
                            debug!(port = %core.name(), "Shutdown command received");
                            let _ = ws_write.close().await;
                            break;
                        }

                        None => {
                            debug!(port = %core.name(), "Command channel closed");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        core.close();
        debug!(port = %core.name(), "Socket event loop terminated");
    }
}

impl Port for SocketPort {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn post_message(&self, message: Vec<u8>) -> Result<()> {
        if !self.core.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        self.command_tx
            .send(SocketCommand::Send(message))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn on_message(&self, handler: MessageHandler) {
        self.core.set_message_handler(handler);
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.core.add_disconnect_handler(handler);
    }

    fn disconnect(&self) {
        let _ = self.command_tx.send(SocketCommand::Shutdown);
        self.core.close();
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use crate::transport::SocketListener;

    #[tokio::test]
    async fn test_socket_round_trip() {
        let listener = SocketListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind");
        let url = listener.ws_url();

        let accept = tokio::spawn(async move { listener.accept().await });
        let client = SocketPort::connect(&url).await.expect("connect");
        let server = accept.await.expect("join").expect("accept");

        let (tx, rx) = oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));
        server.on_message(Box::new(move |m| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(m);
            }
        }));

        client.post_message(b"quote".to_vec()).expect("post");
        let got = timeout(Duration::from_secs(2), rx)
            .await
            .expect("in time")
            .expect("message");
        assert_eq!(got, b"quote");

        let (dtx, drx) = oneshot::channel();
        server.on_disconnect(Box::new(move || {
            let _ = dtx.send(());
        }));
        client.disconnect();
        timeout(Duration::from_secs(2), drx)
            .await
            .expect("disconnect in time")
            .expect("signal");
    }
}
