//! In-extension duplex channel.
//!
//! Models the extension runtime's named port: two connected ends, ordered
//! delivery, one message per post, and asynchronous delivery (a post never
//! runs the remote handler on the caller's stack). The accepting end carries
//! the platform-reported [`PortSender`].
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use context_bridge::transport::{ExtensionPort, Port};
//!
//! let (client, server) = ExtensionPort::pair("documentId:1:2:0", None);
//! client.post_message(b"hello".to_vec()).unwrap();
//! server.disconnect();
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

use super::port::{DisconnectHandler, MessageHandler, Port, PortCore, PortSender};

// ============================================================================
// ExtensionPort
// ============================================================================

/// One end of an in-extension port pair.
pub struct ExtensionPort {
    core: Arc<PortCore>,
    /// Outbound queue to the other end; `None` once disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    sender: Option<PortSender>,
}

impl fmt::Debug for ExtensionPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPort")
            .field("name", &self.core.name())
            .field("connected", &self.core.is_connected())
            .field("sender", &self.sender)
            .finish()
    }
}

impl ExtensionPort {
    /// Opens a connected pair under `name`.
    ///
    /// Returns `(connecting end, accepting end)`; `sender` is attached to
    /// the accepting end. Must be called inside a tokio runtime.
    #[must_use]
    pub fn pair(name: impl Into<String>, sender: Option<PortSender>) -> (Arc<Self>, Arc<Self>) {
        let name = name.into();
        let client_core = PortCore::new(name.clone());
        let server_core = PortCore::new(name);

        let (to_server, server_rx) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::pump(server_rx, Arc::clone(&server_core)));
        tokio::spawn(Self::pump(client_rx, Arc::clone(&client_core)));

        let client = Arc::new(Self {
            core: client_core,
            outbound: Mutex::new(Some(to_server)),
            sender: None,
        });
        let server = Arc::new(Self {
            core: server_core,
            outbound: Mutex::new(Some(to_client)),
            sender,
        });

        (client, server)
    }

    /// Moves messages from the queue into `core` until the other end goes
    /// away, then closes `core`.
    async fn pump(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, core: Arc<PortCore>) {
        while let Some(message) = rx.recv().await {
            core.deliver(message);
        }
        if core.close() {
            debug!(port = %core.name(), "Remote end disconnected");
        }
    }
}

impl Port for ExtensionPort {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn sender(&self) -> Option<&PortSender> {
        self.sender.as_ref()
    }

    fn post_message(&self, message: Vec<u8>) -> Result<()> {
        if !self.core.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(Error::ConnectionClosed)?;
        tx.send(message).map_err(|_| Error::ConnectionClosed)
    }

    fn on_message(&self, handler: MessageHandler) {
        self.core.set_message_handler(handler);
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.core.add_disconnect_handler(handler);
    }

    fn disconnect(&self) {
        // Dropping the queue ends the remote pump, which closes the other end.
        self.outbound.lock().take();
        if self.core.close() {
            debug!(port = %self.core.name(), "Port disconnected locally");
        }
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

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_messages_cross_in_order() {
        let (client, server) = ExtensionPort::pair("documentA:1:2:0", None);

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        server.on_message(Box::new(move |m| {
            let mut seen = seen_clone.lock();
            seen.push(m);
            if seen.len() == 3
                && let Some(tx) = tx.lock().take()
            {
                let _ = tx.send(());
            }
        }));

        for i in 0..3u8 {
            client.post_message(vec![i]).expect("post");
        }

        timeout(Duration::from_secs(1), rx)
            .await
            .expect("delivered")
            .expect("signal");
        assert_eq!(*seen.lock(), vec![vec![0], vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_disconnect_reaches_other_end() {
        let (client, server) = ExtensionPort::pair("panel:1", None);

        let (tx, rx) = oneshot::channel();
        server.on_disconnect(Box::new(move || {
            let _ = tx.send(());
        }));

        client.disconnect();
        assert!(!client.is_connected());

        timeout(Duration::from_secs(1), rx)
            .await
            .expect("disconnect observed")
            .expect("signal");
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn test_post_after_disconnect_fails() {
        let (client, _server) = ExtensionPort::pair("panel:1", None);
        client.disconnect();
        assert!(matches!(
            client.post_message(vec![1]),
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_local_disconnect_fires_local_handler_once() {
        let (client, _server) = ExtensionPort::pair("panel:1", None);
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        client.on_disconnect(Box::new(move || {
            assert!(!f.swap(true, Ordering::SeqCst), "fired twice");
        }));

        client.disconnect();
        client.disconnect();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sender_on_accepting_end() {
        let sender = PortSender {
            window_id: Some(1),
            tab_id: Some(42),
            frame_id: Some(0),
        };
        let (client, server) = ExtensionPort::pair("documentA:1:42:0", Some(sender.clone()));
        assert!(client.sender().is_none());
        assert_eq!(server.sender(), Some(&sender));
    }
}
