//! Byte-buffer protocol over one port.
//!
//! The protocol adds no framing of its own: each [`Protocol::send`] is one
//! [`Port::post_message`], and the transport delivers it as one atomic
//! message at the other end.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::transport::{DisconnectHandler, MessageHandler, Port};

// ============================================================================
// Protocol
// ============================================================================

/// Wraps exactly one [`Port`].
///
/// Cheap to clone; clones share the port.
#[derive(Clone)]
pub struct Protocol {
    port: Arc<dyn Port>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("port", &self.port.name())
            .field("connected", &self.port.is_connected())
            .finish()
    }
}

impl Protocol {
    /// Wraps a port.
    #[must_use]
    pub fn new(port: Arc<dyn Port>) -> Self {
        Self { port }
    }

    /// Logical name of the underlying port.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// Sends one buffer.
    ///
    /// Best-effort: a send on a torn-down port is logged and dropped, never
    /// reported to the caller.
    pub fn send(&self, buffer: Vec<u8>) {
        let len = buffer.len();
        match self.port.post_message(buffer) {
            Ok(()) => trace!(port = %self.port.name(), len, "Buffer sent"),
            Err(e) => warn!(port = %self.port.name(), len, error = %e, "Dropping buffer"),
        }
    }

    /// Installs the inbound buffer handler.
    pub fn on_message(&self, handler: MessageHandler) {
        self.port.on_message(handler);
    }

    /// Adds a disconnect handler.
    pub fn on_disconnect(&self, handler: DisconnectHandler) {
        self.port.on_disconnect(handler);
    }

    /// Disconnects the port. Idempotent.
    pub fn disconnect(&self) {
        self.port.disconnect();
    }

    /// Returns `false` once the port is torn down.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.port.is_connected()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::transport::ExtensionPort;

    #[tokio::test]
    async fn test_send_passes_buffer_through() {
        let (a, b) = ExtensionPort::pair("content", None);
        let left = Protocol::new(a);
        let right = Protocol::new(b);

        let (tx, mut rx) = mpsc::unbounded_channel();
        right.on_message(Box::new(move |buffer| {
            let _ = tx.send(buffer);
        }));

        left.send(vec![1, 2, 3]);
        let got = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("in time")
            .expect("buffer");
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(left.name(), "content");
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_silent() {
        let (a, _b) = ExtensionPort::pair("content", None);
        let protocol = Protocol::new(a);

        protocol.disconnect();
        protocol.disconnect();
        assert!(!protocol.is_connected());

        // Must not panic or surface an error.
        protocol.send(vec![9]);
    }
}
