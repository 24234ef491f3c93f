//! Port contract and shared port state.
//!
//! A [`Port`] is the minimal async duplex primitive every transport
//! provides: post one message, receive messages through a handler, learn
//! about disconnection, and disconnect. Each `post_message` arrives as one
//! atomic message at the other end.
//!
//! [`PortCore`] holds the bookkeeping every transport shares:
//!
//! - Messages that arrive before a handler is attached are buffered and
//!   replayed in order once one is.
//! - Disconnect handlers fire exactly once, on whichever side tears down
//!   first; handlers added after teardown run immediately.
//! - Nothing is delivered after teardown.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Result;

// ============================================================================
// Types
// ============================================================================

/// Callback invoked for each inbound message.
pub type MessageHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Callback invoked once when the port disconnects.
pub type DisconnectHandler = Box<dyn FnOnce() + Send>;

// ============================================================================
// PortSender
// ============================================================================

/// Origin of a port as reported by the host platform.
///
/// Only available on the accepting side, and only for transports whose
/// platform reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSender {
    /// Window the connecting context lives in.
    pub window_id: Option<u32>,
    /// Tab the connecting context lives in.
    pub tab_id: Option<u32>,
    /// Frame the connecting context lives in.
    pub frame_id: Option<u32>,
}

// ============================================================================
// Port
// ============================================================================

/// Minimal duplex message transport.
pub trait Port: Send + Sync + 'static {
    /// Logical name the port was opened under.
    fn name(&self) -> &str;

    /// Platform-reported origin, if any.
    fn sender(&self) -> Option<&PortSender> {
        None
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed)
    /// once the port is torn down.
    fn post_message(&self, message: Vec<u8>) -> Result<()>;

    /// Installs the inbound message handler, replacing any previous one.
    fn on_message(&self, handler: MessageHandler);

    /// Adds a disconnect handler.
    fn on_disconnect(&self, handler: DisconnectHandler);

    /// Tears the port down. Idempotent.
    fn disconnect(&self);

    /// Returns `false` once the port is torn down.
    fn is_connected(&self) -> bool;
}

// ============================================================================
// PortCore
// ============================================================================

/// Inbound side of a port.
#[derive(Default)]
struct Inbox {
    handler: Option<MessageHandler>,
    backlog: Vec<Vec<u8>>,
}

/// State shared by every [`Port`] implementation.
pub struct PortCore {
    name: String,
    connected: AtomicBool,
    inbox: Mutex<Inbox>,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
}

impl fmt::Debug for PortCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortCore")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl PortCore {
    /// Creates a connected core.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            connected: AtomicBool::new(true),
            inbox: Mutex::new(Inbox::default()),
            disconnect_handlers: Mutex::new(Vec::new()),
        })
    }

    /// Port name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `false` once closed.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Hands an inbound message to the handler, or buffers it.
    ///
    /// Runs the handler under the inbox lock so delivery order matches
    /// arrival order even while a handler is being installed.
    pub fn deliver(&self, message: Vec<u8>) {
        if !self.is_connected() {
            trace!(port = %self.name, "Dropping message for closed port");
            return;
        }

        let mut inbox = self.inbox.lock();
        match &inbox.handler {
            Some(handler) => handler(message),
            None => inbox.backlog.push(message),
        }
    }

    /// Installs the message handler and replays the backlog into it.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        let mut inbox = self.inbox.lock();
        let backlog = std::mem::take(&mut inbox.backlog);
        for message in backlog {
            handler(message);
        }
        inbox.handler = Some(handler);
    }

    /// Adds a disconnect handler; runs it now if already closed.
    pub fn add_disconnect_handler(&self, handler: DisconnectHandler) {
        {
            let mut handlers = self.disconnect_handlers.lock();
            if self.is_connected() {
                handlers.push(handler);
                return;
            }
        }
        handler();
    }

    /// Marks the core closed and fires disconnect handlers.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let handlers = {
            let mut handlers = self.disconnect_handlers.lock();
            if !self.connected.swap(false, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *handlers)
        };

        trace!(port = %self.name, handlers = handlers.len(), "Port closed");
        for handler in handlers {
            handler();
        }
        true
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_backlog_replayed_in_order() {
        let core = PortCore::new("test");
        core.deliver(vec![1]);
        core.deliver(vec![2]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        core.set_message_handler(Box::new(move |m| seen_clone.lock().push(m[0])));
        core.deliver(vec![3]);

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_close_fires_handlers_once() {
        let core = PortCore::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        core.add_disconnect_handler(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(core.close());
        assert!(!core.close());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!core.is_connected());
    }

    #[test]
    fn test_late_disconnect_handler_runs_immediately() {
        let core = PortCore::new("test");
        core.close();

        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        core.add_disconnect_handler(Box::new(move || f.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_no_delivery_after_close() {
        let core = PortCore::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        core.set_message_handler(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        core.close();
        core.deliver(vec![0]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
