//! Channel contracts: server-side handlers and client-side proxies.
//!
//! A channel is a named service surface. The side that owns it registers a
//! [`ServerChannel`]; the other side reaches it through a [`ChannelProxy`].
//!
//! | Direction | Type | Wire frames |
//! |-----------|------|-------------|
//! | Command | [`ChannelProxy::call`] → [`ServerChannel::call`] | `request` / `response` / `error` |
//! | Event | [`ChannelProxy::listen`] → [`ServerChannel::listen`] | `listen` / `event` / `eventEnd` / `unlisten` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identifiers::ConnectionId;
use crate::identity::{Identity, parse_identity};

// ============================================================================
// Types
// ============================================================================

/// Event values produced by a [`ServerChannel`] for one listen.
///
/// The stream ending sends `eventEnd` to the listener.
pub type EventSource = BoxStream<'static, Value>;

/// Creates a sender/[`EventSource`] pair.
///
/// Dropping the sender ends the source.
#[must_use]
pub fn event_channel() -> (mpsc::UnboundedSender<Value>, EventSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let source = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|value| (value, rx))
    })
    .boxed();
    (tx, source)
}

// ============================================================================
// CallContext
// ============================================================================

/// Who is calling a [`ServerChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Identity string of the remote context.
    pub identity: String,
    /// Transport-level id of the connection the call arrived on.
    pub connection_id: ConnectionId,
}

impl CallContext {
    /// Parses the caller's identity.
    #[inline]
    #[must_use]
    pub fn parsed_identity(&self) -> Option<Identity> {
        parse_identity(&self.identity)
    }
}

// ============================================================================
// ServerChannel
// ============================================================================

/// A local service exposed to the remote side of a peer.
///
/// # Example
///
/// ```ignore
/// struct Quotes;
///
/// #[async_trait]
/// impl ServerChannel for Quotes {
///     async fn call(&self, _ctx: &CallContext, command: &str, arg: Value) -> Result<Value> {
///         match command {
///             "latest" => Ok(json!({ "symbol": arg["symbol"], "last": 501.2 })),
///             _ => Err(Error::unknown_command("quotes", command)),
///         }
///     }
///
///     fn listen(&self, _ctx: &CallContext, event: &str, _arg: Value) -> Result<EventSource> {
///         Err(Error::unknown_event("quotes", event))
///     }
/// }
/// ```
#[async_trait]
pub trait ServerChannel: Send + Sync + 'static {
    /// Handles one command. An `Err` is sent back as an `error` frame.
    async fn call(&self, ctx: &CallContext, command: &str, arg: Value) -> Result<Value>;

    /// Starts an event subscription.
    ///
    /// The returned source is dropped when the listener unsubscribes or
    /// the peer is disposed.
    fn listen(&self, ctx: &CallContext, event: &str, arg: Value) -> Result<EventSource>;
}

// ============================================================================
// ChannelTarget
// ============================================================================

/// Whatever a [`ChannelProxy`] sends its traffic through.
#[async_trait]
pub(crate) trait ChannelTarget: Send + Sync {
    async fn call(&self, channel: &str, command: &str, arg: Value) -> Result<Value>;

    fn listen(&self, channel: &str, event: &str, arg: Value) -> Result<EventStream>;
}

// ============================================================================
// ChannelProxy
// ============================================================================

/// Client-side handle to a remote channel.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ChannelProxy {
    name: Arc<str>,
    target: Arc<dyn ChannelTarget>,
}

impl fmt::Debug for ChannelProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelProxy")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ChannelProxy {
    pub(crate) fn new(name: &str, target: Arc<dyn ChannelTarget>) -> Self {
        Self {
            name: Arc::from(name),
            target,
        }
    }

    /// Channel name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes `command` and waits for the result.
    ///
    /// # Errors
    ///
    /// - [`Error::Remote`](crate::Error::Remote) if the handler failed
    /// - [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if the
    ///   port dropped before the response arrived
    /// - [`Error::CallTimeout`](crate::Error::CallTimeout) after the
    ///   configured call timeout
    /// - [`Error::Json`](crate::Error::Json) if `arg` does not serialize
    pub async fn call(&self, command: &str, arg: impl Serialize) -> Result<Value> {
        let arg = serde_json::to_value(arg)?;
        self.target.call(&self.name, command, arg).await
    }

    /// Like [`call`](Self::call), deserializing the result.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call), plus [`Error::Json`](crate::Error::Json)
    /// if the result has the wrong shape.
    pub async fn call_as<R: DeserializeOwned>(
        &self,
        command: &str,
        arg: impl Serialize,
    ) -> Result<R> {
        let value = self.call(command, arg).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Subscribes to `event`.
    ///
    /// # Errors
    ///
    /// Fails if the peer is already disposed or `arg` does not serialize.
    pub fn listen(&self, event: &str, arg: impl Serialize) -> Result<EventStream> {
        let arg = serde_json::to_value(arg)?;
        self.target.listen(&self.name, event, arg)
    }
}

// ============================================================================
// EventStream
// ============================================================================

/// Values pushed by the remote side for one listen.
///
/// Ends when the remote side ends the subscription or the peer goes away.
/// Dropping it unsubscribes.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Value>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl EventStream {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Value>,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Waits for the next value. `None` once the stream ended.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Unsubscribes now. Idempotent.
    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.rx.close();
    }
}

impl Stream for EventStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_event_channel_ends_with_sender() {
        let (tx, mut source) = event_channel();
        tx.send(Value::from(1)).expect("send");
        drop(tx);

        assert_eq!(source.next().await, Some(Value::from(1)));
        assert_eq!(source.next().await, None);
    }

    #[tokio::test]
    async fn test_event_stream_cancels_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let mut stream = EventStream::new(rx, move || {
            assert!(!flag.swap(true, Ordering::SeqCst), "cancelled twice");
        });

        tx.send(Value::from("a")).expect("send");
        assert_eq!(stream.recv().await, Some(Value::from("a")));

        stream.close();
        drop(stream);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_call_context_parses_identity() {
        let ctx = CallContext {
            identity: "documentId:7:42:0".into(),
            connection_id: ConnectionId::generate(),
        };
        let identity = ctx.parsed_identity().expect("identity");
        assert_eq!(identity.tab_frame(), Some((42, 0)));
    }
}
