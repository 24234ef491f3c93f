//! Peer: bidirectional channel RPC over one protocol.
//!
//! Each side can register [`ServerChannel`]s and reach the other side's
//! channels through [`ChannelProxy`]s.
//!
//! # Lifecycle
//!
//! ```text
//! connect ──► hello sent ──► Open ──► dispose / port drop ──► Disposed
//! accept  ──► hello awaited ─┘
//! ```
//!
//! Disposal, explicit or caused by the port dropping:
//!
//! 1. Rejects every in-flight call
//! 2. Ends every event listen in both directions
//! 3. Disconnects the protocol, exactly once

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, RequestId, RequestIdAllocator};
use crate::protocol::{Frame, Protocol};

use super::channel::{CallContext, ChannelProxy, ChannelTarget, EventStream, ServerChannel};

// ============================================================================
// Types
// ============================================================================

/// Waiter for one outbound call.
type PendingCall = oneshot::Sender<Result<Value>>;

/// Why a peer is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// [`Peer::dispose`] was called.
    Disposed,
    /// The port went away.
    Disconnected,
}

impl Teardown {
    fn error(self) -> Error {
        match self {
            Self::Disposed => Error::Disposed,
            Self::Disconnected => Error::ConnectionClosed,
        }
    }
}

// ============================================================================
// PeerInner
// ============================================================================

/// Shared peer state. Port handlers hold it weakly.
struct PeerInner {
    protocol: Protocol,
    connection_id: ConnectionId,
    config: BridgeConfig,

    /// Identity of the other side; set by its `hello` on accepting peers.
    remote_identity: OnceLock<String>,
    /// Fired with the remote identity when `hello` arrives.
    hello_tx: Mutex<Option<oneshot::Sender<String>>>,

    /// Channels this side exposes.
    channels: RwLock<FxHashMap<String, Arc<dyn ServerChannel>>>,
    /// Outbound calls awaiting a response.
    pending: Mutex<FxHashMap<RequestId, PendingCall>>,
    /// Outbound listens: id to the local stream feed.
    listeners: Mutex<FxHashMap<RequestId, mpsc::UnboundedSender<Value>>>,
    /// Inbound listens: id to the task forwarding the local source.
    active_listens: Mutex<FxHashMap<RequestId, JoinHandle<()>>>,

    request_ids: RequestIdAllocator,
    disposed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl PeerInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn context(&self) -> Option<CallContext> {
        self.remote_identity.get().map(|identity| CallContext {
            identity: identity.clone(),
            connection_id: self.connection_id.clone(),
        })
    }

    fn send_frame(&self, frame: &Frame) {
        match frame.encode() {
            Ok(buffer) => {
                trace!(
                    connection_id = %self.connection_id,
                    kind = frame.kind(),
                    "Frame out"
                );
                self.protocol.send(buffer);
            }
            Err(e) => warn!(
                connection_id = %self.connection_id,
                kind = frame.kind(),
                error = %e,
                "Failed to encode frame"
            ),
        }
    }

    /// Tears the peer down once. Later calls are no-ops.
    fn shutdown(&self, cause: Teardown) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending: Vec<PendingCall> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        let listeners = std::mem::take(&mut *self.listeners.lock());
        let active: Vec<JoinHandle<()>> =
            self.active_listens.lock().drain().map(|(_, h)| h).collect();
        self.hello_tx.lock().take();

        debug!(
            connection_id = %self.connection_id,
            ?cause,
            pending = pending.len(),
            listens = listeners.len() + active.len(),
            "Peer shutting down"
        );

        for tx in pending {
            let _ = tx.send(Err(cause.error()));
        }
        drop(listeners);
        for handle in active {
            handle.abort();
        }

        // No Unlisten frames: the remote side ends its sources when the port drops.
        self.protocol.disconnect();
        self.closed_tx.send_replace(true);
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn handle_buffer(self: &Arc<Self>, buffer: &[u8]) {
        if self.is_disposed() {
            return;
        }

        let frame = match Frame::decode(buffer) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "Malformed frame dropped");
                return;
            }
        };
        trace!(connection_id = %self.connection_id, kind = frame.kind(), "Frame in");

        if let Frame::Hello { identity } = frame {
            self.handle_hello(identity);
            return;
        }

        let Some(ctx) = self.context() else {
            warn!(
                connection_id = %self.connection_id,
                kind = frame.kind(),
                "Frame before identity handshake dropped"
            );
            return;
        };

        match frame {
            Frame::Hello { .. } => {}
            Frame::Request {
                id,
                channel,
                command,
                arg,
            } => self.handle_request(ctx, id, channel, command, arg),
            Frame::Response { id, data } => self.settle(id, Ok(data)),
            Frame::Error { id, message } => self.settle(id, Err(Error::remote(message))),
            Frame::Listen {
                id,
                channel,
                event,
                arg,
            } => self.handle_listen(&ctx, id, &channel, &event, arg),
            Frame::Unlisten { id } => {
                if let Some(handle) = self.active_listens.lock().remove(&id) {
                    handle.abort();
                }
            }
            Frame::Event { id, data } => {
                let listeners = self.listeners.lock();
                if let Some(tx) = listeners.get(&id) {
                    let _ = tx.send(data);
                }
            }
            Frame::EventEnd { id, message } => {
                if let Some(message) = message {
                    warn!(connection_id = %self.connection_id, %id, %message, "Listen ended remotely");
                }
                self.listeners.lock().remove(&id);
            }
        }
    }

    fn handle_hello(&self, identity: String) {
        if self.remote_identity.set(identity.clone()).is_err() {
            debug!(connection_id = %self.connection_id, "Repeated hello ignored");
            return;
        }
        debug!(connection_id = %self.connection_id, identity = %identity, "Identity received");
        if let Some(tx) = self.hello_tx.lock().take() {
            let _ = tx.send(identity);
        }
    }

    fn settle(&self, id: RequestId, result: Result<Value>) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(connection_id = %self.connection_id, %id, "Response for unknown call"),
        }
    }

    fn handle_request(
        self: &Arc<Self>,
        ctx: CallContext,
        id: RequestId,
        channel: String,
        command: String,
        arg: Value,
    ) {
        let Some(handler) = self.channels.read().get(&channel).cloned() else {
            self.send_frame(&Frame::Error {
                id,
                message: Error::unknown_channel(channel).to_string(),
            });
            return;
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let frame = match handler.call(&ctx, &command, arg).await {
                Ok(data) => Frame::Response { id, data },
                Err(e) => Frame::Error {
                    id,
                    message: e.to_string(),
                },
            };
            if let Some(inner) = weak.upgrade()
                && !inner.is_disposed()
            {
                inner.send_frame(&frame);
            }
        });
    }

    fn handle_listen(
        self: &Arc<Self>,
        ctx: &CallContext,
        id: RequestId,
        channel: &str,
        event: &str,
        arg: Value,
    ) {
        let source = match self.channels.read().get(channel) {
            Some(handler) => handler.listen(ctx, event, arg),
            None => Err(Error::unknown_channel(channel)),
        };
        let mut source = match source {
            Ok(source) => source,
            Err(e) => {
                self.send_frame(&Frame::EventEnd {
                    id,
                    message: Some(e.to_string()),
                });
                return;
            }
        };

        // Registered under the lock so a finished task never leaves a stale entry.
        let mut active = self.active_listens.lock();
        if self.is_disposed() {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(data) = source.next().await {
                let Some(inner) = weak.upgrade() else { return };
                inner.send_frame(&Frame::Event { id, data });
            }
            if let Some(inner) = weak.upgrade()
                && inner.active_listens.lock().remove(&id).is_some()
            {
                inner.send_frame(&Frame::EventEnd { id, message: None });
            }
        });
        active.insert(id, handle);
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    async fn call(&self, channel: &str, command: &str, arg: Value) -> Result<Value> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        let id = self.request_ids.next();
        let buffer = Frame::Request {
            id,
            channel: channel.to_owned(),
            command: command.to_owned(),
            arg,
        }
        .encode()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.config.max_pending_calls {
                return Err(Error::TooManyPending {
                    pending: pending.len(),
                    max: self.config.max_pending_calls,
                });
            }
            pending.insert(id, tx);
        }

        // Shutdown may have drained the map just before the insert.
        if self.is_disposed() {
            self.pending.lock().remove(&id);
            return Err(Error::Disposed);
        }

        trace!(connection_id = %self.connection_id, %id, channel, command, "Call");
        self.protocol.send(buffer);

        match timeout(self.config.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::call_timeout(
                    id,
                    self.config.call_timeout.as_millis() as u64,
                ))
            }
        }
    }

    fn listen(self: &Arc<Self>, channel: &str, event: &str, arg: Value) -> Result<EventStream> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        let id = self.request_ids.next();
        let buffer = Frame::Listen {
            id,
            channel: channel.to_owned(),
            event: event.to_owned(),
            arg,
        }
        .encode()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(id, tx);
        if self.is_disposed() {
            self.listeners.lock().remove(&id);
            return Err(Error::Disposed);
        }
        self.protocol.send(buffer);

        let weak = Arc::downgrade(self);
        Ok(EventStream::new(rx, move || {
            if let Some(inner) = weak.upgrade()
                && inner.listeners.lock().remove(&id).is_some()
                && !inner.is_disposed()
            {
                inner.send_frame(&Frame::Unlisten { id });
            }
        }))
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        if !self.is_disposed() {
            self.protocol.disconnect();
        }
    }
}

// ============================================================================
// Peer
// ============================================================================

/// One side of a channel RPC relationship.
///
/// Cheap to clone; clones share the same connection.
///
/// # Example
///
/// ```ignore
/// let (client_port, server_port) = ExtensionPort::pair("documentId:7:42:0", None);
///
/// let server = tokio::spawn(Peer::accept(Protocol::new(server_port), config.clone()));
/// let client = Peer::connect(Protocol::new(client_port), "documentId:7:42:0", config);
///
/// let server = server.await??;
/// server.register_channel("quotes", Arc::new(Quotes));
/// let last: f64 = client.channel("quotes").call_as("latest", json!({"symbol": "SPY"})).await?;
/// ```
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("connection_id", &self.inner.connection_id)
            .field("remote_identity", &self.inner.remote_identity.get())
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

impl Peer {
    /// Builds a peer and installs its port handlers.
    fn build(
        protocol: Protocol,
        remote_identity: Option<String>,
        config: BridgeConfig,
        channels: FxHashMap<String, Arc<dyn ServerChannel>>,
    ) -> (Self, oneshot::Receiver<String>) {
        let (hello_tx, hello_rx) = oneshot::channel();
        let remote = OnceLock::new();
        if let Some(identity) = remote_identity {
            let _ = remote.set(identity);
        }

        let inner = Arc::new(PeerInner {
            protocol,
            connection_id: ConnectionId::generate(),
            config,
            remote_identity: remote,
            hello_tx: Mutex::new(Some(hello_tx)),
            channels: RwLock::new(channels),
            pending: Mutex::new(FxHashMap::default()),
            listeners: Mutex::new(FxHashMap::default()),
            active_listens: Mutex::new(FxHashMap::default()),
            request_ids: RequestIdAllocator::default(),
            disposed: AtomicBool::new(false),
            closed_tx: watch::channel(false).0,
        });

        let weak: Weak<PeerInner> = Arc::downgrade(&inner);
        inner.protocol.on_message(Box::new(move |buffer| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_buffer(&buffer);
            }
        }));

        let weak = Arc::downgrade(&inner);
        inner.protocol.on_disconnect(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.shutdown(Teardown::Disconnected);
            }
        }));

        (Self { inner }, hello_rx)
    }

    /// Opens the connecting side: sends `identity` as the first frame.
    ///
    /// The remote side is identified by the port name.
    #[must_use]
    pub fn connect(protocol: Protocol, identity: impl Into<String>, config: BridgeConfig) -> Self {
        Self::connect_with_channels(protocol, identity, config, FxHashMap::default())
    }

    /// Like [`connect`](Self::connect), with `channels` registered before
    /// the handshake so the remote side can use them immediately.
    pub(crate) fn connect_with_channels(
        protocol: Protocol,
        identity: impl Into<String>,
        config: BridgeConfig,
        channels: FxHashMap<String, Arc<dyn ServerChannel>>,
    ) -> Self {
        let remote = protocol.name().to_owned();
        let (peer, _) = Self::build(protocol, Some(remote), config, channels);
        peer.inner.send_frame(&Frame::Hello {
            identity: identity.into(),
        });
        debug!(connection_id = %peer.inner.connection_id, "Peer connected");
        peer
    }

    /// Opens the accepting side: waits for the remote `hello`.
    ///
    /// # Errors
    ///
    /// - [`Error::HandshakeTimeout`] if no `hello` arrives within the
    ///   configured handshake timeout (the port is disconnected)
    /// - [`Error::ConnectionClosed`] if the port drops first
    pub async fn accept(protocol: Protocol, config: BridgeConfig) -> Result<Self> {
        Self::accept_with_channels(protocol, config, FxHashMap::default()).await
    }

    /// Like [`accept`](Self::accept), with `channels` exposed before the
    /// handshake completes.
    pub(crate) async fn accept_with_channels(
        protocol: Protocol,
        config: BridgeConfig,
        channels: FxHashMap<String, Arc<dyn ServerChannel>>,
    ) -> Result<Self> {
        let handshake_timeout = config.handshake_timeout;
        let (peer, hello_rx) = Self::build(protocol, None, config, channels);

        match timeout(handshake_timeout, hello_rx).await {
            Ok(Ok(identity)) => {
                debug!(connection_id = %peer.inner.connection_id, identity = %identity, "Peer accepted");
                Ok(peer)
            }
            Ok(Err(_)) => {
                peer.dispose();
                Err(Error::ConnectionClosed)
            }
            Err(_) => {
                warn!(connection_id = %peer.inner.connection_id, "Identity handshake timed out");
                peer.dispose();
                Err(Error::handshake_timeout(handshake_timeout.as_millis() as u64))
            }
        }
    }

    /// Transport-level id of this connection. Changes on every reconnect.
    #[inline]
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    /// Identity string of the other side.
    #[inline]
    #[must_use]
    pub fn remote_identity(&self) -> &str {
        self.inner
            .remote_identity
            .get()
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Exposes a local channel to the other side, replacing any channel
    /// with the same name.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        let name = name.into();
        debug!(connection_id = %self.inner.connection_id, channel = %name, "Channel registered");
        self.inner.channels.write().insert(name, channel);
    }

    /// Returns a proxy to the other side's channel `name`.
    #[must_use]
    pub fn channel(&self, name: &str) -> ChannelProxy {
        ChannelProxy::new(name, Arc::new(self.clone()))
    }

    /// Number of outbound calls awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Returns `true` once disposed or disconnected.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Disposes the peer. Idempotent.
    pub fn dispose(&self) {
        self.inner.shutdown(Teardown::Disposed);
    }

    /// Resolves once the peer is disposed or its port dropped.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[async_trait]
impl ChannelTarget for Peer {
    async fn call(&self, channel: &str, command: &str, arg: Value) -> Result<Value> {
        self.inner.call(channel, command, arg).await
    }

    fn listen(&self, channel: &str, event: &str, arg: Value) -> Result<EventStream> {
        self.inner.listen(channel, event, arg)
    }
}

// ============================================================================
// Tests
// ============================================================================
