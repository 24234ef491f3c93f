//! Client peer that survives transport loss.
//!
//! # State Machine
//!
//! ```text
//! Connected ──(port drop)──► Reconnecting ──(new port)──► Connected
//!                              │      ▲
//!            (attempts exhausted)    (reconnect hint)
//!                              ▼      │
//!                             Disconnected
//!
//! any state ──(close)──► Closed
//! ```
//!
//! On a drop the client opens a fresh port under the same logical name,
//! sends its identity as the first frame, re-registers its local channels
//! and re-establishes every live listen. Calls issued while not connected
//! fail; nothing is buffered. Listens stay open in `Disconnected` and resume
//! once a reconnect hint brings the client back.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, SubscriptionId};
use crate::protocol::Protocol;
use crate::transport::Port;

use super::channel::{ChannelProxy, ChannelTarget, EventStream, ServerChannel};
use super::core::Peer;

// ============================================================================
// Connector
// ============================================================================

/// Opens fresh ports for a [`ReconnectingPeer`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new port under the logical `name`.
    async fn connect(&self, name: &str) -> Result<Arc<dyn Port>>;
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A live peer carries traffic.
    Connected,
    /// The port dropped; a new one is being opened.
    Reconnecting,
    /// Attempts exhausted; waits for [`ReconnectingPeer::reconnect`].
    Disconnected,
    /// Closed for good.
    Closed,
}

// ============================================================================
// ListenRecord
// ============================================================================

/// A caller's listen, kept so it can be re-established after reconnect.
struct ListenRecord {
    channel: String,
    event: String,
    arg: Value,
    /// Feed of the caller's stream; outlives individual peers.
    tx: mpsc::UnboundedSender<Value>,
    /// Forwarder from the current peer's stream.
    forwarder: Option<JoinHandle<()>>,
}

// ============================================================================
// ReconnectInner
// ============================================================================

struct ReconnectInner {
    identity: String,
    connector: Arc<dyn Connector>,
    config: BridgeConfig,

    /// Lock order: `listens` before `current`.
    listens: Mutex<FxHashMap<SubscriptionId, ListenRecord>>,
    current: RwLock<Option<Peer>>,
    channels: RwLock<FxHashMap<String, Arc<dyn ServerChannel>>>,

    state: watch::Sender<ConnectionState>,
    /// Cuts the wait between attempts short.
    wake: Notify,
}

impl ReconnectInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn current_peer(&self) -> Option<Peer> {
        self.current.read().clone()
    }

    /// Binds a fresh port: handshake, channels, listens, then `Connected`.
    fn attach(self: &Arc<Self>, port: Arc<dyn Port>) {
        let channels = self.channels.read().clone();
        let peer = Peer::connect_with_channels(
            Protocol::new(port),
            self.identity.clone(),
            self.config.clone(),
            channels,
        );

        {
            let mut listens = self.listens.lock();
            for (id, record) in listens.iter_mut() {
                record.forwarder = self.forward(&peer, *id, record);
            }
            *self.current.write() = Some(peer.clone());
        }

        self.state.send_replace(ConnectionState::Connected);
        info!(
            identity = %self.identity,
            connection_id = %peer.connection_id(),
            "Client connected"
        );

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            peer.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.on_peer_closed(peer.connection_id()).await;
            }
        });
    }

    /// Pipes the peer-level stream of `record` into the caller's feed.
    ///
    /// Callers hold the `listens` lock.
    fn forward(
        self: &Arc<Self>,
        peer: &Peer,
        id: SubscriptionId,
        record: &ListenRecord,
    ) -> Option<JoinHandle<()>> {
        let mut stream =
            match ChannelTarget::listen(peer, &record.channel, &record.event, record.arg.clone()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        channel = %record.channel,
                        event = %record.event,
                        error = %e,
                        "Failed to re-establish listen"
                    );
                    return None;
                }
            };

        let tx = record.tx.clone();
        let peer = peer.clone();
        let weak = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(value) = stream.recv().await {
                if tx.send(value).is_err() {
                    return;
                }
            }
            // Ended by the remote side rather than by a drop: end the caller's stream.
            if !peer.is_disposed()
                && let Some(inner) = weak.upgrade()
            {
                inner.listens.lock().remove(&id);
            }
        }))
    }

    async fn on_peer_closed(self: Arc<Self>, connection_id: &ConnectionId) {
        {
            let mut current = self.current.write();
            if current
                .as_ref()
                .is_none_or(|peer| peer.connection_id() != connection_id)
            {
                return;
            }
            *current = None;
        }
        if self.state() == ConnectionState::Closed {
            return;
        }

        self.state.send_replace(ConnectionState::Reconnecting);
        info!(identity = %self.identity, "Connection lost, reconnecting");
        self.reconnect_loop().await;
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let policy = self.config.reconnect;
        let mut failures = 0u32;

        loop {
            if failures > 0 {
                if policy.retry_delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        () = tokio::time::sleep(policy.retry_delay) => {}
                        () = self.wake.notified() => {
                            debug!(identity = %self.identity, "Retry delay cut short");
                        }
                    }
                }
            }
            if self.state() == ConnectionState::Closed {
                return;
            }

            match self.connector.connect(&self.identity).await {
                Ok(port) => {
                    if self.state() == ConnectionState::Closed {
                        port.disconnect();
                        return;
                    }
                    self.attach(port);
                    return;
                }
                Err(e) => {
                    failures += 1;
                    warn!(identity = %self.identity, attempt = failures, error = %e, "Reconnect failed");
                    if !policy.allows(failures) {
                        let parked = self.state.send_if_modified(|state| {
                            if *state == ConnectionState::Reconnecting {
                                *state = ConnectionState::Disconnected;
                                true
                            } else {
                                false
                            }
                        });
                        if parked {
                            error!(
                                identity = %self.identity,
                                attempts = failures,
                                "Reconnect attempts exhausted, waiting for a reconnect hint"
                            );
                        }
                        return;
                    }
                }
            }
        }
    }

    fn close(&self) {
        if self.state.send_replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }

        let records: Vec<ListenRecord> = self.listens.lock().drain().map(|(_, r)| r).collect();
        let peer = self.current.write().take();

        for record in records {
            if let Some(handle) = record.forwarder {
                handle.abort();
            }
        }
        if let Some(peer) = peer {
            peer.dispose();
        }
        debug!(identity = %self.identity, "Client closed");
    }
}

#[async_trait]
impl ChannelTarget for Arc<ReconnectInner> {
    async fn call(&self, channel: &str, command: &str, arg: Value) -> Result<Value> {
        match self.state() {
            ConnectionState::Closed => return Err(Error::Disposed),
            ConnectionState::Reconnecting => return Err(Error::Reconnecting),
            ConnectionState::Disconnected => return Err(Error::ConnectionClosed),
            ConnectionState::Connected => {}
        }
        let peer = self.current_peer().ok_or(Error::Reconnecting)?;
        ChannelTarget::call(&peer, channel, command, arg).await
    }

    fn listen(&self, channel: &str, event: &str, arg: Value) -> Result<EventStream> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::Disposed);
        }

        let id = SubscriptionId::next();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut record = ListenRecord {
            channel: channel.to_owned(),
            event: event.to_owned(),
            arg,
            tx,
            forwarder: None,
        };

        {
            let mut listens = self.listens.lock();
            if let Some(peer) = self.current_peer() {
                record.forwarder = self.forward(&peer, id, &record);
            }
            listens.insert(id, record);
        }

        let weak = Arc::downgrade(self);
        Ok(EventStream::new(rx, move || {
            if let Some(inner) = weak.upgrade()
                && let Some(record) = inner.listens.lock().remove(&id)
                && let Some(handle) = record.forwarder
            {
                handle.abort();
            }
        }))
    }
}

impl Drop for ReconnectInner {
    fn drop(&mut self) {
        if let Some(peer) = self.current.get_mut().take() {
            peer.dispose();
        }
    }
}

// ============================================================================
// ReconnectingPeer
// ============================================================================

/// Client peer that reopens its port whenever it drops.
///
/// # Example
///
/// ```ignore
/// let client = ReconnectingPeer::connect("documentId:7:42:0", connector, config).await?;
/// client.register_channel("page", Arc::new(PageService));
///
/// let mut ticks = client.channel("quotes").listen("onTick", json!({"symbol": "SPY"}))?;
/// while let Some(tick) = ticks.recv().await {
///     // keeps flowing across reconnects
/// }
/// ```
#[derive(Clone)]
pub struct ReconnectingPeer {
    inner: Arc<ReconnectInner>,
}

impl fmt::Debug for ReconnectingPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingPeer")
            .field("identity", &self.inner.identity)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl ReconnectingPeer {
    /// Opens the first port under `identity` and connects.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if the first port cannot be opened.
    pub async fn connect(
        identity: impl Into<String>,
        connector: Arc<dyn Connector>,
        config: BridgeConfig,
    ) -> Result<Self> {
        let inner = Arc::new(ReconnectInner {
            identity: identity.into(),
            connector,
            config,
            listens: Mutex::new(FxHashMap::default()),
            current: RwLock::new(None),
            channels: RwLock::new(FxHashMap::default()),
            state: watch::channel(ConnectionState::Reconnecting).0,
            wake: Notify::new(),
        });

        let port = inner.connector.connect(&inner.identity).await?;
        inner.attach(port);
        Ok(Self { inner })
    }

    /// Identity sent on every (re)connect.
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watches state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The live peer, if connected.
    #[must_use]
    pub fn peer(&self) -> Option<Peer> {
        self.inner.current_peer()
    }

    /// Exposes a local channel on this and every future connection.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        let name = name.into();
        self.inner
            .channels
            .write()
            .insert(name.clone(), Arc::clone(&channel));
        if let Some(peer) = self.inner.current_peer() {
            peer.register_channel(name, channel);
        }
    }

    /// Returns a proxy to the remote channel `name`.
    ///
    /// Listens made through it are re-established after every reconnect.
    #[must_use]
    pub fn channel(&self, name: &str) -> ChannelProxy {
        ChannelProxy::new(name, Arc::new(Arc::clone(&self.inner)))
    }

    /// Acts on a reconnect hint from the other side.
    ///
    /// | State | Effect |
    /// |-------|--------|
    /// | `Connected` | Drops the current port so a fresh one is opened |
    /// | `Reconnecting` | Skips the wait before the next attempt |
    /// | `Disconnected` | Starts a new round of attempts |
    /// | `Closed` | None |
    pub fn reconnect(&self) {
        debug!(identity = %self.inner.identity, state = ?self.state(), "Reconnect requested");
        match self.state() {
            ConnectionState::Connected => {
                if let Some(peer) = self.inner.current_peer() {
                    peer.dispose();
                }
            }
            ConnectionState::Reconnecting => self.inner.wake.notify_one(),
            ConnectionState::Disconnected => {
                let resumed = self.inner.state.send_if_modified(|state| {
                    if *state == ConnectionState::Disconnected {
                        *state = ConnectionState::Reconnecting;
                        true
                    } else {
                        false
                    }
                });
                if resumed {
                    info!(identity = %self.inner.identity, "Resuming reconnect attempts");
                    tokio::spawn(Arc::clone(&self.inner).reconnect_loop());
                }
            }
            ConnectionState::Closed => {}
        }
    }

    /// Closes the client for good. Open event streams end.
    pub fn close(&self) {
        self.inner.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
