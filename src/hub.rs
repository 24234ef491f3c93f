//! Server component.
//!
//! [`ConnectionHub`] is what the background context runs: it accepts
//! ports, waits for each one's identity, turns it into a [`Peer`] exposing
//! the hub's channels, and keeps the [`ConnectionRegistry`] in step with
//! the peers' lifetimes.
//!
//! # Accept Flow
//!
//! ```text
//! Port ──► Protocol ──► hello (bounded) ──► Peer ──► registry.register
//!                                             │
//!                                  closed ────┴──► registry.remove_connection
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use context_bridge::{BridgeConfig, ConnectionHub, MemoryRecordStore};
//!
//! let hub = ConnectionHub::new(Arc::new(MemoryRecordStore::new()), host, BridgeConfig::default());
//! hub.register_channel("storage", storage_channel);
//!
//! let report = hub.reconcile().await?;
//! let server = hub.serve(listener);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::identity::{Identity, parse_identity};
use crate::multiplexer::EventMultiplexer;
use crate::peer::{Peer, ServerChannel};
use crate::protocol::Protocol;
use crate::registry::{ConnectionRegistry, HostPlatform, ReconcileReport, RecordStore};
use crate::transport::{Port, PortSender, SocketListener};

// ============================================================================
// Constants
// ============================================================================

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// LifecycleEvent
// ============================================================================

/// Browser lifecycle signal that invalidates connection records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LifecycleEvent {
    /// A tab was closed.
    #[serde(rename_all = "camelCase")]
    TabRemoved {
        /// Closed tab.
        tab_id: u32,
    },

    /// A frame committed a navigation. Frame `0` is the whole tab.
    #[serde(rename_all = "camelCase")]
    NavigationCommitted {
        /// Owning tab.
        tab_id: u32,
        /// Navigated frame.
        frame_id: u32,
    },

    /// A window's side panel was closed.
    #[serde(rename_all = "camelCase")]
    PanelClosed {
        /// Window owning the panel.
        window_id: u32,
    },
}

// ============================================================================
// ConnectionHub
// ============================================================================

/// Accepts ports and keeps the registry in step with peer lifetimes.
pub struct ConnectionHub {
    config: BridgeConfig,
    registry: Arc<ConnectionRegistry>,
    multiplexer: EventMultiplexer,

    /// Channels every accepted peer exposes.
    channels: RwLock<FxHashMap<String, Arc<dyn ServerChannel>>>,

    /// Set by [`shutdown`](ConnectionHub::shutdown). Shared with the
    /// per-peer watchers so teardown keeps the persisted records.
    shutdown: Arc<AtomicBool>,
}

impl fmt::Debug for ConnectionHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHub")
            .field("channels", &self.channels.read().len())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl ConnectionHub {
    /// Creates a hub with its own registry over `store` and `host`.
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        host: Arc<dyn HostPlatform>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(store, host, config.clone()));
        let multiplexer = EventMultiplexer::new(Arc::clone(&registry));

        info!("Connection hub created");

        Arc::new(Self {
            config,
            registry,
            multiplexer,
            channels: RwLock::new(FxHashMap::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration peers are built with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The hub's registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The hub's event multiplexer.
    #[inline]
    #[must_use]
    pub fn multiplexer(&self) -> &EventMultiplexer {
        &self.multiplexer
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has run.
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Exposes `channel` on every connected and future peer.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        let name = name.into();
        self.channels
            .write()
            .insert(name.clone(), Arc::clone(&channel));

        for peer in self.registry.peers() {
            peer.register_channel(name.clone(), Arc::clone(&channel));
        }
        debug!(channel = %name, "Hub channel registered");
    }

    // ========================================================================
    // Accepting
    // ========================================================================

    /// Runs one port through the handshake and registers the resulting peer.
    ///
    /// The record is removed again when the peer closes, unless the hub is
    /// shutting down.
    ///
    /// # Errors
    ///
    /// - [`Error::Disposed`] after shutdown
    /// - [`Error::HandshakeTimeout`] / [`Error::ConnectionClosed`] from the
    ///   handshake
    /// - [`Error::Routing`] if the declared identity does not parse (the
    ///   peer is disposed)
    /// - [`Error::IdentityMismatch`] if it contradicts the platform-reported
    ///   sender (the peer is disposed)
    pub async fn accept(&self, port: Arc<dyn Port>) -> Result<Peer> {
        if self.is_shutdown() {
            port.disconnect();
            return Err(Error::Disposed);
        }

        let sender = port.sender().cloned();
        let channels = self.channels.read().clone();
        let peer =
            Peer::accept_with_channels(Protocol::new(port), self.config.clone(), channels).await?;

        if let Some(sender) = &sender
            && let Err(e) = verify_sender(peer.remote_identity(), sender)
        {
            warn!(identity = %peer.remote_identity(), ?sender, error = %e, "Identity rejected");
            peer.dispose();
            return Err(e);
        }

        // A failed save still leaves the peer registered in memory.
        match self.registry.register(&peer).await {
            Ok(_) => {}
            Err(e) if e.is_routing_error() => {
                warn!(identity = %peer.remote_identity(), "Unroutable identity, disconnecting");
                peer.dispose();
                return Err(e);
            }
            Err(e) => {
                error!(connection_id = %peer.connection_id(), error = %e, "Persisting record failed");
            }
        }

        let registry = Arc::downgrade(&self.registry);
        let shutdown = Arc::clone(&self.shutdown);
        let watched = peer.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let connection_id = watched.connection_id().clone();
            drop(watched);
            if let Err(e) = registry.remove_connection(&connection_id).await {
                warn!(connection_id = %connection_id, error = %e, "Removing record failed");
            }
        });

        Ok(peer)
    }

    /// Spawns an accept loop over `listener`.
    ///
    /// The loop stops after [`shutdown`](Self::shutdown).
    pub fn serve(self: &Arc<Self>, listener: SocketListener) -> JoinHandle<()> {
        info!(url = %listener.ws_url(), "Hub listening");
        let hub = Arc::clone(self);
        tokio::spawn(hub.accept_loop(listener))
    }

    /// Background task that accepts socket ports.
    async fn accept_loop(self: Arc<Self>, listener: SocketListener) {
        debug!("Accept loop started");

        loop {
            if self.is_shutdown() {
                debug!("Accept loop shutting down");
                break;
            }

            // Bounded so the shutdown flag is re-checked.
            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok(port)) => {
                    let hub = Arc::clone(&self);
                    tokio::spawn(async move {
                        let name = port.name().to_owned();
                        if let Err(e) = hub.accept(port).await {
                            warn!(port = %name, error = %e, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    // ========================================================================
    // Registry passthrough
    // ========================================================================

    /// Routes a browser lifecycle signal to the registry.
    ///
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Store errors if persisting fails.
    pub async fn handle_lifecycle(&self, event: LifecycleEvent) -> Result<usize> {
        debug!(?event, "Lifecycle event");
        match event {
            LifecycleEvent::TabRemoved { tab_id } => self.registry.on_tab_removed(tab_id).await,
            LifecycleEvent::NavigationCommitted { tab_id, frame_id } => {
                self.registry
                    .on_navigation_committed(tab_id, frame_id)
                    .await
            }
            LifecycleEvent::PanelClosed { window_id } => {
                self.registry.on_panel_closed(window_id).await
            }
        }
    }

    /// Answers a liveness ping addressed to `target`.
    #[must_use]
    pub fn answer_ping(&self, target: &Identity) -> bool {
        self.registry.answer_ping(target)
    }

    /// Runs the registry's startup reconciliation.
    ///
    /// # Errors
    ///
    /// Store errors from loading or persisting.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.registry.reconcile().await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops accepting and disposes every peer.
    ///
    /// Records stay persisted so the next process can reconcile them.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Connection hub shutting down");

        self.multiplexer.dispose();
        self.registry.dispose_all();

        info!("Connection hub shutdown complete");
    }
}

// ============================================================================
// Sender Check
// ============================================================================

/// Checks a declared identity against the platform-reported sender.
///
/// Only fields known to both sides are compared.
fn verify_sender(identity: &str, sender: &PortSender) -> Result<()> {
    let declared = parse_identity(identity).ok_or_else(|| Error::routing(identity))?;
    let fields = [
        ("windowId", declared.window_id, sender.window_id),
        ("tabId", declared.tab_id, sender.tab_id),
        ("frameId", declared.frame_id, sender.frame_id),
    ];
    for (field, declared, reported) in fields {
        if let (Some(declared), Some(reported)) = (declared, reported)
            && declared != reported
        {
            return Err(Error::identity_mismatch(identity, field));
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
