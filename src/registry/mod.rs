//! Connection registry.
//!
//! Server-side bookkeeping of every known peer, persisted so it survives a
//! restart of the hosting process.
//!
//! # Record Lifecycle
//!
//! ```text
//! Unknown ──register──► Registered ──┬──► Live ──┐
//!                                    └──► Stale ─┴──► Removed
//! ```
//!
//! - At most one record per registration key: a reconnecting context
//!   overwrites its record in place and its previous peer is disposed.
//! - Every insert, replace and delete persists the whole collection before
//!   the mutating call returns.
//! - Records are removed on port disconnect, on `tab removed`, on a
//!   navigation commit of the owning frame, on panel close, or when
//!   [`ConnectionRegistry::reconcile`] finds the target gone.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `record` | [`ConnectionRecord`] |
//! | `store` | [`RecordStore`] and its implementations |
//! | `host` | [`HostPlatform`] seam and [`HostMessage`] |

// ============================================================================
// Submodules
// ============================================================================

/// Host platform seam.
pub mod host;

/// Persisted records.
pub mod record;

/// Record persistence.
pub mod store;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::emitter::{Emitter, Subscription};
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::identity::{Identity, parse_identity};
use crate::peer::Peer;

// ============================================================================
// Re-exports
// ============================================================================

pub use host::{HostMessage, HostPlatform};
pub use record::{ConnectionRecord, KEY_PREFIX, record_key};
pub use store::{FileRecordStore, MemoryRecordStore, RecordStore};

// ============================================================================
// ReconcileReport
// ============================================================================

/// Outcome of one [`ConnectionRegistry::reconcile`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Identity strings of records that passed their liveness check.
    pub kept: Vec<String>,
    /// Identity strings of records removed as stale or unroutable.
    pub removed: Vec<String>,
    /// Reconnect notices delivered.
    pub notified: usize,
    /// Tabs reloaded because messaging them failed.
    pub reloaded: Vec<u32>,
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Tracks peers by identity and persists their records.
///
/// Constructed once per process and shared by `Arc`.
pub struct ConnectionRegistry {
    store: Arc<dyn RecordStore>,
    host: Arc<dyn HostPlatform>,
    config: BridgeConfig,

    /// Persisted view. Held across the save so mutate-then-persist is atomic.
    records: Mutex<Vec<ConnectionRecord>>,
    /// Live peers by record key.
    peers: RwLock<FxHashMap<String, Peer>>,

    peer_added: Emitter<Peer>,
    peer_removed: Emitter<Peer>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("peers", &self.peers.read().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Creates an empty registry. Persisted records are read by
    /// [`reconcile`](Self::reconcile).
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        host: Arc<dyn HostPlatform>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            store,
            host,
            config,
            records: Mutex::new(Vec::new()),
            peers: RwLock::new(FxHashMap::default()),
            peer_added: Emitter::new(),
            peer_removed: Emitter::new(),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Snapshot of all records.
    pub async fn records(&self) -> Vec<ConnectionRecord> {
        self.records.lock().await.clone()
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Returns `true` if there are no records.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Live peers.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    /// The live peer registered for `identity`.
    #[must_use]
    pub fn peer_for(&self, identity: &Identity) -> Option<Peer> {
        self.peers
            .read()
            .get(&record_key(identity))
            .filter(|peer| !peer.is_disposed())
            .cloned()
    }

    /// Answers a liveness ping: `true` only if a live peer for `target`
    /// exists right now.
    #[must_use]
    pub fn answer_ping(&self, target: &Identity) -> bool {
        self.peer_for(target).is_some()
    }

    /// Called with every peer that becomes live.
    pub fn on_peer_added(&self, listener: impl Fn(&Peer) + Send + Sync + 'static) -> Subscription {
        self.peer_added.subscribe(listener)
    }

    /// Called with every peer that leaves the registry.
    pub fn on_peer_removed(
        &self,
        listener: impl Fn(&Peer) + Send + Sync + 'static,
    ) -> Subscription {
        self.peer_removed.subscribe(listener)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Registers an accepted peer under its declared identity.
    ///
    /// A record with the same key is overwritten in place and the peer it
    /// pointed at is disposed.
    ///
    /// # Errors
    ///
    /// - [`Error::Routing`] if the peer's identity does not parse
    /// - Store errors if persisting fails (the in-memory state is updated)
    pub async fn register(&self, peer: &Peer) -> Result<ConnectionRecord> {
        let record = ConnectionRecord::new(peer.connection_id().clone(), peer.remote_identity())?;

        let persisted = {
            let mut records = self.records.lock().await;
            match records.iter_mut().find(|r| r.key == record.key) {
                Some(slot) => {
                    debug!(key = %record.key, old = %slot.id, new = %record.id, "Record replaced");
                    *slot = record.clone();
                }
                None => records.push(record.clone()),
            }
            self.store.save(&records).await
        };

        let previous = self.peers.write().insert(record.key.clone(), peer.clone());
        if let Some(previous) = previous
            && previous.connection_id() != peer.connection_id()
        {
            debug!(key = %record.key, connection_id = %previous.connection_id(), "Superseded peer disposed");
            previous.dispose();
            self.peer_removed.emit(&previous);
        }

        info!(identity = %record.source, connection_id = %record.id, "Peer registered");
        self.peer_added.emit(peer);

        persisted.map(|()| record)
    }

    /// Removes the record of a closed connection.
    ///
    /// Returns `false` if the connection was already superseded or removed.
    ///
    /// # Errors
    ///
    /// Store errors if persisting fails.
    pub async fn remove_connection(&self, connection_id: &ConnectionId) -> Result<bool> {
        let removed = self
            .remove_where(|record| record.id == *connection_id, "disconnected")
            .await?;
        Ok(removed > 0)
    }

    /// Handles a `tab removed` event: drops every record of `tab_id`.
    ///
    /// # Errors
    ///
    /// Store errors if persisting fails.
    pub async fn on_tab_removed(&self, tab_id: u32) -> Result<usize> {
        self.remove_where(
            |record| record.identity().is_some_and(|i| i.tab_id == Some(tab_id)),
            "tab removed",
        )
        .await
    }

    /// Handles a navigation commit of `frame_id` in `tab_id`.
    ///
    /// A top-level commit (`frame_id == 0`) replaces the whole document, so
    /// every record of the tab goes; otherwise only that frame's record.
    ///
    /// # Errors
    ///
    /// Store errors if persisting fails.
    pub async fn on_navigation_committed(&self, tab_id: u32, frame_id: u32) -> Result<usize> {
        self.remove_where(
            |record| {
                record.identity().is_some_and(|i| {
                    i.tab_id == Some(tab_id) && (frame_id == 0 || i.frame_id == Some(frame_id))
                })
            },
            "navigation committed",
        )
        .await
    }

    /// Handles the panel of `window_id` closing.
    ///
    /// # Errors
    ///
    /// Store errors if persisting fails.
    pub async fn on_panel_closed(&self, window_id: u32) -> Result<usize> {
        self.remove_where(
            |record| record.identity().is_some_and(|i| i.is_panel_for(window_id)),
            "panel closed",
        )
        .await
    }

    /// Disposes every live peer. Records stay persisted for the next
    /// [`reconcile`](Self::reconcile).
    pub fn dispose_all(&self) {
        let peers: Vec<Peer> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.dispose();
            self.peer_removed.emit(peer);
        }
        debug!(count = peers.len(), "All peers disposed");
    }

    /// Removes matching records, persists, then disposes their peers.
    async fn remove_where(
        &self,
        predicate: impl Fn(&ConnectionRecord) -> bool,
        reason: &str,
    ) -> Result<usize> {
        let (removed, persisted) = {
            let mut records = self.records.lock().await;
            let (removed, kept): (Vec<_>, Vec<_>) =
                records.drain(..).partition(|record| predicate(record));
            *records = kept;
            if removed.is_empty() {
                return Ok(0);
            }
            let persisted = self.store.save(&records).await;
            (removed, persisted)
        };

        for record in &removed {
            debug!(identity = %record.source, connection_id = %record.id, reason, "Record removed");
            self.release_peer(record);
        }

        persisted.map(|()| removed.len())
    }

    /// Drops the live peer of `record` if it is the one the record names.
    fn release_peer(&self, record: &ConnectionRecord) {
        let peer = {
            let mut peers = self.peers.write();
            let owned = peers
                .get(&record.key)
                .is_some_and(|peer| *peer.connection_id() == record.id);
            if owned { peers.remove(&record.key) } else { None }
        };
        if let Some(peer) = peer {
            peer.dispose();
            self.peer_removed.emit(&peer);
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Startup pass over persisted records.
    ///
    /// 1. Loads persisted records and merges them under the in-memory ones
    /// 2. Checks each record without a live peer, independently:
    ///    unparseable identities are removed, tab/frame identities need the
    ///    frame to exist, panel identities need to answer a ping within the
    ///    probe timeout
    /// 3. Removes the failures and persists
    /// 4. Sends each survivor a reconnect notice, to its tab or, without a
    ///    tab, to the whole extension; a tab that cannot be messaged is
    ///    reloaded
    ///
    /// # Errors
    ///
    /// Store errors from loading or persisting. Per-record platform
    /// failures never abort the pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let persisted = self.store.load().await?;

        let candidates: Vec<ConnectionRecord> = {
            let mut records = self.records.lock().await;
            for record in persisted {
                if !records.iter().any(|r| r.key == record.key) {
                    records.push(record);
                }
            }
            let live: FxHashSet<String> = self
                .peers
                .read()
                .iter()
                .filter(|(_, peer)| !peer.is_disposed())
                .map(|(key, _)| key.clone())
                .collect();
            records
                .iter()
                .filter(|r| !live.contains(&r.key))
                .cloned()
                .collect()
        };

        let verdicts = join_all(candidates.iter().map(|record| self.check_liveness(record))).await;

        let mut report = ReconcileReport::default();
        let mut stale: Vec<&ConnectionRecord> = Vec::new();
        let mut survivors: Vec<&ConnectionRecord> = Vec::new();
        for (record, verdict) in candidates.iter().zip(verdicts) {
            match verdict {
                Ok(()) => survivors.push(record),
                Err(e) => {
                    debug!(error = %e, "Stale record");
                    stale.push(record);
                }
            }
        }

        if !stale.is_empty() {
            let mut records = self.records.lock().await;
            records.retain(|r| !stale.iter().any(|s| s.key == r.key && s.id == r.id));
            self.store.save(&records).await?;
        }
        report.removed = stale.iter().map(|r| r.source.clone()).collect();
        report.kept = survivors.iter().map(|r| r.source.clone()).collect();

        let mut reloaded: FxHashSet<u32> = FxHashSet::default();
        for record in survivors {
            if self.notify(record, &mut reloaded).await {
                report.notified += 1;
            }
        }
        report.reloaded = reloaded.into_iter().collect();
        report.reloaded.sort_unstable();

        info!(
            kept = report.kept.len(),
            removed = report.removed.len(),
            notified = report.notified,
            reloaded = report.reloaded.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Liveness check for one record.
    async fn check_liveness(&self, record: &ConnectionRecord) -> Result<()> {
        let identity = parse_identity(&record.source).ok_or_else(|| Error::routing(&record.source))?;

        if let Some(tab_id) = identity.tab_id {
            let frames = self
                .host
                .frame_ids(tab_id)
                .await
                .map_err(|e| Error::stale(&record.source, format!("tab {tab_id} unavailable: {e}")))?;
            return match identity.frame_id {
                Some(frame_id) if !frames.contains(&frame_id) => Err(Error::stale(
                    &record.source,
                    format!("frame {frame_id} no longer in tab {tab_id}"),
                )),
                None if frames.is_empty() => {
                    Err(Error::stale(&record.source, format!("tab {tab_id} has no frames")))
                }
                _ => Ok(()),
            };
        }

        if identity.is_panel() {
            return match timeout(self.config.probe_timeout, self.host.ping(&identity)).await {
                Ok(Ok(true)) => Ok(()),
                Ok(Ok(false)) => Err(Error::stale(&record.source, "panel not open")),
                Ok(Err(e)) => Err(Error::stale(&record.source, format!("ping failed: {e}"))),
                Err(_) => Err(Error::stale(&record.source, "no reply to ping")),
            };
        }

        Ok(())
    }

    /// Sends the reconnect notice for `record`. Best-effort.
    async fn notify(&self, record: &ConnectionRecord, reloaded: &mut FxHashSet<u32>) -> bool {
        let message = HostMessage::Reconnect {
            identity: record.source.clone(),
        };
        let tab_id = record.identity().and_then(|i| i.tab_id);

        let Some(tab_id) = tab_id else {
            return match self.host.broadcast(&message).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(identity = %record.source, error = %e, "Reconnect broadcast failed");
                    false
                }
            };
        };

        match self.host.send_to_tab(tab_id, &message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(identity = %record.source, tab_id, error = %e, "Tab unreachable, reloading");
                if reloaded.insert(tab_id)
                    && let Err(e) = self.host.reload_tab(tab_id).await
                {
                    warn!(tab_id, error = %e, "Tab reload failed");
                }
                false
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
