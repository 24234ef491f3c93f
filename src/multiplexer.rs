//! Event multiplexer.
//!
//! Merges one named event, defined on a per-connection channel, across the
//! dynamic set of peers in a [`ConnectionRegistry`] into a single stream.
//!
//! # Architecture
//!
//! ```text
//!  peer A ──listen──► forwarder A ─┐
//!  peer B ──listen──► forwarder B ─┼──► Emitter<Tagged<T>> ──► subscribers
//!  peer C ──listen──► forwarder C ─┘          (one per channel::event)
//!        ▲
//!        └── added / removed by registry signals, keyed by connection id
//! ```
//!
//! Filtered subscribers each get their own queue and task, so a slow or
//! failing predicate only affects its own subscriber.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::emitter::{Emitter, Subscription};
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::peer::Peer;
use crate::registry::ConnectionRegistry;

// ============================================================================
// Tagged
// ============================================================================

/// An event value together with the identity of the peer that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tagged<T> {
    /// The event payload.
    pub payload: T,
    /// Identity string of the originating peer.
    pub ctx: String,
}

// ============================================================================
// MergedInner
// ============================================================================

/// Shared state of one `channel::event` merge.
struct MergedInner<T> {
    key: String,
    channel: String,
    event: String,
    emitter: Emitter<Tagged<T>>,
    /// Per-peer forwarders by connection id.
    arena: Mutex<FxHashMap<ConnectionId, JoinHandle<()>>>,
    /// Registry added/removed subscriptions.
    signals: Mutex<Vec<Subscription>>,
}

impl<T> MergedInner<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    /// Starts forwarding `peer`'s event into the merge.
    fn attach(self: &Arc<Self>, peer: &Peer) {
        if self.emitter.is_disposed() || peer.is_disposed() {
            return;
        }

        let mut arena = self.arena.lock();
        if arena.contains_key(peer.connection_id()) {
            return;
        }

        let mut stream = match peer.channel(&self.channel).listen(&self.event, Value::Null) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(key = %self.key, connection_id = %peer.connection_id(), error = %e, "Listen failed");
                return;
            }
        };

        let ctx = peer.remote_identity().to_owned();
        let connection_id = peer.connection_id().clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(value) = stream.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                match serde_json::from_value::<T>(value) {
                    Ok(payload) => inner.emitter.emit(&Tagged {
                        payload,
                        ctx: ctx.clone(),
                    }),
                    Err(e) => warn!(key = %inner.key, ctx = %ctx, error = %e, "Payload dropped"),
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.arena.lock().remove(&connection_id);
            }
        });

        debug!(key = %self.key, connection_id = %peer.connection_id(), "Peer folded in");
        arena.insert(peer.connection_id().clone(), handle);
    }

    /// Stops forwarding `peer`'s event.
    fn detach(&self, peer: &Peer) {
        if let Some(handle) = self.arena.lock().remove(peer.connection_id()) {
            debug!(key = %self.key, connection_id = %peer.connection_id(), "Peer folded out");
            handle.abort();
        }
    }

    fn dispose(&self) {
        self.signals.lock().clear();
        for (_, handle) in self.arena.lock().drain() {
            handle.abort();
        }
        self.emitter.dispose();
    }
}

impl<T> Drop for MergedInner<T> {
    fn drop(&mut self) {
        for (_, handle) in self.arena.get_mut().drain() {
            handle.abort();
        }
    }
}

// ============================================================================
// MergedEvent
// ============================================================================

/// Handle to one merged `channel::event` stream.
///
/// Every handle for the same key shares one merge.
pub struct MergedEvent<T> {
    inner: Arc<MergedInner<T>>,
}

impl<T> Clone for MergedEvent<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for MergedEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedEvent")
            .field("key", &self.inner.key)
            .field("sources", &self.inner.arena.lock().len())
            .finish()
    }
}

impl<T> MergedEvent<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    /// `channel::event` key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Number of peers currently folded in.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.inner.arena.lock().len()
    }

    /// Receives every tagged value.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Tagged<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.emitter.subscribe(listener)
    }

    /// Receives tagged values the async `predicate` accepts.
    ///
    /// Values are checked in arrival order. A predicate error drops that
    /// value with a warning; later values and other subscribers carry on.
    pub fn subscribe_filtered<P, Fut>(
        &self,
        predicate: P,
        listener: impl Fn(&Tagged<T>) + Send + Sync + 'static,
    ) -> Subscription
    where
        P: Fn(Tagged<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Tagged<T>>();
        let feed = self.inner.emitter.subscribe(move |value| {
            let _ = tx.send(value.clone());
        });

        let key = self.inner.key.clone();
        let task = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                match predicate(value.clone()).await {
                    Ok(true) => listener(&value),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(key = %key, ctx = %value.ctx, error = %e, "Value dropped by predicate");
                    }
                }
            }
        });

        Subscription::from_fn(move || {
            drop(feed);
            task.abort();
        })
    }
}

// ============================================================================
// EventMultiplexer
// ============================================================================

/// Lazily created merged event streams over a registry's peers.
pub struct EventMultiplexer {
    registry: Arc<ConnectionRegistry>,
    /// Merges by `channel::event`, type-erased.
    streams: Mutex<FxHashMap<String, Arc<dyn Any + Send + Sync>>>,
    /// Disposers, one per merge.
    disposers: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl fmt::Debug for EventMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventMultiplexer")
            .field("streams", &self.streams.lock().len())
            .finish_non_exhaustive()
    }
}

impl EventMultiplexer {
    /// Creates a multiplexer over `registry`.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            streams: Mutex::new(FxHashMap::default()),
            disposers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the merged stream of `event` on `channel`, creating it on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if the key was first requested with a
    /// different payload type.
    pub fn event<T>(&self, channel: &str, event: &str) -> Result<MergedEvent<T>>
    where
        T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
    {
        let key = format!("{channel}::{event}");
        let mut streams = self.streams.lock();

        if let Some(existing) = streams.get(&key) {
            let inner = Arc::clone(existing)
                .downcast::<MergedInner<T>>()
                .map_err(|_| Error::type_mismatch(&key))?;
            return Ok(MergedEvent { inner });
        }

        let inner = Arc::new(MergedInner {
            key: key.clone(),
            channel: channel.to_owned(),
            event: event.to_owned(),
            emitter: Emitter::traced(format!("multiplexer.{key}")),
            arena: Mutex::new(FxHashMap::default()),
            signals: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let added = self.registry.on_peer_added(move |peer| {
            if let Some(inner) = weak.upgrade() {
                inner.attach(peer);
            }
        });
        let weak = Arc::downgrade(&inner);
        let removed = self.registry.on_peer_removed(move |peer| {
            if let Some(inner) = weak.upgrade() {
                inner.detach(peer);
            }
        });
        inner.signals.lock().extend([added, removed]);

        for peer in self.registry.peers() {
            inner.attach(&peer);
        }

        debug!(key = %key, sources = inner.arena.lock().len(), "Merged event created");

        let weak = Arc::downgrade(&inner);
        self.disposers.lock().push(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.dispose();
            }
        }));
        streams.insert(key, Arc::clone(&inner) as Arc<dyn Any + Send + Sync>);

        Ok(MergedEvent { inner })
    }

    /// Number of merged streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Returns `true` if no merged stream exists yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    /// Tears down every merged stream. Later [`event`](Self::event) calls
    /// start fresh.
    pub fn dispose(&self) {
        let disposers = std::mem::take(&mut *self.disposers.lock());
        self.streams.lock().clear();
        for dispose in disposers {
            dispose();
        }
    }
}

impl Drop for EventMultiplexer {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::BridgeConfig;
    use crate::peer::{CallContext, EventSource, ServerChannel, event_channel};
    use crate::registry::MemoryRecordStore;
    use crate::test_support::{ScriptedHost, peer_pair};

    /// Client-side channel whose `onTick` feed the test drives.
    #[derive(Default)]
    struct Ticker {
        feed: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    }

    impl Ticker {
        async fn feed(&self) -> mpsc::UnboundedSender<Value> {
            tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    if let Some(feed) = self.feed.lock().clone() {
                        return feed;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("multiplexer subscribed")
        }
    }

    #[async_trait]
    impl ServerChannel for Ticker {
        async fn call(&self, _ctx: &CallContext, command: &str, _arg: Value) -> Result<Value> {
            Err(Error::unknown_command("ticker", command))
        }

        fn listen(&self, _ctx: &CallContext, event: &str, _arg: Value) -> Result<EventSource> {
            if event != "onTick" {
                return Err(Error::unknown_event("ticker", event));
            }
            let (tx, source) = event_channel();
            *self.feed.lock() = Some(tx);
            Ok(source)
        }
    }

    struct Connected {
        _client: Peer,
        server: Peer,
        ticker: Arc<Ticker>,
    }

    async fn connect(registry: &ConnectionRegistry, identity: &str) -> Connected {
        let (client, server) = peer_pair(identity).await;
        let ticker = Arc::new(Ticker::default());
        client.register_channel("ticker", Arc::clone(&ticker) as Arc<dyn ServerChannel>);
        registry.register(&server).await.expect("register");
        Connected {
            _client: client,
            server,
            ticker,
        }
    }

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(
            Arc::new(MemoryRecordStore::new()),
            ScriptedHost::new(),
            BridgeConfig::default(),
        ))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_merges_peers_that_attach_later() {
        let registry = registry();
        let multiplexer = EventMultiplexer::new(Arc::clone(&registry));
        let merged = multiplexer.event::<u32>("ticker", "onTick").expect("merged");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = merged.subscribe(move |tagged| sink.lock().push(tagged.clone()));

        let a = connect(&registry, "documentId:1:10:0").await;
        let b = connect(&registry, "documentId:1:11:0").await;
        let c = connect(&registry, "panel:1").await;
        assert_eq!(merged.source_count(), 3);

        a.ticker.feed().await.send(json!(1)).expect("a");
        b.ticker.feed().await.send(json!(2)).expect("b");
        c.ticker.feed().await.send(json!(3)).expect("c");
        settle().await;

        let mut got: Vec<(String, u32)> = seen
            .lock()
            .iter()
            .map(|t| (t.ctx.clone(), t.payload))
            .collect();
        got.sort();
        assert_eq!(
            got,
            vec![
                ("documentId:1:10:0".to_owned(), 1),
                ("documentId:1:11:0".to_owned(), 2),
                ("panel:1".to_owned(), 3),
            ]
        );

        // A removed peer contributes nothing further.
        let feed_b = b.ticker.feed().await;
        registry
            .remove_connection(b.server.connection_id())
            .await
            .expect("remove");
        let _ = feed_b.send(json!(20));
        settle().await;

        assert_eq!(seen.lock().len(), 3);
        assert_eq!(merged.source_count(), 2);
    }

    #[tokio::test]
    async fn test_existing_peers_are_folded_in() {
        let registry = registry();
        let a = connect(&registry, "documentId:1:10:0").await;

        let multiplexer = EventMultiplexer::new(Arc::clone(&registry));
        let merged = multiplexer.event::<String>("ticker", "onTick").expect("merged");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = merged.subscribe(move |tagged| sink.lock().push(tagged.payload.clone()));

        a.ticker.feed().await.send(json!("tick")).expect("send");
        settle().await;
        assert_eq!(*seen.lock(), vec!["tick".to_owned()]);
    }

    #[tokio::test]
    async fn test_same_key_shares_merge_and_checks_type() {
        let multiplexer = EventMultiplexer::new(registry());

        let first = multiplexer.event::<u32>("ticker", "onTick").expect("first");
        let second = multiplexer.event::<u32>("ticker", "onTick").expect("second");
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        assert_eq!(first.key(), "ticker::onTick");
        assert_eq!(multiplexer.len(), 1);

        let err = multiplexer.event::<String>("ticker", "onTick").unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_predicate_rejection_is_isolated() {
        let registry = registry();
        let multiplexer = EventMultiplexer::new(Arc::clone(&registry));
        let merged = multiplexer.event::<u32>("ticker", "onTick").expect("merged");

        let filtered = Arc::new(Mutex::new(Vec::new()));
        let everything = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&filtered);
        let _filtered_sub = merged.subscribe_filtered(
            |tagged: Tagged<u32>| async move {
                if tagged.ctx.starts_with("panel") {
                    Err(Error::predicate("panel values are not trusted"))
                } else {
                    Ok(true)
                }
            },
            move |tagged| sink.lock().push(tagged.payload),
        );
        let sink = Arc::clone(&everything);
        let _all_sub = merged.subscribe(move |tagged| sink.lock().push(tagged.payload));

        let a = connect(&registry, "panel:1").await;
        let b = connect(&registry, "documentId:1:10:0").await;

        let feed_a = a.ticker.feed().await;
        let feed_b = b.ticker.feed().await;
        feed_a.send(json!(1)).expect("a");
        feed_b.send(json!(2)).expect("b");
        feed_a.send(json!(3)).expect("a");
        feed_b.send(json!(4)).expect("b");
        settle().await;

        assert_eq!(*filtered.lock(), vec![2, 4]);
        assert_eq!(everything.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let registry = registry();
        let multiplexer = EventMultiplexer::new(Arc::clone(&registry));
        let merged = multiplexer.event::<u32>("ticker", "onTick").expect("merged");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = merged.subscribe(move |tagged| sink.lock().push(tagged.payload));

        let a = connect(&registry, "documentId:1:10:0").await;
        let feed = a.ticker.feed().await;
        feed.send(json!("not a number")).expect("send");
        feed.send(json!(5)).expect("send");
        settle().await;

        assert_eq!(*seen.lock(), vec![5]);
    }

    #[tokio::test]
    async fn test_dispose_stops_forwarding() {
        let registry = registry();
        let multiplexer = EventMultiplexer::new(Arc::clone(&registry));
        let merged = multiplexer.event::<u32>("ticker", "onTick").expect("merged");
        let a = connect(&registry, "documentId:1:10:0").await;
        let feed = a.ticker.feed().await;

        multiplexer.dispose();
        assert!(multiplexer.is_empty());
        assert_eq!(merged.source_count(), 0);

        tokio::time::timeout(Duration::from_secs(1), feed.closed())
            .await
            .expect("remote listen cancelled");
    }
}
