//! Explicit publish/subscribe subject.
//!
//! An [`Emitter`] tracks subscriber callbacks, hands out [`Subscription`]
//! guards that unsubscribe on drop, and can be disposed deterministically.
//! Every event surface in the crate (peer lifecycle, registry changes,
//! merged multiplexer streams) is one of these; there is no global bus.
//!
//! # Example
//!
//! ```
//! use context_bridge::Emitter;
//!
//! let emitter: Emitter<u32> = Emitter::new();
//! let sub = emitter.subscribe(|value| println!("got {value}"));
//! emitter.emit(&7);
//! drop(sub); // unsubscribed
//! assert_eq!(emitter.listener_count(), 0);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::identifiers::SubscriptionId;
use crate::trace::Tracer;

// ============================================================================
// Types
// ============================================================================

/// Subscriber callback.
type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Converts an emitted value into trace data.
type Describe<T> = fn(&T) -> Value;

/// Trace hook attached by [`Emitter::traced`].
struct TraceHook<T> {
    source: String,
    describe: Describe<T>,
    /// `None` records into [`Tracer::global`].
    tracer: Option<Arc<Tracer>>,
}

/// Shared emitter state.
struct EmitterInner<T> {
    /// Listeners in subscription order.
    listeners: RwLock<Vec<(SubscriptionId, Listener<T>)>>,
    disposed: AtomicBool,
    trace: Option<TraceHook<T>>,
}

// ============================================================================
// Emitter
// ============================================================================

/// A subject delivering `&T` to every current subscriber.
///
/// Cloning yields another handle to the same subject.
pub struct Emitter<T> {
    inner: Arc<EmitterInner<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Emitter<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.inner.listeners.read().len())
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> Emitter<T>
where
    T: Send + Sync + 'static,
{
    /// Creates an emitter with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                listeners: RwLock::new(Vec::new()),
                disposed: AtomicBool::new(false),
                trace: None,
            }),
        }
    }

    /// Registers a callback. Returns a guard that unsubscribes on drop.
    ///
    /// Subscribing to a disposed emitter returns an inert guard.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = SubscriptionId::next();
        if self.is_disposed() {
            return Subscription::inert(id);
        }

        self.inner.listeners.write().push((id, Arc::new(listener)));

        let weak: Weak<EmitterInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.listeners.write().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    /// Delivers `value` to every current subscriber.
    ///
    /// Listeners are snapshotted first, so a callback may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, value: &T) {
        if self.is_disposed() {
            return;
        }

        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        if let Some(hook) = &self.inner.trace {
            let tracer = hook.tracer.as_deref().unwrap_or_else(|| Tracer::global());
            if tracer.is_enabled() && tracer.should_trace(&hook.source, "emit") {
                let started = Instant::now();
                for listener in &listeners {
                    listener(value);
                }
                tracer.record_event(
                    &hook.source,
                    Some(format!("{} listeners", listeners.len())),
                    "emit",
                    (hook.describe)(value),
                    started.elapsed(),
                );
                return;
            }
        }

        for listener in &listeners {
            listener(value);
        }
    }

    /// Returns the number of current subscribers.
    #[inline]
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Drops every subscriber and ignores future emits and subscribes.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            self.inner.listeners.write().clear();
        }
    }

    /// Returns `true` once [`dispose`](Self::dispose) has run.
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl<T> Emitter<T>
where
    T: Serialize + Send + Sync + 'static,
{
    /// Creates an emitter whose emissions are recorded by the global
    /// [`Tracer`] under `source` while tracing is enabled.
    #[must_use]
    pub fn traced(source: impl Into<String>) -> Self {
        Self::with_hook(source.into(), None)
    }

    /// Like [`traced`](Self::traced), recording into `tracer` instead of
    /// the global one.
    #[must_use]
    pub fn traced_with(source: impl Into<String>, tracer: Arc<Tracer>) -> Self {
        Self::with_hook(source.into(), Some(tracer))
    }

    fn with_hook(source: String, tracer: Option<Arc<Tracer>>) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                listeners: RwLock::new(Vec::new()),
                disposed: AtomicBool::new(false),
                trace: Some(TraceHook {
                    source,
                    describe: describe::<T>,
                    tracer,
                }),
            }),
        }
    }
}

/// Serializes a value for the trace ring.
fn describe<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ============================================================================
// Subscription
// ============================================================================

/// Guard returned by [`Emitter::subscribe`].
///
/// Dropping it (or calling [`dispose`](Self::dispose)) removes the listener.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: SubscriptionId,
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// A guard that is not attached to any emitter.
    fn inert(id: SubscriptionId) -> Self {
        Self {
            id,
            unsubscribe: None,
        }
    }

    /// A guard that runs `unsubscribe` once when disposed or dropped.
    pub(crate) fn from_fn(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id: SubscriptionId::next(),
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Returns the subscription id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Unsubscribes now. Idempotent.
    pub fn dispose(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

impl Drop for Subscription {
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

    use std::sync::atomic::AtomicUsize;

    use crate::trace::TraceConfig;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let emitter: Emitter<u32> = Emitter::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = Arc::clone(&total);
        let _a = emitter.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = Arc::clone(&total);
        let _b = emitter.subscribe(move |v| {
            t2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        emitter.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let emitter: Emitter<()> = Emitter::new();
        let sub = emitter.subscribe(|_| {});
        assert_eq!(emitter.listener_count(), 1);
        drop(sub);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_dispose_is_idempotent_and_final() {
        let emitter: Emitter<u8> = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = emitter.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        emitter.dispose();
        emitter.dispose();
        emitter.emit(&1);

        assert!(emitter.is_disposed());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let late = emitter.subscribe(|_| {});
        assert_eq!(emitter.listener_count(), 0);
        drop(late);
    }

    #[test]
    fn test_listener_may_unsubscribe_during_emit() {
        let emitter: Emitter<()> = Emitter::new();
        let slot: Arc<parking_lot::Mutex<Option<Subscription>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let slot_clone = Arc::clone(&slot);
        let sub = emitter.subscribe(move |_| {
            slot_clone.lock().take();
        });
        *slot.lock() = Some(sub);

        emitter.emit(&());
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_subscription_outlives_emitter() {
        let emitter: Emitter<()> = Emitter::new();
        let mut sub = emitter.subscribe(|_| {});
        drop(emitter);
        sub.dispose();
    }

    #[test]
    fn test_traced_emitter_records_when_enabled() {
        let tracer = Arc::new(Tracer::new(TraceConfig {
            enabled: true,
            ..TraceConfig::default()
        }));

        let emitter: Emitter<String> =
            Emitter::traced_with("emitterTest.values", Arc::clone(&tracer));
        let _sub = emitter.subscribe(|_| {});
        emitter.emit(&"hello".to_string());

        let records = tracer.records("emitterTest.values");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "emit");
        assert_eq!(records[0].data, Value::String("hello".into()));

        tracer.disable();
        emitter.emit(&"quiet".to_string());
        assert_eq!(tracer.records("emitterTest.values").len(), 1);
    }
}
