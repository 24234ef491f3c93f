//! Debug/trace facility.
//!
//! A process-wide, lazily-initialized [`Tracer`] that records event flow for
//! diagnostics. When disabled, every hook costs a single atomic load.
//!
//! # Example
//!
//! ```
//! use context_bridge::trace::{TraceConfig, Tracer};
//!
//! let tracer = Tracer::global();
//! tracer.configure(TraceConfig { enabled: true, ..TraceConfig::default() });
//!
//! let doubled = tracer.trace("demo.math", None, "double", || 21.into(), || 21 * 2);
//! assert_eq!(doubled, 42);
//! assert_eq!(tracer.records("demo.math").len(), 1);
//! ```
//!
//! # Filtering
//!
//! | Setting | Effect |
//! |---------|--------|
//! | `enabled` | Master switch |
//! | `components` | Per-component override, keyed by the source prefix before `.` |
//! | `include_sources` | If set, only these sources are recorded |
//! | `include_types` | If set, only these event types are recorded |

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Default number of records kept per source.
pub const DEFAULT_TRACE_CAPACITY: usize = 256;

/// Process-wide tracer.
static TRACER: OnceLock<Tracer> = OnceLock::new();

// ============================================================================
// TraceConfig
// ============================================================================

/// Tracer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Master switch.
    pub enabled: bool,
    /// Component overrides. Components not listed follow `enabled`.
    pub components: FxHashMap<String, bool>,
    /// Only record these sources, when set.
    pub include_sources: Option<FxHashSet<String>>,
    /// Only record these event types, when set.
    pub include_types: Option<FxHashSet<String>>,
    /// Records kept per source before the oldest is evicted.
    pub capacity: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            components: FxHashMap::default(),
            include_sources: None,
            include_types: None,
            capacity: DEFAULT_TRACE_CAPACITY,
        }
    }
}

// ============================================================================
// TraceRecord
// ============================================================================

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    /// Unique record id.
    pub id: Uuid,
    /// Wall-clock time the event started, in milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Emitting component, e.g. `registry.peerAdded`.
    pub source: String,
    /// Receiving side, if known.
    pub target: Option<String>,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: Value,
    /// Time spent delivering the event.
    pub duration: Duration,
}

// ============================================================================
// Tracer
// ============================================================================

/// Mutable tracer state.
#[derive(Debug, Default)]
struct TracerState {
    config: TraceConfig,
    rings: FxHashMap<String, VecDeque<TraceRecord>>,
}

/// Bounded in-memory event recorder.
#[derive(Debug)]
pub struct Tracer {
    /// Mirror of `config.enabled` for the fast path.
    enabled: AtomicBool,
    state: RwLock<TracerState>,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(TraceConfig::default())
    }
}

impl Tracer {
    /// Creates a standalone tracer.
    #[must_use]
    pub fn new(config: TraceConfig) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            state: RwLock::new(TracerState {
                config,
                rings: FxHashMap::default(),
            }),
        }
    }

    /// Returns the process-wide tracer, creating it disabled on first use.
    pub fn global() -> &'static Tracer {
        TRACER.get_or_init(Tracer::default)
    }

    /// Replaces the configuration. Existing records are trimmed to the new
    /// capacity.
    pub fn configure(&self, config: TraceConfig) {
        let mut state = self.state.write();
        let capacity = config.capacity;
        for ring in state.rings.values_mut() {
            while ring.len() > capacity {
                ring.pop_front();
            }
        }
        self.enabled.store(config.enabled, Ordering::Release);
        state.config = config;
    }

    /// Turns recording on.
    pub fn enable(&self) {
        self.state.write().config.enabled = true;
        self.enabled.store(true, Ordering::Release);
    }

    /// Turns recording off. Existing records are kept.
    pub fn disable(&self) {
        self.state.write().config.enabled = false;
        self.enabled.store(false, Ordering::Release);
    }

    /// Master switch check.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Overrides recording for one component.
    pub fn set_component(&self, component: impl Into<String>, enabled: bool) {
        self.state
            .write()
            .config
            .components
            .insert(component.into(), enabled);
    }

    /// Returns `true` if an event from `source` of `event_type` would be
    /// recorded.
    #[must_use]
    pub fn should_trace(&self, source: &str, event_type: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let state = self.state.read();
        let config = &state.config;

        let component = source.split('.').next().unwrap_or(source);
        if config.components.get(component) == Some(&false) {
            return false;
        }
        if let Some(sources) = &config.include_sources
            && !sources.contains(source)
        {
            return false;
        }
        if let Some(types) = &config.include_types
            && !types.contains(event_type)
        {
            return false;
        }
        true
    }

    /// Runs `f`, recording it as an event when tracing is on.
    ///
    /// `data` is only evaluated when the event is recorded.
    pub fn trace<R>(
        &self,
        source: &str,
        target: Option<&str>,
        event_type: &str,
        data: impl FnOnce() -> Value,
        f: impl FnOnce() -> R,
    ) -> R {
        if !self.is_enabled() || !self.should_trace(source, event_type) {
            return f();
        }

        let started = Instant::now();
        let result = f();
        self.record_event(
            source,
            target.map(str::to_owned),
            event_type,
            data(),
            started.elapsed(),
        );
        result
    }

    /// Appends a record to the ring for `source`.
    pub(crate) fn record_event(
        &self,
        source: &str,
        target: Option<String>,
        event_type: &str,
        data: Value,
        duration: Duration,
    ) {
        let timestamp_ms = SystemTime::now()
            .checked_sub(duration)
            .unwrap_or_else(SystemTime::now)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let record = TraceRecord {
            id: Uuid::new_v4(),
            timestamp_ms,
            source: source.to_owned(),
            target,
            event_type: event_type.to_owned(),
            data,
            duration,
        };

        let mut state = self.state.write();
        let capacity = state.config.capacity.max(1);
        let ring = state.rings.entry(source.to_owned()).or_default();
        if ring.len() >= capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Returns the records kept for `source`, oldest first.
    #[must_use]
    pub fn records(&self, source: &str) -> Vec<TraceRecord> {
        self.state
            .read()
            .rings
            .get(source)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every source that has records.
    #[must_use]
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.state.read().rings.keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Drops all records.
    pub fn clear(&self) {
        self.state.write().rings.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> Tracer {
        Tracer::new(TraceConfig {
            enabled: true,
            ..TraceConfig::default()
        })
    }

    #[test]
    fn test_disabled_records_nothing() {
        let tracer = Tracer::default();
        let value = tracer.trace("peer.call", None, "request", || Value::Null, || 5);
        assert_eq!(value, 5);
        assert!(tracer.records("peer.call").is_empty());
    }

    #[test]
    fn test_disabled_does_not_evaluate_data() {
        let tracer = Tracer::default();
        tracer.trace(
            "peer.call",
            None,
            "request",
            || panic!("data evaluated while disabled"),
            || (),
        );
    }

    #[test]
    fn test_ring_is_bounded_per_source() {
        let tracer = Tracer::new(TraceConfig {
            enabled: true,
            capacity: 3,
            ..TraceConfig::default()
        });

        for i in 0..5 {
            tracer.trace("registry.changed", Some("hub"), "update", || i.into(), || ());
        }
        tracer.trace("peer.call", None, "request", || Value::Null, || ());

        let records = tracer.records("registry.changed");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].data, Value::from(2));
        assert_eq!(records[2].data, Value::from(4));
        assert_eq!(records[2].target.as_deref(), Some("hub"));
        assert_eq!(tracer.records("peer.call").len(), 1);
        assert_eq!(tracer.sources(), vec!["peer.call", "registry.changed"]);
    }

    #[test]
    fn test_configure_trims_to_new_capacity() {
        let tracer = enabled();
        for i in 0..4 {
            tracer.trace("peer.event", None, "emit", || i.into(), || ());
        }
        tracer.configure(TraceConfig {
            enabled: true,
            capacity: 2,
            ..TraceConfig::default()
        });

        let records = tracer.records("peer.event");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, Value::from(2));
    }

    #[test]
    fn test_component_override() {
        let tracer = enabled();
        tracer.set_component("registry", false);

        assert!(!tracer.should_trace("registry.changed", "update"));
        assert!(tracer.should_trace("peer.call", "request"));
    }

    #[test]
    fn test_include_lists() {
        let mut sources = FxHashSet::default();
        sources.insert("peer.call".to_string());
        let mut types = FxHashSet::default();
        types.insert("request".to_string());

        let tracer = Tracer::new(TraceConfig {
            enabled: true,
            include_sources: Some(sources),
            include_types: Some(types),
            ..TraceConfig::default()
        });

        assert!(tracer.should_trace("peer.call", "request"));
        assert!(!tracer.should_trace("peer.call", "response"));
        assert!(!tracer.should_trace("peer.listen", "request"));
    }

    #[test]
    fn test_enable_disable_toggle() {
        let tracer = Tracer::default();
        assert!(!tracer.is_enabled());
        tracer.enable();
        assert!(tracer.is_enabled());
        tracer.trace("a.b", None, "x", || Value::Null, || ());
        tracer.disable();
        tracer.trace("a.b", None, "x", || Value::Null, || ());
        assert_eq!(tracer.records("a.b").len(), 1);
        tracer.clear();
        assert!(tracer.sources().is_empty());
    }

    #[test]
    fn test_record_serializes_type_field() {
        let tracer = enabled();
        tracer.trace("a.b", None, "emit", || Value::Null, || ());
        let json = serde_json::to_value(&tracer.records("a.b")[0]).expect("serialize");
        assert_eq!(json["type"], "emit");
        assert!(json.get("timestampMs").is_some());
    }
}
