//! Type-safe identifiers.
//!
//! Newtype wrappers keep transport ids, call correlation ids and
//! subscription handles from being mixed up.
//!
//! | Type | Scope | Source |
//! |------|-------|--------|
//! | [`ConnectionId`] | One port lifetime | UUID v4, new on every (re)connect |
//! | [`RequestId`] | One peer | Monotonic counter |
//! | [`SubscriptionId`] | One emitter | Process-wide counter |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ConnectionId
// ============================================================================

/// Ephemeral transport-level peer identifier.
///
/// Assigned when a port is observed and never reused: a reconnecting
/// context receives a fresh id under the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generates a new random connection id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an id supplied by the host platform or read from storage.
    #[inline]
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// RequestId
// ============================================================================

/// Correlation id for calls and listens on a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates a request id from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-peer allocator for [`RequestId`]s.
#[derive(Debug, Default)]
pub(crate) struct RequestIdAllocator(AtomicU64);

impl RequestIdAllocator {
    /// Returns the next id. Ids start at 1.
    #[inline]
    pub(crate) fn next(&self) -> RequestId {
        RequestId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// ============================================================================
// SubscriptionId
// ============================================================================

/// Global counter for subscription ids.
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle identifying one subscriber of an emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Allocates the next subscription id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_connection_id_serde_is_transparent() {
        let id = ConnectionId::from_string("port-7");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"port-7\"");
    }

    #[test]
    fn test_request_id_allocator_starts_at_one() {
        let alloc = RequestIdAllocator::default();
        assert_eq!(alloc.next(), RequestId::new(1));
        assert_eq!(alloc.next(), RequestId::new(2));
    }

    #[test]
    fn test_subscription_ids_increase() {
        let a = SubscriptionId::next();
        let b = SubscriptionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("sub-"));
    }
}
