//! Persisted connection records.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::identity::{Identity, parse_identity};

// ============================================================================
// Constants
// ============================================================================

/// Prefix of every persisted record key.
pub const KEY_PREFIX: &str = "identity:";

// ============================================================================
// ConnectionRecord
// ============================================================================

/// Bookkeeping entry for one live or formerly live peer.
///
/// Persisted as `{ "id": ..., "source": ..., "key": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Transport id assigned at connect time; changes on every reconnect.
    pub id: ConnectionId,
    /// Identity string the peer declared.
    pub source: String,
    /// `"identity:" + registration key`; stable across reconnects.
    pub key: String,
}

impl ConnectionRecord {
    /// Builds the record for a peer that declared `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Routing`] if `source` is not a valid identity.
    pub fn new(id: ConnectionId, source: &str) -> Result<Self> {
        let identity = parse_identity(source).ok_or_else(|| Error::routing(source))?;
        Ok(Self {
            id,
            source: source.to_owned(),
            key: record_key(&identity),
        })
    }

    /// Parses the stored identity.
    #[inline]
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        parse_identity(&self.source)
    }

    /// Registration key without the `identity:` prefix.
    #[inline]
    #[must_use]
    pub fn registration_key(&self) -> &str {
        self.key.strip_prefix(KEY_PREFIX).unwrap_or(&self.key)
    }
}

/// Persisted key for an identity.
#[inline]
#[must_use]
pub fn record_key(identity: &Identity) -> String {
    format!("{KEY_PREFIX}{}", identity.registration_key())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = ConnectionRecord::new(ConnectionId::from_string("c-1"), "documentId:7:42:0")
            .expect("valid identity");

        assert_eq!(record.key, "identity:documentId:7:42:0");
        assert_eq!(record.registration_key(), "documentId:7:42:0");

        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "id": "c-1",
                "source": "documentId:7:42:0",
                "key": "identity:documentId:7:42:0",
            })
        );
    }

    #[test]
    fn test_unroutable_identity_is_rejected() {
        let err = ConnectionRecord::new(ConnectionId::generate(), "tab-42").unwrap_err();
        assert!(err.is_routing_error());
    }

    #[test]
    fn test_key_is_canonical() {
        // Empty trailing field parses to the same identity.
        let a = ConnectionRecord::new(ConnectionId::generate(), "panel:3").expect("a");
        let b = ConnectionRecord::new(ConnectionId::generate(), "panel:3:").expect("b");
        assert_eq!(a.key, b.key);
    }
}
