//! Error types for the context bridge.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use context_bridge::{Peer, Result};
//!
//! async fn example(peer: &Peer) -> Result<()> {
//!     let quotes = peer.channel("quotes");
//!     let value = quotes.call("latest", serde_json::json!({ "symbol": "SPY" })).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Transport | [`Error::Transport`], [`Error::ConnectionClosed`], [`Error::Disposed`], [`Error::Reconnecting`], [`Error::HandshakeTimeout`] |
//! | Routing | [`Error::Routing`], [`Error::IdentityMismatch`] |
//! | Liveness | [`Error::StaleConnection`] |
//! | Multiplexer | [`Error::Predicate`], [`Error::TypeMismatch`] |
//! | RPC | [`Error::Remote`], [`Error::UnknownChannel`], [`Error::UnknownCommand`], [`Error::UnknownEvent`], [`Error::CallTimeout`], [`Error::TooManyPending`] |
//! | Environment | [`Error::Config`], [`Error::Storage`], [`Error::Platform`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Port closed or unreachable mid-operation.
    ///
    /// Surfaced to RPC callers as a rejected call.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// The underlying port disconnected.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer was disposed while the operation was in flight.
    #[error("Peer disposed")]
    Disposed,

    /// The client is re-establishing its port; the call was not sent.
    #[error("Reconnecting")]
    Reconnecting,

    /// The remote side never sent its identity handshake.
    #[error("Handshake timeout after {timeout_ms}ms")]
    HandshakeTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Routing Errors
    // ========================================================================
    /// Identity string failed to parse.
    ///
    /// Records carrying such an identity are unconditionally stale.
    #[error("Unroutable identity: {identity}")]
    Routing {
        /// The identity string that failed to parse.
        identity: String,
    },

    /// Declared identity disagrees with the platform-reported sender.
    #[error("Identity {identity} does not match sender {field}")]
    IdentityMismatch {
        /// The declared identity.
        identity: String,
        /// First field that disagrees.
        field: &'static str,
    },

    // ========================================================================
    // Liveness Errors
    // ========================================================================
    /// Liveness probe found the target context gone.
    #[error("Stale connection {identity}: {reason}")]
    StaleConnection {
        /// Identity of the stale connection.
        identity: String,
        /// Why the probe failed.
        reason: String,
    },

    // ========================================================================
    // Multiplexer Errors
    // ========================================================================
    /// Multiplexer filter rejected.
    #[error("Predicate error: {message}")]
    Predicate {
        /// Description of the predicate failure.
        message: String,
    },

    /// A merged stream was requested with a payload type different from the
    /// one it was created with.
    #[error("Payload type mismatch for {key}")]
    TypeMismatch {
        /// The `channel::event` key.
        key: String,
    },

    // ========================================================================
    // RPC Errors
    // ========================================================================
    /// The remote channel handler returned an error.
    #[error("Remote error: {message}")]
    Remote {
        /// Error message from the remote side.
        message: String,
    },

    /// No channel registered under this name.
    #[error("Unknown channel: {channel}")]
    UnknownChannel {
        /// The requested channel name.
        channel: String,
    },

    /// The channel does not implement this command.
    #[error("Unknown command: {channel}.{command}")]
    UnknownCommand {
        /// Channel name.
        channel: String,
        /// The unrecognized command.
        command: String,
    },

    /// The channel does not publish this event.
    #[error("Unknown event: {channel}::{event}")]
    UnknownEvent {
        /// Channel name.
        channel: String,
        /// The unrecognized event.
        event: String,
    },

    /// Call was not answered in time.
    #[error("Call {request_id} timed out after {timeout_ms}ms")]
    CallTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Too many outstanding calls on one peer.
    #[error("Too many pending calls: {pending}/{max}")]
    TooManyPending {
        /// Calls currently awaiting a response.
        pending: usize,
        /// Configured limit.
        max: usize,
    },

    // ========================================================================
    // Environment Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Persisted record store failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Host platform call (tab query, messaging, reload) failed.
    #[error("Platform error: {message}")]
    Platform {
        /// Description of the platform error.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a handshake timeout error.
    #[inline]
    pub fn handshake_timeout(timeout_ms: u64) -> Self {
        Self::HandshakeTimeout { timeout_ms }
    }

    /// Creates a routing error.
    #[inline]
    pub fn routing(identity: impl Into<String>) -> Self {
        Self::Routing {
            identity: identity.into(),
        }
    }

    /// Creates an identity mismatch error.
    #[inline]
    pub fn identity_mismatch(identity: impl Into<String>, field: &'static str) -> Self {
        Self::IdentityMismatch {
            identity: identity.into(),
            field,
        }
    }

    /// Creates a stale connection error.
    #[inline]
    pub fn stale(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StaleConnection {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Creates a predicate error.
    #[inline]
    pub fn predicate(message: impl Into<String>) -> Self {
        Self::Predicate {
            message: message.into(),
        }
    }

    /// Creates a type mismatch error.
    #[inline]
    pub fn type_mismatch(key: impl Into<String>) -> Self {
        Self::TypeMismatch { key: key.into() }
    }

    /// Creates a remote error.
    #[inline]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Creates an unknown channel error.
    #[inline]
    pub fn unknown_channel(channel: impl Into<String>) -> Self {
        Self::UnknownChannel {
            channel: channel.into(),
        }
    }

    /// Creates an unknown command error.
    #[inline]
    pub fn unknown_command(channel: impl Into<String>, command: impl Into<String>) -> Self {
        Self::UnknownCommand {
            channel: channel.into(),
            command: command.into(),
        }
    }

    /// Creates an unknown event error.
    #[inline]
    pub fn unknown_event(channel: impl Into<String>, event: impl Into<String>) -> Self {
        Self::UnknownEvent {
            channel: channel.into(),
            event: event.into(),
        }
    }

    /// Creates a call timeout error.
    #[inline]
    pub fn call_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::CallTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a storage error.
    #[inline]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a platform error.
    #[inline]
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the port under the operation went away.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ConnectionClosed
                | Self::Disposed
                | Self::Reconnecting
                | Self::HandshakeTimeout { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the declared identity cannot be routed to.
    #[inline]
    #[must_use]
    pub fn is_routing_error(&self) -> bool {
        matches!(self, Self::Routing { .. } | Self::IdentityMismatch { .. })
    }

    /// Returns `true` if a liveness probe failed.
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleConnection { .. })
    }

    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. } | Self::CallTimeout { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed when retried after the client has
    /// reconnected. Calls are never retried automatically.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_transport_error() || matches!(self, Self::CallTimeout { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::transport("port gone");
        assert_eq!(err.to_string(), "Transport error: port gone");

        let err = Error::unknown_command("quotes", "latest");
        assert_eq!(err.to_string(), "Unknown command: quotes.latest");
    }

    #[test]
    fn test_routing_error() {
        let err = Error::routing("garbage");
        assert!(err.is_routing_error());
        assert!(!err.is_transport_error());
        assert_eq!(err.to_string(), "Unroutable identity: garbage");

        let err = Error::identity_mismatch("documentId:7:42:0", "tabId");
        assert!(err.is_routing_error());
        assert_eq!(
            err.to_string(),
            "Identity documentId:7:42:0 does not match sender tabId"
        );
    }

    #[test]
    fn test_is_transport_error() {
        assert!(Error::ConnectionClosed.is_transport_error());
        assert!(Error::Disposed.is_transport_error());
        assert!(Error::Reconnecting.is_transport_error());
        assert!(!Error::remote("boom").is_transport_error());
        assert!(!Error::config("bad").is_transport_error());
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::call_timeout(RequestId::new(3), 5000);
        assert!(timeout_err.is_timeout());
        assert!(Error::handshake_timeout(10).is_timeout());
        assert!(!Error::ConnectionClosed.is_timeout());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::Reconnecting.is_recoverable());
        assert!(Error::call_timeout(RequestId::new(1), 1).is_recoverable());
        assert!(!Error::predicate("nope").is_recoverable());
        assert!(!Error::stale("panel:1", "no reply").is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
