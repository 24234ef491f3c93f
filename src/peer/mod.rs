//! Channel-based RPC between two contexts.
//!
//! A [`Peer`] binds an identity to one [`Protocol`](crate::protocol::Protocol)
//! and lets both sides expose named channels to each other.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `channel` | [`ServerChannel`] trait, [`ChannelProxy`], [`EventStream`] |
//! | `core` | [`Peer`] |
//! | `reconnect` | [`ReconnectingPeer`] and its [`Connector`] |

// ============================================================================
// Submodules
// ============================================================================

/// Channel contracts and proxies.
pub mod channel;

/// Peer implementation.
pub mod core;

/// Self-healing client peer.
pub mod reconnect;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::channel::{
    CallContext, ChannelProxy, EventSource, EventStream, ServerChannel, event_channel,
};
pub use self::core::Peer;
pub use self::reconnect::{ConnectionState, Connector, ReconnectingPeer};
