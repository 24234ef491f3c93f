//! Protocol layer and wire frames.
//!
//! [`Protocol`] turns a [`Port`](crate::transport::Port) into a plain
//! byte-buffer stream. [`Frame`] is the structure the peer layer puts inside
//! those buffers.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Protocol`] wrapper |
//! | `frame` | [`Frame`] codec |

// ============================================================================
// Submodules
// ============================================================================

/// Protocol wrapper.
pub mod core;

/// Wire frames.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use self::core::Protocol;
pub use self::frame::Frame;
