//! Context Bridge - channel RPC between isolated execution contexts.
//!
//! This library connects the isolated contexts of a browser extension
//! (background, content scripts, page main world, panel UI, remote peers)
//! with a typed request/response and event-stream protocol over whatever
//! narrow message primitive each pair of contexts has.
//!
//! # Architecture
//!
//! The crate is layered, each layer only knowing the one below:
//!
//! - **Port**: duplex message primitive over one physical transport
//! - **Protocol**: opaque byte-buffer framing over one port
//! - **Peer**: named channels, correlated calls and event listens
//! - **Registry**: who is connected, persisted across restarts
//! - **Multiplexer**: one event merged across every connected peer
//!
//! Key design principles:
//!
//! - Every peer declares its identity as the first frame on a port
//! - One record per registration key; a reconnect overwrites in place
//! - Disposal is explicit and idempotent at every layer
//! - No ambient globals besides the opt-in [`Tracer`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use context_bridge::transport::ExtensionPort;
//! use context_bridge::{BridgeConfig, Peer, Protocol, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (client_port, server_port) = ExtensionPort::pair("background", None);
//!
//!     let server = tokio::spawn(Peer::accept(
//!         Protocol::new(server_port),
//!         BridgeConfig::default(),
//!     ));
//!     let client = Peer::connect(
//!         Protocol::new(client_port),
//!         "documentId:7:42:0",
//!         BridgeConfig::default(),
//!     );
//!
//!     let server = server.await.expect("join")?;
//!     println!("accepted {}", server.remote_identity());
//!
//!     let reply = client.channel("storage").call("get", "theme").await;
//!     println!("{reply:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`transport`] | [`Port`](transport::Port) contract and transports |
//! | [`protocol`] | [`Protocol`] wrapper and wire [`Frame`]s |
//! | [`peer`] | [`Peer`], channels, [`ReconnectingPeer`] |
//! | [`identity`] | Identity codec |
//! | [`registry`] | [`ConnectionRegistry`] and persistence |
//! | [`hub`] | [`ConnectionHub`] server component |
//! | [`multiplexer`] | [`EventMultiplexer`] |
//! | [`emitter`] | [`Emitter`] publish/subscribe subject |
//! | [`trace`] | [`Tracer`] debug facility |
//! | [`config`] | [`BridgeConfig`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Tunables and their builder.
pub mod config;

/// Explicit publish/subscribe subject.
pub mod emitter;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Server component.
pub mod hub;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Identity codec.
pub mod identity;

/// Merged events across peers.
pub mod multiplexer;

/// Peer RPC surface.
pub mod peer;

/// Byte-buffer framing over a port.
pub mod protocol;

/// Connection registry.
pub mod registry;

/// Debug/trace facility.
pub mod trace;

/// Port transports.
pub mod transport;

#[cfg(test)]
mod test_support;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{BridgeConfig, BridgeConfigBuilder, ReconnectPolicy};

// Events
pub use emitter::{Emitter, Subscription};

// Error types
pub use error::{Error, Result};

// Server
pub use hub::{ConnectionHub, LifecycleEvent};

// Identifier types
pub use identifiers::{ConnectionId, RequestId, SubscriptionId};

// Identity
pub use identity::{Identity, RoleKind, create_identity, parse_identity};

// Multiplexer
pub use multiplexer::{EventMultiplexer, MergedEvent, Tagged};

// Peers
pub use peer::{
    CallContext, ChannelProxy, ConnectionState, Connector, EventSource, EventStream, Peer,
    ReconnectingPeer, ServerChannel, event_channel,
};

// Protocol
pub use protocol::{Frame, Protocol};

// Registry
pub use registry::{
    ConnectionRecord, ConnectionRegistry, FileRecordStore, HostMessage, HostPlatform,
    MemoryRecordStore, ReconcileReport, RecordStore,
};

// Tracing
pub use trace::{TraceConfig, TraceRecord, Tracer};
