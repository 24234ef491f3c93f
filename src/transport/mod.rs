//! Port transports.
//!
//! A [`Port`] is the narrow message primitive available between isolated
//! execution contexts. Everything above this layer (protocol, peers,
//! registry) is transport-agnostic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ExtensionPort    ┌──────────────┐
//! │ Content /    │◄──────────────────►│              │
//! │ Panel        │                    │  Background  │
//! └──────────────┘                    │  (hub)       │
//! ┌──────────────┐     PagePort       │              │
//! │ Main world   │◄──── PageBus ─────►│              │
//! └──────────────┘                    │              │
//! ┌──────────────┐    SocketPort      │              │
//! │ Remote peer  │◄──── WebSocket ───►│              │
//! └──────────────┘                    └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `port` | [`Port`] trait and shared [`PortCore`] state |
//! | `extension` | In-extension named port pair |
//! | `page` | In-page channel over a broadcast bus |
//! | `socket` | WebSocket port |
//! | `server` | WebSocket listener |

// ============================================================================
// Submodules
// ============================================================================

/// In-extension duplex channel.
pub mod extension;

/// In-page duplex channel.
pub mod page;

/// Port contract and shared state.
pub mod port;

/// WebSocket listener.
pub mod server;

/// WebSocket port.
pub mod socket;

// ============================================================================
// Re-exports
// ============================================================================

pub use extension::ExtensionPort;
pub use page::{PageAcceptor, PageBus, PagePort};
pub use port::{DisconnectHandler, MessageHandler, Port, PortCore, PortSender};
pub use server::SocketListener;
pub use socket::SocketPort;
