//! Host platform seam used by reconciliation.
//!
//! The registry never talks to the browser directly: tab/frame queries,
//! the panel ping and tab messaging all go through [`HostPlatform`].

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::Identity;

// ============================================================================
// HostMessage
// ============================================================================

/// Out-of-band message the registry sends through the host platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    /// Asks the context owning `identity` to reopen its port.
    Reconnect {
        /// Identity string of the record being revived.
        identity: String,
    },
}

// ============================================================================
// HostPlatform
// ============================================================================

/// Browser-side operations the registry depends on.
#[async_trait]
pub trait HostPlatform: Send + Sync + 'static {
    /// Frame ids currently alive in `tab_id`.
    ///
    /// Errors when the tab does not exist.
    async fn frame_ids(&self, tab_id: u32) -> Result<Vec<u32>>;

    /// Round-trip liveness ping to the context named by `target`.
    ///
    /// The registry bounds this with the probe timeout; an implementation
    /// may simply never answer when nobody is listening.
    async fn ping(&self, target: &Identity) -> Result<bool>;

    /// Delivers `message` to the content scripts of `tab_id`.
    async fn send_to_tab(&self, tab_id: u32, message: &HostMessage) -> Result<()>;

    /// Delivers `message` to every extension context.
    async fn broadcast(&self, message: &HostMessage) -> Result<()>;

    /// Reloads `tab_id`.
    async fn reload_tab(&self, tab_id: u32) -> Result<()>;
}

// ============================================================================
// Tests
// ============================================================================
