//! Shared test doubles.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::peer::Peer;
use crate::protocol::Protocol;
use crate::registry::{HostMessage, HostPlatform};
use crate::transport::ExtensionPort;

// ============================================================================
// Peers
// ============================================================================

/// Connects a client peer declaring `identity` to an accepted server peer.
///
/// Returns `(client, server)`.
pub(crate) async fn peer_pair(identity: &str) -> (Peer, Peer) {
    let (client_port, server_port) = ExtensionPort::pair(identity, None);
    let server = tokio::spawn(Peer::accept(
        Protocol::new(server_port),
        BridgeConfig::default(),
    ));
    let client = Peer::connect(Protocol::new(client_port), identity, BridgeConfig::default());
    let server = server.await.expect("join").expect("handshake");
    (client, server)
}

// ============================================================================
// ScriptedHost
// ============================================================================

/// [`HostPlatform`] whose answers are set by the test.
#[derive(Default)]
pub(crate) struct ScriptedHost {
    /// Live frames per tab; a missing tab errors.
    pub frames: Mutex<FxHashMap<u32, Vec<u32>>>,
    /// Windows whose panel answers pings.
    pub open_panels: Mutex<FxHashSet<u32>>,
    /// Windows whose panel never answers.
    pub silent_panels: Mutex<FxHashSet<u32>>,
    /// Tabs where messaging fails.
    pub broken_tabs: Mutex<FxHashSet<u32>>,
    /// Messages delivered per tab.
    pub sent: Mutex<Vec<(u32, HostMessage)>>,
    /// Broadcast messages.
    pub broadcasts: Mutex<Vec<HostMessage>>,
    /// Reloaded tabs.
    pub reloaded: Mutex<Vec<u32>>,
}

impl ScriptedHost {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_tab(self: &Arc<Self>, tab_id: u32, frames: &[u32]) -> Arc<Self> {
        self.frames.lock().insert(tab_id, frames.to_vec());
        Arc::clone(self)
    }
}

#[async_trait]
impl HostPlatform for ScriptedHost {
    async fn frame_ids(&self, tab_id: u32) -> Result<Vec<u32>> {
        self.frames
            .lock()
            .get(&tab_id)
            .cloned()
            .ok_or_else(|| Error::platform(format!("No tab with id: {tab_id}")))
    }

    async fn ping(&self, target: &Identity) -> Result<bool> {
        let Some(window_id) = target.window_id else {
            return Ok(false);
        };
        let silent = self.silent_panels.lock().contains(&window_id);
        if silent {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(self.open_panels.lock().contains(&window_id))
    }

    async fn send_to_tab(&self, tab_id: u32, message: &HostMessage) -> Result<()> {
        if self.broken_tabs.lock().contains(&tab_id) {
            return Err(Error::platform("Could not establish connection. Receiving end does not exist."));
        }
        self.sent.lock().push((tab_id, message.clone()));
        Ok(())
    }

    async fn broadcast(&self, message: &HostMessage) -> Result<()> {
        self.broadcasts.lock().push(message.clone());
        Ok(())
    }

    async fn reload_tab(&self, tab_id: u32) -> Result<()> {
        self.reloaded.lock().push(tab_id);
        Ok(())
    }
}
