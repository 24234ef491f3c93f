//! Connection identity codec.
//!
//! A connection identity names the context a port belongs to: its role and,
//! for contexts living in a browser window, the window, tab and frame. It is
//! serialized to a single colon-delimited token:
//!
//! ```text
//! <role>[:<windowId>][:<tabId>][:<frameId>]
//! ```
//!
//! Numeric fields are decimal. A field is only written while every field
//! before it is present; serialization stops at the first absent field.
//! This codec is the only place identity strings are built or taken apart.
//!
//! # Roles
//!
//! | Prefix | Context |
//! |--------|---------|
//! | `document…` | Content script or page script, one role per document |
//! | `background` | The long-lived background process (server) |
//! | `panel` | The panel UI of one window |
//! | `remote` | A peer reached over a socket |
//!
//! # Example
//!
//! ```
//! use context_bridge::identity::{create_identity, parse_identity};
//!
//! let token = create_identity("documentId", Some(7), Some(42), Some(0));
//! assert_eq!(token, "documentId:7:42:0");
//!
//! let identity = parse_identity(&token).expect("well-formed");
//! assert_eq!(identity.tab_id, Some(42));
//! assert!(parse_identity("unknown:1").is_none());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ============================================================================
// Constants
// ============================================================================

/// Field separator.
const SEPARATOR: char = ':';

/// Prefix shared by every document role.
pub const DOCUMENT_ROLE_PREFIX: &str = "document";

/// Fixed role of the background process.
pub const BACKGROUND_ROLE: &str = "background";

/// Literal marker of the panel UI.
pub const PANEL_ROLE: &str = "panel";

/// Role of peers reached over a socket.
pub const REMOTE_ROLE: &str = "remote";

/// Role prefixes accepted by [`parse_identity`].
const KNOWN_ROLE_PREFIXES: [&str; 4] =
    [DOCUMENT_ROLE_PREFIX, BACKGROUND_ROLE, PANEL_ROLE, REMOTE_ROLE];

// ============================================================================
// RoleKind
// ============================================================================

/// Context type derived from a role token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    /// Content or page script of one document.
    Document,
    /// Background process.
    Background,
    /// Panel UI.
    Panel,
    /// Socket peer.
    Remote,
}

impl RoleKind {
    /// Classifies a role token, `None` if no known prefix matches.
    #[must_use]
    pub fn of(role: &str) -> Option<Self> {
        if role.starts_with(DOCUMENT_ROLE_PREFIX) {
            Some(Self::Document)
        } else if role.starts_with(BACKGROUND_ROLE) {
            Some(Self::Background)
        } else if role.starts_with(PANEL_ROLE) {
            Some(Self::Panel)
        } else if role.starts_with(REMOTE_ROLE) {
            Some(Self::Remote)
        } else {
            None
        }
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Structured connection address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Originating context type.
    pub role: String,
    /// Browser window id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_id: Option<u32>,
    /// Tab id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<u32>,
    /// Frame id, `0` for the top-level frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u32>,
}

impl Identity {
    /// Creates an identity with only a role.
    #[must_use]
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            window_id: None,
            tab_id: None,
            frame_id: None,
        }
    }

    /// Identity of the panel UI of `window_id`.
    #[must_use]
    pub fn panel(window_id: u32) -> Self {
        Self::new(PANEL_ROLE).with_window(window_id)
    }

    /// Identity of the background process.
    #[must_use]
    pub fn background() -> Self {
        Self::new(BACKGROUND_ROLE)
    }

    /// Sets the window id.
    #[inline]
    #[must_use]
    pub fn with_window(mut self, window_id: u32) -> Self {
        self.window_id = Some(window_id);
        self
    }

    /// Sets the tab id.
    #[inline]
    #[must_use]
    pub fn with_tab(mut self, tab_id: u32) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    /// Sets the frame id.
    #[inline]
    #[must_use]
    pub fn with_frame(mut self, frame_id: u32) -> Self {
        self.frame_id = Some(frame_id);
        self
    }

    /// Returns the context type.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> Option<RoleKind> {
        RoleKind::of(&self.role)
    }

    /// Returns `true` for the panel UI of any window.
    #[inline]
    #[must_use]
    pub fn is_panel(&self) -> bool {
        self.kind() == Some(RoleKind::Panel)
    }

    /// Returns `true` for the panel UI of `window_id`.
    #[inline]
    #[must_use]
    pub fn is_panel_for(&self, window_id: u32) -> bool {
        self.is_panel() && self.window_id == Some(window_id)
    }

    /// Returns the `(tab, frame)` pair if both are present.
    #[inline]
    #[must_use]
    pub fn tab_frame(&self) -> Option<(u32, u32)> {
        Some((self.tab_id?, self.frame_id?))
    }

    /// Key under which this identity is registered.
    ///
    /// Stable across reconnects of the same context: it is the canonical
    /// serialization, independent of the transport id.
    #[must_use]
    pub fn registration_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.role)?;
        for field in [self.window_id, self.tab_id, self.frame_id] {
            match field {
                Some(value) => write!(f, "{SEPARATOR}{value}")?,
                None => break,
            }
        }
        Ok(())
    }
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_identity(s).ok_or_else(|| Error::routing(s))
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Serializes an identity to its string token.
///
/// Fields after the first `None` are not written; callers keep the chain
/// gap-free.
#[must_use]
pub fn create_identity(
    role: &str,
    window_id: Option<u32>,
    tab_id: Option<u32>,
    frame_id: Option<u32>,
) -> String {
    Identity {
        role: role.to_owned(),
        window_id,
        tab_id,
        frame_id,
    }
    .to_string()
}

/// Parses an identity token.
///
/// Returns `None` when the role has no known prefix, a numeric field is not
/// a decimal `u32`, a present field follows an absent one, or there are more
/// than three numeric fields. Missing trailing fields are left `None`.
#[must_use]
pub fn parse_identity(s: &str) -> Option<Identity> {
    let mut parts = s.split(SEPARATOR);

    let role = parts.next()?;
    if role.is_empty() || !KNOWN_ROLE_PREFIXES.iter().any(|p| role.starts_with(p)) {
        return None;
    }

    let mut fields: [Option<u32>; 3] = [None; 3];
    let mut ended = false;
    for (index, part) in parts.enumerate() {
        if index >= fields.len() {
            return None;
        }
        if part.is_empty() {
            ended = true;
            continue;
        }
        if ended || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        fields[index] = Some(part.parse().ok()?);
    }

    let [window_id, tab_id, frame_id] = fields;
    Some(Identity {
        role: role.to_owned(),
        window_id,
        tab_id,
        frame_id,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_create_full_chain() {
        assert_eq!(
            create_identity("documentId", Some(7), Some(42), Some(0)),
            "documentId:7:42:0"
        );
    }

    #[test]
    fn test_create_stops_at_first_absent_field() {
        assert_eq!(create_identity("panel", Some(3), None, None), "panel:3");
        assert_eq!(create_identity("background", None, None, None), "background");
        assert_eq!(create_identity("panel", None, Some(9), None), "panel");
    }

    #[test]
    fn test_parse_full_chain() {
        let identity = parse_identity("documentId:7:42:0").expect("parse");
        assert_eq!(identity.role, "documentId");
        assert_eq!(identity.window_id, Some(7));
        assert_eq!(identity.tab_id, Some(42));
        assert_eq!(identity.frame_id, Some(0));
        assert_eq!(identity.tab_frame(), Some((42, 0)));
    }

    #[test]
    fn test_parse_missing_trailing_fields() {
        let identity = parse_identity("panel:3").expect("parse");
        assert_eq!(identity.window_id, Some(3));
        assert_eq!(identity.tab_id, None);
        assert_eq!(identity.frame_id, None);

        let identity = parse_identity("panel:3:").expect("trailing separator");
        assert_eq!(identity, Identity::panel(3));
    }

    #[test]
    fn test_parse_rejects_unknown_role() {
        assert!(parse_identity("").is_none());
        assert!(parse_identity("tab:1:2:3").is_none());
        assert!(parse_identity(":1:2").is_none());
    }

    #[test]
    fn test_parse_rejects_malformed_fields() {
        assert!(parse_identity("documentId:tab-42:7:0").is_none());
        assert!(parse_identity("documentId:-1").is_none());
        assert!(parse_identity("documentId:1:2:3:4").is_none());
        assert!(parse_identity("documentId::2").is_none());
        assert!(parse_identity("documentId:99999999999").is_none());
    }

    #[test]
    fn test_role_kinds() {
        assert_eq!(RoleKind::of("document-abc"), Some(RoleKind::Document));
        assert_eq!(RoleKind::of("background"), Some(RoleKind::Background));
        assert_eq!(RoleKind::of("panel"), Some(RoleKind::Panel));
        assert_eq!(RoleKind::of("remote"), Some(RoleKind::Remote));
        assert_eq!(RoleKind::of("other"), None);
    }

    #[test]
    fn test_is_panel_for() {
        let panel = Identity::panel(4);
        assert!(panel.is_panel());
        assert!(panel.is_panel_for(4));
        assert!(!panel.is_panel_for(5));
        assert!(!Identity::background().is_panel());
    }

    #[test]
    fn test_from_str_routing_error() {
        let err = "nope:1".parse::<Identity>().unwrap_err();
        assert!(err.is_routing_error());
        let ok: Identity = "remote".parse().expect("parse");
        assert_eq!(ok, Identity::new(REMOTE_ROLE));
    }

    #[test]
    fn test_registration_key_is_canonical() {
        let a = Identity::new("documentX").with_window(1).with_tab(2).with_frame(3);
        assert_eq!(a.registration_key(), "documentX:1:2:3");
    }

    fn role_strategy() -> impl Strategy<Value = String> {
        (
            prop::sample::select(KNOWN_ROLE_PREFIXES.to_vec()),
            "[A-Za-z0-9_-]{0,12}",
        )
            .prop_map(|(prefix, suffix)| format!("{prefix}{suffix}"))
    }

    fn chain_strategy() -> impl Strategy<Value = (Option<u32>, Option<u32>, Option<u32>)> {
        (0usize..=3, any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(len, w, t, f)| {
            (
                (len >= 1).then_some(w),
                (len >= 2).then_some(t),
                (len >= 3).then_some(f),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_identity_round_trip(role in role_strategy(), (w, t, f) in chain_strategy()) {
            let token = create_identity(&role, w, t, f);
            let parsed = parse_identity(&token).expect("well-formed identity parses");

            prop_assert_eq!(&parsed.role, &role);
            prop_assert_eq!(parsed.window_id, w);
            prop_assert_eq!(parsed.tab_id, t);
            prop_assert_eq!(parsed.frame_id, f);
            prop_assert_eq!(
                create_identity(&parsed.role, parsed.window_id, parsed.tab_id, parsed.frame_id),
                token
            );
        }
    }
}
