//! Wire frames exchanged by peers.
//!
//! The Protocol layer carries frames as opaque byte buffers; their structure
//! belongs to the peer layer and is defined here.
//!
//! # Format
//!
//! JSON objects tagged by `type`:
//!
//! | Type | Direction | Purpose |
//! |------|-----------|---------|
//! | `hello` | Either, first on a port | Identity handshake |
//! | `request` | Caller → channel owner | Invoke a command |
//! | `response` | Channel owner → caller | Command result |
//! | `error` | Channel owner → caller | Command failure |
//! | `listen` | Caller → channel owner | Subscribe to an event |
//! | `unlisten` | Caller → channel owner | Cancel a subscription |
//! | `event` | Channel owner → caller | One event payload |
//! | `eventEnd` | Channel owner → caller | Subscription ended remotely |
//!
//! ```json
//! { "type": "request", "id": 4, "channel": "quotes", "command": "latest", "arg": { "symbol": "SPY" } }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::RequestId;

// ============================================================================
// Frame
// ============================================================================

/// One peer-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Identity handshake, always the first frame on a (re)connected port.
    Hello {
        /// Identity token of the sending context.
        identity: String,
    },

    /// Command invocation.
    Request {
        /// Correlation id.
        id: RequestId,
        /// Target channel.
        channel: String,
        /// Command name.
        command: String,
        /// Argument, `null` if none.
        #[serde(default)]
        arg: Value,
    },

    /// Successful command result.
    Response {
        /// Matches the request `id`.
        id: RequestId,
        /// Result value.
        #[serde(default)]
        data: Value,
    },

    /// Failed command.
    Error {
        /// Matches the request `id`.
        id: RequestId,
        /// Error message from the handler.
        message: String,
    },

    /// Event subscription.
    Listen {
        /// Subscription id, chosen by the subscriber.
        id: RequestId,
        /// Target channel.
        channel: String,
        /// Event name.
        event: String,
        /// Argument, `null` if none.
        #[serde(default)]
        arg: Value,
    },

    /// Subscription cancellation.
    Unlisten {
        /// Subscription id.
        id: RequestId,
    },

    /// Event payload for a subscription.
    Event {
        /// Subscription id.
        id: RequestId,
        /// Payload.
        data: Value,
    },

    /// The channel owner ended a subscription.
    EventEnd {
        /// Subscription id.
        id: RequestId,
        /// Failure reason, if it ended because of an error.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Frame {
    /// Encodes the frame for [`Protocol::send`](super::Protocol::send).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if a payload cannot be
    /// serialized.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a received buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) for malformed input.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buffer)?)
    }

    /// Frame type name, for logs and traces.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::Listen { .. } => "listen",
            Self::Unlisten { .. } => "unlisten",
            Self::Event { .. } => "event",
            Self::EventEnd { .. } => "eventEnd",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
