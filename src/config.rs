//! Bridge configuration.
//!
//! [`BridgeConfig`] holds every tunable of the channel layer. Build one with
//! [`BridgeConfig::builder()`] or deserialize it from JSON; missing fields
//! take their defaults.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use context_bridge::BridgeConfig;
//!
//! let config = BridgeConfig::builder()
//!     .call_timeout(Duration::from_secs(5))
//!     .probe_timeout(Duration::from_millis(250))
//!     .max_reconnect_attempts(0)
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.max_pending_calls, 100);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for an outbound channel call.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on outstanding calls per peer.
const DEFAULT_MAX_PENDING_CALLS: usize = 100;

/// Default wait for a new port's identity handshake.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on the panel liveness probe.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of consecutive failed reconnect attempts before giving up.
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default pause between failed reconnect attempts.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// ReconnectPolicy
// ============================================================================

/// How a client re-establishes a dropped port.
///
/// The first attempt is always immediate; `retry_delay` only spaces out
/// attempts after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the client parks in
    /// `Disconnected` and waits for a reconnect hint. `0` retries forever.
    pub max_attempts: u32,
    /// Pause between failed attempts.
    #[serde(deserialize_with = "millis")]
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            retry_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Returns `true` if another attempt is allowed after `failures`
    /// consecutive failures.
    #[inline]
    #[must_use]
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts == 0 || failures < self.max_attempts
    }
}

// ============================================================================
// BridgeConfig
// ============================================================================

/// Channel layer settings.
///
/// Durations deserialize from integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Outbound calls reject after this long without a response.
    #[serde(deserialize_with = "millis")]
    pub call_timeout: Duration,

    /// Outstanding calls allowed per peer.
    pub max_pending_calls: usize,

    /// A new port that has not sent its identity by then is dropped.
    #[serde(deserialize_with = "millis")]
    pub handshake_timeout: Duration,

    /// Bound on the panel liveness ping during reconciliation.
    #[serde(deserialize_with = "millis")]
    pub probe_timeout: Duration,

    /// Client reconnection behavior.
    pub reconnect: ReconnectPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BridgeConfig {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::new()
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if a value is out of range
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero timeouts or a zero pending limit.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(Error::config("call_timeout must be greater than zero"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::config("handshake_timeout must be greater than zero"));
        }
        if self.probe_timeout.is_zero() {
            return Err(Error::config("probe_timeout must be greater than zero"));
        }
        if self.max_pending_calls == 0 {
            return Err(Error::config("max_pending_calls must be greater than zero"));
        }
        Ok(())
    }
}

/// Deserializes a [`Duration`] from integer milliseconds.
fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

// ============================================================================
// BridgeConfigBuilder
// ============================================================================

/// Fluent builder for [`BridgeConfig`].
#[derive(Debug, Default, Clone)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Creates a builder seeded with defaults.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the outbound call timeout.
    #[inline]
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Sets the per-peer outstanding call limit.
    #[inline]
    #[must_use]
    pub fn max_pending_calls(mut self, max: usize) -> Self {
        self.config.max_pending_calls = max;
        self
    }

    /// Sets the identity handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Sets the panel liveness probe timeout.
    #[inline]
    #[must_use]
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    /// Sets the reconnect attempt limit (`0` = unbounded).
    #[inline]
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// Sets the pause between failed reconnect attempts.
    #[inline]
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect.retry_delay = delay;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value is out of range.
    pub fn build(self) -> Result<BridgeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ============================================================================
// Tests
// ============================================================================
