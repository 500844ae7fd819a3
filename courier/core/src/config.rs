//! Transport Configuration
//!
//! Tunables for conduit setup and the send pipeline. All limits have
//! defaults suitable for typical use; `from_env` overrides them from
//! `COURIER_*` environment variables.

use serde::{Deserialize, Serialize};

/// Default multi-use receive region size per conduit.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Default remaining-space threshold below which the region is released
/// for reposting.
pub const DEFAULT_MIN_MULTI_RECV: usize = 2048;

/// Default cap on busy-retries for one submission.
pub const DEFAULT_SUBMIT_RETRY_LIMIT: u32 = 64;

/// Transport configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Size in bytes of each conduit's multi-use receive region.
    pub recv_buffer_size: usize,

    /// Remaining-space threshold (bytes) below which a receive region is
    /// considered exhausted and released for reposting.
    pub min_multi_recv: usize,

    /// Maximum number of times one submission is retried while the
    /// provider reports transient local exhaustion.
    pub submit_retry_limit: u32,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            min_multi_recv: DEFAULT_MIN_MULTI_RECV,
            submit_retry_limit: DEFAULT_SUBMIT_RETRY_LIMIT,
        }
    }
}

impl CourierConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive region size.
    #[must_use]
    pub fn with_recv_buffer_size(mut self, bytes: usize) -> Self {
        self.recv_buffer_size = bytes;
        self
    }

    /// Set the exhaustion threshold.
    #[must_use]
    pub fn with_min_multi_recv(mut self, bytes: usize) -> Self {
        self.min_multi_recv = bytes;
        self
    }

    /// Set the busy-retry cap.
    #[must_use]
    pub fn with_submit_retry_limit(mut self, limit: u32) -> Self {
        self.submit_retry_limit = limit;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `COURIER_RECV_BUFFER_SIZE`: receive region size in bytes
    /// - `COURIER_MIN_MULTI_RECV`: exhaustion threshold in bytes
    /// - `COURIER_SUBMIT_RETRY_LIMIT`: busy-retry cap
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }
        Self {
            recv_buffer_size: parse("COURIER_RECV_BUFFER_SIZE")
                .unwrap_or(DEFAULT_RECV_BUFFER_SIZE),
            min_multi_recv: parse("COURIER_MIN_MULTI_RECV").unwrap_or(DEFAULT_MIN_MULTI_RECV),
            submit_retry_limit: parse("COURIER_SUBMIT_RETRY_LIMIT")
                .unwrap_or(DEFAULT_SUBMIT_RETRY_LIMIT),
        }
    }

    /// Clamp inconsistent values into a usable shape, warning about each
    /// adjustment.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.recv_buffer_size == 0 {
            tracing::warn!("recv_buffer_size of 0 raised to the default");
            self.recv_buffer_size = DEFAULT_RECV_BUFFER_SIZE;
        }
        if self.min_multi_recv >= self.recv_buffer_size {
            let clamped = self.recv_buffer_size / 4;
            tracing::warn!(
                min_multi_recv = self.min_multi_recv,
                recv_buffer_size = self.recv_buffer_size,
                clamped,
                "min_multi_recv must be below recv_buffer_size; clamped"
            );
            self.min_multi_recv = clamped;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CourierConfig::default();
        assert_eq!(config.recv_buffer_size, DEFAULT_RECV_BUFFER_SIZE);
        assert_eq!(config.min_multi_recv, DEFAULT_MIN_MULTI_RECV);
        assert_eq!(config.submit_retry_limit, DEFAULT_SUBMIT_RETRY_LIMIT);
    }

    #[test]
    fn test_builders() {
        let config = CourierConfig::new()
            .with_recv_buffer_size(128)
            .with_min_multi_recv(16)
            .with_submit_retry_limit(3);
        assert_eq!(config.recv_buffer_size, 128);
        assert_eq!(config.min_multi_recv, 16);
        assert_eq!(config.submit_retry_limit, 3);
    }

    #[test]
    fn test_sanitized_clamps_threshold() {
        let config = CourierConfig::new()
            .with_recv_buffer_size(100)
            .with_min_multi_recv(200)
            .sanitized();
        assert_eq!(config.min_multi_recv, 25);
    }

    #[test]
    fn test_sanitized_rejects_zero_region() {
        let config = CourierConfig::new().with_recv_buffer_size(0).sanitized();
        assert_eq!(config.recv_buffer_size, DEFAULT_RECV_BUFFER_SIZE);
    }
}
