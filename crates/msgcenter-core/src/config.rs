//! Session Configuration
//!
//! Timing and sizing knobs for the message center session: idle shutdown,
//! acknowledgement batching, login and reconnect policy.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{MessageCenterError, MessageCenterResult};

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for the session manager and its request worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Grace period before an idle, unreferenced worker shuts itself down
    pub idle_grace: Duration,
    /// How long a single-message acknowledgement waits for others to piggyback
    pub ack_delay: Duration,
    /// Maximum time to wait for the login response
    pub login_timeout: Duration,
    /// Consecutive failed reconnects before the worker terminates
    pub max_reconnect_attempts: u32,
    /// Initial delay between reconnect attempts (doubles on each failure)
    pub reconnect_backoff: Duration,
    /// Upper bound for the reconnect delay
    pub max_reconnect_backoff: Duration,
    /// Buffer size of the session event channel
    pub event_buffer_size: usize,
    /// Restart the worker against the last endpoint when work is submitted while it is down
    pub auto_start: bool,
    /// Bytes sent between progress reports during uploads
    pub upload_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(60),
            ack_delay: Duration::from_millis(500),
            login_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(2),
            max_reconnect_backoff: Duration::from_secs(60),
            event_buffer_size: 256,
            auto_start: true,
            upload_chunk_size: 8 * 1024,
        }
    }
}

impl SessionConfig {
    /// Create configuration optimized for testing (short timers, no auto start)
    pub fn testing() -> Self {
        Self {
            idle_grace: Duration::from_millis(200),
            ack_delay: Duration::from_millis(50),
            login_timeout: Duration::from_secs(1),
            max_reconnect_attempts: 2,
            reconnect_backoff: Duration::from_millis(10),
            max_reconnect_backoff: Duration::from_millis(40),
            event_buffer_size: 1024,
            auto_start: false,
            upload_chunk_size: 4,
        }
    }

    /// Delay before the given reconnect attempt (1-based)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.reconnect_backoff
            .saturating_mul(factor)
            .min(self.max_reconnect_backoff)
    }

    /// Validate the configuration
    pub fn validate(&self) -> MessageCenterResult<()> {
        if self.event_buffer_size == 0 {
            return Err(MessageCenterError::configuration(
                "event_buffer_size must be greater than zero",
            ));
        }
        if self.upload_chunk_size == 0 {
            return Err(MessageCenterError::configuration(
                "upload_chunk_size must be greater than zero",
            ));
        }
        if self.login_timeout.is_zero() {
            return Err(MessageCenterError::configuration(
                "login_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SessionConfig::default();
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(40), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            event_buffer_size: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = SessionConfig::testing();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
