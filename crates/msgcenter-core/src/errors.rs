//! Error types for the message center
//!
//! This module contains the error types used throughout the message center,
//! including connection errors, message store errors, push registration errors
//! and the main MessageCenterError type that unifies them all.

use crate::types::{DeliveryId, TransactionId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised by the transport layer while connecting or exchanging packets
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Server unreachable at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("Connection closed: {reason}")]
    Closed { reason: String },
    #[error("Connection timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },
}

/// Errors raised by the persistent message store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Message with delivery id {delivery_id} already stored")]
    Duplicate { delivery_id: DeliveryId },
    #[error("Message not found: {reference}")]
    NotFound { reference: String },
    #[error("Message store failure: {reason}")]
    Backend { reason: String },
}

/// Errors raised by the platform push registrar
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("Push notifications unsupported on this device")]
    Unsupported,
    #[error("Platform registration failed: {reason}")]
    RegistrationFailed { reason: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Main error type for the message center
#[derive(Debug, thiserror::Error)]
pub enum MessageCenterError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Login rejected by server (status {status})")]
    LoginRejected { status: i32 },

    #[error("Job has been cancelled")]
    Cancelled,

    #[error("Job execution failed: {reason}")]
    JobFailed { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Push registration error: {0}")]
    Push(#[from] PushError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed: {channel}")]
    Channel { channel: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Transaction {tx_id} already has a registered handler")]
    DuplicateTransaction { tx_id: TransactionId },

    #[error("Request worker is not running")]
    NotRunning,
}

impl MessageCenterError {
    /// Create a job failure error
    pub fn job_failed(reason: impl Into<String>) -> Self {
        Self::JobFailed {
            reason: reason.into(),
        }
    }

    /// Create a channel error
    pub fn channel(channel: impl Into<String>) -> Self {
        Self::Channel {
            channel: channel.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether this error means the connection is gone and a reconnect is due
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Whether this error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error is a duplicate insert in the message store
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Store(StoreError::Duplicate { .. }))
    }
}

/// Result type for message center operations
pub type MessageCenterResult<T> = core::result::Result<T, MessageCenterError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
