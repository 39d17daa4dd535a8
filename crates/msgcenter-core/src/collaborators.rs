//! External collaborators
//!
//! Boundaries the session talks to but does not own: the contact directory,
//! local media storage, the platform push registrar, user preferences and
//! account credentials.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

use crate::errors::{MessageCenterResult, PushError};
use crate::types::UserId;

/// Known users and their key material
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Record that the user is registered on the server
    async fn mark_registered(&self, user_id: &UserId) -> MessageCenterResult<()>;

    /// Decrypt a status message with the user's key material.
    /// `None` when no key is known or decryption fails.
    fn decrypt_status(&self, user_id: &UserId, status: &str) -> Option<String>;
}

/// Local storage for previews, materialized attachments and outgoing files
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Write a preview into the internal media cache
    async fn write_preview(&self, filename: &str, content: &[u8]) -> io::Result<PathBuf>;

    /// Write content to durable media storage
    async fn write_media(&self, filename: &str, content: &[u8]) -> io::Result<PathBuf>;

    /// Read an outgoing attachment
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// Platform push notification service
///
/// Registration results arrive asynchronously and are fed back to the
/// session as push registration events.
#[async_trait]
pub trait PushRegistrar: Send + Sync {
    /// Cached platform registration id, if any
    fn registration_id(&self) -> Option<String>;

    /// Request a registration under the given sender id
    async fn register(&self, sender_id: &str) -> Result<(), PushError>;

    /// Request removal of the current registration
    async fn unregister(&self) -> Result<(), PushError>;

    /// Mirror of whether the server acknowledged the current registration id
    fn set_registered_on_server(&self, registered: bool);
}

/// User preferences consumed by the session
pub trait Preferences: Send + Sync {
    /// Current status message, if the user set one
    fn status_message(&self) -> Option<String>;

    fn push_enabled(&self) -> bool;

    /// Push sender id stored by a previous session
    fn push_sender_id(&self) -> Option<String>;

    fn set_push_sender_id(&self, sender_id: &str);
}

/// Account credentials
pub trait Credentials: Send + Sync {
    /// Authentication token; `None` when no account is configured
    fn auth_token(&self) -> Option<String>;
}

/// Credentials backed by a fixed token
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(Option<String>);

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// No account configured
    pub fn none() -> Self {
        Self(None)
    }
}

impl Credentials for StaticCredentials {
    fn auth_token(&self) -> Option<String> {
        self.0.clone()
    }
}
