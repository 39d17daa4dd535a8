//! Inbound message model
//!
//! Messages delivered by the connection, either one at a time or as a mailbox
//! batch. Each message is one of three kinds: a presence event, a delivery
//! receipt for one of our outbound messages, or content to be stored.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::types::{DeliveryId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Presence
// ----------------------------------------------------------------------------

/// Presence change announced for a user we subscribed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceData {
    /// Server event code (online, offline, status changed, ...)
    pub event: i32,
    /// Status text, encrypted with the sender's key material
    pub status_message: Option<String>,
}

// ----------------------------------------------------------------------------
// Receipts
// ----------------------------------------------------------------------------

/// Status code carried by a receipt entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptStatus(pub i32);

impl ReceiptStatus {
    pub const SUCCESS: Self = Self(0);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

/// One delivery report inside a receipt message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEntry {
    /// Delivery id of the outbound message being reported on
    pub message_id: DeliveryId,
    pub status: ReceiptStatus,
    /// When the recipient got the message, if the server reported it
    pub timestamp: Option<Timestamp>,
}

// ----------------------------------------------------------------------------
// Content
// ----------------------------------------------------------------------------

/// Structured content types that need special storage treatment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    Text,
    Image,
    /// Contact card, materialized to durable media storage
    VCard,
    Other,
}

impl ContentKind {
    /// Derive the content kind from a MIME type
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("text/x-vcard") || mime.starts_with("text/vcard") {
            Self::VCard
        } else if mime.starts_with("text/") {
            Self::Text
        } else if mime.starts_with("image/") {
            Self::Image
        } else {
            Self::Other
        }
    }

    /// Whether content of this kind must be written to local storage even
    /// when it was delivered inline
    pub fn requires_materialization(&self) -> bool {
        matches!(self, Self::VCard)
    }
}

/// The three classes of inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Presence(PresenceData),
    Receipt(Vec<ReceiptEntry>),
    Content(ContentKind),
}

// ----------------------------------------------------------------------------
// Incoming Message
// ----------------------------------------------------------------------------

/// A message received from the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Message id assigned by the sender's client
    pub id: String,
    /// Delivery id used for acknowledgements and receipts
    pub real_id: DeliveryId,
    pub sender: UserId,
    pub kind: MessageKind,
    pub mime: String,
    /// Binary payload (a preview when `fetch_url` is set)
    pub content: Vec<u8>,
    /// Human-readable variant of the content
    pub text_content: Option<String>,
    /// Client timestamp of the message
    pub timestamp: Timestamp,
    /// Raw timestamp set by the server
    pub server_timestamp: Timestamp,
    /// URL of deferred binary content
    pub fetch_url: Option<String>,
    /// Whether the content is still encrypted
    pub encrypted: bool,
    /// Whether the content was encrypted on the wire
    pub was_encrypted: bool,
    /// Whether the server expects an acknowledgement
    pub need_ack: bool,
    /// Full size of the content, including deferred content
    pub length: u64,
    /// Set by the processor when content was written to durable media storage
    pub local_path: Option<PathBuf>,
    /// Set by the processor when a preview was written to the media cache
    pub preview_path: Option<PathBuf>,
}

impl IncomingMessage {
    /// Create a content message with sensible defaults
    pub fn content(
        id: impl Into<String>,
        real_id: impl Into<DeliveryId>,
        sender: impl Into<UserId>,
        mime: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        let mime = mime.into();
        let length = content.len() as u64;
        Self {
            id: id.into(),
            real_id: real_id.into(),
            sender: sender.into(),
            kind: MessageKind::Content(ContentKind::from_mime(&mime)),
            mime,
            content,
            text_content: None,
            timestamp: Timestamp::now(),
            server_timestamp: Timestamp::now(),
            fetch_url: None,
            encrypted: false,
            was_encrypted: false,
            need_ack: true,
            length,
            local_path: None,
            preview_path: None,
        }
    }

    /// Create a receipt message
    pub fn receipt(
        id: impl Into<String>,
        real_id: impl Into<DeliveryId>,
        sender: impl Into<UserId>,
        entries: Vec<ReceiptEntry>,
    ) -> Self {
        let mut message = Self::content(id, real_id, sender, "internal/receipt", Vec::new());
        message.kind = MessageKind::Receipt(entries);
        message
    }

    /// Create a presence message
    pub fn presence(sender: impl Into<UserId>, data: PresenceData) -> Self {
        let sender = sender.into();
        let mut message = Self::content(
            String::new(),
            DeliveryId::new(String::new()),
            sender,
            "internal/presence",
            Vec::new(),
        );
        message.kind = MessageKind::Presence(data);
        message.need_ack = false;
        message
    }

    /// Delivery id to acknowledge, if the server asked for one
    pub fn ack_id(&self) -> Option<&DeliveryId> {
        if self.need_ack {
            Some(&self.real_id)
        } else {
            None
        }
    }

    /// Text variant of the content, falling back to a lossy decode of the payload
    pub fn text(&self) -> String {
        match &self.text_content {
            Some(text) => text.clone(),
            None => String::from_utf8_lossy(&self.content).into_owned(),
        }
    }

    /// Deterministic filename for materializing this message's media
    ///
    /// Derived from the message id and sender so re-processing a duplicate
    /// lands on the same file.
    pub fn media_filename(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sender.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.id.as_bytes());
        let digest = hex::encode(hasher.finalize());

        let prefix = match &self.kind {
            MessageKind::Content(ContentKind::Image) => "image",
            MessageKind::Content(ContentKind::VCard) => "vcard",
            _ => "media",
        };
        format!("{}-{}.{}", prefix, &digest[..16], extension_for_mime(&self.mime))
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime.to_ascii_lowercase().as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "text/x-vcard" | "text/vcard" => "vcf",
        "text/plain" => "txt",
        _ => "bin",
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_kind_from_mime() {
        assert_eq!(ContentKind::from_mime("text/plain"), ContentKind::Text);
        assert_eq!(ContentKind::from_mime("text/x-vcard"), ContentKind::VCard);
        assert_eq!(ContentKind::from_mime("image/PNG"), ContentKind::Image);
        assert_eq!(ContentKind::from_mime("audio/ogg"), ContentKind::Other);
        assert!(ContentKind::VCard.requires_materialization());
        assert!(!ContentKind::Image.requires_materialization());
    }

    #[test]
    fn test_media_filename_is_deterministic() {
        let a = IncomingMessage::content("id-1", "m1", "alice", "image/png", vec![1, 2]);
        let mut b = a.clone();
        b.content = vec![9, 9, 9];
        assert_eq!(a.media_filename(), b.media_filename());
        assert!(a.media_filename().starts_with("image-"));
        assert!(a.media_filename().ends_with(".png"));

        let c = IncomingMessage::content("id-2", "m2", "alice", "image/png", vec![1, 2]);
        assert_ne!(a.media_filename(), c.media_filename());
    }

    #[test]
    fn test_ack_id_only_when_requested() {
        let mut message = IncomingMessage::content("id", "m1", "bob", "text/plain", b"hi".to_vec());
        assert_eq!(message.ack_id(), Some(&DeliveryId::new("m1")));
        message.need_ack = false;
        assert_eq!(message.ack_id(), None);

        let presence = IncomingMessage::presence(
            "bob",
            PresenceData {
                event: 1,
                status_message: None,
            },
        );
        assert_eq!(presence.ack_id(), None);
    }
}
