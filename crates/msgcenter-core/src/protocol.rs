//! Protocol operations exchanged with the server
//!
//! Field-level structure of requests and responses. Byte encoding is the
//! transport's concern; the session only sees these values.

use serde::{Deserialize, Serialize};

use crate::message::IncomingMessage;
use crate::types::{DeliveryId, TransactionId, UserId};

/// Capability prefix announcing the push notification sender id
pub const PUSH_SENDER_CAPABILITY: &str = "google_gcm=";

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

/// Fields of a user info update; unset fields are left unchanged server side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoUpdate {
    pub status_message: Option<String>,
    pub flags: Option<u32>,
    /// Push registration id; an empty string clears it
    pub push_registration_id: Option<String>,
}

/// Payload of an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingContent {
    /// Inline content
    Inline(Vec<u8>),
    /// Reference to an attachment previously uploaded (the upload's file id)
    Attachment(String),
}

/// Requests the session sends to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolRequest {
    Login {
        auth_token: String,
    },
    ServerInfo,
    UserInfoUpdate(UserInfoUpdate),
    PresenceSubscribe {
        user_id: UserId,
        event_mask: u8,
    },
    SendMessage {
        recipient: UserId,
        mime: String,
        content: OutgoingContent,
        encrypt_key: Option<String>,
    },
    MailboxFetch,
    Received {
        ids: Vec<DeliveryId>,
    },
    UserLookup {
        user_ids: Vec<UserId>,
    },
    Upload {
        mime: String,
        content: Vec<u8>,
    },
}

impl ProtocolRequest {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::ServerInfo => "server-info",
            Self::UserInfoUpdate(_) => "user-info-update",
            Self::PresenceSubscribe { .. } => "presence-subscribe",
            Self::SendMessage { .. } => "send-message",
            Self::MailboxFetch => "mailbox-fetch",
            Self::Received { .. } => "received",
            Self::UserLookup { .. } => "user-lookup",
            Self::Upload { .. } => "upload",
        }
    }
}

// ----------------------------------------------------------------------------
// Responses
// ----------------------------------------------------------------------------

/// Outcome of a login request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginStatus {
    LoggedIn,
    Rejected(i32),
}

impl LoginStatus {
    pub const LOGGED_IN_CODE: i32 = 0;

    /// Map a raw server status code; anything but logged-in is a rejection
    pub fn from_code(code: i32) -> Self {
        if code == Self::LOGGED_IN_CODE {
            Self::LoggedIn
        } else {
            Self::Rejected(code)
        }
    }
}

/// Outcome of a user info update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    Success,
    Failure(i32),
}

impl UpdateStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// One entry of a user lookup response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEntry {
    pub user_id: UserId,
    pub status_message: Option<String>,
    pub last_seen: Option<u64>,
}

/// Responses correlated with a request by transaction id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolResponse {
    Login(LoginStatus),
    /// Legacy authentication response
    Authenticate {
        valid: bool,
    },
    ServerInfo {
        supports: Vec<String>,
    },
    UserInfoUpdate(UpdateStatus),
    MessageSent {
        delivery_id: DeliveryId,
    },
    Mailbox(Vec<IncomingMessage>),
    UserLookup(Vec<LookupEntry>),
}

impl ProtocolResponse {
    /// Push sender id announced in a capability list, if any
    pub fn push_sender_id(&self) -> Option<&str> {
        match self {
            Self::ServerInfo { supports } => supports
                .iter()
                .filter_map(|entry| entry.strip_prefix(PUSH_SENDER_CAPABILITY))
                .last(),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Inbound Frames
// ----------------------------------------------------------------------------

/// Everything the connection delivers to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Response to a request we sent
    Response {
        tx_id: TransactionId,
        response: ProtocolResponse,
    },
    /// A single pushed message
    Message(IncomingMessage),
    /// An ordered batch of messages
    Mailbox(Vec<IncomingMessage>),
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
