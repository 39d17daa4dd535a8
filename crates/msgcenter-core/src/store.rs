//! Message store contract
//!
//! The persistent message store is owned by an external collaborator; the
//! session only inserts inbound messages (unique by delivery id), updates
//! statuses, and scans outbound messages that still need sending.
//! `MemoryMessageStore` is an in-process implementation of the contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::errors::StoreError;
use crate::types::{DeliveryId, LocalMessageId, Timestamp, UserId};

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

/// Delivery status of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Not yet handed to the server
    Sending,
    /// Accepted by the server
    Sent,
    /// Recipient confirmed delivery
    Received,
    /// Server reported the message undeliverable
    NotDelivered,
    /// Local failure while sending
    Error,
    /// Inbound message
    Incoming,
}

impl MessageStatus {
    /// Outbound messages in this status are resent after authentication
    pub fn needs_resend(&self) -> bool {
        !matches!(self, Self::Sent | Self::Received | Self::NotDelivered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Row written for an inbound content message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub real_id: DeliveryId,
    pub peer: UserId,
    pub mime: String,
    pub content: Vec<u8>,
    pub encrypted: bool,
    /// Placeholder for the encryption key of messages that arrived encrypted
    pub encrypt_key: Option<String>,
    pub fetch_url: Option<String>,
    pub local_path: Option<PathBuf>,
    pub preview_path: Option<PathBuf>,
    pub unread: bool,
    pub direction: Direction,
    pub timestamp: Timestamp,
    pub server_timestamp: Timestamp,
    pub length: u64,
}

/// Outbound message as returned by the resend scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingRecord {
    pub id: LocalMessageId,
    pub peer: UserId,
    pub mime: String,
    pub content: Vec<u8>,
    /// Attachment file to upload instead of inline content
    pub local_path: Option<PathBuf>,
    pub encrypt_key: Option<String>,
    pub status: MessageStatus,
}

// ----------------------------------------------------------------------------
// Message Store
// ----------------------------------------------------------------------------

/// Query/update contract of the persistent message store
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert an inbound message; `StoreError::Duplicate` if its delivery id exists
    async fn insert_incoming(&self, message: StoredMessage) -> Result<LocalMessageId, StoreError>;

    /// Update status and timestamp of the outbound message with this delivery id.
    /// Returns the number of rows changed.
    async fn update_status_by_delivery_id(
        &self,
        delivery_id: &DeliveryId,
        status: MessageStatus,
        timestamp: Timestamp,
    ) -> Result<usize, StoreError>;

    /// Update status and timestamp of an outbound message by row id
    async fn update_outgoing_status(
        &self,
        id: LocalMessageId,
        status: MessageStatus,
        timestamp: Timestamp,
    ) -> Result<(), StoreError>;

    /// Record the delivery id the server assigned to an outbound message
    async fn set_delivery_id(
        &self,
        id: LocalMessageId,
        delivery_id: DeliveryId,
    ) -> Result<(), StoreError>;

    /// Outbound messages needing a resend, in ascending store order
    async fn pending_outgoing(&self) -> Result<Vec<OutgoingRecord>, StoreError>;
}

// ----------------------------------------------------------------------------
// In-Memory Store
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct OutgoingRow {
    record: OutgoingRecord,
    delivery_id: Option<DeliveryId>,
    timestamp: Timestamp,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    incoming: BTreeMap<LocalMessageId, StoredMessage>,
    incoming_by_delivery: HashMap<DeliveryId, LocalMessageId>,
    outgoing: BTreeMap<LocalMessageId, OutgoingRow>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> LocalMessageId {
        self.next_id += 1;
        LocalMessageId(self.next_id)
    }
}

/// Message store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    state: Mutex<MemoryState>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an outbound message, as the compose layer would
    pub fn add_outgoing(
        &self,
        peer: impl Into<UserId>,
        mime: impl Into<String>,
        content: Vec<u8>,
        status: MessageStatus,
    ) -> LocalMessageId {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.outgoing.insert(
            id,
            OutgoingRow {
                record: OutgoingRecord {
                    id,
                    peer: peer.into(),
                    mime: mime.into(),
                    content,
                    local_path: None,
                    encrypt_key: None,
                    status,
                },
                delivery_id: None,
                timestamp: Timestamp::now(),
            },
        );
        id
    }

    /// Add an outbound attachment message
    pub fn add_outgoing_attachment(
        &self,
        peer: impl Into<UserId>,
        mime: impl Into<String>,
        path: PathBuf,
        status: MessageStatus,
    ) -> LocalMessageId {
        let id = self.add_outgoing(peer, mime, Vec::new(), status);
        if let Some(row) = self.lock().outgoing.get_mut(&id) {
            row.record.local_path = Some(path);
        }
        id
    }

    pub fn incoming(&self) -> Vec<StoredMessage> {
        self.lock().incoming.values().cloned().collect()
    }

    pub fn incoming_by_delivery_id(&self, delivery_id: &DeliveryId) -> Option<StoredMessage> {
        let state = self.lock();
        state
            .incoming_by_delivery
            .get(delivery_id)
            .and_then(|id| state.incoming.get(id))
            .cloned()
    }

    pub fn outgoing(&self, id: LocalMessageId) -> Option<OutgoingRecord> {
        self.lock().outgoing.get(&id).map(|row| row.record.clone())
    }

    pub fn outgoing_timestamp(&self, id: LocalMessageId) -> Option<Timestamp> {
        self.lock().outgoing.get(&id).map(|row| row.timestamp)
    }

    pub fn outgoing_delivery_id(&self, id: LocalMessageId) -> Option<DeliveryId> {
        self.lock()
            .outgoing
            .get(&id)
            .and_then(|row| row.delivery_id.clone())
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert_incoming(&self, message: StoredMessage) -> Result<LocalMessageId, StoreError> {
        let mut state = self.lock();
        if state.incoming_by_delivery.contains_key(&message.real_id) {
            return Err(StoreError::Duplicate {
                delivery_id: message.real_id,
            });
        }
        let id = state.allocate_id();
        state.incoming_by_delivery.insert(message.real_id.clone(), id);
        state.incoming.insert(id, message);
        Ok(id)
    }

    async fn update_status_by_delivery_id(
        &self,
        delivery_id: &DeliveryId,
        status: MessageStatus,
        timestamp: Timestamp,
    ) -> Result<usize, StoreError> {
        let mut state = self.lock();
        let mut changed = 0;
        for row in state.outgoing.values_mut() {
            if row.delivery_id.as_ref() == Some(delivery_id) {
                row.record.status = status;
                row.timestamp = timestamp;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn update_outgoing_status(
        &self,
        id: LocalMessageId,
        status: MessageStatus,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let row = state.outgoing.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            reference: id.to_string(),
        })?;
        row.record.status = status;
        row.timestamp = timestamp;
        Ok(())
    }

    async fn set_delivery_id(
        &self,
        id: LocalMessageId,
        delivery_id: DeliveryId,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let row = state.outgoing.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            reference: id.to_string(),
        })?;
        row.delivery_id = Some(delivery_id);
        Ok(())
    }

    async fn pending_outgoing(&self) -> Result<Vec<OutgoingRecord>, StoreError> {
        Ok(self
            .lock()
            .outgoing
            .values()
            .filter(|row| row.record.status.needs_resend())
            .map(|row| row.record.clone())
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
