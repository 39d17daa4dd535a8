//! Incoming Message Processor
//!
//! Runs every inbound message through a single pipeline (presence, receipt
//! or content), persists content at most once, reconciles receipts with the
//! outbound messages they report on, and decides when delivery
//! acknowledgements are submitted.

use msgcenter_core::{
    ContactDirectory, ContentKind, DeliveryId, Direction, IncomingMessage, MediaStorage,
    MessageKind, MessageStatus, MessageStore, PresenceData, ReceiptEntry, SessionEvent,
    SessionEventSender, StoreError, StoredMessage, Timestamp, UserId,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::jobs::AckJob;
use crate::submit::JobSink;

/// Inbound message pipeline
pub struct IncomingProcessor {
    store: Arc<dyn MessageStore>,
    contacts: Arc<dyn ContactDirectory>,
    media: Arc<dyn MediaStorage>,
    sink: Arc<dyn JobSink>,
    events: SessionEventSender,
    ack_delay: Duration,
    /// Open acknowledgement for messages received one at a time
    pending_ack: Mutex<Option<Arc<AckJob>>>,
    paused: RwLock<Option<UserId>>,
}

impl IncomingProcessor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        contacts: Arc<dyn ContactDirectory>,
        media: Arc<dyn MediaStorage>,
        sink: Arc<dyn JobSink>,
        events: SessionEventSender,
        ack_delay: Duration,
    ) -> Self {
        Self {
            store,
            contacts,
            media,
            sink,
            events,
            ack_delay,
            pending_ack: Mutex::new(None),
            paused: RwLock::new(None),
        }
    }

    fn pending_ack(&self) -> MutexGuard<'_, Option<Arc<AckJob>>> {
        self.pending_ack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process an ordered batch, acknowledging it with a single job
    ///
    /// The acknowledgement is submitted after the whole batch went through
    /// the pipeline. Only the last message may raise a notification.
    pub async fn mailbox(&self, messages: Vec<IncomingMessage>) -> Option<Arc<AckJob>> {
        let ack = AckJob::new();
        let last = messages.len().saturating_sub(1);
        for (index, message) in messages.into_iter().enumerate() {
            if let Some(delivery_id) = self.process(message, index == last).await {
                ack.merge(delivery_id);
            }
        }

        if ack.is_empty() {
            return None;
        }
        debug!(count = ack.len(), "acknowledging mailbox");
        let ack = Arc::new(ack);
        self.sink.submit(ack.clone(), Duration::ZERO);
        Some(ack)
    }

    /// Process one message, deferring its acknowledgement so others can join it
    pub async fn incoming(&self, message: IncomingMessage) -> Option<DeliveryId> {
        let delivery_id = self.process(message, true).await?;
        self.acknowledge(delivery_id.clone());
        Some(delivery_id)
    }

    fn acknowledge(&self, delivery_id: DeliveryId) {
        let mut pending = self.pending_ack();
        if let Some(job) = pending.as_ref() {
            if job.merge(delivery_id.clone()) {
                return;
            }
        }
        let job = Arc::new(AckJob::with_id(delivery_id));
        *pending = Some(job.clone());
        drop(pending);
        self.sink.submit(job, self.ack_delay);
    }

    /// Forget the open acknowledgement; called for every new connection
    pub fn reset(&self) {
        *self.pending_ack() = None;
    }

    /// Suppress notifications for messages from this user
    pub fn set_paused_conversation(&self, user_id: Option<UserId>) {
        *self.paused.write().unwrap_or_else(PoisonError::into_inner) = user_id;
    }

    fn is_paused(&self, sender: &UserId) -> bool {
        self.paused
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|paused| paused.matches(sender))
    }

    /// Run the single-message pipeline
    ///
    /// Returns the delivery id to acknowledge if the message asked for one.
    pub async fn process(&self, mut message: IncomingMessage, notify: bool) -> Option<DeliveryId> {
        let ack_id = message.ack_id().cloned();
        let sender = message.sender.clone();

        match message.kind.clone() {
            MessageKind::Presence(data) => self.presence(&sender, data),
            MessageKind::Receipt(entries) => self.receipt(&entries, message.server_timestamp).await,
            MessageKind::Content(kind) => {
                self.materialize(&mut message, kind).await;
                self.persist(message).await;
            }
        }

        let contacts = self.contacts.clone();
        let contact = sender.clone();
        tokio::spawn(async move {
            if let Err(err) = contacts.mark_registered(&contact).await {
                debug!(user_id = %contact, error = %err, "mark registered failed");
            }
        });

        if notify && !self.is_paused(&sender) {
            self.emit(SessionEvent::MessageReceived {
                sender,
                delivery_id: ack_id.clone(),
            });
        }
        ack_id
    }

    fn presence(&self, sender: &UserId, data: PresenceData) {
        let status = data
            .status_message
            .filter(|status| !status.is_empty())
            .map(|status| self.contacts.decrypt_status(sender, &status).unwrap_or(status));
        self.emit(SessionEvent::UserPresence {
            user_id: sender.clone(),
            event: data.event,
            status,
        });
    }

    async fn receipt(&self, entries: &[ReceiptEntry], fallback: Timestamp) {
        for entry in entries {
            let status = if entry.status.is_success() {
                MessageStatus::Received
            } else {
                MessageStatus::NotDelivered
            };
            let timestamp = entry.timestamp.unwrap_or(fallback);
            match self
                .store
                .update_status_by_delivery_id(&entry.message_id, status, timestamp)
                .await
            {
                Ok(0) => debug!(delivery_id = %entry.message_id, "receipt for unknown message"),
                Ok(_) => debug!(delivery_id = %entry.message_id, ?status, "receipt applied"),
                Err(err) => warn!(delivery_id = %entry.message_id, error = %err, "receipt update failed"),
            }
        }
    }

    async fn materialize(&self, message: &mut IncomingMessage, kind: ContentKind) {
        if message.fetch_url.is_some() {
            // delivered content is only a preview of the deferred payload
            if kind == ContentKind::Image {
                match self
                    .media
                    .write_preview(&message.media_filename(), &message.content)
                    .await
                {
                    Ok(path) => message.preview_path = Some(path),
                    Err(err) => error!(error = %err, "unable to write preview to media storage"),
                }
            }
            message.content = message.text().into_bytes();
        } else if kind.requires_materialization() {
            match self
                .media
                .write_media(&message.media_filename(), &message.content)
                .await
            {
                Ok(path) => message.local_path = Some(path),
                Err(err) => error!(error = %err, "unable to write to media storage"),
            }
            message.content = message.text().into_bytes();
        }
    }

    async fn persist(&self, message: IncomingMessage) {
        let record = StoredMessage {
            message_id: message.id,
            real_id: message.real_id,
            peer: message.sender,
            mime: message.mime,
            content: message.content,
            encrypted: message.encrypted,
            encrypt_key: message.was_encrypted.then(String::new),
            fetch_url: message.fetch_url,
            local_path: message.local_path,
            preview_path: message.preview_path,
            unread: true,
            direction: Direction::Incoming,
            timestamp: message.timestamp,
            server_timestamp: message.server_timestamp,
            length: message.length,
        };
        match self.store.insert_incoming(record).await {
            Ok(id) => debug!(local_id = %id, "message stored"),
            Err(StoreError::Duplicate { delivery_id }) => {
                debug!(%delivery_id, "duplicate message skipped");
            }
            Err(err) => error!(error = %err, "unable to store message"),
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(err) = self.events.try_send(event) {
            debug!(error = %err, "session event dropped");
        }
    }
}
