//! Concrete jobs
//!
//! `RequestJob` covers the single-request operations (capability query,
//! user info updates, presence subscriptions, lookups, mailbox fetches).
//! `SendMessageJob` delivers an outbound message, uploading its attachment
//! first when it has one. `AckJob` batches delivery acknowledgements.

use async_trait::async_trait;
use msgcenter_core::{
    Connection, DeliveryId, Job, JobId, JobKind, JobProgress, LocalMessageId, LookupEntry,
    MediaStorage, MessageCenterResult, OutgoingContent, OutgoingRecord, ProtocolRequest,
    ProtocolResponse, ResponseHandler, TransactionId, UserId, UserInfoUpdate,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Request Job
// ----------------------------------------------------------------------------

/// A job that sends one request and optionally handles its response
pub struct RequestJob {
    id: JobId,
    kind: JobKind,
    request: ProtocolRequest,
    handler: Mutex<Option<ResponseHandler>>,
}

impl RequestJob {
    pub fn new(kind: JobKind, request: ProtocolRequest) -> Self {
        Self {
            id: JobId::new(),
            kind,
            request,
            handler: Mutex::new(None),
        }
    }

    /// Attach the handler for the response
    pub fn on_response(self, handler: impl FnOnce(ProtocolResponse) + Send + Sync + 'static) -> Self {
        *lock(&self.handler) = Some(Box::new(handler));
        self
    }

    /// Server capability query
    pub fn server_info() -> Self {
        Self::new(JobKind::ServerInfo, ProtocolRequest::ServerInfo)
    }

    /// Push the current status message
    pub fn status_update(status_message: Option<String>) -> Self {
        Self::new(
            JobKind::StatusUpdate,
            ProtocolRequest::UserInfoUpdate(UserInfoUpdate {
                status_message: Some(status_message.unwrap_or_default()),
                ..UserInfoUpdate::default()
            }),
        )
    }

    /// Inform the server of the push registration id; `None` clears it
    pub fn push_registration(registration_id: Option<String>) -> Self {
        Self::new(
            JobKind::PushRegistration,
            ProtocolRequest::UserInfoUpdate(UserInfoUpdate {
                push_registration_id: Some(registration_id.unwrap_or_default()),
                ..UserInfoUpdate::default()
            }),
        )
    }

    /// Subscribe to presence events; a zero mask unsubscribes
    pub fn presence_subscription(user_id: UserId, event_mask: u8) -> Self {
        Self::new(
            JobKind::PresenceSubscription,
            ProtocolRequest::PresenceSubscribe { user_id, event_mask },
        )
    }

    pub fn mailbox_fetch() -> Self {
        Self::new(JobKind::MailboxFetch, ProtocolRequest::MailboxFetch)
    }

    /// Look up users; the receiver resolves with the server's entries
    pub fn user_lookup(user_ids: Vec<UserId>) -> (Self, oneshot::Receiver<Vec<LookupEntry>>) {
        let (sender, receiver) = oneshot::channel();
        let job = Self::new(JobKind::UserLookup, ProtocolRequest::UserLookup { user_ids })
            .on_response(move |response| {
                if let ProtocolResponse::UserLookup(entries) = response {
                    let _ = sender.send(entries);
                }
            });
        (job, receiver)
    }

    pub fn request(&self) -> &ProtocolRequest {
        &self.request
    }
}

#[async_trait]
impl Job for RequestJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn execute(
        &self,
        connection: &mut dyn Connection,
        _progress: &mut JobProgress<'_>,
    ) -> MessageCenterResult<TransactionId> {
        Ok(connection.send(self.request.clone()).await?)
    }

    fn take_response_handler(&self) -> Option<ResponseHandler> {
        lock(&self.handler).take()
    }
}

// ----------------------------------------------------------------------------
// Send Message Job
// ----------------------------------------------------------------------------

/// What a send job puts on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendPayload {
    Inline(Vec<u8>),
    /// Local file to upload before sending
    File(PathBuf),
    /// File reference of an attachment already uploaded
    Uploaded(String),
}

/// Delivers one outbound message
pub struct SendMessageJob {
    id: JobId,
    message: LocalMessageId,
    recipient: UserId,
    mime: String,
    payload: SendPayload,
    encrypt_key: Option<String>,
    media: Option<Arc<dyn MediaStorage>>,
    cancelled: AtomicBool,
    handler: Mutex<Option<ResponseHandler>>,
}

impl SendMessageJob {
    pub fn new(
        message: LocalMessageId,
        recipient: UserId,
        mime: impl Into<String>,
        payload: SendPayload,
    ) -> Self {
        Self {
            id: JobId::new(),
            message,
            recipient,
            mime: mime.into(),
            payload,
            encrypt_key: None,
            media: None,
            cancelled: AtomicBool::new(false),
            handler: Mutex::new(None),
        }
    }

    /// Build the job resending a stored outbound message
    pub fn from_record(record: OutgoingRecord, media: Arc<dyn MediaStorage>) -> Self {
        let payload = match record.local_path {
            Some(path) => SendPayload::File(path),
            None => SendPayload::Inline(record.content),
        };
        let mut job = Self::new(record.id, record.peer, record.mime, payload);
        job.encrypt_key = record.encrypt_key;
        job.media = Some(media);
        job
    }

    pub fn with_media(mut self, media: Arc<dyn MediaStorage>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn on_response(self, handler: impl FnOnce(ProtocolResponse) + Send + Sync + 'static) -> Self {
        *lock(&self.handler) = Some(Box::new(handler));
        self
    }

    /// Request cancellation; honored before execution and between upload chunks
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn message(&self) -> LocalMessageId {
        self.message
    }

    pub fn payload(&self) -> &SendPayload {
        &self.payload
    }

    fn send_request(&self, content: OutgoingContent) -> ProtocolRequest {
        ProtocolRequest::SendMessage {
            recipient: self.recipient.clone(),
            mime: self.mime.clone(),
            content,
            encrypt_key: self.encrypt_key.clone(),
        }
    }
}

#[async_trait]
impl Job for SendMessageJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn kind(&self) -> JobKind {
        JobKind::SendMessage
    }

    async fn execute(
        &self,
        connection: &mut dyn Connection,
        progress: &mut JobProgress<'_>,
    ) -> MessageCenterResult<TransactionId> {
        match &self.payload {
            SendPayload::Inline(content) => Ok(connection
                .send(self.send_request(OutgoingContent::Inline(content.clone())))
                .await?),
            SendPayload::Uploaded(reference) => Ok(connection
                .send(self.send_request(OutgoingContent::Attachment(reference.clone())))
                .await?),
            SendPayload::File(path) => {
                let content = match &self.media {
                    Some(media) => media.read(path).await?,
                    None => tokio::fs::read(path).await?,
                };
                progress.check()?;
                debug!(job_id = %self.id, bytes = content.len(), "uploading attachment");
                connection.upload(&self.mime, &content, progress).await
            }
        }
    }

    fn is_async(&self) -> bool {
        matches!(self.payload, SendPayload::File(_))
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn take_response_handler(&self) -> Option<ResponseHandler> {
        match self.payload {
            // the send response belongs to the follow-up job
            SendPayload::File(_) => None,
            _ => lock(&self.handler).take(),
        }
    }

    fn outbound_message(&self) -> Option<LocalMessageId> {
        Some(self.message)
    }

    fn follow_up(&self, tx_id: &TransactionId) -> Option<Arc<dyn Job>> {
        if !matches!(self.payload, SendPayload::File(_)) {
            return None;
        }
        let job = SendMessageJob {
            id: JobId::new(),
            message: self.message,
            recipient: self.recipient.clone(),
            mime: self.mime.clone(),
            payload: SendPayload::Uploaded(tx_id.as_str().to_owned()),
            encrypt_key: self.encrypt_key.clone(),
            media: self.media.clone(),
            cancelled: AtomicBool::new(false),
            handler: Mutex::new(lock(&self.handler).take()),
        };
        Some(Arc::new(job))
    }
}

// ----------------------------------------------------------------------------
// Acknowledgement Job
// ----------------------------------------------------------------------------

#[derive(Default)]
struct AckState {
    ids: Vec<DeliveryId>,
    done: bool,
}

/// Accumulating delivery acknowledgement
///
/// Open until dequeued: identifiers merged before then travel in the one
/// acknowledgement it sends. Once sealed a merge is refused and the caller
/// must start a new job.
#[derive(Default)]
pub struct AckJob {
    id: JobId,
    state: Mutex<AckState>,
}

impl AckJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(delivery_id: DeliveryId) -> Self {
        let job = Self::new();
        lock(&job.state).ids.push(delivery_id);
        job
    }

    /// Add an identifier; `false` once the job is done
    pub fn merge(&self, delivery_id: DeliveryId) -> bool {
        let mut state = lock(&self.state);
        if state.done {
            return false;
        }
        if !state.ids.contains(&delivery_id) {
            state.ids.push(delivery_id);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        lock(&self.state).done
    }

    pub fn ids(&self) -> Vec<DeliveryId> {
        lock(&self.state).ids.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).ids.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).ids.is_empty()
    }
}

#[async_trait]
impl Job for AckJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn kind(&self) -> JobKind {
        JobKind::Acknowledgement
    }

    async fn execute(
        &self,
        connection: &mut dyn Connection,
        _progress: &mut JobProgress<'_>,
    ) -> MessageCenterResult<TransactionId> {
        let ids = self.ids();
        Ok(connection.send(ProtocolRequest::Received { ids }).await?)
    }

    fn seal(&self) {
        lock(&self.state).done = true;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
