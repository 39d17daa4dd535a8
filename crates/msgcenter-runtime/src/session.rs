//! Session Manager
//!
//! Top-level orchestrator. It owns the request worker's lifecycle, wires the
//! correlator, processor and push coordinator to it, runs the post-login
//! steps and exposes the public control surface. Protocol handling itself
//! lives in the components.

use async_trait::async_trait;
use msgcenter_core::{
    ContactDirectory, Connector, Credentials, IncomingMessage, Job, JobEvent, JobKind, JobListener, JobQueue,
    LookupEntry, MediaStorage, MessageCenterError, MessageCenterResult, MessageStatus,
    MessageStore, OutgoingRecord, Preferences, ProtocolResponse, PushEvent, PushOutcome,
    PushRegistrar, PushState, ServerEndpoint, SessionConfig, SessionEvent, SessionEventReceiver,
    SessionEventSender, StopReason, Timestamp, UserId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::correlator::TransactionCorrelator;
use crate::jobs::{RequestJob, SendMessageJob};
use crate::processor::IncomingProcessor;
use crate::push::PushCoordinator;
use crate::submit::JobSink;
use crate::worker::{RefCount, WorkerCommand, WorkerContext, WorkerHandle, WorkerHooks};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Session Core
// ----------------------------------------------------------------------------

/// Collaborators handed to the session by the builder
pub(crate) struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn MessageStore>,
    pub credentials: Arc<dyn Credentials>,
    pub preferences: Arc<dyn Preferences>,
    pub media: Arc<dyn MediaStorage>,
    pub registrar: Arc<dyn PushRegistrar>,
    pub contacts: Arc<dyn ContactDirectory>,
}

/// Submits through the session, restarting the worker when allowed
struct SessionSink(Weak<SessionCore>);

impl JobSink for SessionSink {
    fn submit(&self, job: Arc<dyn Job>, delay: Duration) -> PushOutcome {
        match self.0.upgrade() {
            Some(core) => core.submit(job, delay),
            None => {
                job.seal();
                PushOutcome::Discarded
            }
        }
    }
}

pub(crate) struct SessionCore {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    store: Arc<dyn MessageStore>,
    credentials: Arc<dyn Credentials>,
    preferences: Arc<dyn Preferences>,
    media: Arc<dyn MediaStorage>,
    queue: Arc<JobQueue>,
    correlator: Arc<TransactionCorrelator>,
    processor: IncomingProcessor,
    push: Arc<PushCoordinator>,
    /// Presence subscription map: user id to event mask
    presence: Mutex<HashMap<UserId, u8>>,
    refs: Arc<RefCount>,
    worker: Mutex<Option<WorkerHandle>>,
    last_endpoint: Mutex<Option<ServerEndpoint>>,
    generation: AtomicU64,
    authenticated: AtomicBool,
    events: SessionEventSender,
    this: Weak<SessionCore>,
}

impl SessionCore {
    pub(crate) fn new(
        config: SessionConfig,
        collaborators: Collaborators,
        events: SessionEventSender,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<SessionCore>| {
            let sink: Arc<dyn JobSink> = Arc::new(SessionSink(this.clone()));
            let processor = IncomingProcessor::new(
                collaborators.store.clone(),
                collaborators.contacts.clone(),
                collaborators.media.clone(),
                sink,
                events.clone(),
                config.ack_delay,
            );
            let push = Arc::new(PushCoordinator::new(
                collaborators.registrar.clone(),
                collaborators.preferences.clone(),
                Arc::default(),
            ));
            Self {
                config,
                connector: collaborators.connector,
                store: collaborators.store,
                credentials: collaborators.credentials,
                preferences: collaborators.preferences,
                media: collaborators.media,
                queue: Arc::new(JobQueue::new()),
                correlator: Arc::new(TransactionCorrelator::new()),
                processor,
                push,
                presence: Mutex::new(HashMap::new()),
                refs: Arc::new(RefCount::new()),
                worker: Mutex::new(None),
                last_endpoint: Mutex::new(None),
                generation: AtomicU64::new(0),
                authenticated: AtomicBool::new(false),
                events,
                this: this.clone(),
            }
        })
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(err) = self.events.try_send(event) {
            debug!(error = %err, "session event dropped");
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|handle| handle.is_running())
    }

    fn start(&self, endpoint: ServerEndpoint) -> MessageCenterResult<()> {
        let this = self.this.upgrade().ok_or(MessageCenterError::NotRunning)?;
        let mut slot = lock(&self.worker);
        if slot.as_ref().is_some_and(|handle| handle.is_running()) {
            debug!("request worker already running");
            return Ok(());
        }

        *lock(&self.last_endpoint) = Some(endpoint.clone());
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let restored = self.queue.activate();
        info!(%endpoint, generation, restored, "starting request worker");

        *slot = Some(WorkerHandle::spawn(WorkerContext {
            config: self.config.clone(),
            endpoint,
            generation,
            connector: self.connector.clone(),
            queue: self.queue.clone(),
            correlator: self.correlator.clone(),
            listener: this.clone(),
            hooks: this,
            refs: self.refs.clone(),
        }));
        Ok(())
    }

    fn stop(&self) {
        let mut slot = lock(&self.worker);
        if let Some(handle) = slot.take() {
            info!(generation = handle.generation(), "stopping request worker");
            handle.shutdown();
        }
        self.teardown();
    }

    /// Reset shared state once no worker serves the queue; caller holds the worker slot
    fn teardown(&self) {
        let discarded = self.queue.deactivate();
        self.correlator.clear();
        self.push.reset_session();
        self.authenticated.store(false, Ordering::Release);
        debug!(discarded, held = self.queue.offline_len(), "session torn down");
    }

    fn command(&self, command: WorkerCommand) {
        if let Some(handle) = lock(&self.worker).as_ref() {
            handle.send(command);
        }
    }

    /// Start a worker against the last endpoint unless one is running
    fn ensure_running(&self) {
        if self.is_running() {
            return;
        }
        let endpoint = lock(&self.last_endpoint).clone();
        if let Some(endpoint) = endpoint {
            debug!("request worker down, starting it");
            if let Err(err) = self.start(endpoint) {
                warn!(error = %err, "unable to start request worker");
            }
        }
    }

    fn submit(&self, job: Arc<dyn Job>, delay: Duration) -> PushOutcome {
        let outcome = self.queue.push(job, delay);
        if outcome != PushOutcome::Queued && self.config.auto_start {
            self.ensure_running();
        }
        outcome
    }

    fn send_job(&self, record: OutgoingRecord) -> Arc<SendMessageJob> {
        let message = record.id;
        let store = self.store.clone();
        let job = SendMessageJob::from_record(record, self.media.clone()).on_response(move |response| {
            let ProtocolResponse::MessageSent { delivery_id } = response else {
                warn!(local_id = %message, "unexpected response to message send");
                return;
            };
            tokio::spawn(async move {
                let result = async {
                    store.set_delivery_id(message, delivery_id).await?;
                    store
                        .update_outgoing_status(message, MessageStatus::Sent, Timestamp::now())
                        .await
                }
                .await;
                if let Err(err) = result {
                    warn!(local_id = %message, error = %err, "unable to mark message sent");
                }
            });
        });
        Arc::new(job)
    }

    fn server_info_job(&self) -> RequestJob {
        let this = self.this.clone();
        RequestJob::server_info().on_response(move |response| {
            let Some(core) = this.upgrade() else {
                return;
            };
            if let Some(sender_id) = response.push_sender_id() {
                core.push.sender_announced(sender_id, core.as_ref());
            }
        })
    }
}

impl JobSink for SessionCore {
    fn submit(&self, job: Arc<dyn Job>, delay: Duration) -> PushOutcome {
        SessionCore::submit(self, job, delay)
    }
}

#[async_trait]
impl WorkerHooks for SessionCore {
    fn auth_token(&self) -> Option<String> {
        self.credentials.auth_token().filter(|token| !token.is_empty())
    }

    async fn authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
        self.processor.reset();

        self.submit(Arc::new(self.server_info_job()), Duration::ZERO);
        self.submit(
            Arc::new(RequestJob::status_update(self.preferences.status_message())),
            Duration::ZERO,
        );

        let subscriptions: Vec<(UserId, u8)> = lock(&self.presence)
            .iter()
            .map(|(user_id, mask)| (user_id.clone(), *mask))
            .collect();
        for (user_id, mask) in subscriptions {
            self.submit(
                Arc::new(RequestJob::presence_subscription(user_id, mask)),
                Duration::ZERO,
            );
        }

        match self.store.pending_outgoing().await {
            Ok(pending) => {
                if !pending.is_empty() {
                    info!(count = pending.len(), "resending pending messages");
                }
                for record in pending {
                    self.submit(self.send_job(record), Duration::ZERO);
                }
            }
            Err(err) => warn!(error = %err, "unable to scan pending messages"),
        }

        self.emit(SessionEvent::Connected);
    }

    fn connection_lost(&self) {
        self.authenticated.store(false, Ordering::Release);
    }

    async fn incoming(&self, message: IncomingMessage) {
        self.processor.incoming(message).await;
    }

    async fn mailbox(&self, messages: Vec<IncomingMessage>) {
        self.processor.mailbox(messages).await;
    }

    fn stopped(&self, generation: u64, reason: StopReason) {
        {
            let mut slot = lock(&self.worker);
            if slot.as_ref().is_some_and(|handle| handle.generation() == generation) {
                slot.take();
                self.teardown();
            }
        }
        self.emit(SessionEvent::WorkerStopped { reason });
    }
}

impl JobListener for SessionCore {
    fn on_job_event(&self, event: &JobEvent) {
        match event {
            JobEvent::Progress { job_id, bytes, .. } => {
                self.emit(SessionEvent::JobProgress {
                    job_id: *job_id,
                    bytes: *bytes,
                });
            }
            JobEvent::Failed {
                job_id,
                kind,
                message,
                error,
                ..
            } => {
                debug!(%job_id, ?kind, %error, "job failure reported");
                if let Some(message) = *message {
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        if let Err(err) = store
                            .update_outgoing_status(message, MessageStatus::Error, Timestamp::now())
                            .await
                        {
                            warn!(local_id = %message, error = %err, "unable to mark message failed");
                        }
                    });
                }
                if *kind == JobKind::PushRegistration {
                    self.push.update_failed(*job_id);
                }
            }
            _ => {}
        }

        if let Some(status) = event.status() {
            self.emit(SessionEvent::JobOutcome {
                job_id: event.job_id(),
                kind: event.kind(),
                status,
            });
        }
    }
}

// ----------------------------------------------------------------------------
// Session Manager
// ----------------------------------------------------------------------------

/// Public control surface of the message center session
///
/// Must be used from within a Tokio runtime: starting the worker and
/// several follow-up actions spawn tasks.
pub struct SessionManager {
    core: Arc<SessionCore>,
    event_receiver: Option<SessionEventReceiver>,
}

impl SessionManager {
    pub(crate) fn new(core: Arc<SessionCore>, event_receiver: SessionEventReceiver) -> Self {
        Self {
            core,
            event_receiver: Some(event_receiver),
        }
    }

    /// Take the session event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<SessionEventReceiver> {
        self.event_receiver.take()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Ensure a worker is running against the endpoint; no-op if one is
    pub fn start(&self, endpoint: ServerEndpoint) -> MessageCenterResult<()> {
        self.core.start(endpoint)
    }

    /// Stop the worker; held jobs stay queued for the next one
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Stop and immediately start against the last endpoint
    pub fn restart(&self) -> MessageCenterResult<()> {
        let endpoint = lock(&self.core.last_endpoint)
            .clone()
            .ok_or_else(|| MessageCenterError::configuration("no endpoint to restart against"))?;
        self.core.stop();
        self.core.start(endpoint)
    }

    /// Allow the worker to shut down after the grace period if unreferenced
    pub fn idle(&self) {
        self.core.command(WorkerCommand::Idle);
    }

    /// Keep the connection alive; starts the worker against the last endpoint if it is down
    pub fn hold(&self) {
        let count = self.core.refs.hold();
        debug!(count, "hold");
        self.core.ensure_running();
        self.core.command(WorkerCommand::RefCountChanged);
    }

    pub fn release(&self) {
        let count = self.core.refs.release();
        debug!(count, "release");
        self.core.command(WorkerCommand::RefCountChanged);
    }

    pub fn ref_count(&self) -> usize {
        self.core.refs.get()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Logged in on the current connection
    pub fn is_authenticated(&self) -> bool {
        self.core.authenticated.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Push the current status message if connected
    pub fn update_status(&self) -> bool {
        if !self.is_authenticated() {
            return false;
        }
        let status = self.core.preferences.status_message();
        self.core
            .submit(Arc::new(RequestJob::status_update(status)), Duration::ZERO);
        true
    }

    /// Queue an outbound message; the returned job can be cancelled
    pub fn send_message(&self, record: OutgoingRecord) -> Arc<SendMessageJob> {
        let job = self.core.send_job(record);
        self.core.submit(job.clone(), Duration::ZERO);
        job
    }

    /// Subscribe to presence events of a user; restored after every login
    pub fn subscribe_presence(&self, user_id: UserId, event_mask: u8) {
        lock(&self.core.presence).insert(user_id.clone(), event_mask);
        self.core.submit(
            Arc::new(RequestJob::presence_subscription(user_id, event_mask)),
            Duration::ZERO,
        );
    }

    pub fn unsubscribe_presence(&self, user_id: &UserId) {
        lock(&self.core.presence).remove(user_id);
        self.core.submit(
            Arc::new(RequestJob::presence_subscription(user_id.clone(), 0)),
            Duration::ZERO,
        );
    }

    pub fn presence_subscriptions(&self) -> HashMap<UserId, u8> {
        lock(&self.core.presence).clone()
    }

    /// Look up users; the receiver resolves when the server answers
    pub fn lookup_users(&self, user_ids: Vec<UserId>) -> oneshot::Receiver<Vec<LookupEntry>> {
        let (job, receiver) = RequestJob::user_lookup(user_ids);
        self.core.submit(Arc::new(job), Duration::ZERO);
        receiver
    }

    /// Ask the server for queued messages
    pub fn fetch_mailbox(&self) {
        self.core
            .submit(Arc::new(RequestJob::mailbox_fetch()), Duration::ZERO);
    }

    /// Suppress notifications for the conversation being viewed
    pub fn set_paused_conversation(&self, user_id: Option<UserId>) {
        self.core.processor.set_paused_conversation(user_id);
    }

    pub fn processor(&self) -> &IncomingProcessor {
        &self.core.processor
    }

    /// Jobs waiting for the active worker
    pub fn pending_jobs(&self) -> usize {
        self.core.queue.len()
    }

    /// Jobs held while no worker is running
    pub fn held_jobs(&self) -> usize {
        self.core.queue.offline_len()
    }

    // ------------------------------------------------------------------------
    // Push notifications
    // ------------------------------------------------------------------------

    pub fn push_enable(&self) {
        self.core.push.handle(PushEvent::Enable, self.core.as_ref());
    }

    pub fn push_disable(&self) {
        self.core.push.handle(PushEvent::Disable, self.core.as_ref());
    }

    /// Platform reported a new registration id, or that none exists
    pub fn push_registration_changed(&self, registration_id: Option<String>) {
        self.core.push.handle(
            PushEvent::from_registration(registration_id),
            self.core.as_ref(),
        );
    }

    pub fn push_state(&self) -> PushState {
        self.core.push.state()
    }

    pub fn push_acknowledged(&self) -> bool {
        self.core.push.is_acknowledged()
    }

    /// Sender id announced by the server in this session
    pub fn push_sender_id(&self) -> Option<String> {
        self.core.push.sender_id()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.core.stop();
    }
}
