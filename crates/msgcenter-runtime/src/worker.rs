//! Request Worker
//!
//! The single consumer of the job queue. It owns the live connection: it
//! connects and authenticates, then alternates between executing due jobs,
//! dispatching inbound frames and obeying control commands. Connection loss
//! triggers a reconnect; exhausting the reconnect attempts stops the worker
//! and leaves the queue to a future worker.

use async_trait::async_trait;
use msgcenter_core::{
    ConnectedSession, Connection, ConnectionError, Connector, Inbound, IncomingMessage, Job,
    JobEvent, JobListener, JobProgress, JobQueue, MessageCenterError, ProtocolResponse,
    ServerEndpoint, SessionConfig, StopReason,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::correlator::TransactionCorrelator;
use crate::handshake::Handshake;

// ----------------------------------------------------------------------------
// Reference Count
// ----------------------------------------------------------------------------

/// Holders keeping the worker from idling out
#[derive(Debug, Default)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment, returning the new count
    pub fn hold(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement without going below zero, returning the new count
    pub fn release(&self) -> usize {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// Commands and Hooks
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Self-shutdown is allowed once unreferenced and out of work
    Idle,
    /// The reference count changed
    RefCountChanged,
    Shutdown,
}

/// Callbacks from the worker into the session
#[async_trait]
pub trait WorkerHooks: Send + Sync {
    /// Token to log in with; `None` stops the worker
    fn auth_token(&self) -> Option<String>;

    /// Authentication succeeded on a fresh connection
    async fn authenticated(&self);

    fn connection_lost(&self);

    async fn incoming(&self, message: IncomingMessage);

    async fn mailbox(&self, messages: Vec<IncomingMessage>);

    /// The worker of this generation has exited
    fn stopped(&self, generation: u64, reason: StopReason);
}

/// Everything a worker needs from the session
pub struct WorkerContext {
    pub config: SessionConfig,
    pub endpoint: ServerEndpoint,
    pub generation: u64,
    pub connector: Arc<dyn Connector>,
    pub queue: Arc<JobQueue>,
    pub correlator: Arc<TransactionCorrelator>,
    pub listener: Arc<dyn JobListener>,
    pub hooks: Arc<dyn WorkerHooks>,
    pub refs: Arc<RefCount>,
}

// ----------------------------------------------------------------------------
// Worker Handle
// ----------------------------------------------------------------------------

/// Control side of a spawned worker
pub struct WorkerHandle {
    generation: u64,
    endpoint: ServerEndpoint,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    interrupted: Arc<AtomicBool>,
    task: JoinHandle<StopReason>,
}

impl WorkerHandle {
    /// Spawn a worker on the current Tokio runtime
    pub fn spawn(context: WorkerContext) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let interrupted = Arc::new(AtomicBool::new(false));
        let generation = context.generation;
        let endpoint = context.endpoint.clone();
        let worker = RequestWorker::new(context, receiver, interrupted.clone());
        let task = tokio::spawn(worker.run());
        Self {
            generation,
            endpoint,
            commands,
            interrupted,
            task,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn send(&self, command: WorkerCommand) {
        if self.commands.send(command).is_err() {
            debug!(?command, "worker already gone");
        }
    }

    /// Interrupt the in-flight job and ask the worker to close the connection
    pub fn shutdown(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.send(WorkerCommand::Shutdown);
    }

    /// Wait for the worker task to exit
    pub async fn join(self) -> Option<StopReason> {
        self.task.await.ok()
    }
}

// ----------------------------------------------------------------------------
// Request Worker
// ----------------------------------------------------------------------------

enum Establish {
    Ready(ConnectedSession, Vec<Inbound>),
    Failed(MessageCenterError),
    Stopped(StopReason),
}

enum ServeExit {
    Stopped(StopReason),
    ConnectionLost(MessageCenterError),
}

enum Step {
    Command(Option<WorkerCommand>),
    Frame(Option<Inbound>),
    Job(Arc<dyn Job>),
    IdleTimeout,
}

pub struct RequestWorker {
    config: SessionConfig,
    endpoint: ServerEndpoint,
    generation: u64,
    connector: Arc<dyn Connector>,
    queue: Arc<JobQueue>,
    correlator: Arc<TransactionCorrelator>,
    listener: Arc<dyn JobListener>,
    hooks: Arc<dyn WorkerHooks>,
    refs: Arc<RefCount>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    interrupted: Arc<AtomicBool>,
    idle_requested: bool,
    idle_deadline: Option<Instant>,
}

impl RequestWorker {
    pub fn new(
        context: WorkerContext,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config: context.config,
            endpoint: context.endpoint,
            generation: context.generation,
            connector: context.connector,
            queue: context.queue,
            correlator: context.correlator,
            listener: context.listener,
            hooks: context.hooks,
            refs: context.refs,
            commands,
            interrupted,
            idle_requested: false,
            idle_deadline: None,
        }
    }

    /// Run until stopped, returning why
    pub async fn run(mut self) -> StopReason {
        info!(endpoint = %self.endpoint, generation = self.generation, "request worker started");
        let reason = self.connection_loop().await;
        info!(generation = self.generation, ?reason, "request worker stopped");
        self.hooks.stopped(self.generation, reason.clone());
        reason
    }

    async fn connection_loop(&mut self) -> StopReason {
        let max_attempts = self.config.max_reconnect_attempts.max(1);
        let mut failures: u32 = 0;
        loop {
            let Some(token) = self.hooks.auth_token() else {
                warn!("no account credentials, not connecting");
                return StopReason::NoCredentials;
            };

            match self.establish(token).await {
                Establish::Stopped(reason) => return reason,
                Establish::Failed(err) => {
                    failures += 1;
                    if failures >= max_attempts {
                        error!(attempts = failures, error = %err, "unable to connect, giving up");
                        return StopReason::ReconnectFailed { attempts: failures };
                    }
                    let delay = self.config.backoff_for_attempt(failures);
                    warn!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "connect failed, retrying"
                    );
                    if self.interruptible(tokio::time::sleep(delay)).await.is_none() {
                        return StopReason::Requested;
                    }
                }
                Establish::Ready(session, deferred) => {
                    failures = 0;
                    match self.serve(session, deferred).await {
                        ServeExit::Stopped(reason) => return reason,
                        ServeExit::ConnectionLost(err) => {
                            warn!(error = %err, "connection lost, reconnecting");
                            // responses to the dead connection's transactions never arrive
                            self.correlator.clear();
                            self.hooks.connection_lost();
                        }
                    }
                }
            }
        }
    }

    /// Await `future` while still obeying commands; `None` on shutdown
    async fn interruptible<F: Future>(&mut self, future: F) -> Option<F::Output> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                output = &mut future => return Some(output),
                command = self.commands.recv() => match command {
                    Some(WorkerCommand::Shutdown) | None => return None,
                    Some(command) => self.apply(command),
                },
            }
        }
    }

    async fn establish(&mut self, token: String) -> Establish {
        let connector = self.connector.clone();
        let endpoint = self.endpoint.clone();
        debug!(endpoint = %endpoint, "connecting");
        let connected = match self
            .interruptible(async move { connector.connect(&endpoint).await })
            .await
        {
            None => return Establish::Stopped(StopReason::Requested),
            Some(Ok(connected)) => connected,
            Some(Err(err)) => return Establish::Failed(err.into()),
        };

        let ConnectedSession {
            mut connection,
            mut inbound,
        } = connected;
        let correlator = self.correlator.clone();
        let login_timeout = self.config.login_timeout;
        let outcome = self
            .interruptible(async move {
                let mut handshake = Handshake::new(&correlator, login_timeout);
                let result = handshake
                    .authenticate(connection.as_mut(), &mut inbound, &token)
                    .await;
                let deferred = handshake.take_deferred();
                (result, connection, inbound, deferred)
            })
            .await;

        match outcome {
            None => Establish::Stopped(StopReason::Requested),
            Some((Ok(()), connection, inbound, deferred)) => {
                Establish::Ready(ConnectedSession { connection, inbound }, deferred)
            }
            Some((Err(err), mut connection, _, _)) => {
                connection.close().await;
                Establish::Failed(err)
            }
        }
    }

    async fn serve(&mut self, session: ConnectedSession, deferred: Vec<Inbound>) -> ServeExit {
        let ConnectedSession {
            mut connection,
            mut inbound,
        } = session;

        self.hooks.authenticated().await;
        for frame in deferred {
            self.handle_inbound(frame).await;
        }
        self.schedule_idle();

        let queue = self.queue.clone();
        loop {
            let idle_deadline = self.idle_deadline;
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                frame = inbound.recv() => Step::Frame(frame),
                job = queue.next_due() => Step::Job(job),
                _ = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)),
                    if idle_deadline.is_some() => Step::IdleTimeout,
            };

            match step {
                Step::Command(None) | Step::Command(Some(WorkerCommand::Shutdown)) => {
                    connection.close().await;
                    return ServeExit::Stopped(StopReason::Requested);
                }
                Step::Command(Some(command)) => self.apply(command),
                Step::Frame(Some(frame)) => self.handle_inbound(frame).await,
                Step::Frame(None) => {
                    return ServeExit::ConnectionLost(
                        ConnectionError::Closed {
                            reason: "inbound stream ended".into(),
                        }
                        .into(),
                    );
                }
                Step::Job(job) => {
                    if let Err(err) = self.run_job(job, connection.as_mut()).await {
                        connection.close().await;
                        return ServeExit::ConnectionLost(err);
                    }
                    self.schedule_idle();
                }
                Step::IdleTimeout => {
                    if self.refs.get() == 0 && self.queue.is_empty() {
                        info!("idle grace period elapsed, shutting down");
                        connection.close().await;
                        return ServeExit::Stopped(StopReason::Idle);
                    }
                    self.idle_deadline = None;
                }
            }
        }
    }

    fn apply(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Idle => {
                self.idle_requested = true;
                self.schedule_idle();
            }
            WorkerCommand::RefCountChanged => {
                if self.refs.get() > 0 {
                    self.idle_requested = false;
                    self.idle_deadline = None;
                } else {
                    // releasing the last hold counts as an idle request
                    self.idle_requested = true;
                    self.schedule_idle();
                }
            }
            WorkerCommand::Shutdown => {}
        }
    }

    fn schedule_idle(&mut self) {
        if !self.idle_requested || self.refs.get() > 0 || !self.queue.is_empty() {
            self.idle_deadline = None;
            return;
        }
        if self.idle_deadline.is_none() {
            debug!(grace_ms = self.config.idle_grace.as_millis() as u64, "idle shutdown scheduled");
            self.idle_deadline = Some(Instant::now() + self.config.idle_grace);
        }
    }

    async fn handle_inbound(&self, frame: Inbound) {
        match frame {
            Inbound::Response {
                tx_id,
                response: ProtocolResponse::Mailbox(messages),
            } => {
                self.correlator.forget(&tx_id);
                self.hooks.mailbox(messages).await;
            }
            Inbound::Response { tx_id, response } => {
                self.correlator.dispatch(&tx_id, response);
            }
            Inbound::Message(message) => self.hooks.incoming(message).await,
            Inbound::Mailbox(messages) => self.hooks.mailbox(messages).await,
        }
    }

    /// Execute one job; an error return means the connection is gone
    async fn run_job(
        &mut self,
        job: Arc<dyn Job>,
        connection: &mut dyn Connection,
    ) -> Result<(), MessageCenterError> {
        let job_id = job.id();
        let kind = job.kind();

        if job.is_async() && job.is_cancelled() {
            debug!(%job_id, ?kind, "job cancelled before execution");
            self.listener
                .on_job_event(&JobEvent::Cancelled { job_id, kind });
            return Ok(());
        }

        self.listener.on_job_event(&JobEvent::Started {
            job_id,
            kind,
            long_running: job.is_async(),
        });

        let result = {
            let mut progress = JobProgress::new(
                job.as_ref(),
                &self.interrupted,
                self.listener.as_ref(),
                self.config.upload_chunk_size,
            );
            job.execute(connection, &mut progress).await
        };

        match result {
            Ok(tx_id) => {
                debug!(%job_id, ?kind, %tx_id, "job executed");
                if let Some(handler) = job.take_response_handler() {
                    if let Err(err) = self.correlator.register(tx_id.clone(), handler) {
                        warn!(%job_id, error = %err, "response handler not registered");
                    }
                }
                if let Some(next) = job.follow_up(&tx_id) {
                    self.queue.push(next, Duration::ZERO);
                }
                self.listener
                    .on_job_event(&JobEvent::Done { job_id, kind, tx_id });
                Ok(())
            }
            Err(err) if err.is_cancelled() => {
                info!(%job_id, ?kind, "job cancelled");
                self.listener
                    .on_job_event(&JobEvent::Cancelled { job_id, kind });
                Ok(())
            }
            Err(err) if err.is_connection_loss() => {
                if kind.is_discardable() {
                    // regenerated from persisted state after reconnecting
                    self.listener.on_job_event(&JobEvent::Failed {
                        job_id,
                        kind,
                        message: job.outbound_message(),
                        error: err.to_string(),
                        retryable: true,
                    });
                } else {
                    debug!(%job_id, ?kind, "requeueing job interrupted by connection loss");
                    self.queue.requeue_front(job);
                }
                Err(err)
            }
            Err(err) => {
                warn!(%job_id, ?kind, error = %err, "job failed");
                self.listener.on_job_event(&JobEvent::Failed {
                    job_id,
                    kind,
                    message: job.outbound_message(),
                    error: err.to_string(),
                    retryable: false,
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_count_never_negative() {
        let refs = RefCount::new();
        assert_eq!(refs.release(), 0);
        assert_eq!(refs.hold(), 1);
        assert_eq!(refs.hold(), 2);
        assert_eq!(refs.release(), 1);
        assert_eq!(refs.release(), 0);
        assert_eq!(refs.release(), 0);
        assert_eq!(refs.get(), 0);
    }
}
