//! Jobs: units of outgoing protocol work
//!
//! A job is executed once by the request worker against the live connection
//! and yields the transaction id of the request it sent. Lifecycle outcomes
//! are reported as a closed set of `JobEvent` variants; dispatchers consult
//! the job's declared `JobKind` instead of inspecting its concrete type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::connection::Connection;
use crate::errors::{MessageCenterError, MessageCenterResult};
use crate::protocol::ProtocolResponse;
use crate::types::{JobId, LocalMessageId, TransactionId};

/// Handler invoked with the response matching a job's transaction id
pub type ResponseHandler = Box<dyn FnOnce(ProtocolResponse) + Send + Sync>;

// ----------------------------------------------------------------------------
// Job Kind
// ----------------------------------------------------------------------------

/// Declared class of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    ServerInfo,
    StatusUpdate,
    PushRegistration,
    PresenceSubscription,
    SendMessage,
    Acknowledgement,
    UserLookup,
    MailboxFetch,
}

impl JobKind {
    /// Jobs regenerated from persisted state on reconnect; dropped instead of
    /// held while no worker is running
    pub fn is_discardable(&self) -> bool {
        matches!(self, Self::SendMessage | Self::Acknowledgement)
    }
}

// ----------------------------------------------------------------------------
// Job Outcomes
// ----------------------------------------------------------------------------

/// Final status of a job, as reported to the layer above
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Success,
    RetryableFailure,
    TerminalFailure,
    Cancelled,
}

/// Lifecycle event of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started {
        job_id: JobId,
        kind: JobKind,
        long_running: bool,
    },
    Progress {
        job_id: JobId,
        kind: JobKind,
        bytes: u64,
    },
    Done {
        job_id: JobId,
        kind: JobKind,
        tx_id: TransactionId,
    },
    Failed {
        job_id: JobId,
        kind: JobKind,
        message: Option<LocalMessageId>,
        error: String,
        retryable: bool,
    },
    Cancelled {
        job_id: JobId,
        kind: JobKind,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Done { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. } => *job_id,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::Started { kind, .. }
            | Self::Progress { kind, .. }
            | Self::Done { kind, .. }
            | Self::Failed { kind, .. }
            | Self::Cancelled { kind, .. } => *kind,
        }
    }

    /// Final status for terminal events, `None` for start and progress
    pub fn status(&self) -> Option<JobStatus> {
        match self {
            Self::Started { .. } | Self::Progress { .. } => None,
            Self::Done { .. } => Some(JobStatus::Success),
            Self::Failed { retryable: true, .. } => Some(JobStatus::RetryableFailure),
            Self::Failed { retryable: false, .. } => Some(JobStatus::TerminalFailure),
            Self::Cancelled { .. } => Some(JobStatus::Cancelled),
        }
    }
}

/// Receives job lifecycle events from the worker
pub trait JobListener: Send + Sync {
    fn on_job_event(&self, event: &JobEvent);
}

/// Listener that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJobListener;

impl JobListener for NoopJobListener {
    fn on_job_event(&self, _event: &JobEvent) {}
}

// ----------------------------------------------------------------------------
// Job Progress
// ----------------------------------------------------------------------------

static NOOP_LISTENER: NoopJobListener = NoopJobListener;
static NEVER_INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Progress reporter handed to a job while it executes
///
/// Every report consults the job's cancellation check and the worker's
/// interrupt flag, so long transfers stop between chunks.
pub struct JobProgress<'a> {
    job: &'a dyn Job,
    interrupted: &'a AtomicBool,
    listener: &'a dyn JobListener,
    chunk_size: usize,
    transferred: u64,
}

impl<'a> JobProgress<'a> {
    pub fn new(
        job: &'a dyn Job,
        interrupted: &'a AtomicBool,
        listener: &'a dyn JobListener,
        chunk_size: usize,
    ) -> Self {
        Self {
            job,
            interrupted,
            listener,
            chunk_size: chunk_size.max(1),
            transferred: 0,
        }
    }

    /// Reporter that is never interrupted and reports nowhere
    pub fn detached(job: &'a dyn Job) -> Self {
        Self::new(job, &NEVER_INTERRUPTED, &NOOP_LISTENER, 8 * 1024)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Fail with `Cancelled` if the job was cancelled or the worker interrupted
    pub fn check(&self) -> MessageCenterResult<()> {
        if self.job.is_cancelled() || self.interrupted.load(Ordering::Acquire) {
            return Err(MessageCenterError::Cancelled);
        }
        Ok(())
    }

    /// Record `bytes` more transferred and report it
    pub fn advance(&mut self, bytes: u64) -> MessageCenterResult<()> {
        self.check()?;
        self.transferred += bytes;
        self.listener.on_job_event(&JobEvent::Progress {
            job_id: self.job.id(),
            kind: self.job.kind(),
            bytes: self.transferred,
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Job
// ----------------------------------------------------------------------------

/// A unit of outgoing work executed by the request worker
#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> JobId;

    fn kind(&self) -> JobKind;

    /// Run the job against the connection, returning the request's transaction id
    async fn execute(
        &self,
        connection: &mut dyn Connection,
        progress: &mut JobProgress<'_>,
    ) -> MessageCenterResult<TransactionId>;

    /// Long-running jobs are checked for cancellation before execution
    fn is_async(&self) -> bool {
        false
    }

    fn is_cancelled(&self) -> bool {
        false
    }

    /// Called once the job leaves the queue, whether dequeued or discarded.
    /// After this the job no longer accepts merges.
    fn seal(&self) {}

    /// Handler for the response to this job's transaction, taken at most once
    fn take_response_handler(&self) -> Option<ResponseHandler> {
        None
    }

    /// Outbound message this job delivers, used to mark failures in the store
    fn outbound_message(&self) -> Option<LocalMessageId> {
        None
    }

    /// Job to enqueue after this one completes with the given transaction id
    fn follow_up(&self, _tx_id: &TransactionId) -> Option<Arc<dyn Job>> {
        None
    }
}

impl std::fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
