//! Events published by the session to the layer above

use tokio::sync::mpsc;

use crate::job::{JobKind, JobStatus};
use crate::types::{DeliveryId, JobId, UserId};

/// Why the request worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` or `restart()` was called
    Requested,
    /// Idle grace period elapsed with no holders and no work
    Idle,
    /// Reconnect attempts exhausted
    ReconnectFailed { attempts: u32 },
    /// No account credentials available
    NoCredentials,
}

/// Events for the UI / notification layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Authenticated and the post-login steps were queued
    Connected,
    /// Presence change of a subscribed user
    UserPresence {
        user_id: UserId,
        event: i32,
        status: Option<String>,
    },
    /// A message was received and should be notified
    MessageReceived {
        sender: UserId,
        /// Set when the message is acknowledged to the server
        delivery_id: Option<DeliveryId>,
    },
    /// Transfer progress of a long-running job
    JobProgress { job_id: JobId, bytes: u64 },
    /// Final outcome of a job
    JobOutcome {
        job_id: JobId,
        kind: JobKind,
        status: JobStatus,
    },
    WorkerStopped { reason: StopReason },
}

pub type SessionEventSender = mpsc::Sender<SessionEvent>;
pub type SessionEventReceiver = mpsc::Receiver<SessionEvent>;

/// Create the bounded session event channel
pub fn create_event_channel(buffer_size: usize) -> (SessionEventSender, SessionEventReceiver) {
    mpsc::channel(buffer_size.max(1))
}
