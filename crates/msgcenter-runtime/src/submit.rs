//! Job submission seam shared by the session components

use msgcenter_core::{Job, JobQueue, PushOutcome};
use std::sync::Arc;
use std::time::Duration;

/// Accepts jobs for the request worker
pub trait JobSink: Send + Sync {
    /// Enqueue a job eligible after `delay`; never blocks
    fn submit(&self, job: Arc<dyn Job>, delay: Duration) -> PushOutcome;
}

impl JobSink for JobQueue {
    fn submit(&self, job: Arc<dyn Job>, delay: Duration) -> PushOutcome {
        self.push(job, delay)
    }
}
