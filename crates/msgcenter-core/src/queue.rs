//! Delay-aware job queue
//!
//! A time-ordered multiset of jobs, each eligible for execution once its
//! not-before instant has passed. Ties are broken by submission order, so
//! jobs run in queue order modulo their delay.
//!
//! While no worker is attached the queue is inactive: submissions are held
//! in an offline list (discardable kinds are dropped instead) and moved back
//! into the pending set, order preserved, when a worker activates it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use tracing::debug;

use crate::job::Job;

// ----------------------------------------------------------------------------
// Queued Entry
// ----------------------------------------------------------------------------

struct QueuedEntry {
    not_before: Instant,
    seq: i64,
    job: Arc<dyn Job>,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    // BinaryHeap is a max-heap; the earliest entry must compare greatest
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ----------------------------------------------------------------------------
// Job Queue
// ----------------------------------------------------------------------------

/// Where a submitted job ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Pending for the active worker
    Queued,
    /// Held in the offline list until a worker starts
    Held,
    /// Dropped: discardable job submitted while no worker is running
    Discarded,
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<QueuedEntry>,
    offline: Vec<QueuedEntry>,
    active: bool,
    next_seq: i64,
    front_seq: i64,
}

/// Ordered, cancellable request queue shared by submitters and the worker
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    /// Create an inactive queue
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submit a job eligible at `now + delay`; never blocks
    pub fn push(&self, job: Arc<dyn Job>, delay: Duration) -> PushOutcome {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = QueuedEntry {
            not_before: Instant::now() + delay,
            seq,
            job,
        };

        if state.active {
            state.pending.push(entry);
            drop(state);
            self.notify.notify_one();
            PushOutcome::Queued
        } else if entry.job.kind().is_discardable() {
            drop(state);
            debug!(job_id = %entry.job.id(), kind = ?entry.job.kind(), "worker down, discarding job");
            entry.job.seal();
            PushOutcome::Discarded
        } else {
            debug!(job_id = %entry.job.id(), kind = ?entry.job.kind(), "worker down, holding job");
            state.offline.push(entry);
            PushOutcome::Held
        }
    }

    /// Put a job back at the head of the queue, immediately eligible
    pub fn requeue_front(&self, job: Arc<dyn Job>) -> PushOutcome {
        let mut state = self.lock();
        state.front_seq -= 1;
        let entry = QueuedEntry {
            not_before: Instant::now(),
            seq: state.front_seq,
            job,
        };
        if state.active {
            state.pending.push(entry);
            drop(state);
            self.notify.notify_one();
            PushOutcome::Queued
        } else {
            state.offline.push(entry);
            PushOutcome::Held
        }
    }

    /// Attach a worker: held jobs become pending in their original order
    pub fn activate(&self) -> usize {
        let mut state = self.lock();
        state.active = true;
        let restored = state.offline.len();
        let offline = std::mem::take(&mut state.offline);
        state.pending.extend(offline);
        drop(state);
        self.notify.notify_one();
        restored
    }

    /// Detach the worker: pending jobs move to the offline list, except
    /// discardable ones which are dropped. Returns the number dropped.
    pub fn deactivate(&self) -> usize {
        let mut state = self.lock();
        state.active = false;
        let mut pending = std::mem::take(&mut state.pending).into_vec();
        pending.sort_by(|a, b| b.cmp(a));

        let mut discarded = Vec::new();
        for entry in pending {
            if entry.job.kind().is_discardable() {
                discarded.push(entry.job);
            } else {
                state.offline.push(entry);
            }
        }
        drop(state);

        for job in &discarded {
            job.seal();
        }
        discarded.len()
    }

    /// Remove and return the earliest job whose eligibility time has passed
    pub fn pop_due(&self) -> Option<Arc<dyn Job>> {
        let job = {
            let mut state = self.lock();
            let due = state
                .pending
                .peek()
                .is_some_and(|entry| entry.not_before <= Instant::now());
            if !due {
                return None;
            }
            state.pending.pop().map(|entry| entry.job)
        };
        if let Some(job) = &job {
            job.seal();
        }
        job
    }

    /// Earliest eligibility instant among pending jobs
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().pending.peek().map(|entry| entry.not_before)
    }

    /// Wait until a job is due and dequeue it
    ///
    /// The wait is recomputed whenever a job is pushed, so an earlier deadline
    /// submitted while waiting is honored. Cancel-safe: a job is only removed
    /// synchronously once it is due.
    pub async fn next_due(&self) -> Arc<dyn Job> {
        loop {
            if let Some(job) = self.pop_due() {
                return job;
            }
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Number of pending jobs
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Number of jobs held while no worker is running
    pub fn offline_len(&self) -> usize {
        self.lock().offline.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
