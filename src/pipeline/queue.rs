//! Batch queue — FIFO of fetched messages drained in rate-limited batches.
//!
//! State machine: Idle → Draining → Idle. At most one drain runs at a
//! time; messages enqueued mid-drain are picked up by the same drain before
//! it goes idle. Within a batch every message takes its own limiter token
//! and all classifier calls run concurrently. A batch commits with a single
//! bulk save followed by one `newTasks` event, or not at all: any classifier
//! error (or non-conflict save error) puts the whole batch back at the head
//! of the queue, ends the drain, and schedules a delayed retry.
//!
//! Duplicate external ids are skipped: on a constraint violation the
//! records that already exist (or repeat within the batch) are dropped and
//! reported, and the rest is saved in one more atomic call.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{ClassifyError, PipelineError};
use crate::pipeline::rate_limiter::RateLimiter;
use crate::pipeline::types::{Classifier, PendingMessage};
use crate::store::TaskRepository;
use crate::tasks::model::{TaskRecord, UpdateEvent};
use crate::tasks::publisher::UpdatePublisher;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<PendingMessage>,
    draining: bool,
    /// Consecutive failed batches; drives the retry delay.
    failures: u32,
    retry_scheduled: bool,
}

/// Totals for one drain.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
    /// Batches committed.
    pub batches: usize,
    /// Records persisted.
    pub persisted: usize,
    /// External ids skipped as duplicates.
    pub conflicts: Vec<String>,
    /// Messages put back at the head after a failure.
    pub requeued: usize,
}

/// How a `drain` call ended.
#[derive(Debug)]
pub enum DrainOutcome {
    /// Another drain is in progress; the caller's items will be picked up by it.
    AlreadyRunning,
    /// Nothing was pending.
    Idle,
    /// The queue was emptied.
    Drained(DrainReport),
    /// A batch failed and was requeued; a retry is scheduled.
    Interrupted {
        report: DrainReport,
        error: PipelineError,
    },
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            Self::Drained(report) | Self::Interrupted { report, .. } => Some(report),
            _ => None,
        }
    }
}

struct BatchCommit {
    persisted: usize,
    conflicts: Vec<String>,
}

/// The claimed drain slot. Dropping it while still held (a panicking
/// classifier, a cancelled `drain()` call) frees the slot so the queue
/// does not stay marked as draining.
struct DrainSlot<'a> {
    queue: &'a BatchQueue,
    held: bool,
}

impl DrainSlot<'_> {
    /// The drain cleared `draining` itself.
    fn release(mut self) {
        self.held = false;
    }
}

impl Drop for DrainSlot<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        warn!("Drain ended without finishing; releasing drain slot");
        if let Ok(mut state) = self.queue.state.try_lock() {
            state.draining = false;
            drop(state);
            self.queue.idle.notify_waiters();
        } else if let (Some(queue), Ok(runtime)) = (
            self.queue.this.upgrade(),
            tokio::runtime::Handle::try_current(),
        ) {
            runtime.spawn(async move { queue.finish_drain().await });
        }
    }
}

/// Shared pending queue feeding classifier → repository → publisher.
pub struct BatchQueue {
    state: Mutex<QueueState>,
    idle: Notify,
    limiter: Arc<RateLimiter>,
    classifier: Arc<dyn Classifier>,
    repository: Arc<dyn TaskRepository>,
    publisher: Arc<UpdatePublisher>,
    batch_size: usize,
    retry_initial: Duration,
    retry_max: Duration,
    this: Weak<BatchQueue>,
}

impl BatchQueue {
    pub fn new(
        config: &PipelineConfig,
        limiter: Arc<RateLimiter>,
        classifier: Arc<dyn Classifier>,
        repository: Arc<dyn TaskRepository>,
        publisher: Arc<UpdatePublisher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(QueueState::default()),
            idle: Notify::new(),
            limiter,
            classifier,
            repository,
            publisher,
            batch_size: config.batch_size.max(1),
            retry_initial: config.retry_initial,
            retry_max: config.retry_max.max(config.retry_initial),
            this: this.clone(),
        })
    }

    /// Append one message and start a drain if idle.
    pub async fn enqueue(&self, message: PendingMessage) {
        self.enqueue_all(vec![message]).await;
    }

    /// Append messages in order and start a drain if idle.
    pub async fn enqueue_all(&self, messages: Vec<PendingMessage>) {
        if messages.is_empty() {
            return;
        }
        let count = messages.len();
        let pending = {
            let mut state = self.state.lock().await;
            state.pending.extend(messages);
            state.pending.len()
        };
        debug!(added = count, pending, "Messages enqueued");
        self.trigger().await;
    }

    /// Start a background drain unless one is running or nothing is pending.
    /// Returns true when a drain was started.
    pub async fn trigger(&self) -> bool {
        if !self.begin_drain().await {
            return false;
        }
        let Some(queue) = self.this.upgrade() else {
            self.finish_drain().await;
            return false;
        };
        tokio::spawn(async move {
            queue.run_drain().await;
        });
        true
    }

    /// Drain in the caller's task. Returns when the queue is empty, a batch
    /// failed, or immediately when another drain is already running.
    pub async fn drain(&self) -> DrainOutcome {
        {
            let state = self.state.lock().await;
            if state.draining {
                return DrainOutcome::AlreadyRunning;
            }
            if state.pending.is_empty() {
                return DrainOutcome::Idle;
            }
        }
        if !self.begin_drain().await {
            return DrainOutcome::AlreadyRunning;
        }
        self.run_drain().await
    }

    /// Wait until no drain is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.state.lock().await.draining {
                return;
            }
            notified.await;
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_draining(&self) -> bool {
        self.state.lock().await.draining
    }

    /// Copy of the pending messages, head first.
    pub async fn pending_snapshot(&self) -> Vec<PendingMessage> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    // ── Drain internals ─────────────────────────────────────────────

    /// Claim the single drain slot. False when busy or empty.
    async fn begin_drain(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.draining || state.pending.is_empty() {
            return false;
        }
        state.draining = true;
        true
    }

    async fn finish_drain(&self) {
        self.state.lock().await.draining = false;
        self.idle.notify_waiters();
    }

    /// Process batches until empty or a failure. Caller holds the drain slot.
    ///
    /// Boxed because a failed drain schedules a retry that triggers the next one.
    fn run_drain(&self) -> BoxFuture<'_, DrainOutcome> {
        let slot = DrainSlot {
            queue: self,
            held: true,
        };
        Box::pin(async move {
            let mut report = DrainReport::default();

            loop {
                let batch: Vec<PendingMessage> = {
                    let mut state = self.state.lock().await;
                    if state.pending.is_empty() {
                        // Cleared under the same lock that saw the queue empty,
                        // so a concurrent enqueue either lands in this drain or
                        // starts the next one.
                        state.draining = false;
                        drop(state);
                        slot.release();
                        self.idle.notify_waiters();
                        if report.batches > 0 {
                            info!(
                                batches = report.batches,
                                persisted = report.persisted,
                                conflicts = report.conflicts.len(),
                                "Queue drained"
                            );
                        }
                        return DrainOutcome::Drained(report);
                    }
                    let n = self.batch_size.min(state.pending.len());
                    state.pending.drain(..n).collect()
                };

                match self.process_batch(&batch).await {
                    Ok(commit) => {
                        report.batches += 1;
                        report.persisted += commit.persisted;
                        report.conflicts.extend(commit.conflicts);
                        self.state.lock().await.failures = 0;
                    }
                    Err(err) => {
                        report.requeued = batch.len();
                        let (pending, delay) = {
                            let mut state = self.state.lock().await;
                            for message in batch.into_iter().rev() {
                                state.pending.push_front(message);
                            }
                            state.draining = false;
                            state.failures = state.failures.saturating_add(1);
                            (state.pending.len(), self.retry_delay(state.failures))
                        };
                        slot.release();
                        self.idle.notify_waiters();
                        error!(
                            error = %err,
                            requeued = report.requeued,
                            pending,
                            retry_in_ms = delay.as_millis() as u64,
                            "Batch failed; requeued at head"
                        );
                        self.schedule_retry(delay).await;
                        return DrainOutcome::Interrupted { report, error: err };
                    }
                }
            }
        })
    }

    /// Classify a batch concurrently and commit it with one bulk save.
    async fn process_batch(&self, batch: &[PendingMessage]) -> Result<BatchCommit, PipelineError> {
        debug!(size = batch.len(), "Processing batch");

        let results = join_all(batch.iter().map(|message| async move {
            self.limiter.acquire().await;
            self.classifier.classify(message.to_request()).await
        }))
        .await;

        let mut classifications = Vec::with_capacity(results.len());
        let mut failed = 0usize;
        let mut first: Option<ClassifyError> = None;
        for (message, result) in batch.iter().zip(results) {
            match result {
                Ok(c) => classifications.push(c),
                Err(e) => {
                    warn!(external_id = %message.external_id, error = %e, "Classification failed");
                    failed += 1;
                    first.get_or_insert(e);
                }
            }
        }
        if let Some(first) = first {
            return Err(PipelineError::BatchClassification {
                failed,
                batch: batch.len(),
                first,
            });
        }

        let records: Vec<TaskRecord> = batch
            .iter()
            .cloned()
            .zip(classifications)
            .map(|(message, c)| TaskRecord::from_classified(message, c))
            .collect();

        let (saved, conflicts) = self.persist(records).await?;
        let persisted = saved.len();

        if !saved.is_empty() {
            info!(count = persisted, "Processed and saved emails");
            self.publisher
                .publish(UpdateEvent::NewTasks { tasks: saved })
                .await;
        }

        Ok(BatchCommit {
            persisted,
            conflicts,
        })
    }

    /// Bulk save; on a uniqueness conflict drop the duplicates and save the rest.
    async fn persist(
        &self,
        records: Vec<TaskRecord>,
    ) -> Result<(Vec<TaskRecord>, Vec<String>), PipelineError> {
        let err = match self.repository.save(&records).await {
            Ok(saved) => return Ok((saved, Vec::new())),
            Err(e) if e.is_conflict() => e,
            Err(e) => return Err(PipelineError::Persistence(e)),
        };

        warn!(error = %err, "Persistence conflict; skipping duplicate external ids");

        let ids: Vec<String> = records.iter().map(|r| r.external_id.clone()).collect();
        let existing: HashSet<String> = self
            .repository
            .find_by_external_ids(&ids)
            .await?
            .into_iter()
            .map(|t| t.external_id)
            .collect();

        let mut seen = HashSet::new();
        let mut keep = Vec::with_capacity(records.len());
        let mut conflicts = Vec::new();
        for record in records {
            if existing.contains(&record.external_id) || !seen.insert(record.external_id.clone())
            {
                warn!(external_id = %record.external_id, "Dropping duplicate message");
                conflicts.push(record.external_id);
            } else {
                keep.push(record);
            }
        }

        if keep.is_empty() {
            return Ok((Vec::new(), conflicts));
        }

        match self.repository.save(&keep).await {
            Ok(saved) => Ok((saved, conflicts)),
            Err(e) if e.is_conflict() => Err(PipelineError::PersistenceConflict(e.to_string())),
            Err(e) => Err(PipelineError::Persistence(e)),
        }
    }

    /// Exponential delay with up to 10% jitter, capped at `retry_max`.
    fn retry_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let base = self
            .retry_initial
            .saturating_mul(1u32 << exp)
            .min(self.retry_max);
        let jitter_ms = (base.as_millis() as u64) / 10;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        base + jitter
    }

    async fn schedule_retry(&self, delay: Duration) {
        {
            let mut state = self.state.lock().await;
            if state.retry_scheduled {
                return;
            }
            state.retry_scheduled = true;
        }

        let weak = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(queue) = weak.upgrade() else {
                return;
            };
            queue.state.lock().await.retry_scheduled = false;
            if queue.trigger().await {
                debug!("Retry drain started");
            }
        });
    }
}
