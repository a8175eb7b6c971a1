//! Producer side: stage input, publish a job, wait for its result.
//!
//! Every dispatcher instance owns a private consumer group on the results
//! stream and a table of in-flight waiters keyed by job id. A single delivery
//! loop reads all results and hands each one to its waiter. Results addressed
//! to another instance are skipped; results of this instance that nobody is
//! waiting for are orphans and are logged and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::queue::{JobStore, QueueError};
use super::results::ResultChannel;
use super::shutdown::ShutdownSignal;
use super::storage::{BlobArea, StorageError};
use crate::models::job::{Job, JobId, MediaFormat, TranscribeParams};
use crate::models::result::JobResult;
use crate::telemetry;

const DELIVERY_BATCH: usize = 64;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Results group private to this instance, e.g. `dispatch:<host>-<pid>`.
    pub group: String,
    pub consumer: String,
    /// How long one read of the results stream may block.
    pub block: Duration,
}

/// One inbound unit of work.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub data: Vec<u8>,
    pub format: MediaFormat,
    pub params: TranscribeParams,
    pub requester: serde_json::Value,
}

type Waiters = Mutex<HashMap<JobId, oneshot::Sender<JobResult>>>;

/// Removes its waiter entry when dropped, whether the submit call finished,
/// timed out or was cancelled.
struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    job_id: JobId,
}

impl<'a> WaiterGuard<'a> {
    fn register(waiters: &'a Waiters, job_id: JobId) -> (Self, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        let inflight = {
            let mut map = lock(waiters);
            map.insert(job_id, tx);
            map.len()
        };
        metrics::gauge!(telemetry::INFLIGHT_WAITERS).set(inflight as f64);
        (Self { waiters, job_id }, rx)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let inflight = {
            let mut map = lock(self.waiters);
            map.remove(&self.job_id);
            map.len()
        };
        metrics::gauge!(telemetry::INFLIGHT_WAITERS).set(inflight as f64);
    }
}

fn lock(waiters: &Waiters) -> std::sync::MutexGuard<'_, HashMap<JobId, oneshot::Sender<JobResult>>> {
    waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Dispatcher {
    jobs: Arc<JobStore>,
    results: Arc<ResultChannel>,
    blobs: Arc<BlobArea>,
    settings: DispatcherSettings,
    waiters: Waiters,
    orphans: AtomicU64,
    /// Set once the delivery loop has exited; no result can arrive after that.
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<JobStore>,
        results: Arc<ResultChannel>,
        blobs: Arc<BlobArea>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            jobs,
            results,
            blobs,
            settings,
            waiters: Mutex::new(HashMap::new()),
            orphans: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to the results stream and start the delivery loop.
    ///
    /// Must complete before the first `submit`, otherwise results published
    /// before the subscription exists are never seen by this instance.
    pub async fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> Result<JoinHandle<()>, QueueError> {
        self.results.subscribe(&self.settings.group).await?;
        tracing::info!(group = %self.settings.group, "Dispatcher subscribed to results");

        let dispatcher = Arc::clone(self);
        Ok(tokio::spawn(async move { dispatcher.delivery_loop(shutdown).await }))
    }

    /// Submit work and wait up to `timeout` for its result.
    ///
    /// Both outcomes of processing come back as `Ok(JobResult)`. On timeout
    /// the job keeps running; its late result is dropped as an orphan.
    pub async fn submit(&self, request: SubmitRequest, timeout: Duration) -> Result<JobResult, DispatchError> {
        request
            .params
            .check()
            .map_err(DispatchError::InvalidParameters)?;

        let job_id = JobId::new();
        if self.is_closed() {
            return Err(DispatchError::Closed { job_id });
        }

        let input_ref = self
            .blobs
            .stage(job_id, request.format, &request.data)
            .await?;

        let job = Job {
            job_id,
            input_ref,
            parameters: request.params,
            submitted_at: Utc::now(),
            requester_context: request.requester,
            reply_to: Some(self.settings.group.clone()),
        };

        // Register before publishing so even an instant result finds its waiter.
        let (_guard, rx) = WaiterGuard::register(&self.waiters, job_id);

        // The loop may have drained the table between the first check and
        // the registration above.
        if self.is_closed() {
            self.discard_input(job_id).await;
            return Err(DispatchError::Closed { job_id });
        }

        if let Err(e) = self.jobs.publish(&job).await {
            self.discard_input(job_id).await;
            return Err(DispatchError::Queue(e));
        }

        metrics::counter!(telemetry::JOBS_SUBMITTED).increment(1);
        tracing::info!(
            job_id = %job_id,
            model = %job.parameters.model,
            language = %job.parameters.language,
            "Job submitted, awaiting result"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(DispatchError::Closed { job_id }),
            Err(_) => {
                metrics::counter!(telemetry::SUBMIT_TIMEOUTS).increment(1);
                tracing::warn!(job_id = %job_id, timeout_ms = timeout.as_millis() as u64, "Gave up waiting for result");
                Err(DispatchError::Timeout { job_id })
            }
        }
    }

    async fn discard_input(&self, job_id: JobId) {
        if let Err(cleanup) = self.blobs.remove(job_id).await {
            tracing::warn!(job_id = %job_id, error = %cleanup, "Failed to remove staged input");
        }
    }

    /// Whether the delivery loop has stopped. `submit` then fails fast.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of `submit` calls currently waiting.
    pub fn inflight(&self) -> usize {
        lock(&self.waiters).len()
    }

    /// Results dropped because nobody was waiting for them.
    pub fn orphan_count(&self) -> u64 {
        self.orphans.load(Ordering::Relaxed)
    }

    /// Hand a result to its waiter. Returns false when it is not ours or is
    /// an orphan.
    fn deliver(&self, result: JobResult) -> bool {
        let job_id = result.job_id();
        if let Some(owner) = result.reply_to() {
            if owner != self.settings.group {
                tracing::debug!(job_id = %job_id, owner, "Skipping result for another dispatcher");
                return false;
            }
        }
        let Some(tx) = lock(&self.waiters).remove(&job_id) else {
            self.record_orphan(job_id);
            return false;
        };

        // The receiver can vanish between the lookup and the send when the
        // waiter times out at that instant.
        if tx.send(result).is_err() {
            self.record_orphan(job_id);
            return false;
        }
        true
    }

    fn record_orphan(&self, job_id: JobId) {
        self.orphans.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::ORPHAN_RESULTS).increment(1);
        tracing::warn!(job_id = %job_id, "Orphan result discarded, no waiter");
    }

    async fn delivery_loop(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let DispatcherSettings {
            group,
            consumer,
            block,
        } = self.settings.clone();

        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                batch = self.results.receive(&group, &consumer, DELIVERY_BATCH, block) => batch,
            };

            match batch {
                Ok(deliveries) => {
                    let mut offsets = Vec::with_capacity(deliveries.len());
                    for delivery in deliveries {
                        offsets.push(delivery.offset);
                        self.deliver(delivery.result);
                    }
                    if let Err(e) = self.results.ack(&group, &offsets).await {
                        tracing::error!(error = %e, "Failed to acknowledge results");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read results, retrying");
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        // Flag first: a submit that registers after the drain sees it.
        self.closed.store(true, Ordering::SeqCst);

        // Dropping the senders wakes every waiter with `Closed`.
        let abandoned = std::mem::take(&mut *lock(&self.waiters));
        if !abandoned.is_empty() {
            tracing::warn!(count = abandoned.len(), "Dispatcher stopping with jobs still in flight");
        }
        drop(abandoned);

        if let Err(e) = self.results.unsubscribe(&group).await {
            tracing::warn!(group = %group, error = %e, "Failed to drop results group");
        }
        tracing::info!("Dispatcher delivery loop stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Job queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Failed to stage input: {0}")]
    StageFailure(#[from] StorageError),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Timed out waiting for result of job {job_id}")]
    Timeout { job_id: JobId },

    #[error("Dispatcher stopped before job {job_id} completed")]
    Closed { job_id: JobId },
}

impl DispatchError {
    /// The job id, once one was assigned.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Timeout { job_id } | Self::Closed { job_id } => Some(*job_id),
            _ => None,
        }
    }
}
