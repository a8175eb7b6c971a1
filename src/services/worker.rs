//! Consumer side: claim jobs, run the engine, publish results, acknowledge.
//!
//! Each claimed job runs as its own task holding one slot permit, so a
//! long transcription never blocks claiming or acknowledging other jobs.
//! On shutdown the worker stops claiming and waits for in-flight jobs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use super::processor::{ProcessInput, Processor};
use super::queue::{ClaimedJob, JobStore, QueueError};
use super::results::ResultChannel;
use super::shutdown::ShutdownSignal;
use super::storage::BlobArea;
use crate::models::job::Job;
use crate::models::result::{ErrorKind, JobResult};
use crate::telemetry;

const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Consumer group shared by every worker of the pool.
    pub group: String,
    /// Name of this worker inside the group.
    pub consumer: String,
    /// Upper bound on jobs claimed in one call.
    pub batch_size: usize,
    /// Jobs processed concurrently by this worker.
    pub slots: usize,
    /// How long one claim may block when the queue is empty.
    pub block: Duration,
}

pub struct Worker {
    jobs: Arc<JobStore>,
    results: Arc<ResultChannel>,
    blobs: Arc<BlobArea>,
    processor: Arc<dyn Processor>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        jobs: Arc<JobStore>,
        results: Arc<ResultChannel>,
        blobs: Arc<BlobArea>,
        processor: Arc<dyn Processor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            jobs,
            results,
            blobs,
            processor,
            settings,
        }
    }

    /// Claim and process jobs until `shutdown` fires, then drain.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) -> Result<(), QueueError> {
        let WorkerSettings {
            group,
            consumer,
            batch_size,
            slots,
            block,
        } = self.settings.clone();

        self.jobs.ensure_group(&group).await?;
        tracing::info!(group = %group, consumer = %consumer, slots, "Worker ready, starting job processing loop");

        let semaphore = Arc::new(Semaphore::new(slots.max(1)));
        let mut inflight = JoinSet::new();

        loop {
            while let Some(joined) = inflight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Job task panicked");
                }
            }

            // Only claim as many jobs as there are free slots.
            let first = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut permits: Vec<OwnedSemaphorePermit> = vec![first];
            while permits.len() < batch_size.max(1) {
                match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let claimed = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                claimed = self.jobs.claim(&group, &consumer, permits.len(), block) => claimed,
            };

            match claimed {
                Ok(batch) => {
                    for job in batch {
                        let Some(permit) = permits.pop() else {
                            break;
                        };
                        let worker = Arc::clone(&self);
                        inflight.spawn(async move {
                            let _permit = permit;
                            let job_id = job.job.job_id;
                            if let Err(e) = worker.handle(job).await {
                                tracing::error!(
                                    job_id = %job_id,
                                    error = %e,
                                    "Job left unacknowledged, it will be redelivered"
                                );
                            }
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error claiming jobs, will retry");
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        tracing::info!(inflight = inflight.len(), "Shutdown requested, draining in-flight jobs");
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Job task panicked during shutdown");
            }
        }
        tracing::info!("Worker stopped");
        Ok(())
    }

    /// Process one claimed job end to end.
    ///
    /// The result is published before the input is removed and the job is
    /// acknowledged. If publishing fails the job stays pending and is
    /// redelivered after the claim timeout.
    pub async fn handle(&self, claimed: ClaimedJob) -> Result<(), QueueError> {
        let job_id = claimed.job.job_id;

        if claimed.redelivered {
            metrics::counter!(telemetry::REDELIVERIES).increment(1);
            tracing::warn!(job_id = %job_id, offset = %claimed.offset, "Processing redelivered job");
        }

        if self.results.already_published(job_id).await? {
            tracing::info!(job_id = %job_id, "Result already published, skipping duplicate run");
            self.cleanup_input(&claimed.job).await;
            self.jobs.complete(&self.settings.group, &claimed).await?;
            return Ok(());
        }

        tracing::info!(job_id = %job_id, input_ref = %claimed.job.input_ref, "Processing transcription job");
        let result = self
            .execute(&claimed.job)
            .await
            .with_worker(self.settings.consumer.clone())
            .with_reply_to(claimed.job.reply_to.clone());

        if result.is_success() {
            metrics::counter!(telemetry::JOBS_COMPLETED).increment(1);
        } else {
            metrics::counter!(telemetry::JOBS_FAILED).increment(1);
        }

        self.results.publish(&result).await?;
        self.cleanup_input(&claimed.job).await;
        self.jobs.complete(&self.settings.group, &claimed).await?;

        tracing::info!(job_id = %job_id, status = %result.status(), "Job acknowledged");
        Ok(())
    }

    /// Run the engine. Every failure becomes a failure result.
    async fn execute(&self, job: &Job) -> JobResult {
        if let Err(reason) = job.parameters.check() {
            return JobResult::failure(job.job_id, ErrorKind::InvalidParameters, reason);
        }

        let path = match self.blobs.resolve(&job.input_ref).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "Input unavailable");
                return JobResult::failure(job.job_id, ErrorKind::InputMissing, e.to_string());
            }
        };

        let input = ProcessInput {
            job_id: job.job_id,
            path,
            params: job.parameters.clone(),
        };

        let start = Instant::now();
        let outcome = self.processor.process(&input).await;
        let elapsed = start.elapsed();
        metrics::histogram!(telemetry::PROCESSING_SECONDS).record(elapsed.as_secs_f64());

        match outcome {
            Ok(transcript) => {
                tracing::info!(
                    job_id = %job.job_id,
                    duration_ms = elapsed.as_millis() as u64,
                    segments = transcript.segments.len(),
                    "Transcription complete"
                );
                JobResult::success(job.job_id, transcript)
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Transcription failed");
                JobResult::failure(job.job_id, e.kind(), e.to_string())
            }
        }
    }

    async fn cleanup_input(&self, job: &Job) {
        if let Err(e) = self.blobs.remove(job.job_id).await {
            tracing::warn!(job_id = %job.job_id, error = %e, "Failed to remove staged input");
        }
    }
}
