use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::results::result_marker_key;
use super::stream_log::{ClaimRequest, Offset, StreamLog};
use crate::models::job::{Job, JobId};

const JOBS_STREAM: &str = "jobs";
const PENDING_SCAN_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Namespace for stream and marker keys (e.g. "transcribe").
    pub prefix: String,
    /// Claims idle for this long are handed to another group member.
    pub claim_timeout: Duration,
    /// How long the duplicate-submission guard for a job id lives.
    pub retention: Duration,
}

/// A job handed to one consumer of a group.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub offset: Offset,
    pub job: Job,
    pub redelivered: bool,
}

/// Claimed but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub offset: Offset,
    /// `None` when the record was trimmed or could not be decoded.
    pub job: Option<Job>,
    pub claimed_by: String,
    pub claimed_at: DateTime<Utc>,
    pub delivery_count: u64,
}

/// Durable, ordered job queue with consumer-group claims.
pub struct JobStore {
    log: Arc<dyn StreamLog>,
    stream: String,
    prefix: String,
    settings: StoreSettings,
}

impl JobStore {
    pub fn new(log: Arc<dyn StreamLog>, settings: StoreSettings) -> Self {
        Self {
            log,
            stream: format!("{}:{JOBS_STREAM}", settings.prefix),
            prefix: settings.prefix.clone(),
            settings,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    fn active_key(&self, job_id: JobId) -> String {
        format!("{}:active:{job_id}", self.prefix)
    }

    /// Create the consumer group. Workers call this on startup; jobs published
    /// before any worker existed are still delivered.
    pub async fn ensure_group(&self, group: &str) -> Result<(), QueueError> {
        self.log.ensure_group(&self.stream, group, true).await
    }

    /// Append a job. Rejects a job id that is already live in the queue.
    pub async fn publish(&self, job: &Job) -> Result<Offset, QueueError> {
        let payload = serde_json::to_string(job)?;

        let key = self.active_key(job.job_id);
        if !self.log.put_marker(&key, self.settings.retention).await? {
            return Err(QueueError::DuplicateJob(job.job_id));
        }

        // A reused id must not inherit the finished run's result marker, or
        // workers would skip it as already processed.
        let stale = result_marker_key(&self.prefix, job.job_id);
        if let Err(e) = self.log.remove_marker(&stale).await {
            self.release(&key, job.job_id).await;
            return Err(e);
        }

        match self.log.append(&self.stream, &payload).await {
            Ok(offset) => {
                tracing::debug!(job_id = %job.job_id, offset = %offset, "Job published");
                Ok(offset)
            }
            Err(e) => {
                self.release(&key, job.job_id).await;
                Err(e)
            }
        }
    }

    async fn release(&self, key: &str, job_id: JobId) {
        if let Err(cleanup) = self.log.remove_marker(key).await {
            tracing::warn!(job_id = %job_id, error = %cleanup, "Failed to release job guard");
        }
    }

    /// Claim up to `max_batch` jobs for `consumer`, blocking up to
    /// `block_timeout` when nothing is available.
    ///
    /// Records that cannot be decoded are acknowledged and skipped so they do
    /// not come back after every claim timeout.
    pub async fn claim(
        &self,
        group: &str,
        consumer: &str,
        max_batch: usize,
        block_timeout: Duration,
    ) -> Result<Vec<ClaimedJob>, QueueError> {
        let entries = self
            .log
            .claim(
                &self.stream,
                ClaimRequest {
                    group,
                    consumer,
                    max: max_batch.max(1),
                    block: block_timeout,
                    min_idle: self.settings.claim_timeout,
                },
            )
            .await?;

        let mut claimed = Vec::with_capacity(entries.len());
        let mut poisoned = Vec::new();
        for entry in entries {
            match serde_json::from_str::<Job>(&entry.payload) {
                Ok(job) => claimed.push(ClaimedJob {
                    offset: entry.offset,
                    job,
                    redelivered: entry.redelivered,
                }),
                Err(e) => {
                    tracing::warn!(offset = %entry.offset, error = %e, "Dropping malformed job record");
                    poisoned.push(entry.offset);
                }
            }
        }

        if !poisoned.is_empty() {
            self.log.ack(&self.stream, group, &poisoned).await?;
        }

        Ok(claimed)
    }

    /// Mark the job at `offset` as processed by `group`. Returns false when it
    /// was already acknowledged.
    pub async fn ack(&self, group: &str, offset: &Offset) -> Result<bool, QueueError> {
        let acked = self
            .log
            .ack(&self.stream, group, std::slice::from_ref(offset))
            .await?;
        Ok(acked > 0)
    }

    /// Acknowledge a claimed job and release its id for reuse.
    pub async fn complete(&self, group: &str, claimed: &ClaimedJob) -> Result<bool, QueueError> {
        let acked = self.ack(group, &claimed.offset).await?;
        self.log.remove_marker(&self.active_key(claimed.job.job_id)).await?;
        Ok(acked)
    }

    pub async fn pending(&self, group: &str) -> Result<Vec<PendingJob>, QueueError> {
        let entries = self
            .log
            .pending(&self.stream, group, PENDING_SCAN_LIMIT)
            .await?;
        let now = Utc::now();

        Ok(entries
            .into_iter()
            .map(|entry| PendingJob {
                job: entry
                    .payload
                    .as_deref()
                    .and_then(|payload| serde_json::from_str(payload).ok()),
                claimed_at: now
                    - chrono::Duration::from_std(entry.idle).unwrap_or_else(|_| chrono::Duration::zero()),
                offset: entry.offset,
                claimed_by: entry.consumer,
                delivery_count: entry.delivery_count,
            })
            .collect())
    }

    /// Drop job records older than `age` from the stream.
    pub async fn trim(&self, age: Duration) -> Result<u64, QueueError> {
        self.log.trim_older_than(&self.stream, age).await
    }

    /// Check queue connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.log.ping().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Malformed stream reply: {0}")]
    Malformed(String),

    #[error("Consumer group {group} does not exist on {stream}")]
    UnknownGroup { stream: String, group: String },

    #[error("Job {0} is already queued")]
    DuplicateJob(JobId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::TranscribeParams;
    use crate::services::memory_log::MemoryLog;

    fn store(log: Arc<dyn StreamLog>) -> JobStore {
        JobStore::new(
            log,
            StoreSettings {
                prefix: "test".to_string(),
                claim_timeout: Duration::from_secs(30),
                retention: Duration::from_secs(60),
            },
        )
    }

    fn job() -> Job {
        Job {
            job_id: JobId::new(),
            input_ref: "/tmp/blobs/x/input.ogg".to_string(),
            parameters: TranscribeParams::default(),
            submitted_at: Utc::now(),
            requester_context: serde_json::Value::Null,
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped_and_acked() {
        let log: Arc<dyn StreamLog> = Arc::new(MemoryLog::new());
        let store = store(log.clone());
        store.ensure_group("g").await.unwrap();

        log.append(store.stream(), "{not json").await.unwrap();
        let good = job();
        store.publish(&good).await.unwrap();

        let claimed = store.claim("g", "c", 10, Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job, good);

        let pending = store.pending("g").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].offset, claimed[0].offset);
    }

    #[tokio::test]
    async fn test_stream_name_uses_prefix() {
        let store = store(Arc::new(MemoryLog::new()));
        assert_eq!(store.stream(), "test:jobs");
    }
}
