//! Result channel: one shared results stream, fanned out to every dispatcher.
//!
//! Each dispatcher instance subscribes with its own consumer group, so every
//! instance sees every result and keeps only the ones it is waiting for.
//! Results nobody claims are removed by retention trimming.

use std::sync::Arc;
use std::time::Duration;

use super::queue::QueueError;
use super::stream_log::{ClaimRequest, Offset, StreamLog};
use crate::models::job::JobId;
use crate::models::result::JobResult;

const RESULTS_STREAM: &str = "results";

/// Key of the marker recording that `job_id` has a published result.
pub(crate) fn result_marker_key(prefix: &str, job_id: JobId) -> String {
    format!("{prefix}:result:{job_id}")
}

/// A result read from the channel together with its position.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub offset: Offset,
    pub result: JobResult,
}

pub struct ResultChannel {
    log: Arc<dyn StreamLog>,
    stream: String,
    prefix: String,
    retention: Duration,
}

impl ResultChannel {
    pub fn new(log: Arc<dyn StreamLog>, prefix: &str, retention: Duration) -> Self {
        Self {
            log,
            stream: format!("{prefix}:{RESULTS_STREAM}"),
            prefix: prefix.to_string(),
            retention,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn published_key(&self, job_id: JobId) -> String {
        result_marker_key(&self.prefix, job_id)
    }

    /// Append a result and remember that `job_id` has one.
    pub async fn publish(&self, result: &JobResult) -> Result<Offset, QueueError> {
        let payload = serde_json::to_string(result)?;
        let offset = self.log.append(&self.stream, &payload).await?;
        self.log
            .put_marker(&self.published_key(result.job_id()), self.retention)
            .await?;

        tracing::debug!(
            job_id = %result.job_id(),
            status = %result.status(),
            offset = %offset,
            "Result published"
        );
        Ok(offset)
    }

    /// Whether a result for `job_id` was published within the retention window.
    pub async fn already_published(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.log.has_marker(&self.published_key(job_id)).await
    }

    /// Start reading under `group`. Only results published afterwards are seen.
    pub async fn subscribe(&self, group: &str) -> Result<(), QueueError> {
        self.log.ensure_group(&self.stream, group, false).await
    }

    pub async fn unsubscribe(&self, group: &str) -> Result<(), QueueError> {
        self.log.drop_group(&self.stream, group).await
    }

    /// Read the next batch for `group`. Undecodable records are acknowledged
    /// and dropped here.
    pub async fn receive(
        &self,
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let entries = self
            .log
            .claim(
                &self.stream,
                ClaimRequest {
                    group,
                    consumer,
                    max: max.max(1),
                    block,
                    min_idle: self.retention,
                },
            )
            .await?;

        let mut deliveries = Vec::with_capacity(entries.len());
        let mut dropped = Vec::new();
        for entry in entries {
            match serde_json::from_str::<JobResult>(&entry.payload) {
                Ok(result) => deliveries.push(Delivery {
                    offset: entry.offset,
                    result,
                }),
                Err(e) => {
                    tracing::warn!(offset = %entry.offset, error = %e, "Dropping malformed result record");
                    dropped.push(entry.offset);
                }
            }
        }

        if !dropped.is_empty() {
            self.log.ack(&self.stream, group, &dropped).await?;
        }
        Ok(deliveries)
    }

    pub async fn ack(&self, group: &str, offsets: &[Offset]) -> Result<u64, QueueError> {
        self.log.ack(&self.stream, group, offsets).await
    }

    /// Remove results older than the retention window.
    pub async fn trim(&self) -> Result<u64, QueueError> {
        self.log.trim_older_than(&self.stream, self.retention).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::result::{ErrorKind, Transcript};
    use crate::services::memory_log::MemoryLog;

    fn channel(retention: Duration) -> ResultChannel {
        ResultChannel::new(Arc::new(MemoryLog::new()), "test", retention)
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_result() {
        let channel = channel(Duration::from_secs(60));
        channel.subscribe("a").await.unwrap();
        channel.subscribe("b").await.unwrap();

        let result = JobResult::failure(JobId::new(), ErrorKind::ProcessingFailure, "boom");
        channel.publish(&result).await.unwrap();

        for group in ["a", "b"] {
            let got = channel.receive(group, "c", 10, Duration::ZERO).await.unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].result, result);
        }
    }

    #[tokio::test]
    async fn test_marks_published_job_ids() {
        let channel = channel(Duration::from_secs(60));
        let id = JobId::new();
        assert!(!channel.already_published(id).await.unwrap());

        let result = JobResult::success(
            id,
            Transcript {
                text: "ok".to_string(),
                segments: vec![],
            },
        );
        channel.publish(&result).await.unwrap();
        assert!(channel.already_published(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_trim_removes_unclaimed_results() {
        let channel = channel(Duration::from_millis(20));
        channel.subscribe("late").await.unwrap();
        channel
            .publish(&JobResult::failure(JobId::new(), ErrorKind::InputMissing, "gone"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.trim().await.unwrap(), 1);

        let got = channel.receive("late", "c", 10, Duration::ZERO).await.unwrap();
        assert!(got.is_empty());
    }
}
