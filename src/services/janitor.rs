//! Periodic retention sweep over both streams and the blob area.

use std::sync::Arc;
use std::time::Duration;

use super::queue::JobStore;
use super::results::ResultChannel;
use super::shutdown::ShutdownSignal;
use super::storage::BlobArea;

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub jobs: Duration,
    pub blobs: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub results_trimmed: u64,
    pub jobs_trimmed: u64,
    pub blobs_removed: usize,
}

pub struct Janitor {
    jobs: Arc<JobStore>,
    results: Arc<ResultChannel>,
    blobs: Arc<BlobArea>,
    policy: RetentionPolicy,
}

impl Janitor {
    pub fn new(
        jobs: Arc<JobStore>,
        results: Arc<ResultChannel>,
        blobs: Arc<BlobArea>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            jobs,
            results,
            blobs,
            policy,
        }
    }

    /// One pass. A failing step is logged and the others still run.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.results.trim().await {
            Ok(n) => report.results_trimmed = n,
            Err(e) => tracing::warn!(error = %e, "Failed to trim results stream"),
        }
        match self.jobs.trim(self.policy.jobs).await {
            Ok(n) => report.jobs_trimmed = n,
            Err(e) => tracing::warn!(error = %e, "Failed to trim jobs stream"),
        }
        match self.blobs.sweep_older_than(self.policy.blobs).await {
            Ok(n) => report.blobs_removed = n,
            Err(e) => tracing::warn!(error = %e, "Failed to sweep blob area"),
        }

        if report != SweepReport::default() {
            tracing::info!(
                results_trimmed = report.results_trimmed,
                jobs_trimmed = report.jobs_trimmed,
                blobs_removed = report.blobs_removed,
                "Retention sweep"
            );
        }
        report
    }

    pub async fn run(self, interval: Duration, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        tracing::debug!("Janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{Job, JobId, MediaFormat, TranscribeParams};
    use crate::models::result::{JobResult, Transcript};
    use crate::services::memory_log::MemoryLog;
    use crate::services::queue::StoreSettings;
    use crate::services::stream_log::StreamLog;

    #[tokio::test]
    async fn test_sweep_trims_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log: Arc<dyn StreamLog> = Arc::new(MemoryLog::new());
        let jobs = Arc::new(JobStore::new(
            Arc::clone(&log),
            StoreSettings {
                prefix: "t".into(),
                claim_timeout: Duration::from_secs(60),
                retention: Duration::from_secs(60),
            },
        ));
        let results = Arc::new(ResultChannel::new(Arc::clone(&log), "t", Duration::ZERO));
        let blobs = Arc::new(BlobArea::new(dir.path(), 1024));

        let job_id = JobId::new();
        let input_ref = blobs.stage(job_id, MediaFormat::Ogg, b"OggS").await.unwrap();
        jobs.publish(&Job {
            job_id,
            input_ref,
            parameters: TranscribeParams::default(),
            submitted_at: chrono::Utc::now(),
            requester_context: serde_json::Value::Null,
            reply_to: None,
        })
        .await
        .unwrap();
        results
            .publish(&JobResult::success(
                job_id,
                Transcript {
                    text: "ok".into(),
                    segments: vec![],
                },
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        let janitor = Janitor::new(
            Arc::clone(&jobs),
            Arc::clone(&results),
            Arc::clone(&blobs),
            RetentionPolicy {
                jobs: Duration::from_secs(3600),
                blobs: Duration::ZERO,
            },
        );
        let report = janitor.sweep().await;
        assert_eq!(report.results_trimmed, 1);
        assert_eq!(report.jobs_trimmed, 0);
        assert_eq!(report.blobs_removed, 1);
    }
}
