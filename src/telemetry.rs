//! Logging setup and the metric catalog shared by both binaries.

use tracing_subscriber::EnvFilter;

pub const JOBS_SUBMITTED: &str = "transcribe_jobs_submitted_total";
pub const JOBS_COMPLETED: &str = "transcribe_jobs_completed_total";
pub const JOBS_FAILED: &str = "transcribe_jobs_failed_total";
pub const SUBMIT_TIMEOUTS: &str = "transcribe_submit_timeouts_total";
pub const ORPHAN_RESULTS: &str = "transcribe_orphan_results_total";
pub const REDELIVERIES: &str = "transcribe_redeliveries_total";
pub const PROCESSING_SECONDS: &str = "transcribe_processing_seconds";
pub const INFLIGHT_WAITERS: &str = "transcribe_inflight_waiters";

/// Structured JSON logs, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

pub fn describe_metrics() {
    metrics::describe_counter!(JOBS_SUBMITTED, "Total transcription jobs published");
    metrics::describe_counter!(JOBS_COMPLETED, "Total jobs that produced a success result");
    metrics::describe_counter!(JOBS_FAILED, "Total jobs that produced a failure result");
    metrics::describe_counter!(SUBMIT_TIMEOUTS, "Submit calls that gave up waiting");
    metrics::describe_counter!(ORPHAN_RESULTS, "Results discarded because nobody was waiting");
    metrics::describe_counter!(REDELIVERIES, "Jobs claimed again after a claim timeout");
    metrics::describe_histogram!(PROCESSING_SECONDS, "Time spent in the transcription engine");
    metrics::describe_gauge!(INFLIGHT_WAITERS, "Submit calls currently awaiting a result");
}
