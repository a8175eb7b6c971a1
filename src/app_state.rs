use std::sync::Arc;
use std::time::Duration;

use crate::models::job::TranscribeParams;
use crate::services::{dispatcher::Dispatcher, queue::JobStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub jobs: Arc<JobStore>,
    pub submit_timeout: Duration,
    /// Applied to fields the request leaves unset.
    pub defaults: TranscribeParams,
    /// Speaker bounds used when diarization is requested without any.
    pub diarize_bounds: (u32, u32),
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        jobs: Arc<JobStore>,
        submit_timeout: Duration,
        defaults: TranscribeParams,
        diarize_bounds: (u32, u32),
    ) -> Self {
        Self {
            dispatcher,
            jobs,
            submit_timeout,
            defaults,
            diarize_bounds,
        }
    }
}
