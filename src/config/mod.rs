use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::models::job::TranscribeParams;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Front door bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Worker health/metrics bind address.
    #[serde(default = "default_worker_bind_addr")]
    pub worker_bind_addr: String,

    /// Redis connection string for the job and result streams
    pub redis_url: String,

    /// Namespace for every stream and marker key
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    /// Consumer group shared by all workers
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Name of this process inside its group, unique per process
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Shared directory where inputs are staged for workers
    #[serde(default = "default_blob_base_dir")]
    pub blob_base_dir: PathBuf,

    /// A claimed job idle for longer than this is handed to another worker
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,

    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Jobs one worker process runs concurrently
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,

    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,

    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: u64,

    /// Approximate cap applied on every append
    #[serde(default = "default_max_stream_length")]
    pub max_stream_length: usize,

    #[serde(default = "default_result_retention_secs")]
    pub result_retention_secs: u64,

    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    #[serde(default = "default_blob_retention_secs")]
    pub blob_retention_secs: u64,

    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,

    /// Transcription command run by workers, e.g. "python -m transcriber"
    pub processor_command: Option<String>,

    /// Compute device handed to the engine ("cpu", "cuda")
    #[serde(default = "default_device")]
    pub device: String,

    /// Hugging Face token for diarization models
    pub hf_token: Option<String>,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_language")]
    pub default_language: String,

    /// Speaker bounds used when diarization is requested without any
    #[serde(default = "default_diarize_min_speakers")]
    pub diarize_min_speakers: u32,

    #[serde(default = "default_diarize_max_speakers")]
    pub diarize_max_speakers: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_stream_prefix() -> String {
    "transcribe".to_string()
}

fn default_consumer_group() -> String {
    "transcribe-workers".to_string()
}

fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{}-{}", host, std::process::id())
}

fn default_blob_base_dir() -> PathBuf {
    std::env::temp_dir().join("transcribe-blobs")
}

fn default_claim_timeout_secs() -> u64 {
    600
}

fn default_block_ms() -> u64 {
    5000
}

fn default_batch_size() -> usize {
    1
}

fn default_worker_slots() -> usize {
    1
}

fn default_submit_timeout_secs() -> u64 {
    1800
}

fn default_max_input_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_max_stream_length() -> usize {
    10_000
}

fn default_result_retention_secs() -> u64 {
    15 * 60
}

fn default_job_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_blob_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_janitor_interval_secs() -> u64 {
    60
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_model() -> String {
    "medium".to_string()
}

fn default_language() -> String {
    "Russian".to_string()
}

fn default_diarize_min_speakers() -> u32 {
    2
}

fn default_diarize_max_speakers() -> u32 {
    5
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn blob_retention(&self) -> Duration {
        Duration::from_secs(self.blob_retention_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }

    /// Parameters applied to requests that leave fields unset.
    pub fn default_params(&self) -> TranscribeParams {
        TranscribeParams {
            model: self.default_model.clone(),
            language: self.default_language.clone(),
            ..TranscribeParams::default()
        }
    }

    /// Speaker bounds used when diarization is on and the caller gave none.
    pub fn diarize_bounds(&self) -> (u32, u32) {
        (self.diarize_min_speakers, self.diarize_max_speakers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_env() {
        let vars = vec![("REDIS_URL".to_string(), "redis://127.0.0.1/".to_string())];
        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.stream_prefix, "transcribe");
        assert_eq!(config.consumer_group, "transcribe-workers");
        assert_eq!(config.claim_timeout(), Duration::from_secs(600));
        assert_eq!(config.result_retention(), Duration::from_secs(900));
        assert_eq!(config.submit_timeout(), Duration::from_secs(1800));
        assert_eq!(config.max_stream_length, 10_000);
        assert!(config.processor_command.is_none());
        assert_eq!(config.diarize_bounds(), (2, 5));
        assert_eq!(config.default_params().language, "Russian");
    }

    #[test]
    fn test_overrides() {
        let vars = vec![
            ("REDIS_URL".to_string(), "redis://cache:6379/".to_string()),
            ("WORKER_SLOTS".to_string(), "4".to_string()),
            ("BLOCK_MS".to_string(), "250".to_string()),
            ("DEFAULT_LANGUAGE".to_string(), "English".to_string()),
            ("PROCESSOR_COMMAND".to_string(), "python -m engine".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.worker_slots, 4);
        assert_eq!(config.block(), Duration::from_millis(250));
        assert_eq!(config.default_params().language, "English");
        assert_eq!(config.processor_command.as_deref(), Some("python -m engine"));
    }

    #[test]
    fn test_missing_redis_url_is_an_error() {
        let vars: Vec<(String, String)> = vec![];
        assert!(envy::from_iter::<_, AppConfig>(vars).is_err());
    }
}
