//! Adapters for the external transcription engine.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::models::job::{JobId, TranscribeParams};
use crate::models::result::{ErrorKind, Transcript};

/// Everything the engine needs for one job.
#[derive(Debug, Clone)]
pub struct ProcessInput {
    pub job_id: JobId,
    pub path: PathBuf,
    pub params: TranscribeParams,
}

/// The black-box `process(audio) -> transcript` step. May run for minutes.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, input: &ProcessInput) -> Result<Transcript, ProcessError>;
}

/// Runs a transcription command once per job and reads its JSON output.
///
/// The command receives `--input <path> --model <m> --language <l>
/// --device <d>` plus the diarization flags when requested, and must print
/// `{"text": ..., "segments": [...]}` on stdout.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    device: String,
    hf_token: Option<String>,
}

impl CommandProcessor {
    /// Build from a whitespace-separated command line.
    pub fn from_command_line(command: &str, device: &str, hf_token: Option<String>) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            device: device.to_string(),
            hf_token: hf_token.filter(|token| !token.is_empty()),
        })
    }

    fn command(&self, input: &ProcessInput) -> Command {
        let params = &input.params;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--input")
            .arg(&input.path)
            .arg("--model")
            .arg(&params.model)
            .arg("--language")
            .arg(&params.language)
            .arg("--device")
            .arg(&self.device);

        if params.diarize {
            cmd.arg("--diarize");
            for (flag, value) in [
                ("--num-speakers", params.num_speakers),
                ("--min-speakers", params.min_speakers),
                ("--max-speakers", params.max_speakers),
            ] {
                if let Some(value) = value {
                    cmd.arg(flag).arg(value.to_string());
                }
            }
        }

        if let Some(token) = &self.hf_token {
            cmd.env("HF_TOKEN", token);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn process(&self, input: &ProcessInput) -> Result<Transcript, ProcessError> {
        if !input.path.is_file() {
            return Err(ProcessError::InputMissing(input.path.display().to_string()));
        }

        tracing::debug!(job_id = %input.job_id, program = %self.program, "Starting transcription command");
        let output = self.command(input).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no output")
                .trim()
                .to_string();
            return Err(ProcessError::Failed(format!("{} ({})", reason, output.status)));
        }

        serde_json::from_slice(&output.stdout).map_err(ProcessError::InvalidOutput)
    }
}

type BlockingFn = dyn Fn(&ProcessInput) -> Result<Transcript, ProcessError> + Send + Sync;

/// Wraps a synchronous engine call so it runs on the blocking thread pool.
#[derive(Clone)]
pub struct BlockingProcessor {
    f: Arc<BlockingFn>,
}

impl BlockingProcessor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ProcessInput) -> Result<Transcript, ProcessError> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl Processor for BlockingProcessor {
    async fn process(&self, input: &ProcessInput) -> Result<Transcript, ProcessError> {
        let f = Arc::clone(&self.f);
        let input = input.clone();
        tokio::task::spawn_blocking(move || f(&input))
            .await
            .map_err(|e| ProcessError::Failed(format!("engine task aborted: {e}")))?
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Input missing or unreadable: {0}")]
    InputMissing(String),

    #[error("Transcription failed: {0}")]
    Failed(String),

    #[error("Engine output is not a transcript: {0}")]
    InvalidOutput(#[from] serde_json::Error),

    #[error("Failed to run engine: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InputMissing(_) => ErrorKind::InputMissing,
            _ => ErrorKind::ProcessingFailure,
        }
    }
}
