//! Shared fixtures for integration tests: an in-memory stack and a fake engine.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use transcribe_dispatch::models::job::{MediaFormat, TranscribeParams};
use transcribe_dispatch::models::result::{Segment, Transcript};
use transcribe_dispatch::services::{
    dispatcher::{Dispatcher, DispatcherSettings, SubmitRequest},
    memory_log::MemoryLog,
    processor::{ProcessError, ProcessInput, Processor},
    queue::{JobStore, QueueError, StoreSettings},
    results::ResultChannel,
    shutdown::{self, ShutdownHandle},
    storage::BlobArea,
    stream_log::StreamLog,
    worker::{Worker, WorkerSettings},
};

pub const PREFIX: &str = "test";
pub const WORKER_GROUP: &str = "transcribe-workers";
pub const BLOCK: Duration = Duration::from_millis(50);

/// What the fake engine does with each input.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Return this transcript.
    Fixed(Transcript),
    /// Return the staged file's contents as the transcript text.
    Echo,
    /// Fail with this message.
    Fail(String),
}

pub struct FakeEngine {
    behaviour: Behaviour,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeEngine {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for FakeEngine {
    async fn process(&self, input: &ProcessInput) -> Result<Transcript, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behaviour {
            Behaviour::Fixed(transcript) => Ok(transcript.clone()),
            Behaviour::Echo => {
                let text = tokio::fs::read_to_string(&input.path).await?;
                Ok(Transcript {
                    text,
                    segments: vec![],
                })
            }
            Behaviour::Fail(message) => Err(ProcessError::Failed(message.clone())),
        }
    }
}

pub fn russian_transcript() -> Transcript {
    Transcript {
        text: "привет мир".to_string(),
        segments: vec![Segment {
            start: 0.0,
            end: 1.2,
            text: "привет мир".to_string(),
            speaker: None,
        }],
    }
}

pub fn request(data: &[u8]) -> SubmitRequest {
    SubmitRequest {
        data: data.to_vec(),
        format: MediaFormat::Ogg,
        params: TranscribeParams::default(),
        requester: serde_json::json!({ "chat_id": 1 }),
    }
}

/// Job store, result channel, blob area and a started dispatcher, all in memory.
pub struct Stack {
    pub log: Arc<MemoryLog>,
    pub jobs: Arc<JobStore>,
    pub results: Arc<ResultChannel>,
    pub blobs: Arc<BlobArea>,
    pub dispatcher: Arc<Dispatcher>,
    pub dispatcher_shutdown: ShutdownHandle,
    pub delivery: JoinHandle<()>,
    _dir: TempDir,
}

impl Stack {
    pub async fn start(claim_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(MemoryLog::new());
        let shared: Arc<dyn StreamLog> = log.clone();

        let jobs = Arc::new(JobStore::new(
            Arc::clone(&shared),
            StoreSettings {
                prefix: PREFIX.to_string(),
                claim_timeout,
                retention: Duration::from_secs(3600),
            },
        ));
        jobs.ensure_group(WORKER_GROUP).await.unwrap();

        let results = Arc::new(ResultChannel::new(
            Arc::clone(&shared),
            PREFIX,
            Duration::from_secs(900),
        ));
        let blobs = Arc::new(BlobArea::new(dir.path(), 1024 * 1024));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&jobs),
            Arc::clone(&results),
            Arc::clone(&blobs),
            DispatcherSettings {
                group: "dispatch:test".to_string(),
                consumer: "dispatcher".to_string(),
                block: BLOCK,
            },
        ));
        let (dispatcher_shutdown, signal) = shutdown::new_pair();
        let delivery = dispatcher.start(signal).await.unwrap();

        Self {
            log,
            jobs,
            results,
            blobs,
            dispatcher,
            dispatcher_shutdown,
            delivery,
            _dir: dir,
        }
    }

    pub fn worker(&self, name: &str, engine: Arc<FakeEngine>, slots: usize) -> Arc<Worker> {
        Arc::new(Worker::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.results),
            Arc::clone(&self.blobs),
            engine,
            WorkerSettings {
                group: WORKER_GROUP.to_string(),
                consumer: name.to_string(),
                batch_size: slots,
                slots,
                block: BLOCK,
            },
        ))
    }

    /// Run a worker in the background. Trigger the handle to stop it.
    pub fn spawn_worker(
        &self,
        name: &str,
        engine: Arc<FakeEngine>,
        slots: usize,
    ) -> (ShutdownHandle, JoinHandle<Result<(), QueueError>>) {
        let (handle, signal) = shutdown::new_pair();
        let task = tokio::spawn(self.worker(name, engine, slots).run(signal));
        (handle, task)
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
