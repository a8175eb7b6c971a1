use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::models::job::{JobId, MediaFormat};

const INPUT_STEM: &str = "input";

/// Shared staging area for job inputs.
///
/// A job's input lives at `{base}/{job_id}/input.{ext}`, so the dispatcher
/// and the workers agree on the location without any lookup. The dispatcher
/// writes it before publishing, the worker that acknowledges the job deletes
/// it.
#[derive(Debug, Clone)]
pub struct BlobArea {
    base: PathBuf,
    max_input_bytes: u64,
}

impl BlobArea {
    pub fn new(base: impl Into<PathBuf>, max_input_bytes: u64) -> Self {
        Self {
            base: base.into(),
            max_input_bytes,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.base.join(job_id.to_string())
    }

    pub fn input_path(&self, job_id: JobId, format: MediaFormat) -> PathBuf {
        self.job_dir(job_id)
            .join(format!("{INPUT_STEM}.{}", format.extension()))
    }

    /// Write the input for `job_id` and return its reference.
    ///
    /// The file is written under a temporary name and renamed into place, so a
    /// reader never sees a partial input.
    pub async fn stage(&self, job_id: JobId, format: MediaFormat, data: &[u8]) -> Result<String, StorageError> {
        if data.is_empty() {
            return Err(StorageError::Empty);
        }
        let size = data.len() as u64;
        if size > self.max_input_bytes {
            return Err(StorageError::TooLarge {
                size,
                limit: self.max_input_bytes,
            });
        }

        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.input_path(job_id, format);
        let partial = path.with_extension(format!("{}.part", format.extension()));
        tokio::fs::write(&partial, data).await?;
        tokio::fs::rename(&partial, &path).await?;

        tracing::debug!(job_id = %job_id, path = %path.display(), bytes = size, "Input staged");
        Ok(path.to_string_lossy().into_owned())
    }

    /// Resolve an input reference to a readable, non-empty file.
    pub async fn resolve(&self, input_ref: &str) -> Result<PathBuf, StorageError> {
        let path = PathBuf::from(input_ref);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(path),
            Ok(meta) if meta.is_file() => Err(StorageError::Empty),
            Ok(_) => Err(StorageError::NotFound(input_ref.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(input_ref.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Delete everything staged for `job_id`. Missing entries are fine.
    pub async fn remove(&self, job_id: JobId) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(self.job_dir(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Delete staged entries last modified more than `age` ago.
    pub async fn sweep_older_than(&self, age: Duration) -> Result<usize, StorageError> {
        let mut dir = match tokio::fs::read_dir(&self.base).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let stale = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|elapsed| elapsed >= age);
            if stale {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Blob area I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Input is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("Input is empty")]
    Empty,

    #[error("Input not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_uses_job_id_path() {
        let dir = tempfile::tempdir().unwrap();
        let area = BlobArea::new(dir.path(), 1024);
        let id = JobId::new();

        let input_ref = area.stage(id, MediaFormat::Ogg, b"OggS....").await.unwrap();
        let expected = dir.path().join(id.to_string()).join("input.ogg");
        assert_eq!(PathBuf::from(&input_ref), expected);
        assert_eq!(area.resolve(&input_ref).await.unwrap(), expected);
        assert_eq!(tokio::fs::read(&expected).await.unwrap(), b"OggS....");
    }

    #[tokio::test]
    async fn test_stage_rejects_empty_and_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let area = BlobArea::new(dir.path(), 4);

        assert!(matches!(
            area.stage(JobId::new(), MediaFormat::Mp3, b"").await,
            Err(StorageError::Empty)
        ));
        assert!(matches!(
            area.stage(JobId::new(), MediaFormat::Mp3, b"12345").await,
            Err(StorageError::TooLarge { size: 5, limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let area = BlobArea::new(dir.path(), 1024);
        let id = JobId::new();
        let input_ref = area.stage(id, MediaFormat::Wav, b"RIFF").await.unwrap();

        area.remove(id).await.unwrap();
        area.remove(id).await.unwrap();
        assert!(matches!(
            area.resolve(&input_ref).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let area = BlobArea::new(dir.path(), 1024);
        area.stage(JobId::new(), MediaFormat::Flac, b"fLaC").await.unwrap();

        assert_eq!(area.sweep_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(area.sweep_older_than(Duration::from_millis(10)).await.unwrap(), 1);
    }
}
