//! File-based job store.

use super::{check_overwrite, JobStore};
use crate::error::{ImportError, Result};
use crate::job::Job;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// On-disk form of one job.
#[derive(Debug, Serialize, Deserialize)]
struct JobDocument {
    job: Job,

    /// HMAC-SHA256 over the serialized job, keyed by the mapping fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
}

impl JobDocument {
    fn compute_hmac(job: &Job) -> Result<String> {
        let content = serde_json::to_string(job)
            .map_err(|e| ImportError::State(format!("Failed to serialize job for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(job.mapping.fingerprint().as_bytes())
            .map_err(|e| ImportError::State(format!("Failed to create HMAC: {}", e)))?;

        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Stores each job as `<dir>/<job id>.json`.
///
/// Writes are atomic (temp file, then rename). Each document is signed so
/// that a hand-edited state file is rejected on load instead of silently
/// resuming with altered counters.
///
/// Saves re-read the stored document first and apply [`check_overwrite`].
/// Within one process the read and the rename happen under a lock; across
/// processes only the short gap between them remains.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileJobStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ImportError::NotFound(format!("job {}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read_document(path: &Path) -> Result<Job> {
        let content = tokio::fs::read_to_string(path).await?;
        let doc: JobDocument = serde_json::from_str(&content).map_err(|e| {
            ImportError::State(format!("Corrupt job file {}: {}", path.display(), e))
        })?;

        match &doc.hmac {
            Some(stored) => {
                let expected = JobDocument::compute_hmac(&doc.job)?;
                if *stored != expected {
                    return Err(ImportError::State(format!(
                        "Job file {} failed integrity check: HMAC mismatch (possible tampering)",
                        path.display()
                    )));
                }
            }
            None => warn!(
                "Job file {} has no HMAC signature, integrity cannot be verified",
                path.display()
            ),
        }

        Ok(doc.job)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, job: &Job) -> Result<()> {
        let path = self.path_for(&job.id)?;
        let doc = JobDocument {
            hmac: Some(JobDocument::compute_hmac(job)?),
            job: job.clone(),
        };
        let content = serde_json::to_string_pretty(&doc)?;

        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            match Self::read_document(&path).await {
                Ok(stored) => check_overwrite(&stored, job)?,
                Err(e) => warn!("Replacing unreadable job file {}: {}", path.display(), e),
            }
        }

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!("Saved job {} to {}", job.id, path.display());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>> {
        let path = self.path_for(id)?;
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Self::read_document(&path).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_document(&path).await {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job file {}: {}", path.display(), e),
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::mapping::{FieldMapping, MappingDescriptor, SourceLocation, Transform};
    use tempfile::TempDir;

    fn job() -> Job {
        Job::new(MappingDescriptor::new(
            "m",
            SourceLocation::new("dbo", "T"),
            "t",
            vec![FieldMapping::new("A", "a", Transform::Int)],
        ))
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();

        let mut job = job();
        job.start().unwrap();
        job.set_total(10);
        job.record_progress(4, 1);
        store.save(&job).await.unwrap();

        let loaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(loaded.status, JobStatus::Running);
        assert!(!dir.path().join(format!("{}.tmp", job.id)).exists());
    }

    #[tokio::test]
    async fn test_missing_job_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        assert!(store.load("no-such-job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();
        assert!(store.load("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_tampered_file_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();

        let mut job = job();
        job.start().unwrap();
        job.set_total(10);
        job.record_progress(2, 0);
        store.save(&job).await.unwrap();

        let path = dir.path().join(format!("{}.json", job.id));
        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replace("\"imported_records\": 2", "\"imported_records\": 9");
        assert_ne!(content, tampered);
        std::fs::write(&path, tampered).unwrap();

        let err = store.load(&job.id).await.unwrap_err();
        assert!(matches!(err, ImportError::State(_)));
    }

    #[tokio::test]
    async fn test_list_sorted_and_skips_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();

        let first = job();
        let second = job();
        store.save(&second).await.unwrap();
        store.save(&first).await.unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{").unwrap();

        let jobs = store.list().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].created_at <= jobs[1].created_at);
    }

    #[tokio::test]
    async fn test_running_save_keeps_stored_cancellation() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(dir.path()).unwrap();

        let mut running = job();
        running.start().unwrap();
        store.save(&running).await.unwrap();

        // Another process cancels between the runner's check and its save.
        let other = FileJobStore::new(dir.path()).unwrap();
        let mut cancelled = other.load(&running.id).await.unwrap().unwrap();
        cancelled.cancel().unwrap();
        other.save(&cancelled).await.unwrap();

        running.record_progress(3, 0);
        let err = store.save(&running).await.unwrap_err();
        assert!(matches!(err, ImportError::Cancelled));

        let stored = store.load(&running.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.imported_records, 0);
    }
}
