//! Durable job storage.
//!
//! The [`JobStore`] trait defines how job records are persisted between
//! batches and between processes:
//!
//! - **File**: one signed JSON document per job, in `file.rs`
//! - **Memory**: process-local map, in `memory.rs`
//!
//! The controller saves the job after every batch so that a crash leaves
//! counters consistent with committed target writes. Another process may
//! cancel a running job by saving it with status `cancelled`; the runner
//! picks that up at its next batch boundary. Stores refuse a save that
//! would undo such a cancellation (see [`check_overwrite`]).

mod file;
mod memory;

pub use file::FileJobStore;
pub use memory::MemoryJobStore;

use crate::error::{ImportError, Result};
use crate::job::{Job, JobStatus};
use async_trait::async_trait;

/// Persistence backend for job records.
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
///
/// # Example
///
/// ```rust,ignore
/// let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(".sql-import")?);
/// store.save(&job).await?;
/// let loaded = store.load(&job.id).await?;
/// ```
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist the complete job record, replacing any earlier version.
    ///
    /// Fails with [`ImportError::Cancelled`] when a running job would
    /// replace a stored cancellation.
    async fn save(&self, job: &Job) -> Result<()>;

    /// Load one job. `Ok(None)` if no job has that id.
    async fn load(&self, id: &str) -> Result<Option<Job>>;

    /// Every stored job, oldest first.
    async fn list(&self) -> Result<Vec<Job>>;
}

/// Whether `incoming` may replace the `stored` copy of the same job.
///
/// A running job never overwrites a stored `cancelled`; the runner gets
/// [`ImportError::Cancelled`] and stops. A job stored as `done` or `error`
/// cannot be resumed or cancelled afterwards.
pub(crate) fn check_overwrite(stored: &Job, incoming: &Job) -> Result<()> {
    match (stored.status, incoming.status) {
        (JobStatus::Cancelled, JobStatus::Running) => Err(ImportError::Cancelled),
        (JobStatus::Done | JobStatus::Error, JobStatus::Running) => Err(
            ImportError::invalid_state(&incoming.id, stored.status, "run"),
        ),
        (JobStatus::Done | JobStatus::Error, JobStatus::Cancelled) => Err(
            ImportError::invalid_state(&incoming.id, stored.status, "cancel"),
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{FieldMapping, MappingDescriptor, SourceLocation, Transform};

    fn job() -> Job {
        Job::new(MappingDescriptor::new(
            "people",
            SourceLocation::new("dbo", "People"),
            "person",
            vec![FieldMapping::new("Name", "name", Transform::Str)],
        ))
    }

    #[test]
    fn test_running_never_replaces_cancelled() {
        let mut running = job();
        running.start().unwrap();
        let mut cancelled = running.clone();
        cancelled.cancel().unwrap();

        assert!(matches!(
            check_overwrite(&cancelled, &running),
            Err(ImportError::Cancelled)
        ));
        assert!(check_overwrite(&running, &cancelled).is_ok());
        assert!(check_overwrite(&running, &running).is_ok());
    }

    #[test]
    fn test_finished_job_cannot_be_cancelled() {
        let mut running = job();
        running.start().unwrap();
        let mut cancelled = running.clone();
        cancelled.cancel().unwrap();
        let mut done = running.clone();
        done.complete().unwrap();

        assert!(matches!(
            check_overwrite(&done, &cancelled),
            Err(ImportError::InvalidState { .. })
        ));
        assert!(matches!(
            check_overwrite(&done, &running),
            Err(ImportError::InvalidState { .. })
        ));
        assert!(check_overwrite(&done, &done).is_ok());
    }
}
