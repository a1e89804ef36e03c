//! Job Service: drives jobs by id over one source, one target and one store.

use super::{Job, JobController, JobStatus, JobSummary};
use crate::config::Config;
use crate::core::HealthStatus;
use crate::drivers::{MssqlSource, PgTarget};
use crate::error::{ImportError, Result};
use crate::mapping::{transform_row, MappingDescriptor};
use crate::source::{ConnectionProvider, SourceReader};
use crate::state::{FileJobStore, JobStore};
use crate::target::{KeyResolver, TargetStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One previewed source row and what the mapping makes of it.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewRow {
    pub row: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a dry run over the first few source rows. Nothing is written.
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub mapping: String,
    pub columns: Vec<String>,
    pub rows: Vec<PreviewRow>,
}

impl Preview {
    /// Number of rows that transformed without error.
    pub fn ok_count(&self) -> usize {
        self.rows.iter().filter(|r| r.error.is_none()).count()
    }
}

/// Connectivity of both stores.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
    pub healthy: bool,
}

pub struct JobService {
    mappings: Vec<MappingDescriptor>,
    source: Arc<dyn ConnectionProvider>,
    target: Arc<dyn TargetStore>,
    store: Arc<dyn JobStore>,
    controller: JobController,
    shutdown: CancellationToken,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl JobService {
    pub fn new(
        mappings: Vec<MappingDescriptor>,
        source: Arc<dyn ConnectionProvider>,
        target: Arc<dyn TargetStore>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let controller = JobController::new(source.clone(), target.clone(), store.clone());
        Self {
            mappings,
            source,
            target,
            store,
            controller,
            shutdown: CancellationToken::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to the configured source and target, with a file job store
    /// under `state_dir`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let source = MssqlSource::connect(&config.source).await?;
        let target = PgTarget::connect(&config.target).await?;
        let store = FileJobStore::new(&config.state_dir)?;
        Ok(Self::new(
            config.mappings.clone(),
            Arc::new(source),
            Arc::new(target),
            Arc::new(store),
        ))
    }

    pub fn with_key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.controller = self.controller.with_key_resolver(resolver);
        self
    }

    /// Jobs started by this service are cancelled when `token` fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    fn running(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mapping(&self, name: &str) -> Result<&MappingDescriptor> {
        self.mappings
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ImportError::NotFound(format!("mapping '{}'", name)))
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("job {}", id)))
    }

    /// Check a mapping against the target's stored fields.
    pub async fn validate_mapping(&self, name: &str) -> Result<()> {
        let mapping = self.mapping(name)?;
        let fields = self.target.list_stored_fields(&mapping.target_entity).await?;
        mapping.validate(&fields)
    }

    /// New draft job over a named mapping. Returns the job id.
    pub async fn create_job(&self, mapping_name: &str) -> Result<String> {
        let mapping = self.mapping(mapping_name)?.clone();
        self.create_job_from(mapping).await
    }

    /// New draft job over an ad-hoc descriptor.
    pub async fn create_job_from(&self, mapping: MappingDescriptor) -> Result<String> {
        let job = Job::new(mapping);
        self.store.save(&job).await?;
        info!("Created job {} for mapping '{}'", job.id, job.mapping.name);
        Ok(job.id)
    }

    /// Run a draft job to a terminal state.
    ///
    /// Cancellation via [`cancel_job`](Self::cancel_job) or the shutdown
    /// token still returns `Ok` with a cancelled summary.
    pub async fn start_job(&self, id: &str) -> Result<JobSummary> {
        let mut job = self.get_job(id).await?;
        if job.status != JobStatus::Draft {
            return Err(ImportError::invalid_state(&job.id, job.status, "start"));
        }

        let token = self.shutdown.child_token();
        self.running().insert(job.id.clone(), token.clone());
        info!("Starting job {} ({})", job.id, job.name);

        let result = self.controller.run(&mut job, &token).await;
        self.running().remove(&job.id);

        result.map(|()| job.summary())
    }

    /// Create and start a job over a named mapping.
    pub async fn run_mapping(&self, mapping_name: &str) -> Result<JobSummary> {
        let id = self.create_job(mapping_name).await?;
        self.start_job(&id).await
    }

    /// Request cancellation of a running job.
    ///
    /// A job run by this service stops at its next batch boundary. A job run
    /// by another process is marked cancelled in the store, which that
    /// process picks up at its next batch boundary.
    pub async fn cancel_job(&self, id: &str) -> Result<JobSummary> {
        let token = self.running().get(id).cloned();
        if let Some(token) = token {
            info!("Cancelling job {}", id);
            token.cancel();
            return self.get_status(id).await;
        }

        let mut job = self.get_job(id).await?;
        job.cancel()?;
        self.store.save(&job).await?;
        info!("Marked job {} cancelled", id);
        Ok(job.summary())
    }

    /// New draft job over the same mapping snapshot. Returns the new id.
    pub async fn retry_job(&self, id: &str) -> Result<String> {
        let job = self.get_job(id).await?;
        if job.status == JobStatus::Running {
            return Err(ImportError::invalid_state(&job.id, job.status, "retry"));
        }

        let retry = job.retry();
        self.store.save(&retry).await?;
        info!("Created job {} as retry of {}", retry.id, job.id);
        Ok(retry.id)
    }

    pub async fn get_status(&self, id: &str) -> Result<JobSummary> {
        Ok(self.get_job(id).await?.summary())
    }

    /// The rendered verification report, if verification has run.
    pub async fn get_verification_report(&self, id: &str) -> Result<Option<String>> {
        Ok(self.get_job(id).await?.verification_report)
    }

    /// Every stored job, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        Ok(self.store.list().await?.iter().map(Job::summary).collect())
    }

    /// Re-run verification for a finished job.
    pub async fn verify_job(&self, id: &str) -> Result<JobSummary> {
        let mut job = self.get_job(id).await?;
        self.controller.verify(&mut job).await?;
        Ok(job.summary())
    }

    /// Transform the first `limit` source rows without writing anything.
    ///
    /// Per-row transform failures are reported in the preview, not returned.
    pub async fn preview(&self, mapping_name: &str, limit: usize) -> Result<Preview> {
        self.validate_mapping(mapping_name).await?;
        let mapping = self.mapping(mapping_name)?;

        let reader = SourceReader::new(self.source.clone(), mapping);
        let rows = reader.sample(limit).await?;

        let rows = rows
            .iter()
            .map(|row| {
                let raw = row.iter().map(|v| v.to_json()).collect();
                match transform_row(row, &mapping.fields) {
                    Ok(record) => PreviewRow {
                        row: raw,
                        record: Some(record.to_json()),
                        error: None,
                    },
                    Err(e) => PreviewRow {
                        row: raw,
                        record: None,
                        error: Some(e.to_string()),
                    },
                }
            })
            .collect();

        Ok(Preview {
            mapping: mapping.name.clone(),
            columns: reader.columns().to_vec(),
            rows,
        })
    }

    pub async fn health_check(&self) -> HealthCheckResult {
        let (source, target) =
            tokio::join!(self.source.health_check(), self.target.health_check());
        let source = source.unwrap_or_else(|e| HealthStatus::failed(0, e.to_string()));
        let target = target.unwrap_or_else(|e| HealthStatus::failed(0, e.to_string()));

        HealthCheckResult {
            healthy: source.connected && target.connected,
            source_connected: source.connected,
            source_latency_ms: source.latency_ms,
            source_error: source.error,
            target_connected: target.connected,
            target_latency_ms: target.latency_ms,
            target_error: target.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::drivers::{MemorySource, MemoryTarget};
    use crate::mapping::{FieldMapping, SourceLocation, Transform};
    use crate::state::MemoryJobStore;
    use crate::target::StoredField;

    fn service() -> (JobService, Arc<MemoryTarget>) {
        let mapping = MappingDescriptor::new(
            "cities",
            SourceLocation::new("dbo", "Cities"),
            "city",
            vec![
                FieldMapping::new("Name", "name", Transform::Str),
                FieldMapping::new("Pop", "population", Transform::Int),
            ],
        );
        let source = MemorySource::new().with_table(
            "dbo",
            "Cities",
            &["Name", "Pop"],
            vec![
                vec![Value::from("Lyon"), Value::from("513000")],
                vec![Value::from("Nowhere"), Value::from("many")],
                vec![Value::from("Lille"), Value::Int(236000)],
            ],
        );
        let target = Arc::new(MemoryTarget::new().with_entity(
            "city",
            vec![
                StoredField::new("name", "varchar", true),
                StoredField::new("population", "integer", false),
            ],
        ));
        let svc = JobService::new(
            vec![mapping],
            Arc::new(source),
            target.clone(),
            Arc::new(MemoryJobStore::new()),
        );
        (svc, target)
    }

    #[tokio::test]
    async fn test_create_job_is_draft() {
        let (svc, _) = service();
        let id = svc.create_job("cities").await.unwrap();
        let status = svc.get_status(&id).await.unwrap();
        assert_eq!(status.status, JobStatus::Draft);
        assert_eq!(status.mapping, "cities");
    }

    #[tokio::test]
    async fn test_unknown_mapping_and_job() {
        let (svc, _) = service();
        assert!(matches!(
            svc.create_job("towns").await,
            Err(ImportError::NotFound(_))
        ));
        assert!(matches!(
            svc.get_status("nope").await,
            Err(ImportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_preview_reports_row_errors_without_writing() {
        let (svc, target) = service();
        let preview = svc.preview("cities", 5).await.unwrap();

        assert_eq!(preview.columns, vec!["Name", "Pop"]);
        assert_eq!(preview.rows.len(), 3);
        assert_eq!(preview.ok_count(), 2);
        assert!(preview.rows[1].error.as_deref().unwrap().contains("population"));
        assert!(target.records("city").is_empty());
    }

    #[tokio::test]
    async fn test_start_job_stops_on_bad_row() {
        let (svc, target) = service();
        let id = svc.create_job("cities").await.unwrap();
        let err = svc.start_job(&id).await.unwrap_err();

        assert!(matches!(err, ImportError::Transform { .. }));
        let status = svc.get_status(&id).await.unwrap();
        assert_eq!(status.status, JobStatus::Error);
        assert!(target.records("city").is_empty());
    }

    #[tokio::test]
    async fn test_retry_creates_fresh_draft() {
        let (svc, _) = service();
        let id = svc.create_job("cities").await.unwrap();
        let _ = svc.start_job(&id).await;

        let retry_id = svc.retry_job(&id).await.unwrap();
        assert_ne!(retry_id, id);
        let retry = svc.get_job(&retry_id).await.unwrap();
        assert_eq!(retry.status, JobStatus::Draft);
        assert_eq!(retry.retry_of.as_deref(), Some(id.as_str()));
        assert_eq!(retry.imported_records, 0);
        assert_eq!(svc.list_jobs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_draft_is_invalid() {
        let (svc, _) = service();
        let id = svc.create_job("cities").await.unwrap();
        assert!(matches!(
            svc.cancel_job(&id).await,
            Err(ImportError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_token_cancels_started_jobs() {
        let token = CancellationToken::new();
        let (svc, target) = service();
        let svc = svc.with_shutdown(token.clone());
        token.cancel();

        let id = svc.create_job("cities").await.unwrap();
        let summary = svc.start_job(&id).await.unwrap();
        assert_eq!(summary.status, JobStatus::Cancelled);
        assert!(target.records("city").is_empty());
    }

    #[tokio::test]
    async fn test_health_check() {
        let (svc, target) = service();
        assert!(svc.health_check().await.healthy);

        target.set_connected(false);
        let health = svc.health_check().await;
        assert!(!health.healthy);
        assert!(health.source_connected);
        assert!(health.target_error.is_some());
    }
}
