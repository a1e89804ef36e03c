//! Job Controller: runs one job through count, stream, transform, write,
//! and (optionally) verify.

use super::{Job, JobStatus};
use crate::error::{ImportError, Result};
use crate::mapping::{transform_row, MappingDescriptor};
use crate::source::{ConnectionProvider, SourceReader};
use crate::state::JobStore;
use crate::target::{BatchWriter, FieldKeyResolver, KeyResolver, TargetStore};
use crate::verify::{ChecksumVerifier, VerificationStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the import loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopOutcome {
    Completed,
    Cancelled,
}

/// Drives jobs against one source and one target.
///
/// A controller holds no per-job state, so one instance can run several
/// jobs concurrently as long as each job is only run once.
pub struct JobController {
    source: Arc<dyn ConnectionProvider>,
    target: Arc<dyn TargetStore>,
    store: Arc<dyn JobStore>,
    key_resolver: Option<Arc<dyn KeyResolver>>,
}

impl JobController {
    pub fn new(
        source: Arc<dyn ConnectionProvider>,
        target: Arc<dyn TargetStore>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            source,
            target,
            store,
            key_resolver: None,
        }
    }

    /// Key matching for the update write modes. Without one, a mapping's
    /// `key_field` is used; with neither, update modes fail.
    pub fn with_key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.key_resolver = Some(resolver);
        self
    }

    /// Validate, start and run `job` to a terminal state.
    ///
    /// Returns `Ok` for `done` and `cancelled`. Any unrecovered error moves
    /// the job to `error`, is persisted, and is returned. An invalid mapping
    /// leaves the job in `draft`.
    pub async fn run(&self, job: &mut Job, cancel: &CancellationToken) -> Result<()> {
        if job.status != JobStatus::Draft {
            return Err(ImportError::invalid_state(&job.id, job.status, "start"));
        }

        let stored_fields = match self.target.list_stored_fields(&job.mapping.target_entity).await {
            Ok(fields) => fields,
            Err(e) => {
                job.start()?;
                return self.abort(job, e).await;
            }
        };
        job.mapping.validate(&stored_fields)?;

        job.start()?;
        self.store.save(job).await?;

        let outcome = match self.import(job, cancel).await {
            Ok(LoopOutcome::Completed) if job.mapping.verification.enabled => {
                self.run_verification(job).await
            }
            other => other,
        };

        match outcome {
            Ok(LoopOutcome::Completed) => {
                job.complete()?;
                self.store.save(job).await
            }
            Ok(LoopOutcome::Cancelled) => {
                job.cancel()?;
                self.store.save(job).await?;
                info!("Job {} cancelled", job.id);
                Ok(())
            }
            Err(e) => self.abort(job, e).await,
        }
    }

    /// Re-run the verification pass for a finished job.
    pub async fn verify(&self, job: &mut Job) -> Result<()> {
        if job.status != JobStatus::Done {
            return Err(ImportError::invalid_state(&job.id, job.status, "verify"));
        }
        self.run_verification(job).await?;
        self.store.save(job).await
    }

    async fn import(&self, job: &mut Job, cancel: &CancellationToken) -> Result<LoopOutcome> {
        let mapping = job.mapping.clone();
        let reader = SourceReader::new(self.source.clone(), &mapping);

        let total = reader.count().await?;
        job.set_total(total);
        job.log.info(format!(
            "Found {} records in {}",
            total,
            mapping.source.full_name()
        ));
        if !self.save_running(job).await? {
            return Ok(LoopOutcome::Cancelled);
        }

        let writer = self.writer_for(&mapping);
        let mut batches = reader.open().await?;
        let mut batch_no = 0u64;

        loop {
            if self.cancel_requested(job, cancel).await {
                return Ok(LoopOutcome::Cancelled);
            }

            let Some(rows) = batches.next_batch().await? else {
                break;
            };
            batch_no += 1;
            let row_offset = job.imported_records + job.failed_records;

            let mut records = Vec::with_capacity(rows.len());
            let mut failed = 0u64;

            for (i, row) in rows.iter().enumerate() {
                match transform_row(row, &mapping.fields) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        failed += 1;
                        job.log.warn(format!(
                            "Row {} skipped: {}",
                            row_offset + i as u64 + 1,
                            e
                        ));
                        if !mapping.skip_errors {
                            job.record_progress(0, failed);
                            return Err(e);
                        }
                    }
                }
            }

            let written = match writer.write(&records).await {
                Ok(outcome) => {
                    failed += outcome.failed;
                    if outcome.failed > 0 && !mapping.skip_errors {
                        job.record_progress(outcome.written, failed);
                        return Err(ImportError::write(
                            &mapping.target_entity,
                            format!(
                                "{} records in batch {} were not written",
                                outcome.failed, batch_no
                            ),
                        ));
                    }
                    outcome.written
                }
                Err(ImportError::PartialWrite { written, source }) => {
                    failed += (records.len() as u64).saturating_sub(written);
                    job.log.error(format!(
                        "Batch {} stopped after {} records: {}",
                        batch_no, written, source
                    ));
                    job.record_progress(written, failed);
                    return Err(*source);
                }
                Err(e) => {
                    failed += records.len() as u64;
                    job.log.error(format!("Batch {} failed: {}", batch_no, e));
                    if !mapping.skip_errors || !e.is_recoverable() {
                        job.record_progress(0, failed);
                        return Err(e);
                    }
                    0
                }
            };

            job.record_progress(written, failed);
            job.log.info(format!(
                "Batch {}: {} imported, {} failed ({}/{})",
                batch_no,
                written,
                failed,
                job.imported_records + job.failed_records,
                job.total_records
            ));

            if !self.save_running(job).await? {
                return Ok(LoopOutcome::Cancelled);
            }
        }

        debug!("Import loop for job {} finished after {} batches", job.id, batch_no);
        Ok(LoopOutcome::Completed)
    }

    fn writer_for(&self, mapping: &MappingDescriptor) -> BatchWriter {
        let writer = BatchWriter::new(
            self.target.clone(),
            mapping.target_entity.clone(),
            mapping.write_mode,
        );

        let resolver = self.key_resolver.clone().or_else(|| {
            mapping
                .key_field
                .as_ref()
                .map(|field| Arc::new(FieldKeyResolver::new(field.clone())) as Arc<dyn KeyResolver>)
        });

        match resolver {
            Some(resolver) => writer.with_key_resolver(resolver),
            None => writer,
        }
    }

    /// Token fired, or the stored job was cancelled by another process.
    async fn cancel_requested(&self, job: &Job, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        match self.store.load(&job.id).await {
            Ok(Some(stored)) => stored.status == JobStatus::Cancelled,
            Ok(None) => false,
            Err(e) => {
                warn!("Could not check stored status of job {}: {}", job.id, e);
                false
            }
        }
    }

    /// Persist a job that is still in flight. `Ok(false)` means the store
    /// holds a cancellation from another process, which this save did not
    /// overwrite.
    async fn save_running(&self, job: &Job) -> Result<bool> {
        match self.store.save(job).await {
            Ok(()) => Ok(true),
            Err(ImportError::Cancelled) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn run_verification(&self, job: &mut Job) -> Result<LoopOutcome> {
        job.verification_status = VerificationStatus::Running;
        if !self.save_running(job).await? {
            job.verification_status = VerificationStatus::Pending;
            return Ok(LoopOutcome::Cancelled);
        }

        let verifier = ChecksumVerifier::new(self.source.clone(), self.target.clone());
        let mapping = job.mapping.clone();

        match verifier.verify(&mapping, &mut job.log).await {
            Ok(report) => job.record_verification(&report),
            Err(e) => job.verification_failed(e.to_string()),
        }
        Ok(LoopOutcome::Completed)
    }

    /// Move a running job to `error`, persist it, and return the error.
    async fn abort(&self, job: &mut Job, err: ImportError) -> Result<()> {
        job.fail(err.to_string())?;
        if let Err(save_err) = self.store.save(job).await {
            warn!("Failed to persist failed job {}: {}", job.id, save_err);
        }
        Err(err)
    }
}
