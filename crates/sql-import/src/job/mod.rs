//! Import jobs: the job record and its state machine, the job log, the
//! controller that runs a job, and the service that drives jobs by id.
//!
//! ```text
//! draft --start--> running --+--> done
//!                            +--> error
//!                            +--cancel--> cancelled
//! ```
//!
//! `retry` is not a transition: it builds a fresh draft job from an existing
//! job's mapping snapshot.

mod controller;
mod log;
mod service;

pub use controller::JobController;
pub use log::{JobLog, LogEntry, LogLevel};
pub use service::{HealthCheckResult, JobService, Preview, PreviewRow};

use crate::error::{ImportError, Result};
use crate::mapping::MappingDescriptor;
use crate::verify::{VerificationReport, VerificationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Draft,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Draft => write!(f, "draft"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One run of a mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// Snapshot taken at creation; later mapping edits do not affect it.
    pub mapping: MappingDescriptor,
    pub status: JobStatus,

    pub total_records: u64,
    pub imported_records: u64,
    pub failed_records: u64,

    pub verification_status: VerificationStatus,
    pub mismatch_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_report: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Id of the job this one retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,

    pub log: JobLog,
}

/// Point-in-time view returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub mapping: String,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub total_records: u64,
    pub imported_records: u64,
    pub failed_records: u64,
    pub verification_status: VerificationStatus,
    pub mismatch_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Job {
    /// New draft job over a snapshot of `mapping`.
    pub fn new(mapping: MappingDescriptor) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        Self {
            log: JobLog::new(&id),
            id,
            name: format!("Import Job - {}", now.format("%Y-%m-%d %H:%M:%S")),
            mapping,
            status: JobStatus::Draft,
            total_records: 0,
            imported_records: 0,
            failed_records: 0,
            verification_status: VerificationStatus::Pending,
            mismatch_count: 0,
            verification_report: None,
            created_at: now,
            start_date: None,
            end_date: None,
            error_message: None,
            retry_of: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// `draft -> running`. Resets counters, log and error message.
    pub fn start(&mut self) -> Result<()> {
        if self.status != JobStatus::Draft {
            return Err(ImportError::invalid_state(&self.id, self.status, "start"));
        }

        self.status = JobStatus::Running;
        self.total_records = 0;
        self.imported_records = 0;
        self.failed_records = 0;
        self.verification_status = VerificationStatus::Pending;
        self.mismatch_count = 0;
        self.verification_report = None;
        self.error_message = None;
        self.start_date = Some(Utc::now());
        self.end_date = None;
        self.log = JobLog::new(&self.id);
        self.log.info(format!(
            "Job started: {} -> {} ({})",
            self.mapping.source.full_name(),
            self.mapping.target_entity,
            self.mapping.write_mode
        ));
        Ok(())
    }

    /// `running -> done`.
    pub fn complete(&mut self) -> Result<()> {
        self.require_running("complete")?;
        self.status = JobStatus::Done;
        self.end_date = Some(Utc::now());
        self.log.info(format!(
            "Job completed: {} imported, {} failed of {}",
            self.imported_records, self.failed_records, self.total_records
        ));
        Ok(())
    }

    /// `running -> error`, keeping the message and a final log line.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.require_running("fail")?;
        let message = message.into();
        self.status = JobStatus::Error;
        self.end_date = Some(Utc::now());
        self.log.error(format!("Job failed: {}", message));
        self.error_message = Some(message);
        Ok(())
    }

    /// `running -> cancelled`.
    pub fn cancel(&mut self) -> Result<()> {
        self.require_running("cancel")?;
        self.status = JobStatus::Cancelled;
        self.end_date = Some(Utc::now());
        self.log.warn(format!(
            "Job cancelled after {} imported, {} failed",
            self.imported_records, self.failed_records
        ));
        Ok(())
    }

    /// Fresh draft job over the same mapping snapshot.
    pub fn retry(&self) -> Job {
        let mut job = Job::new(self.mapping.clone()).with_name(format!("Retry - {}", self.name));
        job.retry_of = Some(self.id.clone());
        job.log.info(format!("Created as retry of job {}", self.id));
        job
    }

    fn require_running(&self, action: &str) -> Result<()> {
        if self.status != JobStatus::Running {
            return Err(ImportError::invalid_state(&self.id, self.status, action));
        }
        Ok(())
    }

    /// Set the expected total from the source count.
    pub fn set_total(&mut self, total: u64) {
        self.total_records = total;
    }

    /// Add one batch's counts.
    ///
    /// Keeps `imported + failed <= total` when the source grew after it was
    /// counted by raising the total.
    pub fn record_progress(&mut self, imported: u64, failed: u64) {
        self.imported_records += imported;
        self.failed_records += failed;

        let processed = self.imported_records + self.failed_records;
        if processed > self.total_records {
            self.log.warn(format!(
                "Processed {} records but source count was {}; raising total",
                processed, self.total_records
            ));
            self.total_records = processed;
        }
    }

    /// Record a completed verification pass.
    pub fn record_verification(&mut self, report: &VerificationReport) {
        self.verification_status = report.status();
        self.mismatch_count = report.mismatch_count();
        self.verification_report = Some(report.render());
    }

    /// Record a verification pass that could not run.
    pub fn verification_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.verification_status = VerificationStatus::Failed;
        self.log.error(format!("Verification could not run: {}", reason));
        self.verification_report = Some(format!("Verification could not run: {}", reason));
    }

    /// Share of records processed, 0-100.
    pub fn progress_percent(&self) -> f64 {
        if self.total_records == 0 {
            return if self.status == JobStatus::Done { 100.0 } else { 0.0 };
        }
        let processed = (self.imported_records + self.failed_records) as f64;
        (processed / self.total_records as f64 * 100.0).min(100.0)
    }

    /// Seconds from start to end (or to now while running).
    pub fn duration_seconds(&self) -> Option<f64> {
        let start = self.start_date?;
        let end = self.end_date.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            mapping: self.mapping.name.clone(),
            status: self.status,
            progress_percent: self.progress_percent(),
            total_records: self.total_records,
            imported_records: self.imported_records,
            failed_records: self.failed_records,
            verification_status: self.verification_status,
            mismatch_count: self.mismatch_count,
            duration_seconds: self.duration_seconds(),
            error_message: self.error_message.clone(),
        }
    }
}
