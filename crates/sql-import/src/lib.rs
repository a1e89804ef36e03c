//! # sql-import
//!
//! Batched import of relational source tables into a target store, with
//! post-import checksum reconciliation.
//!
//! A job reads one source table through a mapping descriptor, transforms
//! each row into a target record, and writes records in batches:
//!
//! - **Mapping descriptors** list source-to-target field pairs with typed
//!   transforms, validated against the target before every run
//! - **Write modes** create new records, or update/upsert by a natural key
//! - **Error policy** either stops at the first bad row or batch, or skips
//!   and counts it
//! - **Durable job state** saved after every batch, with cooperative
//!   cancellation across processes
//! - **Verification** re-reads both stores and compares normalized per-row
//!   checksums, reporting missing, extra and mismatched rows
//!
//! ## Example
//!
//! ```rust,no_run
//! use sql_import::{Config, JobService};
//!
//! #[tokio::main]
//! async fn main() -> sql_import::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let service = JobService::connect(&config).await?;
//!     let summary = service.run_mapping("customers").await?;
//!     println!("Imported {} of {} rows", summary.imported_records, summary.total_records);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod job;
pub mod mapping;
pub mod source;
pub mod state;
pub mod target;
pub mod verify;

// Re-exports for convenient access
pub use config::{Config, Credential, SourceConfig, TargetConfig};
pub use core::{HealthStatus, Record, Row, Value};
pub use error::{ImportError, Result};
pub use job::{Job, JobController, JobLog, JobService, JobStatus, JobSummary};
pub use mapping::{FieldMapping, MappingDescriptor, SourceLocation, Transform, WriteMode};
pub use source::{ConnectionProvider, SourceReader};
pub use state::{FileJobStore, JobStore, MemoryJobStore};
pub use target::{BatchWriter, StoredField, TargetStore, WriteOutcome};
pub use verify::{ChecksumVerifier, VerificationReport, VerificationStatus};
