//! Batch Writer: submits transformed records under a write mode.

use super::TargetStore;
use crate::core::{Record, Value};
use crate::error::{ImportError, Result};
use crate::mapping::WriteMode;
use crate::verify::normalize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counts for one submitted batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: u64,
    pub failed: u64,
}

/// Extracts the stable key used to match a record against existing target
/// records in the update write modes.
pub trait KeyResolver: Send + Sync {
    /// Target field the key is matched on.
    fn key_field(&self) -> &str;

    /// The record's key, or `None` if it carries no usable key.
    fn resolve(&self, record: &Record) -> Option<Value>;
}

/// Uses the value of one record field as the key.
#[derive(Debug, Clone)]
pub struct FieldKeyResolver {
    field: String,
}

impl FieldKeyResolver {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl KeyResolver for FieldKeyResolver {
    fn key_field(&self) -> &str {
        &self.field
    }

    fn resolve(&self, record: &Record) -> Option<Value> {
        match record.get(&self.field) {
            None | Some(Value::Null) | Some(Value::Unset) => None,
            Some(Value::Text(s)) if s.trim().is_empty() => None,
            Some(v) => Some(v.clone()),
        }
    }
}

/// Writes batches of records to one target entity.
pub struct BatchWriter {
    target: Arc<dyn TargetStore>,
    entity: String,
    mode: WriteMode,
    resolver: Option<Arc<dyn KeyResolver>>,
}

impl BatchWriter {
    pub fn new(target: Arc<dyn TargetStore>, entity: impl Into<String>, mode: WriteMode) -> Self {
        Self {
            target,
            entity: entity.into(),
            mode,
            resolver: None,
        }
    }

    /// Plug in key matching for the update modes.
    pub fn with_key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Submit one batch.
    ///
    /// A rejected `create_many` call surfaces as an error; the caller decides
    /// whether the batch counts as failed or aborts the job. In the update
    /// modes records are applied one at a time, so per-record rejections
    /// are counted as failed instead, along with records that have no key
    /// and (for `update`) records with no match. A fatal error after some
    /// records were committed is returned as [`ImportError::PartialWrite`].
    pub async fn write(&self, records: &[Record]) -> Result<WriteOutcome> {
        if records.is_empty() {
            return Ok(WriteOutcome::default());
        }
        if !self.mode.requires_key() {
            return self.create(records).await;
        }

        let resolver = self.resolver.as_ref().ok_or_else(|| {
            ImportError::KeyResolution(format!(
                "write mode {} on {} requires a key resolution strategy",
                self.mode, self.entity
            ))
        })?;
        self.upsert(records, resolver.as_ref()).await
    }

    async fn create(&self, records: &[Record]) -> Result<WriteOutcome> {
        let inserted = self.target.create_many(&self.entity, records).await?;
        let total = records.len() as u64;
        let written = inserted.min(total);

        debug!("Created {} records in {}", written, self.entity);
        Ok(WriteOutcome {
            written,
            failed: total - written,
        })
    }

    async fn upsert(&self, records: &[Record], resolver: &dyn KeyResolver) -> Result<WriteOutcome> {
        let key_field = resolver.key_field();
        let mut outcome = WriteOutcome::default();
        let mut pending = PendingCreates::default();

        for record in records {
            let Some(key) = resolver.resolve(record) else {
                warn!("Record has no value for key field {}", key_field);
                outcome.failed += 1;
                continue;
            };

            // Not in the target yet, but already queued by this batch.
            if pending.merge(&key, record) {
                continue;
            }

            let existing = match self.target.find_by_key(&self.entity, key_field, &key).await {
                Ok(existing) => existing,
                Err(e) => {
                    self.absorb(&mut outcome, e, 1)?;
                    continue;
                }
            };

            match (existing, self.mode) {
                (Some(_), _) => {
                    match self
                        .target
                        .update_by_key(&self.entity, key_field, &key, record)
                        .await
                    {
                        Ok(0) => outcome.failed += 1,
                        Ok(_) => outcome.written += 1,
                        Err(e) => self.absorb(&mut outcome, e, 1)?,
                    }
                }
                (None, WriteMode::CreateOrUpdate) => pending.push(&key, record),
                (None, _) => {
                    warn!(
                        "No record in {} with {} = {:?}",
                        self.entity, key_field, key
                    );
                    outcome.failed += 1;
                }
            }
        }

        if !pending.is_empty() {
            let represented = pending.represented();
            match self.create(&pending.records).await {
                Ok(created) if created.failed == 0 => outcome.written += represented,
                Ok(created) => {
                    outcome.written += created.written;
                    outcome.failed += represented - created.written.min(represented);
                }
                Err(e) => self.absorb(&mut outcome, e, represented)?,
            }
        }

        debug!(
            "Wrote {} records to {} ({}), {} failed",
            outcome.written, self.entity, self.mode, outcome.failed
        );
        Ok(outcome)
    }

    /// Count a store error against `count` records.
    ///
    /// Rejections become failures. Anything else stops the batch, carrying
    /// the records already committed.
    fn absorb(&self, outcome: &mut WriteOutcome, err: ImportError, count: u64) -> Result<()> {
        if err.is_recoverable() {
            warn!("{} record(s) rejected by {}: {}", count, self.entity, err);
            outcome.failed += count;
            return Ok(());
        }
        if outcome.written == 0 {
            return Err(err);
        }
        Err(ImportError::PartialWrite {
            written: outcome.written,
            source: Box::new(err),
        })
    }
}

/// Unmatched records queued for creation, one per key.
///
/// A later record with an already queued key overwrites its fields, the
/// same way an update would once the first one exists.
#[derive(Default)]
struct PendingCreates {
    records: Vec<Record>,
    /// Batch records folded into each queued record.
    counts: Vec<u64>,
    index: HashMap<String, usize>,
}

impl PendingCreates {
    fn push(&mut self, key: &Value, record: &Record) {
        self.index.insert(normalize(key), self.records.len());
        self.records.push(record.clone());
        self.counts.push(1);
    }

    fn merge(&mut self, key: &Value, record: &Record) -> bool {
        let Some(&i) = self.index.get(&normalize(key)) else {
            return false;
        };
        for (field, value) in record.iter() {
            self.records[i].insert(field, value.clone());
        }
        self.counts[i] += 1;
        true
    }

    fn represented(&self) -> u64 {
        self.counts.iter().sum()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
