//! Post-import verification.
//!
//! The verifier re-reads both stores and rebuilds evidence from the data
//! itself, never from the import counters:
//!
//! 1. Source rows are projected through each field's transform (so both
//!    sides are compared in the target's representation), normalized, and
//!    keyed by ordinal or by a stable identifier.
//! 2. Target records are read back and normalized the same way.
//! 3. The two keyed maps are merged: keys only in the source are missing in
//!    the target, keys only in the target are extra, and keys on both sides
//!    with differing signatures are mismatches.
//!
//! Ordinals are assigned after normalization, by sorting each side on the
//! normalized first field and then the row signature. A transform that
//! changes sort order (text ids read as `int`, trimmed strings, parsed
//! dates) therefore numbers both sides identically.

pub mod normalize;
pub mod types;

pub use normalize::{normalize, normalize_row, row_checksum};
pub use types::{
    CompareStrategy, Discrepancy, DiscrepancyKind, RowKey, RowKeyStrategy, VerificationConfig,
    VerificationReport, VerificationStatus,
};

use crate::core::{Row, Value};
use crate::error::{ImportError, Result};
use crate::job::JobLog;
use crate::mapping::{FieldMapping, MappingDescriptor};
use crate::source::{ConnectionProvider, ScopedCursor, SourceReader};
use crate::target::TargetStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-row comparison signature.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Signature {
    Checksum(u64),
    Values(Vec<String>),
}

type SignatureMap = BTreeMap<RowKey, Signature>;

/// Gathers one side's signatures and assigns their keys.
struct SignatureCollector {
    side: &'static str,
    ordinal: bool,
    unkeyed: Vec<(String, Signature)>,
    keyed: SignatureMap,
}

impl SignatureCollector {
    fn new(side: &'static str, ordinal: bool) -> Self {
        Self {
            side,
            ordinal,
            unkeyed: Vec::new(),
            keyed: SignatureMap::new(),
        }
    }

    /// `key_value` is the row's key field in the target representation.
    fn push(&mut self, key_value: &Value, signature: Signature, log: &mut JobLog) {
        let key = normalize(key_value);
        if self.ordinal {
            self.unkeyed.push((key, signature));
            return;
        }
        let key = RowKey::Id(key);
        if self.keyed.insert(key.clone(), signature).is_some() {
            log.warn(format!(
                "Duplicate {} key {} during verification",
                self.side, key
            ));
        }
    }

    fn finish(mut self) -> SignatureMap {
        if !self.ordinal {
            return self.keyed;
        }
        self.unkeyed.sort();
        self.unkeyed
            .into_iter()
            .enumerate()
            .map(|(i, (_, signature))| (RowKey::Ordinal(i as u64 + 1), signature))
            .collect()
    }
}

/// Where the row key and sort order come from on each side.
#[derive(Debug, Clone)]
struct KeyPlan {
    ordinal: bool,
    source_field: String,
    source_index: usize,
    target_field: String,
}

/// Compares a finished import against its source.
pub struct ChecksumVerifier {
    source: Arc<dyn ConnectionProvider>,
    target: Arc<dyn TargetStore>,
}

impl ChecksumVerifier {
    pub fn new(source: Arc<dyn ConnectionProvider>, target: Arc<dyn TargetStore>) -> Self {
        Self { source, target }
    }

    /// Run one verification pass for `mapping`.
    ///
    /// Errors mean the verifier itself could not run (for example the
    /// target has no usable key field); a completed pass with differences
    /// is an `Ok` report that did not pass.
    pub async fn verify(
        &self,
        mapping: &MappingDescriptor,
        log: &mut JobLog,
    ) -> Result<VerificationReport> {
        let config = &mapping.verification;
        let plan = self.key_plan(mapping).await?;

        log.info(format!(
            "Verification started for {} ({}, keyed by {})",
            mapping.target_entity,
            config.strategy,
            if plan.ordinal {
                format!("row order of {}", plan.source_field)
            } else {
                format!("{} = {}", plan.source_field, plan.target_field)
            }
        ));

        let source_map = self.source_signatures(mapping, &plan, log).await?;
        debug!("Built {} source signatures", source_map.len());

        let target_map = self.target_signatures(mapping, &plan, log).await?;
        debug!("Built {} target signatures", target_map.len());

        let report = compare(
            mapping,
            &source_map,
            &target_map,
            config.strategy,
            config.max_report_entries,
        );

        if report.passed() {
            log.info(format!(
                "Verification passed: {} rows matched",
                report.matched
            ));
        } else {
            log.warn(format!(
                "Verification failed: {} missing in target, {} extra in target, {} mismatched",
                report.missing_in_target, report.extra_in_target, report.mismatched
            ));
        }

        info!(
            "Verification of {}: source={} target={} mismatches={}",
            mapping.target_entity,
            report.source_rows,
            report.target_rows,
            report.mismatch_count()
        );

        Ok(report)
    }

    async fn key_plan(&self, mapping: &MappingDescriptor) -> Result<KeyPlan> {
        let first = mapping
            .fields
            .first()
            .ok_or_else(|| ImportError::Verification("mapping has no fields".into()))?;

        let stored = self
            .target
            .list_stored_fields(&mapping.target_entity)
            .await?;
        let has_field = |name: &str| stored.iter().any(|f| f.name == name);

        let plan = match &mapping.verification.row_key {
            RowKeyStrategy::Ordinal => KeyPlan {
                ordinal: true,
                source_field: first.source_field.clone(),
                source_index: 0,
                target_field: first.target_field.clone(),
            },
            RowKeyStrategy::Field {
                source_field,
                target_field,
            } => {
                let source_index = mapping.source_index(source_field).ok_or_else(|| {
                    ImportError::Verification(format!(
                        "key field {} is not a mapped source field",
                        source_field
                    ))
                })?;
                KeyPlan {
                    ordinal: false,
                    source_field: source_field.clone(),
                    source_index,
                    target_field: target_field.clone(),
                }
            }
        };

        if !has_field(&plan.target_field) {
            return Err(ImportError::Verification(format!(
                "target {} has no field {} to key rows by",
                mapping.target_entity, plan.target_field
            )));
        }

        for field in &mapping.fields {
            if !has_field(&field.target_field) {
                return Err(ImportError::Verification(format!(
                    "target {} has no field {}",
                    mapping.target_entity, field.target_field
                )));
            }
        }

        Ok(plan)
    }

    async fn source_signatures(
        &self,
        mapping: &MappingDescriptor,
        plan: &KeyPlan,
        log: &mut JobLog,
    ) -> Result<SignatureMap> {
        let reader = SourceReader::new(self.source.clone(), mapping);
        let mut batches = reader.open_ordered(&plan.source_field).await?;
        let mut signatures = SignatureCollector::new("source", plan.ordinal);

        while let Some(batch) = batches.next_batch().await? {
            for row in batch {
                let projected = project_source_row(&mapping.fields, &row);
                let signature = signature(&projected, mapping.verification.strategy);
                let key = projected.get(plan.source_index).unwrap_or(&Value::Null);
                signatures.push(key, signature, log);
            }
        }

        Ok(signatures.finish())
    }

    async fn target_signatures(
        &self,
        mapping: &MappingDescriptor,
        plan: &KeyPlan,
        log: &mut JobLog,
    ) -> Result<SignatureMap> {
        let mut fields = mapping.target_fields();
        let key_index = match fields.iter().position(|f| *f == plan.target_field) {
            Some(i) => i,
            None => {
                fields.push(plan.target_field.clone());
                fields.len() - 1
            }
        };
        let width = mapping.fields.len();

        let cursor = self
            .target
            .scan(&mapping.target_entity, &fields, Some(&plan.target_field))
            .await?;
        let mut cursor = ScopedCursor::new(cursor);

        let mut signatures = SignatureCollector::new("target", plan.ordinal);

        loop {
            let batch = cursor.fetch_batch(mapping.batch_size.max(1)).await?;
            if batch.is_empty() {
                break;
            }

            for row in batch {
                if row.len() != fields.len() {
                    return Err(ImportError::Verification(format!(
                        "target returned {} fields, expected {}",
                        row.len(),
                        fields.len()
                    )));
                }
                let signature = signature(&row[..width], mapping.verification.strategy);
                signatures.push(&row[key_index], signature, log);
            }
        }

        Ok(signatures.finish())
    }
}

/// Source values in the target's representation.
///
/// A value its transform rejects is compared raw; the import already
/// counted that row as failed, so it surfaces as missing or mismatched.
fn project_source_row(fields: &[FieldMapping], row: &Row) -> Vec<Value> {
    fields
        .iter()
        .zip(row.iter())
        .map(|(field, raw)| field.transform.apply(raw).unwrap_or_else(|_| raw.clone()))
        .collect()
}

fn signature(values: &[Value], strategy: CompareStrategy) -> Signature {
    let normalized = normalize_row(values);
    match strategy {
        CompareStrategy::RowChecksum => Signature::Checksum(row_checksum(&normalized)),
        CompareStrategy::ValueVector => Signature::Values(normalized),
    }
}

fn compare(
    mapping: &MappingDescriptor,
    source: &SignatureMap,
    target: &SignatureMap,
    strategy: CompareStrategy,
    max_entries: usize,
) -> VerificationReport {
    let mut report = VerificationReport {
        entity: mapping.target_entity.clone(),
        strategy,
        source_rows: source.len() as u64,
        target_rows: target.len() as u64,
        ..Default::default()
    };

    let record = |report: &mut VerificationReport, key: &RowKey, kind: DiscrepancyKind| {
        if report.discrepancies.len() < max_entries {
            report.discrepancies.push(Discrepancy {
                key: key.clone(),
                kind,
            });
        }
    };

    for (key, src) in source {
        match target.get(key) {
            None => {
                report.missing_in_target += 1;
                record(&mut report, key, DiscrepancyKind::MissingInTarget);
            }
            Some(tgt) if tgt == src => report.matched += 1,
            Some(tgt) => {
                report.mismatched += 1;
                record(&mut report, key, mismatch_kind(mapping, src, tgt));
            }
        }
    }

    for key in target.keys().filter(|k| !source.contains_key(*k)) {
        report.extra_in_target += 1;
        record(&mut report, key, DiscrepancyKind::ExtraInTarget);
    }

    report.discrepancies.sort_by(|a, b| a.key.cmp(&b.key));
    report
}

fn mismatch_kind(mapping: &MappingDescriptor, src: &Signature, tgt: &Signature) -> DiscrepancyKind {
    match (src, tgt) {
        (Signature::Values(s), Signature::Values(t)) => {
            let differing = s
                .iter()
                .zip(t.iter())
                .enumerate()
                .find(|(_, (a, b))| a != b);
            match differing {
                Some((i, (sv, tv))) => DiscrepancyKind::ValueMismatch {
                    field: mapping.fields[i].target_field.clone(),
                    source: sv.clone(),
                    target: tv.clone(),
                },
                None => DiscrepancyKind::ChecksumMismatch {
                    source: row_checksum(s),
                    target: row_checksum(t),
                },
            }
        }
        (Signature::Checksum(s), Signature::Checksum(t)) => DiscrepancyKind::ChecksumMismatch {
            source: *s,
            target: *t,
        },
        // Both maps are built with one strategy.
        _ => DiscrepancyKind::ChecksumMismatch { source: 0, target: 0 },
    }
}
