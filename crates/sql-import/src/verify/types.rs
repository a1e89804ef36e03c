//! Type definitions for post-import verification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How source rows are correlated with target rows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowKeyStrategy {
    /// 1-based position under a deterministic sort by the first mapped field.
    ///
    /// Breaks if the target is written to concurrently.
    #[default]
    Ordinal,
    /// A stable identifier carried by both sides.
    Field {
        source_field: String,
        target_field: String,
    },
}

/// How two correlated rows are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareStrategy {
    /// One 64-bit checksum per row.
    #[default]
    RowChecksum,
    /// Normalized value per field; mismatches name the differing field.
    ValueVector,
}

impl fmt::Display for CompareStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareStrategy::RowChecksum => write!(f, "row_checksum"),
            CompareStrategy::ValueVector => write!(f, "value_vector"),
        }
    }
}

/// Verification settings, part of a mapping descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Run the verifier after a successful import (default: false).
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub row_key: RowKeyStrategy,

    #[serde(default)]
    pub strategy: CompareStrategy,

    /// Discrepancies listed in the report before it is truncated (default: 100).
    #[serde(default = "default_max_report_entries")]
    pub max_report_entries: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            row_key: RowKeyStrategy::default(),
            strategy: CompareStrategy::default(),
            max_report_entries: default_max_report_entries(),
        }
    }
}

fn default_max_report_entries() -> usize {
    100
}

/// Verification outcome recorded on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationStatus::Pending => write!(f, "pending"),
            VerificationStatus::Running => write!(f, "running"),
            VerificationStatus::Passed => write!(f, "passed"),
            VerificationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Key of one row on either side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowKey {
    Ordinal(u64),
    Id(String),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Ordinal(n) => write!(f, "{}", n),
            RowKey::Id(s) => write!(f, "{}", s),
        }
    }
}

/// What went wrong for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscrepancyKind {
    MissingInTarget,
    ExtraInTarget,
    /// Row checksums differ.
    ChecksumMismatch { source: u64, target: u64 },
    /// A normalized field value differs.
    ValueMismatch {
        field: String,
        source: String,
        target: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub key: RowKey,
    #[serde(flatten)]
    pub kind: DiscrepancyKind,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DiscrepancyKind::MissingInTarget => write!(f, "key {}: missing in target", self.key),
            DiscrepancyKind::ExtraInTarget => write!(f, "key {}: extra in target", self.key),
            DiscrepancyKind::ChecksumMismatch { source, target } => write!(
                f,
                "key {}: mismatch (source checksum {:016x}, target checksum {:016x})",
                self.key, source, target
            ),
            DiscrepancyKind::ValueMismatch {
                field,
                source,
                target,
            } => write!(
                f,
                "key {}: mismatch in {} (source {}, target {})",
                self.key, field, source, target
            ),
        }
    }
}

/// Result of one verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub entity: String,
    pub strategy: CompareStrategy,
    pub source_rows: u64,
    pub target_rows: u64,
    pub matched: u64,
    pub missing_in_target: u64,
    pub extra_in_target: u64,
    pub mismatched: u64,
    /// At most `max_report_entries` items, in key order.
    pub discrepancies: Vec<Discrepancy>,
}

impl VerificationReport {
    pub fn mismatch_count(&self) -> u64 {
        self.missing_in_target + self.extra_in_target + self.mismatched
    }

    pub fn passed(&self) -> bool {
        self.mismatch_count() == 0
    }

    pub fn is_truncated(&self) -> bool {
        (self.discrepancies.len() as u64) < self.mismatch_count()
    }

    pub fn status(&self) -> VerificationStatus {
        if self.passed() {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        }
    }

    /// Human-readable report stored on the job.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Verification of {} ({}): {}\n",
            self.entity,
            self.strategy,
            if self.passed() { "PASSED" } else { "FAILED" }
        ));
        out.push_str(&format!(
            "Source rows: {}, target rows: {}, matched: {}\n",
            self.source_rows, self.target_rows, self.matched
        ));
        out.push_str(&format!(
            "Missing in target: {}, extra in target: {}, mismatched: {}\n",
            self.missing_in_target, self.extra_in_target, self.mismatched
        ));

        for d in &self.discrepancies {
            out.push_str(&format!("  - {}\n", d));
        }

        if self.is_truncated() {
            out.push_str(&format!(
                "Report truncated: showing {} of {} discrepancies\n",
                self.discrepancies.len(),
                self.mismatch_count()
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: VerificationConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.row_key, RowKeyStrategy::Ordinal);
        assert_eq!(config.strategy, CompareStrategy::RowChecksum);
        assert_eq!(config.max_report_entries, 100);
    }

    #[test]
    fn test_field_key_deserialize() {
        let config: VerificationConfig = serde_json::from_str(
            r#"{"enabled": true, "row_key": {"type": "field", "source_field": "Id", "target_field": "legacy_id"}, "strategy": "value_vector"}"#,
        )
        .unwrap();
        assert_eq!(
            config.row_key,
            RowKeyStrategy::Field {
                source_field: "Id".into(),
                target_field: "legacy_id".into()
            }
        );
        assert_eq!(config.strategy, CompareStrategy::ValueVector);
    }

    #[test]
    fn test_report_render_and_truncation() {
        let report = VerificationReport {
            entity: "res_partner".into(),
            strategy: CompareStrategy::RowChecksum,
            source_rows: 100,
            target_rows: 98,
            matched: 97,
            missing_in_target: 2,
            extra_in_target: 0,
            mismatched: 1,
            discrepancies: vec![Discrepancy {
                key: RowKey::Id("42".into()),
                kind: DiscrepancyKind::MissingInTarget,
            }],
        };

        assert!(!report.passed());
        assert_eq!(report.mismatch_count(), 3);
        assert_eq!(report.status(), VerificationStatus::Failed);

        let text = report.render();
        assert!(text.contains("FAILED"));
        assert!(text.contains("key 42: missing in target"));
        assert!(text.contains("Report truncated: showing 1 of 3"));
    }

    #[test]
    fn test_clean_report_passes() {
        let report = VerificationReport {
            entity: "t".into(),
            source_rows: 5,
            target_rows: 5,
            matched: 5,
            ..Default::default()
        };
        assert!(report.passed());
        assert!(!report.is_truncated());
        assert!(report.render().contains("PASSED"));
    }
}
