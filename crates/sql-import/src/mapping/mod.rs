//! Mapping descriptors: which source fields go to which target fields, and how.
//!
//! A descriptor is validated once before a job starts and is immutable for
//! the lifetime of that job. The job keeps its own snapshot, so editing a
//! mapping never affects a job that already references it.

mod row;
mod transform;
mod validation;

pub use row::transform_row;
pub use transform::{parse_datetime, Transform};
pub use validation::validate;

use crate::error::{ImportError, Result};
use crate::target::StoredField;
use crate::verify::VerificationConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where rows come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Source schema (default: "dbo").
    #[serde(default = "default_dbo_schema")]
    pub schema: String,

    /// Source table name.
    pub table: String,

    /// Optional row filter, applied verbatim as a WHERE predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl SourceLocation {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// How transformed records are written to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Insert every record as new.
    #[default]
    Create,
    /// Update records matched by key; unmatched records fail.
    Update,
    /// Update records matched by key, insert the rest.
    #[serde(alias = "create_update")]
    CreateOrUpdate,
}

impl WriteMode {
    /// Whether records are matched against existing target records.
    pub fn requires_key(&self) -> bool {
        !matches!(self, WriteMode::Create)
    }
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteMode::Create => write!(f, "create"),
            WriteMode::Update => write!(f, "update"),
            WriteMode::CreateOrUpdate => write!(f, "create_or_update"),
        }
    }
}

/// One positional source-to-target field pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub transform: Transform,
}

impl FieldMapping {
    pub fn new(
        source_field: impl Into<String>,
        target_field: impl Into<String>,
        transform: Transform,
    ) -> Self {
        Self {
            source_field: source_field.into(),
            target_field: target_field.into(),
            transform,
        }
    }
}

/// Validated, immutable import configuration for one source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingDescriptor {
    /// Unique mapping name.
    pub name: String,

    /// Source table and optional filter.
    pub source: SourceLocation,

    /// Destination collection/model (for PostgreSQL: `schema.table` or `table`).
    pub target_entity: String,

    /// Write mode (default: create).
    #[serde(default)]
    pub write_mode: WriteMode,

    /// Ordered field mappings. Order matches source projection order.
    pub fields: Vec<FieldMapping>,

    /// Rows per batch (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Continue past per-row and per-batch failures (default: false).
    #[serde(default)]
    pub skip_errors: bool,

    /// Target field holding a natural or legacy key. Used by the update
    /// write modes and by identifier-keyed verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,

    /// Post-import verification settings.
    #[serde(default)]
    pub verification: VerificationConfig,
}

impl MappingDescriptor {
    /// Create a descriptor with default batch size and error policy.
    pub fn new(
        name: impl Into<String>,
        source: SourceLocation,
        target_entity: impl Into<String>,
        fields: Vec<FieldMapping>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            target_entity: target_entity.into(),
            write_mode: WriteMode::Create,
            fields,
            batch_size: default_batch_size(),
            skip_errors: false,
            key_field: None,
            verification: VerificationConfig::default(),
        }
    }

    /// Parse a descriptor from its JSON text form.
    pub fn from_json(json: &str) -> Result<Self> {
        let descriptor: MappingDescriptor = serde_json::from_str(json)
            .map_err(|e| ImportError::InvalidMapping(format!("invalid mapping JSON: {}", e)))?;
        Ok(descriptor)
    }

    /// Serialize to JSON. Field order is kept.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse the raw `fields` blob (a JSON array of mapping objects).
    ///
    /// Reports which entry is malformed instead of a bare serde error.
    pub fn parse_fields(text: &str) -> Result<Vec<FieldMapping>> {
        if text.trim().is_empty() {
            return Err(ImportError::InvalidMapping(
                "field mappings are required".into(),
            ));
        }

        let raw: serde_json::Value = serde_json::from_str(text)
            .map_err(|_| ImportError::InvalidMapping("invalid JSON in field mappings".into()))?;

        let entries = raw.as_array().ok_or_else(|| {
            ImportError::InvalidMapping("field mappings must be a JSON array".into())
        })?;

        let mut fields = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let position = i + 1;
            let obj = entry.as_object().ok_or_else(|| {
                ImportError::InvalidMapping(format!("mapping {} is not a valid object", position))
            })?;

            let source_field = obj
                .get("source_field")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ImportError::InvalidMapping(format!(
                        "missing source_field in mapping {}",
                        position
                    ))
                })?;
            let target_field = obj
                .get("target_field")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ImportError::InvalidMapping(format!(
                        "missing target_field in mapping {}",
                        position
                    ))
                })?;
            let transform = match obj.get("transform").and_then(|v| v.as_str()) {
                Some(name) => name.parse::<Transform>().map_err(|e| {
                    ImportError::InvalidMapping(format!("{} in mapping {}", e, position))
                })?,
                None => Transform::Direct,
            };

            fields.push(FieldMapping::new(source_field, target_field, transform));
        }

        Ok(fields)
    }

    /// Validate against the target entity's stored fields.
    pub fn validate(&self, stored_fields: &[StoredField]) -> Result<()> {
        validation::validate(self, stored_fields)
    }

    pub fn source_fields(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.source_field.clone()).collect()
    }

    pub fn target_fields(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.target_field.clone()).collect()
    }

    /// Position of a source field in the projection.
    pub fn source_index(&self, source_field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.source_field == source_field)
    }

    /// Position of a target field in the projection.
    pub fn target_index(&self, target_field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.target_field == target_field)
    }

    /// SHA256 of the JSON form. Keys job state signatures.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_batch_size() -> usize {
    100
}
