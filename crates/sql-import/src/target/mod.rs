//! Target side: the store adapter contract and the Batch Writer.

mod writer;

pub use writer::{BatchWriter, FieldKeyResolver, KeyResolver, WriteOutcome};

use crate::core::{HealthStatus, Record, Value};
use crate::error::Result;
use crate::source::Cursor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One field stored on a target entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredField {
    pub name: String,
    /// Store-native type name.
    pub field_type: String,
    pub required: bool,
}

impl StoredField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required,
        }
    }
}

/// Adapter over the destination store.
///
/// `find_by_key` and `update_by_key` are only used by the update write
/// modes; `scan` is only used by the verifier.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert every record as new. Returns the inserted count.
    async fn create_many(&self, entity: &str, records: &[Record]) -> Result<u64>;

    /// Look up one record by the value of `key_field`.
    async fn find_by_key(
        &self,
        entity: &str,
        key_field: &str,
        key: &Value,
    ) -> Result<Option<Record>>;

    /// Overwrite the fields of `record` on every record matching the key.
    /// Returns the number of records updated.
    async fn update_by_key(
        &self,
        entity: &str,
        key_field: &str,
        key: &Value,
        record: &Record,
    ) -> Result<u64>;

    /// Field introspection used by mapping validation.
    async fn list_stored_fields(&self, entity: &str) -> Result<Vec<StoredField>>;

    /// Re-read `fields` of every record, ordered by `order_by` when given.
    async fn scan(
        &self,
        entity: &str,
        fields: &[String],
        order_by: Option<&str>,
    ) -> Result<Box<dyn Cursor>>;

    async fn health_check(&self) -> Result<HealthStatus>;
}
