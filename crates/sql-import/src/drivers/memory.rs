//! In-process source and target stores.
//!
//! Used by the test suites and for dry runs. The source interprets
//! [`QueryShape`] instead of SQL, so filters are not applied.

use crate::core::{HealthStatus, Record, Row, Value};
use crate::error::{ImportError, Result};
use crate::source::{ChannelCursor, ConnectionProvider, Cursor, Dialect, QueryShape, SourceQuery};
use crate::target::{StoredField, TargetStore};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Total order over values for sorting scans: nulls first, then by kind.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null | Value::Unset => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) | Value::Decimal(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
            Value::Date(_) => 5,
            Value::DateTime(_) => 6,
        }
    }

    fn as_f64(v: &Value) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        match v {
            Value::Int(n) => *n as f64,
            Value::Float(f) => *f,
            Value::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Decimal(x), Value::Decimal(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        _ if rank(a) == 2 && rank(b) == 2 => as_f64(a).total_cmp(&as_f64(b)),
        _ => rank(a).cmp(&rank(b)),
    }
}

struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Source tables held in memory, addressed as `schema.table`.
pub struct MemorySource {
    tables: Mutex<HashMap<String, MemoryTable>>,
    connected: AtomicBool,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Add a table. Every row must have one value per column.
    pub fn with_table(self, schema: &str, table: &str, columns: &[&str], rows: Vec<Row>) -> Self {
        lock(&self.tables).insert(
            format!("{}.{}", schema, table),
            MemoryTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        );
        self
    }

    /// Simulate losing (or regaining) the connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, AtomicOrdering::SeqCst);
    }

    fn run(&self, query: &SourceQuery) -> Result<Vec<Row>> {
        let tables = lock(&self.tables);
        let name = query.location.full_name();
        let table = tables
            .get(&name)
            .ok_or_else(|| ImportError::Connection(format!("source: invalid object name '{}'", name)))?;

        match &query.shape {
            QueryShape::Count => Ok(vec![vec![Value::Int(table.rows.len() as i64)]]),
            QueryShape::Select {
                columns,
                order_by,
                limit,
            } => {
                let index_of = |col: &str| {
                    table.columns.iter().position(|c| c == col).ok_or_else(|| {
                        ImportError::Connection(format!("source: invalid column name '{}'", col))
                    })
                };
                let indices = columns
                    .iter()
                    .map(|c| index_of(c))
                    .collect::<Result<Vec<_>>>()?;

                let mut rows: Vec<&Row> = table.rows.iter().collect();
                if let Some(col) = order_by {
                    let idx = index_of(col)?;
                    rows.sort_by(|a, b| compare_values(&a[idx], &b[idx]));
                }

                let take = limit.unwrap_or(usize::MAX);
                Ok(rows
                    .into_iter()
                    .take(take)
                    .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                    .collect())
            }
        }
    }
}

#[async_trait]
impl ConnectionProvider for MemorySource {
    async fn open_cursor(&self, query: &SourceQuery) -> Result<Box<dyn Cursor>> {
        if !self.is_connected() {
            return Err(ImportError::Connection("source: connection refused".into()));
        }
        let rows = self.run(query)?;
        Ok(Box::new(ChannelCursor::from_rows(rows)))
    }

    fn dialect(&self) -> Dialect {
        Dialect::Mssql
    }

    fn is_connected(&self) -> bool {
        self.connected.load(AtomicOrdering::SeqCst)
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        if self.is_connected() {
            Ok(HealthStatus::ok(0, Some("in-memory".into())))
        } else {
            Ok(HealthStatus::failed(0, "connection refused"))
        }
    }
}

struct MemoryEntity {
    fields: Vec<StoredField>,
    records: Vec<Record>,
}

/// Target entities held in memory.
///
/// Batches are atomic: a rejected batch leaves no records behind.
pub struct MemoryTarget {
    entities: Mutex<HashMap<String, MemoryEntity>>,
    rejections: Mutex<Vec<(String, Value)>>,
    connected: AtomicBool,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self {
            entities: Mutex::new(HashMap::new()),
            rejections: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn with_entity(self, name: &str, fields: Vec<StoredField>) -> Self {
        lock(&self.entities).insert(
            name.to_string(),
            MemoryEntity {
                fields,
                records: Vec::new(),
            },
        );
        self
    }

    /// Snapshot of the records stored in `entity`.
    pub fn records(&self, entity: &str) -> Vec<Record> {
        lock(&self.entities)
            .get(entity)
            .map(|e| e.records.clone())
            .unwrap_or_default()
    }

    /// Store a record without going through the write path.
    pub fn insert_raw(&self, entity: &str, record: Record) {
        if let Some(e) = lock(&self.entities).get_mut(entity) {
            e.records.push(record);
        }
    }

    /// Reject any batch containing a record whose `field` equals `value`.
    pub fn reject_records_where(&self, field: &str, value: Value) {
        lock(&self.rejections).push((field.to_string(), value));
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, AtomicOrdering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(ImportError::Connection("target: connection refused".into()))
        }
    }

    fn check_record(&self, entity: &str, fields: &[StoredField], record: &Record) -> Result<()> {
        for name in record.field_names() {
            if !fields.iter().any(|f| f.name == name) {
                return Err(ImportError::write(
                    entity,
                    format!("unknown field '{}'", name),
                ));
            }
        }
        for (field, value) in lock(&self.rejections).iter() {
            if record.get(field) == Some(value) {
                return Err(ImportError::write(
                    entity,
                    format!("record rejected: {} = {:?}", field, value),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn create_many(&self, entity: &str, records: &[Record]) -> Result<u64> {
        self.ensure_connected()?;
        let mut entities = lock(&self.entities);
        let e = entities
            .get_mut(entity)
            .ok_or_else(|| ImportError::write(entity, "unknown entity"))?;

        for record in records {
            self.check_record(entity, &e.fields, record)?;
        }
        e.records.extend(records.iter().cloned());
        Ok(records.len() as u64)
    }

    async fn find_by_key(
        &self,
        entity: &str,
        key_field: &str,
        key: &Value,
    ) -> Result<Option<Record>> {
        self.ensure_connected()?;
        Ok(lock(&self.entities).get(entity).and_then(|e| {
            e.records
                .iter()
                .find(|r| r.get(key_field) == Some(key))
                .cloned()
        }))
    }

    async fn update_by_key(
        &self,
        entity: &str,
        key_field: &str,
        key: &Value,
        record: &Record,
    ) -> Result<u64> {
        self.ensure_connected()?;
        let mut entities = lock(&self.entities);
        let e = entities
            .get_mut(entity)
            .ok_or_else(|| ImportError::write(entity, "unknown entity"))?;
        self.check_record(entity, &e.fields, record)?;

        let mut updated = 0;
        for existing in e.records.iter_mut() {
            if existing.get(key_field) == Some(key) {
                for (name, value) in record.iter() {
                    existing.insert(name, value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn list_stored_fields(&self, entity: &str) -> Result<Vec<StoredField>> {
        self.ensure_connected()?;
        lock(&self.entities)
            .get(entity)
            .map(|e| e.fields.clone())
            .ok_or_else(|| ImportError::NotFound(format!("target entity '{}'", entity)))
    }

    async fn scan(
        &self,
        entity: &str,
        fields: &[String],
        order_by: Option<&str>,
    ) -> Result<Box<dyn Cursor>> {
        self.ensure_connected()?;
        let mut records = self.records(entity);
        if let Some(col) = order_by {
            records.sort_by(|a, b| {
                compare_values(
                    a.get(col).unwrap_or(&Value::Null),
                    b.get(col).unwrap_or(&Value::Null),
                )
            });
        }

        let rows = records
            .iter()
            .map(|r| {
                fields
                    .iter()
                    .map(|f| r.get(f).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Ok(Box::new(ChannelCursor::from_rows(rows)))
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        match self.ensure_connected() {
            Ok(()) => Ok(HealthStatus::ok(0, Some("in-memory".into()))),
            Err(e) => Ok(HealthStatus::failed(0, e.to_string())),
        }
    }
}
