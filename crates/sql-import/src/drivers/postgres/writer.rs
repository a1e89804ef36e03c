//! PostgreSQL target store.
//!
//! Uses deadpool-postgres for connection pooling. Values are bound as `$n`
//! parameters and converted to the column type PostgreSQL infers for each
//! placeholder. A batch is inserted inside one transaction, so a rejected
//! batch leaves nothing behind.

use std::error::Error;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SslMode;
use crate::config::TargetConfig;
use crate::core::{HealthStatus, Record, Row, Value};
use crate::error::{ImportError, Result};
use crate::source::{ChannelCursor, Cursor, Dialect};
use crate::target::{StoredField, TargetStore};

/// Connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows buffered between the scan task and the cursor.
const SCAN_BUFFER_ROWS: usize = 1000;

/// Bind parameters PostgreSQL accepts in one statement.
const MAX_BIND_PARAMS: usize = 65535;

/// Bound for fields a record does not carry.
static NULL: Value = Value::Null;

/// Target store backed by PostgreSQL tables.
///
/// Entities are `schema.table` or a bare table name in the configured schema.
pub struct PgTarget {
    pool: Pool,
    schema: String,
}

impl PgTarget {
    /// Build the pool and verify the connection.
    pub async fn connect(config: &TargetConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.credential.user);
        pg_config.password(config.credential.password()?);

        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(CONNECT_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match SslMode::parse(&config.ssl_mode)?.connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections as usize)
            .build()
            .map_err(|e| ImportError::Connection(format!("target pool: {}", e)))?;

        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }

    fn qualify(&self, entity: &str) -> String {
        let (schema, table) = self.split_entity(entity);
        Dialect::Postgres.qualify(schema, table)
    }

    fn split_entity<'a>(&'a self, entity: &'a str) -> (&'a str, &'a str) {
        entity
            .split_once('.')
            .unwrap_or((self.schema.as_str(), entity))
    }
}

fn quote(name: &str) -> String {
    Dialect::Postgres.quote_ident(name)
}

type BindError = Box<dyn Error + Sync + Send>;

fn mismatch(value: &Value, ty: &Type) -> BindError {
    format!("cannot bind {} to a {} parameter", value.kind(), ty).into()
}

fn bind_text(
    value: &Value,
    s: &str,
    ty: &Type,
    out: &mut BytesMut,
) -> std::result::Result<IsNull, BindError> {
    match *ty {
        Type::UUID => Uuid::parse_str(s)?.to_sql(ty, out),
        _ if <&str as ToSql>::accepts(ty) => s.to_sql(ty, out),
        _ => Err(mismatch(value, ty)),
    }
}

/// Converts to the parameter type PostgreSQL inferred from the statement.
/// `Unset` binds NULL. Conversions that would lose information fail.
impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BindError> {
        match self {
            Value::Null | Value::Unset => Ok(IsNull::Yes),
            Value::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                _ => bind_text(self, &b.to_string(), ty, out),
            },
            Value::Int(n) => match *ty {
                Type::INT2 => i16::try_from(*n)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*n)?.to_sql(ty, out),
                Type::INT8 => n.to_sql(ty, out),
                Type::FLOAT4 => (*n as f32).to_sql(ty, out),
                Type::FLOAT8 => (*n as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*n).to_sql(ty, out),
                _ => bind_text(self, &n.to_string(), ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::FLOAT8 => f.to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                _ => bind_text(self, &f.to_string(), ty, out),
            },
            Value::Decimal(d) => match *ty {
                Type::NUMERIC => d.to_sql(ty, out),
                Type::FLOAT4 | Type::FLOAT8 => match d.to_f64() {
                    Some(f) if *ty == Type::FLOAT4 => (f as f32).to_sql(ty, out),
                    Some(f) => f.to_sql(ty, out),
                    None => Err(mismatch(self, ty)),
                },
                Type::INT2 | Type::INT4 | Type::INT8 if d.fract().is_zero() => match d.to_i64() {
                    Some(n) => Value::Int(n).to_sql(ty, out),
                    None => Err(mismatch(self, ty)),
                },
                _ => bind_text(self, &d.to_string(), ty, out),
            },
            Value::Text(s) => bind_text(self, s, ty, out),
            Value::Bytes(b) => match *ty {
                Type::BYTEA => b.as_slice().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            Value::Date(d) => match *ty {
                Type::DATE => d.to_sql(ty, out),
                Type::TIMESTAMP | Type::TIMESTAMPTZ => {
                    Value::DateTime(d.and_time(NaiveTime::MIN)).to_sql(ty, out)
                }
                _ => bind_text(self, &d.format("%Y-%m-%d").to_string(), ty, out),
            },
            Value::DateTime(dt) => match *ty {
                Type::TIMESTAMP => dt.to_sql(ty, out),
                Type::TIMESTAMPTZ => Utc.from_utc_datetime(dt).to_sql(ty, out),
                Type::DATE if dt.time() == NaiveTime::MIN => dt.date().to_sql(ty, out),
                _ => bind_text(
                    self,
                    &dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
                    ty,
                    out,
                ),
            },
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

type Params<'a> = Vec<&'a (dyn ToSql + Sync)>;

/// Records per INSERT statement for `width` columns.
fn rows_per_insert(width: usize) -> usize {
    (MAX_BIND_PARAMS / width.max(1)).max(1)
}

/// One INSERT covering every record. Columns come from the first record;
/// a record without one of them binds NULL.
fn build_insert_sql<'a>(table: &str, records: &'a [Record]) -> (String, Params<'a>) {
    let cols: Vec<&str> = records
        .first()
        .map(|r| r.field_names().collect())
        .unwrap_or_default();

    let col_list = cols.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    let mut params: Params<'a> = Vec::with_capacity(records.len() * cols.len());
    let mut value_rows = Vec::with_capacity(records.len());

    for record in records {
        let mut placeholders = Vec::with_capacity(cols.len());
        for col in &cols {
            params.push(record.get(col).unwrap_or(&NULL));
            placeholders.push(format!("${}", params.len()));
        }
        value_rows.push(format!("({})", placeholders.join(", ")));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        col_list,
        value_rows.join(", ")
    );
    (sql, params)
}

fn build_update_sql<'a>(
    table: &str,
    key_field: &str,
    key: &'a Value,
    record: &'a Record,
) -> (String, Params<'a>) {
    let mut params: Params<'a> = Vec::with_capacity(record.len() + 1);
    let mut assignments = Vec::with_capacity(record.len());
    for (name, value) in record.iter() {
        params.push(value);
        assignments.push(format!("{} = ${}", quote(name), params.len()));
    }
    params.push(key);

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ${}",
        table,
        assignments.join(", "),
        quote(key_field),
        params.len()
    );
    (sql, params)
}

fn decode_error(
    row: &tokio_postgres::Row,
    idx: usize,
    cause: impl std::fmt::Display,
) -> ImportError {
    let col = &row.columns()[idx];
    ImportError::Decode(format!(
        "target column {} ({}): {}",
        col.name(),
        col.type_(),
        cause
    ))
}

/// Decode one column by its PostgreSQL type name.
fn column_value(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    let decoded = match row.columns()[idx].type_().name() {
        "bool" => row.try_get::<_, Option<bool>>(idx).map(Value::from),
        "int2" => row.try_get::<_, Option<i16>>(idx).map(|v| Value::from(v.map(i64::from))),
        "int4" => row.try_get::<_, Option<i32>>(idx).map(Value::from),
        "int8" => row.try_get::<_, Option<i64>>(idx).map(Value::from),
        "float4" => row.try_get::<_, Option<f32>>(idx).map(|v| Value::from(v.map(f64::from))),
        "float8" => row.try_get::<_, Option<f64>>(idx).map(Value::from),
        "numeric" => row.try_get::<_, Option<Decimal>>(idx).map(Value::from),
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx).map(Value::from),
        "date" => row.try_get::<_, Option<NaiveDate>>(idx).map(Value::from),
        "time" => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .map(|v| Value::from(v.map(|t| t.format("%H:%M:%S%.f").to_string()))),
        "timestamp" => row.try_get::<_, Option<NaiveDateTime>>(idx).map(Value::from),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .map(|v| Value::from(v.map(|dt| dt.naive_utc()))),
        "uuid" => row
            .try_get::<_, Option<Uuid>>(idx)
            .map(|v| Value::from(v.map(|u| u.to_string()))),
        "text" | "varchar" | "bpchar" | "name" | "citext" => {
            row.try_get::<_, Option<String>>(idx).map(Value::from)
        }
        other => return Err(decode_error(row, idx, format!("unsupported type {}", other))),
    };
    decoded.map_err(|e| decode_error(row, idx, e))
}

fn to_record(row: &tokio_postgres::Row) -> Result<Record> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| Ok((col.name().to_string(), column_value(row, i)?)))
        .collect()
}

#[async_trait]
impl TargetStore for PgTarget {
    async fn create_many(&self, entity: &str, records: &[Record]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let table = self.qualify(entity);
        let width = records.first().map_or(1, Record::len);
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let mut inserted = 0;
        for chunk in records.chunks(rows_per_insert(width)) {
            let (sql, params) = build_insert_sql(&table, chunk);
            inserted += tx
                .execute(sql.as_str(), &params)
                .await
                .map_err(|e| ImportError::write(entity, e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| ImportError::write(entity, e.to_string()))?;
        Ok(inserted)
    }

    async fn find_by_key(
        &self,
        entity: &str,
        key_field: &str,
        key: &Value,
    ) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = $1 LIMIT 1",
            self.qualify(entity),
            quote(key_field)
        );
        let client = self.pool.get().await?;
        let rows = client
            .query(sql.as_str(), &[key as &(dyn ToSql + Sync)])
            .await
            .map_err(|e| ImportError::write(entity, e.to_string()))?;
        rows.first().map(to_record).transpose()
    }

    async fn update_by_key(
        &self,
        entity: &str,
        key_field: &str,
        key: &Value,
        record: &Record,
    ) -> Result<u64> {
        if record.is_empty() {
            return Ok(0);
        }

        let (sql, params) = build_update_sql(&self.qualify(entity), key_field, key, record);
        let client = self.pool.get().await?;
        client
            .execute(sql.as_str(), &params)
            .await
            .map_err(|e| ImportError::write(entity, e.to_string()))
    }

    async fn list_stored_fields(&self, entity: &str) -> Result<Vec<StoredField>> {
        let (schema, table) = self.split_entity(entity);
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT column_name, data_type, is_nullable, column_default
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await?;

        if rows.is_empty() {
            return Err(ImportError::NotFound(format!("target entity '{}'", entity)));
        }

        Ok(rows
            .iter()
            .map(|row| {
                let nullable: String = row.get(2);
                let default: Option<String> = row.get(3);
                StoredField::new(
                    row.get::<_, String>(0),
                    row.get::<_, String>(1),
                    nullable == "NO" && default.is_none(),
                )
            })
            .collect())
    }

    async fn scan(
        &self,
        entity: &str,
        fields: &[String],
        order_by: Option<&str>,
    ) -> Result<Box<dyn Cursor>> {
        let col_list = fields.iter().map(|f| quote(f)).collect::<Vec<_>>().join(", ");
        let mut sql = format!("SELECT {} FROM {}", col_list, self.qualify(entity));
        if let Some(col) = order_by {
            sql.push_str(&format!(" ORDER BY {}", quote(col)));
        }

        let client = self.pool.get().await?;
        let (tx, rx) = mpsc::channel(SCAN_BUFFER_ROWS);

        let task = tokio::spawn(async move {
            debug!("PostgreSQL scan: {}", sql);
            let params: Vec<&(dyn ToSql + Sync)> = Vec::new();
            let stream = match client.query_raw(sql.as_str(), params).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            futures::pin_mut!(stream);

            loop {
                match stream.try_next().await {
                    Ok(Some(row)) => {
                        let values: Result<Row> =
                            (0..row.len()).map(|i| column_value(&row, i)).collect();
                        let failed = values.is_err();
                        if tx.send(values).await.is_err() || failed {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        break;
                    }
                }
            }
        });

        Ok(Box::new(ChannelCursor::new(rx, task)))
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        let check = async {
            let client = self.pool.get().await?;
            let row = client.query_one("SELECT version()", &[]).await?;
            let version: String = row.get(0);
            Ok::<_, ImportError>(version.split(',').next().map(|v| v.trim().to_string()))
        };

        let result = check.await;
        let latency = start.elapsed().as_millis() as u64;
        Ok(match result {
            Ok(version) => HealthStatus::ok(latency, version),
            Err(e) => HealthStatus::failed(latency, e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn bind(value: &Value, ty: &Type) -> std::result::Result<Option<BytesMut>, BindError> {
        let mut out = BytesMut::new();
        match value.to_sql_checked(ty, &mut out)? {
            IsNull::Yes => Ok(None),
            IsNull::No => Ok(Some(out)),
        }
    }

    fn encoded<T: ToSql>(v: T, ty: &Type) -> BytesMut {
        let mut out = BytesMut::new();
        v.to_sql(ty, &mut out).unwrap();
        out
    }

    #[test]
    fn test_bind_follows_parameter_type() {
        assert_eq!(
            bind(&Value::Int(7), &Type::INT4).unwrap(),
            Some(encoded(7i32, &Type::INT4))
        );
        assert_eq!(
            bind(&Value::Int(7), &Type::INT8).unwrap(),
            Some(encoded(7i64, &Type::INT8))
        );
        assert_eq!(
            bind(&Value::Int(7), &Type::NUMERIC).unwrap(),
            Some(encoded(Decimal::from(7), &Type::NUMERIC))
        );
        assert_eq!(
            bind(&Value::from("O'Brien"), &Type::VARCHAR).unwrap(),
            Some(encoded("O'Brien", &Type::VARCHAR))
        );
        let d = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(
            bind(&Value::Date(d), &Type::TIMESTAMP).unwrap(),
            Some(encoded(d.and_time(NaiveTime::MIN), &Type::TIMESTAMP))
        );
    }

    #[test]
    fn test_bind_null_and_unset() {
        assert_eq!(bind(&Value::Null, &Type::INT4).unwrap(), None);
        assert_eq!(bind(&Value::Unset, &Type::TEXT).unwrap(), None);
    }

    #[test]
    fn test_bind_rejects_lossy_conversions() {
        assert!(bind(&Value::Int(70_000), &Type::INT2).is_err());
        assert!(bind(&Value::from("12"), &Type::INT4).is_err());
        assert!(bind(&Value::Bytes(vec![1]), &Type::TEXT).is_err());
        assert!(bind(&Value::Decimal(Decimal::new(15, 1)), &Type::INT4).is_err());
    }

    #[test]
    fn test_build_insert_sql() {
        let records = vec![
            record(&[("name", Value::from("a")), ("age", Value::Int(1))]),
            record(&[("name", Value::from("b'c"))]),
        ];
        let (sql, params) = build_insert_sql("\"public\".\"person\"", &records);
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"person\" (\"name\", \"age\") VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_build_update_sql() {
        let r = record(&[("name", Value::from("new")), ("age", Value::Int(3))]);
        let key = Value::Int(7);
        let (sql, params) = build_update_sql("\"public\".\"partner\"", "legacy_id", &key, &r);
        assert_eq!(
            sql,
            "UPDATE \"public\".\"partner\" SET \"name\" = $1, \"age\" = $2 WHERE \"legacy_id\" = $3"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_rows_per_insert_stays_under_bind_limit() {
        assert_eq!(rows_per_insert(5), 13107);
        assert_eq!(rows_per_insert(0), MAX_BIND_PARAMS);
        assert!(rows_per_insert(70_000) >= 1);
    }
}
