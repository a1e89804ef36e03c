//! MSSQL source provider.
//!
//! Uses Tiberius with bb8 connection pooling. Each cursor owns one pooled
//! connection inside a producer task and streams rows through a bounded
//! channel, so memory stays proportional to the channel size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bb8::Pool;
use chrono::{DateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::core::{HealthStatus, Row, Value};
use crate::error::{ImportError, Result};
use crate::source::{ChannelCursor, ConnectionProvider, Cursor, Dialect, SourceQuery};

/// Maximum TDS packet size (32767 bytes, ~32KB).
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// Idle connection timeout (5 minutes).
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum connection lifetime (30 minutes).
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// TCP keepalive interval (30 seconds).
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Rows buffered between the producer task and the cursor.
const CURSOR_BUFFER_ROWS: usize = 1000;

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: SourceConfig,
    password: String,
}

impl TiberiusConnectionManager {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let password = config.credential.password()?;
        Ok(Self { config, password })
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            &self.config.credential.user,
            &self.password,
        ));

        if self.config.encrypt_enabled() {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config.packet_size(TDS_MAX_PACKET_SIZE);
        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;

        tcp.set_nodelay(true).ok();

        let keepalive = socket2::TcpKeepalive::new().with_time(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

fn pool_error(e: bb8::RunError<tiberius::error::Error>) -> ImportError {
    ImportError::Connection(format!("source pool: {}", e))
}

/// Source provider backed by a SQL Server database.
pub struct MssqlSource {
    pool: Pool<TiberiusConnectionManager>,
    connected: AtomicBool,
}

impl MssqlSource {
    /// Build the pool and verify the connection.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone())?;
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| ImportError::Connection(format!("source: {}", e)))?;

        {
            let mut conn = pool.get().await.map_err(pool_error)?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, config.max_connections
        );

        Ok(Self {
            pool,
            connected: AtomicBool::new(true),
        })
    }

    fn mark(&self, ok: bool) {
        self.connected.store(ok, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionProvider for MssqlSource {
    async fn open_cursor(&self, query: &SourceQuery) -> Result<Box<dyn Cursor>> {
        let mut conn = match self.pool.get_owned().await {
            Ok(conn) => conn,
            Err(e) => {
                self.mark(false);
                return Err(pool_error(e));
            }
        };
        self.mark(true);

        let sql = query.sql.clone();
        let (tx, rx) = mpsc::channel(CURSOR_BUFFER_ROWS);

        let task = tokio::spawn(async move {
            debug!("MSSQL cursor open: {}", sql);
            let mut rows = match conn.simple_query(sql).await {
                Ok(stream) => stream.into_row_stream(),
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };

            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => {
                        let values: Result<Row> = row.into_iter().map(convert_column).collect();
                        let failed = values.is_err();
                        if tx.send(values).await.is_err() || failed {
                            // Cursor closed, or the row could not be decoded
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

    fn dialect(&self) -> Dialect {
        Dialect::Mssql
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        let check = async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            let row = conn.simple_query("SELECT @@VERSION").await?.into_row().await?;
            Ok::<_, ImportError>(row.and_then(|r| {
                r.get::<&str, _>(0)
                    .and_then(|v| v.lines().next())
                    .map(|v| v.trim().to_string())
            }))
        };

        let result = check.await;
        let latency = start.elapsed().as_millis() as u64;
        self.mark(result.is_ok());
        Ok(match result {
            Ok(version) => HealthStatus::ok(latency, version),
            Err(e) => HealthStatus::failed(latency, e.to_string()),
        })
    }
}

/// Decode through tiberius, keeping SQL NULL as [`Value::Null`].
fn decode<'a, T: FromSql<'a>>(
    data: &'a ColumnData<'static>,
    f: impl FnOnce(T) -> Value,
) -> Result<Value> {
    match T::from_sql(data) {
        Ok(v) => Ok(v.map_or(Value::Null, f)),
        Err(e) => Err(ImportError::Decode(format!("source column: {}", e))),
    }
}

/// Convert one TDS column to a [`Value`].
///
/// Only SQL NULL becomes [`Value::Null`]; a value that cannot be
/// represented is an error.
fn convert_column(data: ColumnData<'static>) -> Result<Value> {
    fn or_null<T>(v: Option<T>, f: impl FnOnce(T) -> Value) -> Result<Value> {
        Ok(v.map_or(Value::Null, f))
    }

    match &data {
        ColumnData::U8(v) => or_null(*v, |n| Value::Int(n.into())),
        ColumnData::I16(v) => or_null(*v, |n| Value::Int(n.into())),
        ColumnData::I32(v) => or_null(*v, |n| Value::Int(n.into())),
        ColumnData::I64(v) => or_null(*v, Value::Int),
        ColumnData::F32(v) => or_null(*v, |f| Value::Float(f.into())),
        ColumnData::F64(v) => or_null(*v, Value::Float),
        ColumnData::Bit(v) => or_null(*v, Value::Bool),
        ColumnData::String(v) => or_null(v.as_ref(), |s| Value::Text(s.to_string())),
        ColumnData::Guid(v) => or_null(*v, |u| Value::Text(u.to_string())),
        ColumnData::Binary(v) => or_null(v.as_ref(), |b| Value::Bytes(b.to_vec())),
        ColumnData::Xml(v) => or_null(v.as_ref(), |x| Value::Text((**x).clone().into_string())),
        // numeric(38) exceeds the 96-bit decimal mantissa.
        ColumnData::Numeric(None) => Ok(Value::Null),
        ColumnData::Numeric(Some(n)) => {
            Decimal::try_from_i128_with_scale(n.value(), u32::from(n.scale()))
                .map(Value::Decimal)
                .map_err(|e| {
                    ImportError::Decode(format!("source numeric {} does not fit: {}", n, e))
                })
        }
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            decode(&data, Value::DateTime)
        }
        ColumnData::Date(_) => decode(&data, Value::Date),
        ColumnData::Time(_) => decode(&data, |t: NaiveTime| {
            Value::Text(t.format("%H:%M:%S%.f").to_string())
        }),
        ColumnData::DateTimeOffset(_) => {
            decode(&data, |dt: DateTime<Utc>| Value::DateTime(dt.naive_utc()))
        }
    }
}
