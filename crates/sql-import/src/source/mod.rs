//! Source side: connection/cursor contracts and the Source Reader.
//!
//! The reader counts the filtered source, then streams the mapped projection
//! in `batch_size` chunks. Cursors are scoped: dropping a [`ScopedCursor`]
//! closes the underlying statement and returns the connection.

mod query;

pub use query::{Dialect, QueryShape, SelectOptions, SourceQuery};

use crate::core::{HealthStatus, Row, Value};
use crate::error::{ImportError, Result};
use crate::mapping::{MappingDescriptor, SourceLocation};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A forward-only result set.
#[async_trait]
pub trait Cursor: Send {
    /// Up to `n` rows. An empty batch means the cursor is exhausted.
    async fn fetch_batch(&mut self, n: usize) -> Result<Vec<Row>>;

    /// Read a single-row, single-column count result.
    async fn fetch_count(&mut self) -> Result<u64> {
        let rows = self.fetch_batch(1).await?;
        match rows.first().and_then(|r| r.first()) {
            Some(Value::Int(n)) if *n >= 0 => Ok(*n as u64),
            Some(Value::Decimal(d)) => d
                .to_u64()
                .ok_or_else(|| ImportError::Connection(format!("invalid row count {}", d))),
            other => Err(ImportError::Connection(format!(
                "count query returned {:?}",
                other
            ))),
        }
    }

    /// Release the statement and connection. Safe to call more than once.
    fn close(&mut self);
}

/// Opens cursors against one store.
///
/// Connection-level timeouts belong to the implementation.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn open_cursor(&self, query: &SourceQuery) -> Result<Box<dyn Cursor>>;

    /// SQL syntax used to build queries for this provider.
    fn dialect(&self) -> Dialect;

    /// Whether the last interaction with the store succeeded.
    fn is_connected(&self) -> bool;

    async fn health_check(&self) -> Result<HealthStatus>;
}

/// Cursor fed by a producer task through a bounded channel.
///
/// The producer owns the connection; closing the cursor aborts the task,
/// which drops the connection back into its pool.
pub struct ChannelCursor {
    rx: mpsc::Receiver<Result<Row>>,
    task: Option<JoinHandle<()>>,
    done: bool,
}

impl ChannelCursor {
    pub fn new(rx: mpsc::Receiver<Result<Row>>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
            done: false,
        }
    }

    /// Cursor over rows already in memory.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            // Capacity covers every row, so this never fails.
            let _ = tx.try_send(Ok(row));
        }
        Self {
            rx,
            task: None,
            done: false,
        }
    }
}

#[async_trait]
impl Cursor for ChannelCursor {
    async fn fetch_batch(&mut self, n: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(n);
        if self.done {
            return Ok(rows);
        }

        while rows.len() < n {
            match self.rx.recv().await {
                Some(Ok(row)) => rows.push(row),
                Some(Err(e)) => {
                    self.close();
                    return Err(e);
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        Ok(rows)
    }

    fn close(&mut self) {
        self.done = true;
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ChannelCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns a cursor for one phase and closes it on every exit path.
pub struct ScopedCursor {
    inner: Box<dyn Cursor>,
}

impl ScopedCursor {
    pub fn new(inner: Box<dyn Cursor>) -> Self {
        Self { inner }
    }

    pub async fn fetch_batch(&mut self, n: usize) -> Result<Vec<Row>> {
        self.inner.fetch_batch(n).await
    }

    pub async fn fetch_count(&mut self) -> Result<u64> {
        self.inner.fetch_count().await
    }
}

impl Drop for ScopedCursor {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Reads the mapped projection of one source table.
pub struct SourceReader {
    provider: Arc<dyn ConnectionProvider>,
    location: SourceLocation,
    columns: Vec<String>,
    batch_size: usize,
}

impl SourceReader {
    pub fn new(provider: Arc<dyn ConnectionProvider>, mapping: &MappingDescriptor) -> Self {
        Self {
            provider,
            location: mapping.source.clone(),
            columns: mapping.source_fields(),
            batch_size: mapping.batch_size.max(1),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Exact row count over the filtered source.
    pub async fn count(&self) -> Result<u64> {
        let query = self.provider.dialect().count_query(&self.location);
        debug!("Counting rows: {}", query.sql);

        let mut cursor = ScopedCursor::new(self.provider.open_cursor(&query).await?);
        cursor.fetch_count().await
    }

    /// Stream the projection in the source's natural order.
    pub async fn open(&self) -> Result<RowBatches> {
        self.open_with(SelectOptions::default()).await
    }

    /// Stream the projection ordered by one source field.
    pub async fn open_ordered(&self, order_by: &str) -> Result<RowBatches> {
        self.open_with(SelectOptions {
            order_by: Some(order_by.to_string()),
            limit: None,
        })
        .await
    }

    /// First `n` rows, for previews.
    pub async fn sample(&self, n: usize) -> Result<Vec<Row>> {
        let opts = SelectOptions {
            order_by: None,
            limit: Some(n),
        };
        let mut batches = self.open_with(opts).await?;
        let mut rows = Vec::with_capacity(n);
        while rows.len() < n {
            match batches.next_batch().await? {
                Some(batch) => rows.extend(batch),
                None => break,
            }
        }
        rows.truncate(n);
        Ok(rows)
    }

    async fn open_with(&self, opts: SelectOptions) -> Result<RowBatches> {
        let query = self
            .provider
            .dialect()
            .select_query(&self.location, &self.columns, &opts);
        debug!("Opening source cursor: {}", query.sql);

        let cursor = self.provider.open_cursor(&query).await?;
        Ok(RowBatches {
            cursor: Some(ScopedCursor::new(cursor)),
            batch_size: self.batch_size,
            width: self.columns.len(),
        })
    }
}

/// Lazy, finite, non-restartable sequence of row batches.
pub struct RowBatches {
    cursor: Option<ScopedCursor>,
    batch_size: usize,
    width: usize,
}

impl RowBatches {
    /// Next batch, or `None` once the source is exhausted.
    ///
    /// The cursor is released as soon as the source is exhausted or fails.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };

        let rows = match cursor.fetch_batch(self.batch_size).await {
            Ok(rows) => rows,
            Err(e) => {
                self.cursor = None;
                return Err(e);
            }
        };

        if rows.is_empty() {
            self.cursor = None;
            return Ok(None);
        }

        if let Some(bad) = rows.iter().find(|r| r.len() != self.width) {
            let found = bad.len();
            self.cursor = None;
            return Err(ImportError::Connection(format!(
                "source returned {} columns, expected {}",
                found, self.width
            )));
        }

        Ok(Some(rows))
    }

    /// Whether the underlying cursor is still held.
    pub fn is_open(&self) -> bool {
        self.cursor.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rows(n: i64) -> Vec<Row> {
        (1..=n).map(|i| vec![Value::Int(i)]).collect()
    }

    #[tokio::test]
    async fn test_channel_cursor_batches() {
        let mut cursor = ChannelCursor::from_rows(rows(5));
        assert_eq!(cursor.fetch_batch(2).await.unwrap().len(), 2);
        assert_eq!(cursor.fetch_batch(2).await.unwrap().len(), 2);
        assert_eq!(cursor.fetch_batch(2).await.unwrap().len(), 1);
        assert!(cursor.fetch_batch(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_fetch_count() {
        let mut cursor = ChannelCursor::from_rows(vec![vec![Value::Int(250)]]);
        assert_eq!(cursor.fetch_count().await.unwrap(), 250);

        let mut bad = ChannelCursor::from_rows(vec![vec![Value::from("x")]]);
        assert!(bad.fetch_count().await.is_err());
    }

    #[tokio::test]
    async fn test_channel_cursor_surfaces_producer_error() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let _ = tx.send(Ok(vec![Value::Int(1)])).await;
            let _ = tx
                .send(Err(ImportError::Connection("lost".into())))
                .await;
        });
        let mut cursor = ChannelCursor::new(rx, task);
        assert!(cursor.fetch_batch(10).await.is_err());
        assert!(cursor.fetch_batch(10).await.unwrap().is_empty());
    }

    struct CountingCursor {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Cursor for CountingCursor {
        async fn fetch_batch(&mut self, _n: usize) -> Result<Vec<Row>> {
            Err(ImportError::Connection("boom".into()))
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_scoped_cursor_closes_on_error_path() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let mut cursor = ScopedCursor::new(Box::new(CountingCursor {
                closes: closes.clone(),
            }));
            assert!(cursor.fetch_batch(1).await.is_err());
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_row_batches_release_on_exhaustion() {
        let mut batches = RowBatches {
            cursor: Some(ScopedCursor::new(Box::new(ChannelCursor::from_rows(rows(3))))),
            batch_size: 2,
            width: 1,
        };
        assert_eq!(batches.next_batch().await.unwrap().unwrap().len(), 2);
        assert_eq!(batches.next_batch().await.unwrap().unwrap().len(), 1);
        assert!(batches.is_open());
        assert!(batches.next_batch().await.unwrap().is_none());
        assert!(!batches.is_open());
        assert!(batches.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_row_batches_reject_wrong_width() {
        let mut batches = RowBatches {
            cursor: Some(ScopedCursor::new(Box::new(ChannelCursor::from_rows(vec![vec![
                Value::Int(1),
                Value::Int(2),
            ]])))),
            batch_size: 10,
            width: 1,
        };
        assert!(batches.next_batch().await.is_err());
        assert!(!batches.is_open());
    }
}
