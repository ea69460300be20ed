//! Forward-only, memory-bounded row streams over a server-side cursor.
//!
//! A [`RowStream`] owns one scoped connection for its whole life. Each pull
//! asks the engine for at most `fetch_size` rows, so no more than that many
//! rows are ever buffered here no matter how large the result set is.
//!
//! Exhaustion (an empty pull) commits and closes the connection. A failed
//! pull rolls back and closes, and every later pull reports the stream as
//! failed rather than exhausted. Dropping the stream early releases the
//! connection through the engine's drop contract; [`RowStream::close`] does
//! the same thing explicitly and reports close failures.

use std::collections::VecDeque;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, info};

use crate::engine::{CursorHandle, Engine};
use crate::error::{DbError, Result};
use crate::retry::RetryPolicy;
use crate::row::{Row, Value};
use crate::scope::{ConnectionScope, ScopedConnection};

pub struct RowStream {
    scoped: Option<ScopedConnection>,
    cursor: CursorHandle,
    fetch_size: usize,
    buffer: VecDeque<Row>,
    rows_yielded: u64,
    batches_yielded: u64,
    failed: bool,
}

impl RowStream {
    /// Acquire a connection and open a cursor over `sql`.
    pub async fn open(
        engine: &dyn Engine,
        sql: &str,
        params: &[Value],
        fetch_size: usize,
    ) -> Result<Self> {
        if fetch_size == 0 {
            return Err(DbError::invalid_argument("fetch size must be at least 1"));
        }
        let mut scoped = ScopedConnection::acquire(engine).await?;
        let cursor = match scoped.connection().query(sql, params).await {
            Ok(cursor) => cursor,
            Err(err) => return scoped.finish(Err(err)).await,
        };
        debug!(scope = scoped.id(), fetch_size, "row stream opened");
        Ok(Self {
            scoped: Some(scoped),
            cursor,
            fetch_size,
            buffer: VecDeque::with_capacity(fetch_size.min(1024)),
            rows_yielded: 0,
            batches_yielded: 0,
            failed: false,
        })
    }

    /// [`open`](Self::open) retried under `policy`.
    ///
    /// Only opening is retried. Once rows have been handed out a failed
    /// pull is returned to the caller, since replaying the cursor would
    /// yield those rows twice.
    pub async fn open_with_retry(
        engine: &dyn Engine,
        policy: &RetryPolicy,
        sql: &str,
        params: &[Value],
        fetch_size: usize,
    ) -> Result<Self> {
        policy
            .run(|_| Self::open(engine, sql, params, fetch_size))
            .await
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    pub fn rows_yielded(&self) -> u64 {
        self.rows_yielded
    }

    pub fn batches_yielded(&self) -> u64 {
        self.batches_yielded
    }

    /// Rows pulled from the engine but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True once the cursor is drained and every row handed out.
    pub fn is_exhausted(&self) -> bool {
        !self.failed && self.scoped.is_none() && self.buffer.is_empty()
    }

    /// True once a pull has failed. The connection is already released.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Next batch of at most `fetch_size` rows, `None` once exhausted.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        let batch = if self.buffer.is_empty() {
            match self.pull(self.fetch_size).await? {
                Some(batch) => batch,
                None => return Ok(None),
            }
        } else {
            self.buffer.drain(..).collect()
        };
        self.rows_yielded += batch.len() as u64;
        self.batches_yielded += 1;
        Ok(Some(batch))
    }

    /// Next row, `None` once exhausted.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.buffer.is_empty() {
            match self.pull(self.fetch_size).await? {
                Some(batch) => self.buffer.extend(batch),
                None => return Ok(None),
            }
        }
        let row = self.buffer.pop_front();
        if row.is_some() {
            self.rows_yielded += 1;
        }
        Ok(row)
    }

    /// Commit and close now, discarding anything not yet consumed.
    pub async fn close(mut self) -> Result<()> {
        self.buffer.clear();
        self.release(Ok(())).await
    }

    /// Adapt into a stream of batches.
    pub fn into_batches(self) -> BoxStream<'static, Result<Vec<Row>>> {
        stream::try_unfold(self, |mut rows| async move {
            Ok(rows.next_batch().await?.map(|batch| (batch, rows)))
        })
        .boxed()
    }

    /// Adapt into a stream of single rows.
    pub fn into_rows(self) -> BoxStream<'static, Result<Row>> {
        stream::try_unfold(self, |mut rows| async move {
            Ok(rows.next_row().await?.map(|row| (row, rows)))
        })
        .boxed()
    }

    /// One cursor advance. `None` means the cursor is drained and the
    /// connection has been released.
    async fn pull(&mut self, n: usize) -> Result<Option<Vec<Row>>> {
        if self.failed {
            return Err(DbError::permanent(format!(
                "row stream already failed after {} rows",
                self.rows_yielded
            )));
        }
        let cursor = self.cursor;
        let Some(scoped) = self.scoped.as_mut() else {
            return Ok(None);
        };

        let fetched = if n == 1 {
            scoped
                .connection()
                .fetch_one(cursor)
                .await
                .map(|row| row.into_iter().collect::<Vec<_>>())
        } else {
            scoped.connection().fetch_many(cursor, n).await
        };

        let fetched = match fetched {
            Ok(batch) if batch.len() > n => Err(DbError::permanent(format!(
                "engine returned {} rows for a fetch of {n}",
                batch.len()
            ))),
            other => other,
        };

        match fetched {
            Ok(batch) if batch.is_empty() => {
                info!(
                    rows = self.rows_yielded,
                    batches = self.batches_yielded,
                    "row stream exhausted"
                );
                self.release(Ok(())).await?;
                Ok(None)
            }
            Ok(batch) => Ok(Some(batch)),
            Err(err) => {
                self.failed = true;
                self.release(Err(err)).await?;
                Ok(None)
            }
        }
    }

    async fn release(&mut self, outcome: Result<()>) -> Result<()> {
        match self.scoped.take() {
            Some(scoped) => scoped.finish(outcome).await,
            None => outcome,
        }
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        if self.scoped.is_some() {
            debug!(
                rows = self.rows_yielded,
                "row stream dropped before exhaustion"
            );
        }
    }
}

impl ConnectionScope {
    /// Open a [`RowStream`] on this scope's engine.
    pub async fn stream(&self, sql: &str, params: &[Value], fetch_size: usize) -> Result<RowStream> {
        RowStream::open(self.engine().as_ref(), sql, params, fetch_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::memory::MemoryEngine;
    use futures::TryStreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn batches_of_ten_over_twenty_three_rows() {
        let engine = MemoryEngine::with_sample_users(23);
        let mut stream = RowStream::open(&engine, "SELECT * FROM user_data", &[], 10)
            .await
            .unwrap();

        let mut sizes = Vec::new();
        while let Some(batch) = stream.next_batch().await.unwrap() {
            sizes.push(batch.len());
        }

        assert_eq!(sizes, [10, 10, 3]);
        assert_eq!(stream.rows_yielded(), 23);
        assert_eq!(stream.batches_yielded(), 3);
        assert!(stream.is_exhausted());

        let stats = engine.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.max_fetch, 10);
    }

    #[tokio::test]
    async fn single_row_pulls_use_fetch_one() {
        let engine = MemoryEngine::with_sample_users(4);
        let rows: Vec<Row> = RowStream::open(&engine, "SELECT name FROM user_data", &[], 1)
            .await
            .unwrap()
            .into_rows()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("Ada 0".into())));
        assert_eq!(engine.stats().max_fetch, 1);
    }

    #[tokio::test]
    async fn rows_are_buffered_at_most_one_batch_at_a_time() {
        let engine = MemoryEngine::with_sample_users(50);
        let mut stream = RowStream::open(&engine, "SELECT * FROM user_data", &[], 7)
            .await
            .unwrap();

        let mut seen = 0;
        while let Some(_row) = stream.next_row().await.unwrap() {
            seen += 1;
            assert!(stream.buffered() < 7);
        }
        assert_eq!(seen, 50);
        assert_eq!(engine.stats().max_fetch, 7);
    }

    #[tokio::test]
    async fn early_drop_releases_the_connection() {
        let engine = MemoryEngine::with_sample_users(100);
        {
            let mut stream = RowStream::open(&engine, "SELECT * FROM user_data", &[], 10)
                .await
                .unwrap();
            stream.next_batch().await.unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.rows_fetched, 10);
    }

    #[tokio::test]
    async fn explicit_close_commits_and_closes() {
        let engine = MemoryEngine::with_sample_users(100);
        let mut stream = RowStream::open(&engine, "SELECT * FROM user_data", &[], 10)
            .await
            .unwrap();
        stream.next_row().await.unwrap();
        stream.close().await.unwrap();

        let stats = engine.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn failed_open_rolls_back_and_closes() {
        let engine = MemoryEngine::with_sample_users(1);
        let err = RowStream::open(&engine, "SELECT * FROM missing", &[], 10)
            .await
            .err()
            .unwrap();

        assert_eq!(err.sqlstate(), Some("42P01"));
        let stats = engine.stats();
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.closes, 1);
    }

    #[tokio::test]
    async fn zero_fetch_size_is_rejected() {
        let engine = MemoryEngine::with_sample_users(1);
        let result = RowStream::open(&engine, "SELECT * FROM user_data", &[], 0).await;
        assert!(matches!(result, Err(DbError::InvalidArgument { .. })));
        assert_eq!(engine.stats().connects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_retried_on_transient_failure() {
        let engine = MemoryEngine::with_sample_users(3);
        engine.fail_next_connects(1, FailureKind::Connection);
        engine.fail_next_queries(1, FailureKind::Transient);
        let policy = RetryPolicy::new(3, Duration::from_millis(100)).unwrap();

        let stream = RowStream::open_with_retry(&engine, &policy, "SELECT * FROM user_data", &[], 2)
            .await
            .unwrap();
        let batches: Vec<Vec<Row>> = stream.into_batches().try_collect().await.unwrap();

        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), [2, 1]);
        let stats = engine.stats();
        assert_eq!(stats.connects, 2);
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.commits, 1);
    }

    #[tokio::test]
    async fn failed_pull_is_not_reported_as_exhaustion() {
        let engine = MemoryEngine::with_sample_users(30);
        let mut stream = RowStream::open(&engine, "SELECT * FROM user_data", &[], 10)
            .await
            .unwrap();
        assert_eq!(stream.next_batch().await.unwrap().unwrap().len(), 10);

        engine.fail_next_fetches(1, FailureKind::Transient);
        assert!(stream.next_batch().await.unwrap_err().is_transient());
        assert!(stream.is_failed());
        assert!(!stream.is_exhausted());

        let again = stream.next_batch().await.unwrap_err();
        assert!(matches!(again, DbError::PermanentQuery { .. }));
        assert!(stream.next_row().await.is_err());

        let stats = engine.stats();
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.closes, 1);
        assert_eq!(stats.commits, 0);
    }

    #[tokio::test]
    async fn failed_row_stream_ends_with_the_error() {
        let engine = MemoryEngine::with_sample_users(30);
        let stream = RowStream::open(&engine, "SELECT * FROM user_data", &[], 10)
            .await
            .unwrap();
        engine.fail_next_fetches(1, FailureKind::Permanent);

        let result: Result<Vec<Row>> = stream.into_rows().try_collect().await;
        assert!(matches!(result, Err(DbError::PermanentQuery { .. })));
    }

    #[tokio::test]
    async fn stream_through_scope() {
        let engine = std::sync::Arc::new(MemoryEngine::with_sample_users(12));
        let scope = ConnectionScope::new(engine.clone());

        let total: usize = scope
            .stream("SELECT * FROM user_data WHERE age > $1", &[Value::Int(25)], 5)
            .await
            .unwrap()
            .into_batches()
            .map_ok(|batch| batch.len())
            .try_fold(0, |acc, n| async move { Ok(acc + n) })
            .await
            .unwrap();

        let expected = (0..12).filter(|i| 18 + (i * 7) % 63 > 25).count();
        assert_eq!(total, expected);
    }
}
