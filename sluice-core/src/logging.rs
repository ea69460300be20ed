//! Statement logging around any [`Engine`].
//!
//! Every statement is logged under the `sluice::query` target with its SQL
//! text, parameter count, elapsed time and the connection it ran on.
//! Parameter values are never logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::engine::{Connection, CursorHandle, Engine};
use crate::error::Result;
use crate::row::{Row, Value};

pub const QUERY_TARGET: &str = "sluice::query";

pub struct LoggedEngine {
    inner: Arc<dyn Engine>,
    next_id: AtomicU64,
}

impl LoggedEngine {
    pub fn new(inner: Arc<dyn Engine>) -> Self {
        Self {
            inner,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Engine for LoggedEngine {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let started = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.inner.connect().await {
            Ok(inner) => {
                debug!(
                    target: QUERY_TARGET,
                    conn = id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "connected"
                );
                Ok(Box::new(LoggedConnection { inner, id }))
            }
            Err(err) => {
                warn!(target: QUERY_TARGET, conn = id, error = %err, "connect failed");
                Err(err)
            }
        }
    }
}

struct LoggedConnection {
    inner: Box<dyn Connection>,
    id: u64,
}

impl LoggedConnection {
    fn log<T>(&self, sql: &str, params: &[Value], started: Instant, outcome: &Result<T>) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(_) => info!(
                target: QUERY_TARGET,
                conn = self.id,
                params = params.len(),
                elapsed_ms,
                "{sql}"
            ),
            Err(err) => warn!(
                target: QUERY_TARGET,
                conn = self.id,
                params = params.len(),
                elapsed_ms,
                error = %err,
                "{sql}"
            ),
        }
    }
}

#[async_trait]
impl Connection for LoggedConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let started = Instant::now();
        let outcome = self.inner.execute(sql, params).await;
        self.log(sql, params, started, &outcome);
        outcome
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<CursorHandle> {
        let started = Instant::now();
        let outcome = self.inner.query(sql, params).await;
        self.log(sql, params, started, &outcome);
        outcome
    }

    async fn fetch_one(&mut self, cursor: CursorHandle) -> Result<Option<Row>> {
        let outcome = self.inner.fetch_one(cursor).await;
        trace!(target: QUERY_TARGET, conn = self.id, cursor = cursor.id(), "fetch one");
        outcome
    }

    async fn fetch_many(&mut self, cursor: CursorHandle, n: usize) -> Result<Vec<Row>> {
        let outcome = self.inner.fetch_many(cursor, n).await;
        if let Ok(rows) = &outcome {
            trace!(
                target: QUERY_TARGET,
                conn = self.id,
                cursor = cursor.id(),
                requested = n,
                rows = rows.len(),
                "fetch many"
            );
        }
        outcome
    }

    async fn commit(&mut self) -> Result<()> {
        let outcome = self.inner.commit().await;
        debug!(target: QUERY_TARGET, conn = self.id, ok = outcome.is_ok(), "COMMIT");
        outcome
    }

    async fn rollback(&mut self) -> Result<()> {
        let outcome = self.inner.rollback().await;
        debug!(target: QUERY_TARGET, conn = self.id, ok = outcome.is_ok(), "ROLLBACK");
        outcome
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let started = Instant::now();
        let cursor = self.inner.query(sql, params).await;
        self.log(sql, params, started, &cursor);
        let cursor = cursor?;
        let mut rows = Vec::new();
        loop {
            let batch = self
                .inner
                .fetch_many(cursor, crate::engine::DRAIN_BATCH_SIZE)
                .await?;
            if batch.is_empty() {
                break;
            }
            rows.extend(batch);
        }
        debug!(target: QUERY_TARGET, conn = self.id, rows = rows.len(), "drained");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use crate::scope::ConnectionScope;

    #[tokio::test]
    async fn logged_engine_is_transparent() {
        let memory = Arc::new(MemoryEngine::with_sample_users(7));
        let scope = ConnectionScope::new(Arc::new(LoggedEngine::new(memory.clone())));

        let rows = scope.fetch_all("SELECT * FROM user_data", &[]).await.unwrap();
        assert_eq!(rows.len(), 7);

        scope
            .execute("INSERT INTO logs(message) VALUES($1)", &["Fetched users".into()])
            .await
            .unwrap();
        assert_eq!(memory.row_count("logs"), 1);

        let err = scope.fetch_all("SELECT * FROM missing", &[]).await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));

        let stats = memory.stats();
        assert_eq!(stats.commits, 2);
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.closes, 3);
    }
}
