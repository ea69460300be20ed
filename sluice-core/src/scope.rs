//! Scoped connection acquisition.
//!
//! One scope = one connection = one transaction. The transaction is
//! resolved exactly once (commit on success, rollback on failure) and the
//! connection is closed on every exit path. If the owning future is
//! dropped mid-operation, [`ScopedConnection`]'s `Drop` releases the
//! connection through the engine's drop contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::engine::{Connection, Engine};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::row::{Row, Value};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// RAII guard over one acquired connection.
pub struct ScopedConnection {
    conn: Box<dyn Connection>,
    id: u64,
    released: bool,
}

impl ScopedConnection {
    /// Acquire a connection from `engine`.
    pub async fn acquire(engine: &dyn Engine) -> Result<Self> {
        let conn = engine.connect().await?;
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(scope = id, "connection acquired");
        Ok(Self {
            conn,
            id,
            released: false,
        })
    }

    /// Identifier used in log lines for this scope.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn.as_mut()
    }

    /// Resolve the transaction according to `outcome`, then close.
    ///
    /// A failed commit is returned as-is (no rollback follows it, the
    /// transaction has already been resolved once). Failures while rolling
    /// back or closing are logged; the original outcome still propagates.
    pub async fn finish<T>(mut self, outcome: Result<T>) -> Result<T> {
        let result = match outcome {
            Ok(value) => match self.conn.commit().await {
                Ok(()) => {
                    debug!(scope = self.id, "transaction committed");
                    Ok(value)
                }
                Err(err) => {
                    warn!(scope = self.id, error = %err, "commit failed");
                    Err(err)
                }
            },
            Err(err) => {
                match self.conn.rollback().await {
                    Ok(()) => debug!(scope = self.id, error = %err, "transaction rolled back"),
                    Err(rollback_err) => warn!(
                        scope = self.id,
                        error = %err,
                        rollback_error = %rollback_err,
                        "rollback failed"
                    ),
                }
                Err(err)
            }
        };

        if let Err(close_err) = self.conn.close().await {
            warn!(scope = self.id, error = %close_err, "failed to close connection");
        } else {
            debug!(scope = self.id, "connection closed");
        }
        self.released = true;
        result
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if !self.released {
            debug!(
                scope = self.id,
                "scope dropped before resolution; connection released without commit"
            );
        }
    }
}

/// Runs operations against a fresh connection each time.
///
/// Cheap to clone; clones share the engine.
#[derive(Clone)]
pub struct ConnectionScope {
    engine: Arc<dyn Engine>,
}

impl ConnectionScope {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Acquire a connection, run `op`, commit or roll back, close.
    ///
    /// ```ignore
    /// let rows = scope
    ///     .run(|conn| Box::pin(async move {
    ///         conn.fetch_all("SELECT * FROM user_data", &[]).await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut dyn Connection) -> BoxFuture<'c, Result<T>>,
    {
        let mut scoped = ScopedConnection::acquire(self.engine.as_ref()).await?;
        let outcome = op(scoped.connection()).await;
        scoped.finish(outcome).await
    }

    /// [`run`](Self::run) under a retry policy. Every attempt gets its own
    /// connection; a failed attempt's connection is never reused.
    pub async fn run_with_retry<T, F>(&self, policy: &RetryPolicy, op: F) -> Result<T>
    where
        F: for<'c> Fn(&'c mut dyn Connection) -> BoxFuture<'c, Result<T>>,
    {
        let op = &op;
        let scope = self;
        policy
            .run(move |attempt| {
                debug!(attempt, "opening scope for attempt");
                scope.run(op)
            })
            .await
    }

    /// Materialize a read query inside its own scope.
    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut scoped = ScopedConnection::acquire(self.engine.as_ref()).await?;
        let outcome = scoped.connection().fetch_all(sql, params).await;
        scoped.finish(outcome).await
    }

    /// Run a write inside its own scope; commits on success.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut scoped = ScopedConnection::acquire(self.engine.as_ref()).await?;
        let outcome = scoped.connection().execute(sql, params).await;
        scoped.finish(outcome).await
    }

    /// [`fetch_all`](Self::fetch_all) retried under `policy`.
    pub async fn fetch_all_with_retry(
        &self,
        policy: &RetryPolicy,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        policy.run(move |_| self.fetch_all(sql, params)).await
    }

    /// [`execute`](Self::execute) retried under `policy`.
    pub async fn execute_with_retry(
        &self,
        policy: &RetryPolicy,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        policy.run(move |_| self.execute(sql, params)).await
    }
}
