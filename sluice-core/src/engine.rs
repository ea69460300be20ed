//! The narrow seam between sluice and a relational engine.
//!
//! Everything above this module talks to the database only through
//! [`Engine`] and [`Connection`]. Implementations live in
//! [`crate::postgres`] (sqlx) and [`crate::memory`] (in-process tables).

use async_trait::async_trait;

use crate::error::Result;
use crate::row::{Row, Value};

/// Batch size used by [`Connection::fetch_all`] when draining a cursor.
pub const DRAIN_BATCH_SIZE: usize = 256;

/// Opaque reference to an open cursor on one [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorHandle(u64);

impl CursorHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A live database session.
///
/// A connection starts inside a transaction. `commit` and `rollback`
/// resolve it; `close` releases the session and is idempotent.
///
/// Dropping a connection without calling `close` must still release it
/// and abandon any open transaction. Streams rely on this when a caller
/// stops iterating early.
#[async_trait]
pub trait Connection: Send {
    /// Run a statement that returns no rows; yields the affected row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Open a forward-only cursor over a read query.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<CursorHandle>;

    /// Next row, or `None` at end of data.
    async fn fetch_one(&mut self, cursor: CursorHandle) -> Result<Option<Row>>;

    /// Up to `n` rows; shorter near the end, empty once exhausted.
    async fn fetch_many(&mut self, cursor: CursorHandle, n: usize) -> Result<Vec<Row>>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Run a read query and materialize every row.
    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let cursor = self.query(sql, params).await?;
        let mut rows = Vec::new();
        loop {
            let batch = self.fetch_many(cursor, DRAIN_BATCH_SIZE).await?;
            if batch.is_empty() {
                return Ok(rows);
            }
            rows.extend(batch);
        }
    }
}

/// Source of connections.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Open a session. Fails with [`crate::DbError::Connection`] when the
    /// engine is unreachable, rejects credentials or times out.
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}
