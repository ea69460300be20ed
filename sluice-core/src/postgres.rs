//! PostgreSQL engine on a sqlx pool.
//!
//! Each connection holds a pooled session inside an open transaction.
//! Reads go through server-side cursors (`DECLARE ... NO SCROLL CURSOR`,
//! `FETCH FORWARD n`), so a stream never has more than one fetch worth of
//! rows in process memory. After `commit` or `rollback` the next statement
//! transparently begins a new transaction.
//!
//! Dropping a connection drops its sqlx transaction, which rolls back and
//! returns the session to the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, Transaction, TypeInfo};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SluiceConfig;
use crate::engine::{Connection, CursorHandle, Engine};
use crate::error::{DbError, Result};
use crate::row::{Row, Value};

/// Default maximum connections for the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cursor names are unique per process, never reused on a pooled session.
static NEXT_CURSOR: AtomicU64 = AtomicU64::new(1);

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => DbError::from_sqlstate(&code, db.message()),
                None => DbError::permanent(db.message()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DbError::connection(err.to_string()),
            _ => DbError::permanent(err.to_string()),
        }
    }
}

/// Any failure while establishing a session is a connection failure,
/// whatever SQLSTATE the server reported (bad credentials, unknown db).
fn connect_error(err: sqlx::Error) -> DbError {
    match DbError::from(err) {
        err @ DbError::Connection { .. } => err,
        other => DbError::connection(other.to_string()),
    }
}

/// Create a PostgreSQL connection pool.
///
/// # Errors
///
/// Returns [`DbError::Connection`] if the first connection cannot be made.
///
/// # Example
///
/// ```ignore
/// let pool = create_pool("postgres://localhost/ALX_prodev", 5, Duration::from_secs(5)).await?;
/// ```
pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .map_err(connect_error)?;
    info!(max_connections, "connected to PostgreSQL");
    Ok(pool)
}

#[derive(Clone)]
pub struct PgEngine {
    pool: PgPool,
}

impl PgEngine {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url, DEFAULT_MAX_CONNECTIONS, DEFAULT_ACQUIRE_TIMEOUT).await?;
        Ok(Self::from_pool(pool))
    }

    /// Pool sized and timed from `[database]`.
    pub async fn from_config(config: &SluiceConfig) -> Result<Self> {
        let pool = create_pool(
            config.database_url()?,
            config.database.max_connections,
            config.acquire_timeout(),
        )
        .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Engine for PgEngine {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let tx = self.pool.begin().await.map_err(connect_error)?;
        Ok(Box::new(PgConnection {
            pool: self.pool.clone(),
            tx: Some(tx),
            cursors: HashMap::new(),
            closed: false,
        }))
    }
}

struct CursorState {
    name: String,
    columns: Option<Arc<[String]>>,
}

struct PgConnection {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    cursors: HashMap<u64, CursorState>,
    closed: bool,
}

impl PgConnection {
    /// The open transaction, beginning a new one if the last was resolved.
    async fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        if self.closed {
            return Err(DbError::connection("connection already closed"));
        }
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await?);
        }
        self.tx
            .as_mut()
            .ok_or_else(|| DbError::connection("no open transaction"))
    }
}

fn bind_all<'q>(sql: &'q str, params: &'q [Value]) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(sqlx::query(sql), |query, value| match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Uuid(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
    })
}

fn decode_value(row: &PgRow, idx: usize) -> Result<Value> {
    let column = &row.columns()[idx];
    let value: Value = match column.type_info().name() {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(i64::from).into(),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.into(),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.into(),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => row.try_get::<Option<String>, _>(idx)?.into(),
        "UUID" => row.try_get::<Option<Uuid>, _>(idx)?.into(),
        "TIMESTAMPTZ" => row.try_get::<Option<DateTime<Utc>>, _>(idx)?.into(),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|ts| ts.and_utc())
            .into(),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)?
            .map(|json| json.to_string())
            .into(),
        other => {
            return Err(DbError::from_sqlstate(
                "42804",
                format!(
                    "unsupported type {other} for column \"{}\"; cast it in SQL",
                    column.name()
                ),
            ))
        }
    };
    Ok(value)
}

fn decode_row(row: &PgRow, columns: &Arc<[String]>) -> Result<Row> {
    let values = (0..row.len())
        .map(|idx| decode_value(row, idx))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let tx = self.tx().await?;
        let result = bind_all(sql, params).execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<CursorHandle> {
        let id = NEXT_CURSOR.fetch_add(1, Ordering::Relaxed);
        let name = format!("sluice_cursor_{id}");
        let declare = format!("DECLARE {name} NO SCROLL CURSOR FOR {}", sql.trim().trim_end_matches(';'));

        // Cursor statements are one-shot: a prepared FETCH would pin the
        // first result shape seen on this session.
        let tx = self.tx().await?;
        bind_all(&declare, params)
            .persistent(false)
            .execute(&mut **tx)
            .await?;
        debug!(cursor = %name, "cursor declared");

        self.cursors.insert(id, CursorState { name, columns: None });
        Ok(CursorHandle::new(id))
    }

    async fn fetch_one(&mut self, cursor: CursorHandle) -> Result<Option<Row>> {
        Ok(self.fetch_many(cursor, 1).await?.pop())
    }

    async fn fetch_many(&mut self, cursor: CursorHandle, n: usize) -> Result<Vec<Row>> {
        if n == 0 {
            return Err(DbError::invalid_argument("fetch size must be at least 1"));
        }
        let name = self
            .cursors
            .get(&cursor.id())
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                DbError::from_sqlstate("34000", format!("cursor {} does not exist", cursor.id()))
            })?;

        let fetch = format!("FETCH FORWARD {n} FROM {name}");
        let tx = self.tx().await?;
        let pg_rows = sqlx::query(&fetch)
            .persistent(false)
            .fetch_all(&mut **tx)
            .await?;
        if pg_rows.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.cursors.get_mut(&cursor.id()).ok_or_else(|| {
            DbError::from_sqlstate("34000", format!("cursor {} does not exist", cursor.id()))
        })?;
        let columns = state
            .columns
            .get_or_insert_with(|| {
                pg_rows[0]
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect()
            })
            .clone();

        pg_rows.iter().map(|row| decode_row(row, &columns)).collect()
    }

    async fn commit(&mut self) -> Result<()> {
        if self.closed {
            return Err(DbError::connection("connection already closed"));
        }
        // cursors die with the transaction
        self.cursors.clear();
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.closed {
            return Err(DbError::connection("connection already closed"));
        }
        self.cursors.clear();
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cursors.clear();
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
