//! In-process engine for tests, benchmarks and demos.
//!
//! Understands a deliberately small SQL subset:
//!
//! ```text
//! SELECT * | col[, col...] FROM table [WHERE col <op> operand]
//!        [LIMIT operand] [OFFSET operand]
//! INSERT INTO table [(col, ...)] VALUES (operand, ...)
//! ```
//!
//! where an operand is a `$n` placeholder or a literal. Inserts are
//! buffered per connection and only reach the table on commit.
//!
//! Faults and latency can be injected to exercise the failure paths of
//! the layers above.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;
use uuid::Uuid;

use crate::engine::{Connection, CursorHandle, Engine};
use crate::error::{DbError, FailureKind, Result};
use crate::row::{Row, Value};

static SELECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)^\s*SELECT\s+(?P<cols>.+?)\s+FROM\s+(?P<table>\w+)(?:\s+WHERE\s+(?P<wcol>\w+)\s*(?P<op><=|>=|<>|!=|=|<|>)\s*(?P<wval>\$\d+|'[^']*'|-?\d+(?:\.\d+)?|\w+))?(?:\s+LIMIT\s+(?P<limit>\$\d+|\d+))?(?:\s+OFFSET\s+(?P<offset>\$\d+|\d+))?\s*;?\s*$",
    )
    .expect("static regex")
});

static INSERT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)^\s*INSERT\s+INTO\s+(?P<table>\w+)\s*(?:\((?P<cols>[^)]*)\))?\s*VALUES\s*\((?P<vals>.*)\)\s*;?\s*$",
    )
    .expect("static regex")
});

static OPERAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*('[^']*'|[^,]+)\s*(?:,|$)").expect("static regex"));

const SAMPLE_NAMES: &[&str] = &[
    "Ada", "Grace", "Linus", "Barbara", "Dennis", "Margaret", "Ken", "Frances", "Edsger", "Radia",
];

/// Counters observed by tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connects: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub closes: u64,
    /// Connections dropped without `close`.
    pub dropped: u64,
    pub queries: u64,
    pub executes: u64,
    pub rows_fetched: u64,
    /// Largest number of rows handed out by a single fetch.
    pub max_fetch: usize,
}

struct Table {
    columns: Arc<[String]>,
    rows: Vec<Vec<Value>>,
    latency: Duration,
}

#[derive(Default)]
struct Faults {
    connect: VecDeque<FailureKind>,
    statement: VecDeque<FailureKind>,
    fetch: VecDeque<FailureKind>,
    commit: VecDeque<FailureKind>,
    close: u32,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    faults: Faults,
    stats: MemoryStats,
}

type Shared = Arc<Mutex<State>>;

fn lock(state: &Shared) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Engine backed by in-process tables.
#[derive(Default)]
pub struct MemoryEngine {
    state: Shared,
    next_conn: AtomicU64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `user_data` table of `rows` deterministic users plus an empty
    /// `logs` table.
    pub fn with_sample_users(rows: usize) -> Self {
        let engine = Self::new();
        engine.create_table("user_data", &["user_id", "name", "email", "age"]);
        engine.create_table("logs", &["message"]);
        let users = (0..rows)
            .map(|i| {
                let name = SAMPLE_NAMES[i % SAMPLE_NAMES.len()];
                vec![
                    Value::Uuid(Uuid::from_u128(i as u128 + 1)),
                    Value::Text(format!("{name} {i}")),
                    Value::Text(format!("{}.{i}@example.com", name.to_lowercase())),
                    Value::Int(18 + (i as i64 * 7) % 63),
                ]
            })
            .collect();
        engine.insert_rows("user_data", users);
        engine
    }

    /// Create (or replace) an empty table.
    pub fn create_table(&self, name: &str, columns: &[&str]) {
        let columns: Arc<[String]> = columns.iter().map(|c| c.to_string()).collect();
        lock(&self.state).tables.insert(
            name.to_string(),
            Table {
                columns,
                rows: Vec::new(),
                latency: Duration::ZERO,
            },
        );
    }

    /// Append committed rows directly, bypassing transactions. Unknown
    /// tables are ignored.
    pub fn insert_rows(&self, table: &str, rows: Vec<Vec<Value>>) {
        if let Some(t) = lock(&self.state).tables.get_mut(table) {
            let width = t.columns.len();
            t.rows.extend(rows.into_iter().map(|mut r| {
                r.resize(width, Value::Null);
                r
            }));
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.state)
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Delay every statement touching `table` by `latency`.
    pub fn set_latency(&self, table: &str, latency: Duration) {
        if let Some(t) = lock(&self.state).tables.get_mut(table) {
            t.latency = latency;
        }
    }

    pub fn fail_next_connects(&self, n: usize, kind: FailureKind) {
        lock(&self.state).faults.connect.extend(std::iter::repeat(kind).take(n));
    }

    /// Fail the next `n` statements (queries or writes) on any connection.
    pub fn fail_next_queries(&self, n: usize, kind: FailureKind) {
        lock(&self.state).faults.statement.extend(std::iter::repeat(kind).take(n));
    }

    /// Fail the next `n` cursor fetches on any connection.
    pub fn fail_next_fetches(&self, n: usize, kind: FailureKind) {
        lock(&self.state).faults.fetch.extend(std::iter::repeat(kind).take(n));
    }

    pub fn fail_next_commits(&self, n: usize, kind: FailureKind) {
        lock(&self.state).faults.commit.extend(std::iter::repeat(kind).take(n));
    }

    pub fn fail_next_closes(&self, n: u32) {
        lock(&self.state).faults.close += n;
    }

    pub fn stats(&self) -> MemoryStats {
        lock(&self.state).stats
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut state = lock(&self.state);
        if let Some(kind) = state.faults.connect.pop_front() {
            return Err(DbError::of_kind(kind, "injected connect failure"));
        }
        state.stats.connects += 1;
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(conn = id, "memory connection opened");
        Ok(Box::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            cursors: HashMap::new(),
            next_cursor: 0,
            pending: Vec::new(),
            closed: false,
        }))
    }
}

struct Cursor {
    columns: Arc<[String]>,
    rows: VecDeque<Vec<Value>>,
}

struct PendingInsert {
    table: String,
    values: Vec<Value>,
}

struct MemoryConnection {
    id: u64,
    state: Shared,
    cursors: HashMap<u64, Cursor>,
    next_cursor: u64,
    pending: Vec<PendingInsert>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(DbError::connection("connection already closed"))
        } else {
            Ok(())
        }
    }

    /// Consume an injected statement fault, then wait out the table latency
    /// with the lock released.
    async fn before_statement(&self, table: &str) -> Result<()> {
        let latency = {
            let mut state = lock(&self.state);
            if let Some(kind) = state.faults.statement.pop_front() {
                return Err(DbError::of_kind(kind, "injected statement failure"));
            }
            state
                .tables
                .get(table)
                .map(|t| t.latency)
                .unwrap_or_default()
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn reset_transaction(&mut self) {
        self.pending.clear();
        self.cursors.clear();
    }
}

fn undefined_table(table: &str) -> DbError {
    DbError::from_sqlstate("42P01", format!("relation \"{table}\" does not exist"))
}

fn undefined_column(column: &str) -> DbError {
    DbError::from_sqlstate("42703", format!("column \"{column}\" does not exist"))
}

fn resolve_operand(raw: &str, params: &[Value]) -> Result<Value> {
    let raw = raw.trim();
    match raw.strip_prefix('$') {
        Some(n) => {
            let idx: usize = n
                .parse()
                .map_err(|_| DbError::from_sqlstate("42601", format!("bad placeholder {raw}")))?;
            idx.checked_sub(1)
                .and_then(|i| params.get(i))
                .cloned()
                .ok_or_else(|| {
                    DbError::from_sqlstate("08P01", format!("no value bound for {raw}"))
                })
        }
        None => Ok(Value::parse_literal(raw)),
    }
}

fn resolve_count(raw: Option<&str>, params: &[Value]) -> Result<Option<usize>> {
    let Some(raw) = raw else { return Ok(None) };
    match resolve_operand(raw, params)? {
        Value::Int(n) if n >= 0 => Ok(Some(n as usize)),
        other => Err(DbError::from_sqlstate(
            "2201W",
            format!("LIMIT/OFFSET must be a non-negative integer, got {other}"),
        )),
    }
}

fn column_index(columns: &[String], name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(name))
        .ok_or_else(|| undefined_column(name))
}

fn matches(op: &str, lhs: &Value, rhs: &Value) -> bool {
    use std::cmp::Ordering::*;
    let Some(ord) = lhs.compare(rhs) else {
        return false;
    };
    match op {
        "=" => ord == Equal,
        "!=" | "<>" => ord != Equal,
        "<" => ord == Less,
        "<=" => ord != Greater,
        ">" => ord == Greater,
        ">=" => ord != Less,
        _ => false,
    }
}

fn split_operands(list: &str) -> Vec<&str> {
    if list.trim().is_empty() {
        return Vec::new();
    }
    OPERAND_RE
        .captures_iter(list)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
        .collect()
}

fn statement_table<'a>(re: &Regex, sql: &'a str) -> Option<&'a str> {
    re.captures(sql)
        .and_then(|c| c.name("table"))
        .map(|m| m.as_str())
}

impl State {
    fn select(&self, sql: &str, params: &[Value]) -> Result<Cursor> {
        let caps = SELECT_RE.captures(sql).ok_or_else(|| {
            DbError::from_sqlstate("42601", format!("unsupported statement: {sql}"))
        })?;
        let table_name = &caps["table"];
        let table = self
            .tables
            .get(table_name)
            .ok_or_else(|| undefined_table(table_name))?;

        let projection: Vec<usize> = match caps["cols"].trim() {
            "*" => (0..table.columns.len()).collect(),
            list => list
                .split(',')
                .map(|c| column_index(&table.columns, c.trim()))
                .collect::<Result<_>>()?,
        };
        let columns: Arc<[String]> = projection
            .iter()
            .map(|&i| table.columns[i].clone())
            .collect();

        let filter = match (caps.name("wcol"), caps.name("op"), caps.name("wval")) {
            (Some(col), Some(op), Some(val)) => Some((
                column_index(&table.columns, col.as_str())?,
                op.as_str(),
                resolve_operand(val.as_str(), params)?,
            )),
            _ => None,
        };
        let limit = resolve_count(caps.name("limit").map(|m| m.as_str()), params)?;
        let offset = resolve_count(caps.name("offset").map(|m| m.as_str()), params)?.unwrap_or(0);

        let rows = table
            .rows
            .iter()
            .filter(|row| match &filter {
                Some((idx, op, rhs)) => matches(op, &row[*idx], rhs),
                None => true,
            })
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|row| projection.iter().map(|&i| row[i].clone()).collect())
            .collect();

        Ok(Cursor { columns, rows })
    }

    fn prepare_insert(&self, sql: &str, params: &[Value]) -> Result<PendingInsert> {
        let caps = INSERT_RE.captures(sql).ok_or_else(|| {
            DbError::from_sqlstate("42601", format!("unsupported statement: {sql}"))
        })?;
        let table_name = &caps["table"];
        let table = self
            .tables
            .get(table_name)
            .ok_or_else(|| undefined_table(table_name))?;

        let supplied = split_operands(&caps["vals"])
            .into_iter()
            .map(|raw| resolve_operand(raw, params))
            .collect::<Result<Vec<_>>>()?;

        let targets: Vec<usize> = match caps.name("cols") {
            Some(list) => list
                .as_str()
                .split(',')
                .map(|c| column_index(&table.columns, c.trim()))
                .collect::<Result<_>>()?,
            None => (0..table.columns.len()).collect(),
        };
        if supplied.len() > targets.len() {
            return Err(DbError::from_sqlstate(
                "42601",
                "INSERT has more expressions than target columns",
            ));
        }

        let mut values = vec![Value::Null; table.columns.len()];
        for (target, value) in targets.into_iter().zip(supplied) {
            values[target] = value;
        }
        Ok(PendingInsert {
            table: table_name.to_string(),
            values,
        })
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.before_statement(statement_table(&INSERT_RE, sql).unwrap_or_default())
            .await?;
        let insert = {
            let mut state = lock(&self.state);
            state.stats.executes += 1;
            state.prepare_insert(sql, params)?
        };
        self.pending.push(insert);
        Ok(1)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<CursorHandle> {
        self.ensure_open()?;
        self.before_statement(statement_table(&SELECT_RE, sql).unwrap_or_default())
            .await?;
        let cursor = {
            let mut state = lock(&self.state);
            state.stats.queries += 1;
            state.select(sql, params)?
        };
        self.next_cursor += 1;
        self.cursors.insert(self.next_cursor, cursor);
        trace!(conn = self.id, cursor = self.next_cursor, "cursor opened");
        Ok(CursorHandle::new(self.next_cursor))
    }

    async fn fetch_one(&mut self, cursor: CursorHandle) -> Result<Option<Row>> {
        Ok(self.fetch_many(cursor, 1).await?.pop())
    }

    async fn fetch_many(&mut self, cursor: CursorHandle, n: usize) -> Result<Vec<Row>> {
        self.ensure_open()?;
        if n == 0 {
            return Err(DbError::invalid_argument("fetch size must be at least 1"));
        }
        if let Some(kind) = lock(&self.state).faults.fetch.pop_front() {
            return Err(DbError::of_kind(kind, "injected fetch failure"));
        }
        let open = self.cursors.get_mut(&cursor.id()).ok_or_else(|| {
            DbError::from_sqlstate(
                "34000",
                format!("cursor {} does not exist", cursor.id()),
            )
        })?;
        let take = n.min(open.rows.len());
        let batch: Vec<Row> = open
            .rows
            .drain(..take)
            .map(|values| Row::new(Arc::clone(&open.columns), values))
            .collect();

        let mut state = lock(&self.state);
        state.stats.rows_fetched += batch.len() as u64;
        state.stats.max_fetch = state.stats.max_fetch.max(batch.len());
        Ok(batch)
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut self.pending);
        self.cursors.clear();
        let mut state = lock(&self.state);
        if let Some(kind) = state.faults.commit.pop_front() {
            return Err(DbError::of_kind(kind, "injected commit failure"));
        }
        for insert in pending {
            if let Some(table) = state.tables.get_mut(&insert.table) {
                table.rows.push(insert.values);
            }
        }
        state.stats.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.reset_transaction();
        lock(&self.state).stats.rollbacks += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reset_transaction();
        let mut state = lock(&self.state);
        state.stats.closes += 1;
        if state.faults.close > 0 {
            state.faults.close -= 1;
            return Err(DbError::connection("injected close failure"));
        }
        trace!(conn = self.id, "memory connection closed");
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            lock(&self.state).stats.dropped += 1;
            trace!(conn = self.id, "memory connection dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn select(engine: &MemoryEngine, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = engine.connect().await?;
        let rows = conn.fetch_all(sql, params).await;
        conn.close().await?;
        rows
    }

    #[tokio::test]
    async fn select_with_filter_limit_and_offset() {
        let engine = MemoryEngine::with_sample_users(30);

        let all = select(&engine, "SELECT * FROM user_data;", &[]).await.unwrap();
        assert_eq!(all.len(), 30);
        assert_eq!(all[0].columns(), ["user_id", "name", "email", "age"]);

        let page = select(
            &engine,
            "SELECT name FROM user_data LIMIT $1 OFFSET $2",
            &[Value::Int(5), Value::Int(25)],
        )
        .await
        .unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].get("name"), Some(&Value::Text("Margaret 25".into())));

        let older = select(&engine, "SELECT * FROM user_data WHERE age > $1", &[Value::Int(40)])
            .await
            .unwrap();
        assert!(!older.is_empty());
        assert!(older.iter().all(|r| r.get("age").and_then(Value::as_i64) > Some(40)));
    }

    #[tokio::test]
    async fn unknown_table_and_column_are_permanent() {
        let engine = MemoryEngine::with_sample_users(1);

        let err = select(&engine, "SELECT * FROM nope", &[]).await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("42P01"));
        assert!(!err.is_transient());

        let err = select(&engine, "SELECT shoe_size FROM user_data", &[]).await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("42703"));
    }

    #[tokio::test]
    async fn inserts_apply_on_commit_only() {
        let engine = MemoryEngine::with_sample_users(0);
        let mut conn = engine.connect().await.unwrap();

        conn.execute("INSERT INTO logs(message) VALUES('Fetched users')", &[])
            .await
            .unwrap();
        assert_eq!(engine.row_count("logs"), 0);
        conn.commit().await.unwrap();
        assert_eq!(engine.row_count("logs"), 1);

        conn.execute("INSERT INTO logs VALUES ($1)", &["discarded".into()])
            .await
            .unwrap();
        conn.rollback().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(engine.row_count("logs"), 1);
    }

    #[tokio::test]
    async fn fetch_many_respects_bound() {
        let engine = MemoryEngine::with_sample_users(23);
        let mut conn = engine.connect().await.unwrap();
        let cursor = conn.query("SELECT * FROM user_data", &[]).await.unwrap();

        let mut sizes = Vec::new();
        loop {
            let batch = conn.fetch_many(cursor, 10).await.unwrap();
            if batch.is_empty() {
                break;
            }
            sizes.push(batch.len());
        }
        assert_eq!(sizes, [10, 10, 3]);
        assert_eq!(engine.stats().max_fetch, 10);
    }

    #[tokio::test]
    async fn injected_fetch_failure_leaves_cursor_intact() {
        let engine = MemoryEngine::with_sample_users(3);
        let mut conn = engine.connect().await.unwrap();
        let cursor = conn.query("SELECT * FROM user_data", &[]).await.unwrap();
        engine.fail_next_fetches(1, FailureKind::Transient);

        let err = conn.fetch_many(cursor, 2).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(conn.fetch_many(cursor, 2).await.unwrap().len(), 2);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_is_counted() {
        let engine = MemoryEngine::with_sample_users(1);
        let conn = engine.connect().await.unwrap();
        drop(conn);

        let stats = engine.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.closes, 0);
    }

    #[tokio::test]
    async fn unknown_cursor_is_rejected() {
        let engine = MemoryEngine::with_sample_users(1);
        let mut conn = engine.connect().await.unwrap();
        let err = conn.fetch_many(CursorHandle::new(99), 1).await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("34000"));
        conn.close().await.unwrap();
    }
}
