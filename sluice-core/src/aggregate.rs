//! Constant-memory processing on top of [`RowStream`].

use std::cmp::Ordering;
use std::fmt;

use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::{DbError, Result};
use crate::row::{Row, Value};
use crate::stream::RowStream;

static FILTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\w+)\s*(<=|>=|!=|<>|=|<|>)\s*(.+?)\s*$").expect("static regex")
});

/// Running statistics over one numeric column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ColumnSummary {
    pub count: u64,
    pub nulls: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ColumnSummary {
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Fold `column` over the whole stream, one batch in memory at a time.
///
/// Nulls are counted and skipped. A missing column or a non-numeric value
/// fails the fold.
pub async fn summarize_column(mut stream: RowStream, column: &str) -> Result<ColumnSummary> {
    let mut summary = ColumnSummary::default();
    while let Some(batch) = stream.next_batch().await? {
        for row in &batch {
            match row.get(column) {
                None => {
                    return Err(DbError::from_sqlstate(
                        "42703",
                        format!("column \"{column}\" does not exist"),
                    ))
                }
                Some(Value::Null) => summary.nulls += 1,
                Some(value) => match value.as_f64() {
                    Some(v) => summary.observe(v),
                    None => {
                        return Err(DbError::from_sqlstate(
                            "42804",
                            format!("column \"{column}\" holds non-numeric value {value}"),
                        ))
                    }
                },
            }
        }
    }
    Ok(summary)
}

/// Mean of `column`, `None` when no non-null value was seen.
pub async fn average_column(stream: RowStream, column: &str) -> Result<Option<f64>> {
    Ok(summarize_column(stream, column).await?.mean())
}

/// Lazily filter each batch. A batch whose rows are all rejected is still
/// yielded (empty), so batch boundaries line up with the source.
pub fn filter_batches<F>(stream: RowStream, mut predicate: F) -> BoxStream<'static, Result<Vec<Row>>>
where
    F: FnMut(&Row) -> bool + Send + 'static,
{
    stream
        .into_batches()
        .map_ok(move |batch| batch.into_iter().filter(|row| predicate(row)).collect())
        .boxed()
}

/// A `column <op> literal` predicate, e.g. `age > 25`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    column: String,
    op: CompareOp,
    value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

impl RowFilter {
    pub fn parse(expr: &str) -> Result<Self> {
        let caps = FILTER_RE
            .captures(expr)
            .ok_or_else(|| DbError::invalid_argument(format!("cannot parse filter: {expr}")))?;
        let op = match &caps[2] {
            "=" => CompareOp::Eq,
            "!=" | "<>" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            _ => CompareOp::Ge,
        };
        Ok(Self {
            column: caps[1].to_string(),
            op,
            value: Value::parse_literal(&caps[3]),
        })
    }

    /// Rows lacking the column, or holding an incomparable value, never match.
    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column)
            .and_then(|v| v.compare(&self.value))
            .is_some_and(|ord| self.op.holds(ord))
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.op.symbol(), self.value)
    }
}
