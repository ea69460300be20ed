//! Offset pagination over a read query.
//!
//! Every page is an independent bounded query (`LIMIT n OFFSET m`) in its
//! own scope; nothing is held open between pages. Page boundaries are
//! only stable while the underlying rows are not modified between
//! fetches. There is no snapshot across pages, so concurrent inserts or
//! deletes can shift rows between pages, duplicating or skipping them.

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tracing::debug;

use crate::error::{DbError, Result};
use crate::retry::RetryPolicy;
use crate::row::{Row, Value};
use crate::scope::ConnectionScope;

/// Maximum rows per page
pub const MAX_PER_PAGE: u32 = 10_000;

/// Default rows per page
pub const DEFAULT_PER_PAGE: u32 = 100;

/// Pagination parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Page number (1-indexed)
    pub page: u32,
    /// Rows per page
    pub per_page: u32,
}

impl Pagination {
    /// Page is clamped to at least 1, per page to `1..=MAX_PER_PAGE`.
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    /// SQL OFFSET value.
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }

    /// SQL LIMIT value.
    pub fn limit(&self) -> u32 {
        self.per_page
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

/// One fetched page.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub rows: Vec<Row>,
    pub page: u32,
    pub per_page: u32,
    pub offset: u64,
}

impl Page {
    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    /// A short page is certainly the last one. A full page may or may not be.
    pub fn is_partial(&self) -> bool {
        self.rows.len() < self.per_page as usize
    }
}

/// Paged access to the rows of one query.
#[derive(Clone)]
pub struct PageSource {
    scope: ConnectionScope,
    sql: String,
    params: Vec<Value>,
    retry: Option<RetryPolicy>,
}

impl PageSource {
    /// `sql` must not carry its own LIMIT/OFFSET; a trailing `;` is dropped.
    pub fn new(scope: ConnectionScope, sql: impl Into<String>, params: Vec<Value>) -> Self {
        let sql = sql.into();
        let sql = sql.trim().trim_end_matches(';').trim_end().to_string();
        Self {
            scope,
            sql,
            params,
            retry: None,
        }
    }

    /// Retry each page fetch under `policy`.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Rows `offset..offset + page_size`.
    pub async fn page(&self, page_size: usize, offset: u64) -> Result<Vec<Row>> {
        if page_size == 0 {
            return Err(DbError::invalid_argument("page size must be at least 1"));
        }
        let limit = i64::try_from(page_size)
            .map_err(|_| DbError::invalid_argument("page size out of range"))?;
        let offset_value = i64::try_from(offset)
            .map_err(|_| DbError::invalid_argument("offset out of range"))?;

        let n = self.params.len();
        let sql = format!("{} LIMIT ${} OFFSET ${}", self.sql, n + 1, n + 2);
        let mut params = self.params.clone();
        params.push(Value::Int(limit));
        params.push(Value::Int(offset_value));

        let rows = match &self.retry {
            Some(policy) => self.scope.fetch_all_with_retry(policy, &sql, &params).await?,
            None => self.scope.fetch_all(&sql, &params).await?,
        };
        debug!(offset, page_size, rows = rows.len(), "page fetched");
        Ok(rows)
    }

    /// Page by 1-based page number.
    pub async fn page_at(&self, pagination: Pagination) -> Result<Page> {
        let rows = self
            .page(pagination.limit() as usize, pagination.offset())
            .await?;
        Ok(Page {
            rows,
            page: pagination.page,
            per_page: pagination.per_page,
            offset: pagination.offset(),
        })
    }

    /// Pages from offset 0 until the first empty page.
    pub fn lazy_pages(&self, page_size: usize) -> Result<LazyPages> {
        if page_size == 0 {
            return Err(DbError::invalid_argument("page size must be at least 1"));
        }
        Ok(LazyPages {
            source: self.clone(),
            page_size,
            offset: 0,
            pages_fetched: 0,
            done: false,
        })
    }
}

/// Sequential page walk started by [`PageSource::lazy_pages`].
///
/// A failed fetch leaves the position where it was, so calling
/// [`next_page`](Self::next_page) again re-requests the same page.
pub struct LazyPages {
    source: PageSource,
    page_size: usize,
    offset: u64,
    pages_fetched: u64,
    done: bool,
}

impl LazyPages {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }
        let rows = self.source.page(self.page_size, self.offset).await?;
        if rows.is_empty() {
            debug!(pages = self.pages_fetched, "pagination finished");
            self.done = true;
            return Ok(None);
        }
        self.offset += self.page_size as u64;
        self.pages_fetched += 1;
        Ok(Some(rows))
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Vec<Row>>> {
        stream::try_unfold(self, |mut pages| async move {
            Ok(pages.next_page().await?.map(|rows| (rows, pages)))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::memory::MemoryEngine;
    use futures::TryStreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn source(rows: usize) -> (Arc<MemoryEngine>, PageSource) {
        let engine = Arc::new(MemoryEngine::with_sample_users(rows));
        let scope = ConnectionScope::new(engine.clone());
        (engine, PageSource::new(scope, "SELECT * FROM user_data;", Vec::new()))
    }

    #[test]
    fn offset_calculation() {
        assert_eq!(Pagination::new(1, 10).offset(), 0);
        assert_eq!(Pagination::new(2, 10).offset(), 10);
        assert_eq!(Pagination::new(3, 25).offset(), 50);
    }

    #[test]
    fn clamps_page_and_per_page() {
        assert_eq!(Pagination::new(0, 10).page, 1);
        assert_eq!(Pagination::new(1, 0).per_page, 1);
        assert_eq!(Pagination::new(1, 50_000).per_page, MAX_PER_PAGE);
    }

    #[tokio::test]
    async fn single_page_is_independent() {
        let (engine, pages) = source(25);

        let rows = pages.page(10, 20).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("Ada 20".into())));

        let again = pages.page(10, 20).await.unwrap();
        assert_eq!(rows, again);
        assert_eq!(engine.stats().connects, 2);
    }

    #[tokio::test]
    async fn page_at_uses_one_based_numbers() {
        let (_engine, pages) = source(25);
        let page = pages.page_at(Pagination::new(3, 10)).await.unwrap();

        assert_eq!(page.offset, 20);
        assert_eq!(page.rows.len(), 5);
        assert!(page.has_prev());
        assert!(page.is_partial());
    }

    #[tokio::test]
    async fn lazy_pages_stop_at_first_empty_page() {
        let (engine, pages) = source(23);
        let mut walk = pages.lazy_pages(10).unwrap();

        let mut sizes = Vec::new();
        while let Some(rows) = walk.next_page().await.unwrap() {
            sizes.push(rows.len());
        }

        assert_eq!(sizes, [10, 10, 3]);
        assert!(walk.is_done());
        assert!(walk.next_page().await.unwrap().is_none());
        // three pages plus the empty one that ends the walk
        assert_eq!(engine.stats().queries, 4);
    }

    #[tokio::test]
    async fn exact_multiple_ends_after_empty_page() {
        let (_engine, pages) = source(20);
        let all: Vec<Vec<Row>> = pages.lazy_pages(5).unwrap().into_stream().try_collect().await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn params_are_kept_ahead_of_limit_and_offset() {
        let engine = Arc::new(MemoryEngine::with_sample_users(40));
        let scope = ConnectionScope::new(engine.clone());
        let pages = PageSource::new(scope, "SELECT * FROM user_data WHERE age > $1", vec![Value::Int(40)]);

        let rows: Vec<Row> = pages
            .lazy_pages(3)
            .unwrap()
            .into_stream()
            .try_concat()
            .await
            .unwrap();
        assert!(rows.iter().all(|r| r.get("age").and_then(Value::as_i64) > Some(40)));
        assert_eq!(rows.len(), (0..40).filter(|i| 18 + (i * 7) % 63 > 40).count());
    }

    #[tokio::test(start_paused = true)]
    async fn page_fetch_retries_transient_failures() {
        let (engine, pages) = source(5);
        engine.fail_next_queries(2, FailureKind::Transient);
        let pages = pages.with_retry(RetryPolicy::new(3, Duration::from_millis(10)).unwrap());

        let rows = pages.page(10, 0).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(engine.stats().connects, 3);
    }

    #[tokio::test]
    async fn failed_page_keeps_position() {
        let (engine, pages) = source(15);
        let mut walk = pages.lazy_pages(10).unwrap();
        walk.next_page().await.unwrap();

        engine.fail_next_queries(1, FailureKind::Transient);
        assert!(walk.next_page().await.is_err());
        assert_eq!(walk.offset(), 10);

        let rows = walk.next_page().await.unwrap().unwrap();
        assert_eq!(rows.len(), 5);
    }
}
