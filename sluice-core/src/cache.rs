//! Query result cache keyed by query fingerprint.
//!
//! The cache is an ordinary value: build one at startup, share it through
//! an `Arc`, drop (or [`QueryCache::clear`]) it at shutdown. There is no
//! global instance.
//!
//! Entries never expire and are never evicted. A cached read keeps
//! returning the same rows after the underlying table changes until the
//! entry is invalidated by hand. Only cache pure reads.
//!
//! Concurrent callers asking for the same fingerprint while it is being
//! computed wait for that single computation instead of issuing their own.
//! A failed or cancelled computation is not stored. A caller already
//! waiting on it takes over the computation; otherwise the next caller
//! computes again.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::Result;
use crate::row::{Row, Value};
use crate::scope::ConnectionScope;

/// Rows shared between the cache and its callers.
pub type CachedRows = Arc<Vec<Row>>;

/// Cache key: the literal query text plus its bound parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(sql: &str, params: &[Value]) -> Self {
        if params.is_empty() {
            Self(sql.to_string())
        } else {
            Self(format!("{sql}\u{1f}{params:?}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Fingerprint {
    fn from(sql: &str) -> Self {
        Self::new(sql, &[])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

type Entries = DashMap<Fingerprint, Arc<OnceCell<CachedRows>>>;

/// One caller's hold on an entry's cell.
///
/// On drop (success, error or cancellation) the entry is removed if its cell
/// is still empty and no other caller holds it.
struct CellHold<'a> {
    entries: &'a Entries,
    fingerprint: &'a Fingerprint,
    cell: Arc<OnceCell<CachedRows>>,
}

impl Drop for CellHold<'_> {
    fn drop(&mut self) {
        // release our hold first so the holder count below excludes it
        let cell = std::mem::take(&mut self.cell);
        let ours = Arc::as_ptr(&cell);
        drop(cell);
        self.entries.remove_if(self.fingerprint, |_, cell| {
            std::ptr::eq(Arc::as_ptr(cell), ours)
                && Arc::strong_count(cell) == 1
                && !cell.initialized()
        });
    }
}

#[derive(Default)]
pub struct QueryCache {
    entries: Entries,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached rows for `fingerprint`, or run `compute`, store
    /// its rows and return them.
    pub async fn get_or_compute<F, Fut>(&self, fingerprint: Fingerprint, compute: F) -> Result<CachedRows>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Row>>>,
    {
        // clone the cell out so no shard lock is held across an await
        let hold = CellHold {
            entries: &self.entries,
            fingerprint: &fingerprint,
            cell: Arc::clone(&*self.entries.entry(fingerprint.clone()).or_default()),
        };

        if let Some(rows) = hold.cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(query = %fingerprint, "cache hit");
            return Ok(Arc::clone(rows));
        }

        let mut computed = false;
        let outcome = hold
            .cell
            .get_or_try_init(|| {
                computed = true;
                async {
                    debug!(query = %fingerprint, "cache miss, executing query");
                    compute().await.map(Arc::new)
                }
            })
            .await;

        if computed {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else if outcome.is_ok() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        outcome.map(Arc::clone)
    }

    /// Cached read through `scope`. A hit never acquires a connection.
    pub async fn fetch(&self, scope: &ConnectionScope, sql: &str, params: &[Value]) -> Result<CachedRows> {
        self.get_or_compute(Fingerprint::new(sql, params), || scope.fetch_all(sql, params))
            .await
    }

    /// Cached rows for `fingerprint` without computing anything.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CachedRows> {
        self.entries
            .get(fingerprint)
            .and_then(|cell| cell.value().get().cloned())
    }

    /// Drop one entry; returns whether it was cached.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.entries
            .remove(fingerprint)
            .map(|(_, cell)| cell.initialized())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored results.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::memory::MemoryEngine;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn one_row() -> Vec<Row> {
        vec![Row::from_pairs([("?column?", Value::Int(1))])]
    }

    #[tokio::test]
    async fn second_lookup_skips_compute() {
        let cache = QueryCache::new();
        let calls = AtomicU32::new(0);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(one_row())
        };

        let first = cache.get_or_compute("SELECT 1".into(), compute).await.unwrap();
        let second = cache.get_or_compute("SELECT 1".into(), compute).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, entries: 1 });
    }

    #[tokio::test]
    async fn different_fingerprints_compute_separately() {
        let cache = QueryCache::new();
        let calls = AtomicU32::new(0);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(one_row())
        };

        cache.get_or_compute("SELECT 1".into(), compute).await.unwrap();
        cache.get_or_compute("SELECT 2".into(), compute).await.unwrap();
        cache
            .get_or_compute(Fingerprint::new("SELECT $1", &[Value::Int(1)]), compute)
            .await
            .unwrap();
        cache
            .get_or_compute(Fingerprint::new("SELECT $1", &[Value::Int(2)]), compute)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.len(), 4);
    }

    #[tokio::test]
    async fn failed_compute_is_not_cached() {
        let cache = QueryCache::new();

        let err = cache
            .get_or_compute("SELECT broken".into(), || async {
                Err(DbError::permanent("syntax error"))
            })
            .await;
        assert!(err.is_err());
        assert!(cache.is_empty());

        let rows = cache
            .get_or_compute("SELECT broken".into(), || async { Ok(one_row()) })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_keeps_its_result_when_the_first_compute_fails() {
        let cache = QueryCache::new();
        let fingerprint = Fingerprint::from("SELECT * FROM user_data");

        let first = cache.get_or_compute(fingerprint.clone(), || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(DbError::transient("could not serialize access"))
        });
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache
                .get_or_compute(fingerprint.clone(), || async { Ok(one_row()) })
                .await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_err());
        assert_eq!(second.unwrap().len(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fingerprint).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_compute_leaves_no_entry() {
        let cache = QueryCache::new();

        let slow = cache.get_or_compute("SELECT * FROM user_data".into(), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(one_row())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(100), slow).await;

        assert!(timed_out.is_err());
        assert_eq!(cache.entries.len(), 0);

        let rows = cache
            .get_or_compute("SELECT * FROM user_data".into(), || async { Ok(one_row()) })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(cache.entries.len(), 1);
    }

    #[tokio::test]
    async fn failed_compute_removes_its_entry() {
        let cache = QueryCache::new();
        let _ = cache
            .get_or_compute("SELECT broken".into(), || async {
                Err(DbError::permanent("syntax error"))
            })
            .await;
        assert_eq!(cache.entries.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_share_one_compute() {
        let cache = Arc::new(QueryCache::new());
        let calls = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_compute("SELECT * FROM user_data".into(), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(one_row())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hit_does_not_touch_the_engine() {
        let engine = Arc::new(MemoryEngine::new());
        engine.create_table("user_data", &["name"]);
        engine.insert_rows("user_data", vec![vec!["Ada".into()]]);
        let scope = ConnectionScope::new(engine.clone());
        let cache = QueryCache::new();

        cache.fetch(&scope, "SELECT * FROM user_data", &[]).await.unwrap();
        // stale: the insert is not observed through the cache
        engine.insert_rows("user_data", vec![vec!["Grace".into()]]);
        let rows = cache.fetch(&scope, "SELECT * FROM user_data", &[]).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(engine.stats().connects, 1);

        assert!(cache.invalidate(&Fingerprint::from("SELECT * FROM user_data")));
        let rows = cache.fetch(&scope, "SELECT * FROM user_data", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
