pub mod aggregate;
pub mod cache;
pub mod concurrent;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod memory;
pub mod pages;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod retry;
pub mod row;
pub mod scope;
pub mod stream;

pub use aggregate::{average_column, filter_batches, summarize_column, ColumnSummary, RowFilter};
pub use cache::{CacheStats, CachedRows, Fingerprint, QueryCache};
pub use concurrent::{FailurePolicy, FetchCoordinator, QuerySpec};
pub use config::SluiceConfig;
pub use engine::{Connection, CursorHandle, Engine};
pub use error::{DbError, FailureKind, Result};
pub use logging::LoggedEngine;
pub use memory::{MemoryEngine, MemoryStats};
pub use pages::{LazyPages, Page, PageSource, Pagination};
#[cfg(feature = "postgres")]
pub use postgres::PgEngine;
pub use retry::{with_deadline, with_retry, Backoff, RetryPolicy};
pub use row::{Row, Value};
pub use scope::{ConnectionScope, ScopedConnection};
pub use stream::RowStream;
