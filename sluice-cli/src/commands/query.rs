use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sluice_core::{CachedRows, Fingerprint, QueryCache};
use tracing::info;

use super::{GlobalArgs, QueryArgs, Session};
use crate::output::NdjsonWriter;

#[derive(Parser, Debug)]
pub struct QueryCmdArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// Run the read this many times; repeats are served from the cache
    #[arg(long, default_value_t = 1)]
    pub repeat: u32,

    /// Bypass the query cache
    #[arg(long)]
    pub no_cache: bool,
}

/// Materialized read, retried on transient failures and cached by fingerprint.
pub async fn run_query(global: &GlobalArgs, args: QueryCmdArgs) -> Result<()> {
    let session = Session::open(global).await?;
    let policy = session.config.retry_policy()?;
    let use_cache = session.config.cache.enabled && !args.no_cache;
    let cache = QueryCache::new();

    let sql = args.query.sql.as_str();
    let params = args.query.values();
    let mut rows: CachedRows = Arc::new(Vec::new());

    for run in 1..=args.repeat.max(1) {
        let fetched = if use_cache {
            cache
                .get_or_compute(Fingerprint::new(sql, &params), || {
                    session.scope.fetch_all_with_retry(&policy, sql, &params)
                })
                .await
        } else {
            session
                .scope
                .fetch_all_with_retry(&policy, sql, &params)
                .await
                .map(Arc::new)
        };
        rows = fetched.with_context(|| format!("Query failed on run {run}"))?;
    }

    let stats = cache.stats();
    info!(
        rows = rows.len(),
        runs = args.repeat.max(1),
        cache_hits = stats.hits,
        cache_misses = stats.misses,
        "Query complete"
    );

    let mut out = NdjsonWriter::stdout();
    out.write_all(rows.iter())?;
    out.flush()
}
