use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use sluice_core::{FailurePolicy, FetchCoordinator, QuerySpec, Row};
use tracing::{info, warn};

use super::{parse_params, GlobalArgs, Session};
use crate::output::NdjsonWriter;
use crate::ui;

#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Queries to run concurrently; results come back in this order
    #[arg(required = true, value_name = "SQL")]
    pub queries: Vec<String>,

    /// Parameters bound to every query
    #[arg(long = "param", short = 'p', value_name = "VALUE")]
    pub params: Vec<String>,

    /// Upper bound on simultaneously open connections
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// Report every query's outcome instead of stopping at the first failure
    #[arg(long, conflicts_with = "fail_fast")]
    pub settle_all: bool,

    /// Stop at the first failure and cancel the rest
    #[arg(long)]
    pub fail_fast: bool,

    /// Overall deadline in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct FetchLine<'a> {
    index: usize,
    sql: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<&'a [Row]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl FetchArgs {
    fn policy(&self, configured: FailurePolicy) -> FailurePolicy {
        if self.settle_all {
            FailurePolicy::SettleAll
        } else if self.fail_fast {
            FailurePolicy::FailFast
        } else {
            configured
        }
    }
}

/// Run several reads concurrently, each in its own scope.
pub async fn run_fetch(global: &GlobalArgs, args: FetchArgs) -> Result<()> {
    let session = Session::open(global).await?;
    let policy = args.policy(session.config.concurrency.failure_policy);
    let params = parse_params(&args.params);

    let mut coordinator = FetchCoordinator::new(session.scope.clone())
        .with_max_in_flight(
            args.max_in_flight
                .unwrap_or(session.config.concurrency.max_in_flight),
        )
        .with_retry(session.config.retry_policy()?);
    if let Some(ms) = args.timeout_ms {
        coordinator = coordinator.with_timeout(Duration::from_millis(ms));
    }

    let specs = args
        .queries
        .iter()
        .map(|sql| QuerySpec::with_params(sql.clone(), params.clone()))
        .collect();

    info!(
        queries = args.queries.len(),
        max_in_flight = coordinator.max_in_flight(),
        ?policy,
        "Starting concurrent fetch"
    );
    let results = ui::track(
        format!("Fetching {} queries", args.queries.len()),
        coordinator.fetch(specs, policy),
    )
    .await
    .context("Concurrent fetch failed")?;

    let mut out = NdjsonWriter::stdout();
    let mut failures = 0usize;
    for (index, (sql, result)) in args.queries.iter().zip(&results).enumerate() {
        let line = match result {
            Ok(rows) => FetchLine {
                index,
                sql,
                rows: Some(rows.as_slice()),
                error: None,
            },
            Err(e) => {
                failures += 1;
                warn!(index, error = %e, "Query failed");
                FetchLine {
                    index,
                    sql,
                    rows: None,
                    error: Some(e.to_string()),
                }
            }
        };
        out.write(&line)?;
    }
    out.flush()?;

    if failures > 0 {
        anyhow::bail!("{failures} of {} queries failed", results.len());
    }
    Ok(())
}
