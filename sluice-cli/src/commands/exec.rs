use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::info;

use super::{GlobalArgs, QueryArgs, Session};
use crate::output::NdjsonWriter;

#[derive(Parser, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// Attempt once, without retrying transient failures
    #[arg(long)]
    pub no_retry: bool,
}

/// Run a write in its own transaction, committed on success.
pub async fn run_exec(global: &GlobalArgs, args: ExecArgs) -> Result<()> {
    let session = Session::open(global).await?;
    let sql = args.query.sql.as_str();
    let params = args.query.values();

    let affected = if args.no_retry {
        session.scope.execute(sql, &params).await
    } else {
        let policy = session.config.retry_policy()?;
        session.scope.execute_with_retry(&policy, sql, &params).await
    }
    .context("Statement failed")?;

    info!(rows_affected = affected, "Statement committed");

    let mut out = NdjsonWriter::stdout();
    out.write(&json!({ "rows_affected": affected }))?;
    out.flush()
}
