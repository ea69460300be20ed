use anyhow::{Context, Result};
use clap::Parser;
use futures::TryStreamExt;
use sluice_core::{filter_batches, RowFilter, RowStream};
use tracing::info;

use super::{GlobalArgs, QueryArgs, Session};
use crate::output::NdjsonWriter;
use crate::ui;

#[derive(Parser, Debug)]
pub struct StreamArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// Rows pulled per cursor fetch (default: [stream] fetch_size)
    #[arg(long, short = 'k')]
    pub fetch_size: Option<usize>,

    /// Emit one JSON array per fetched batch instead of one object per row
    #[arg(long)]
    pub batches: bool,

    /// Keep only rows matching `column <op> literal`, e.g. "age > 25"
    #[arg(long, value_name = "EXPR")]
    pub filter: Option<String>,
}

/// Stream a query through a server-side cursor, one fetch in memory at a time.
pub async fn run_stream(global: &GlobalArgs, args: StreamArgs) -> Result<()> {
    let filter = args
        .filter
        .as_deref()
        .map(RowFilter::parse)
        .transpose()
        .context("Invalid --filter")?;

    let session = Session::open(global).await?;
    let fetch_size = args.fetch_size.unwrap_or(session.config.stream.fetch_size);
    let policy = session.config.retry_policy()?;

    let stream = RowStream::open_with_retry(
        session.engine(),
        &policy,
        &args.query.sql,
        &args.query.values(),
        fetch_size,
    )
    .await
    .context("Failed to open row stream")?;

    let mut batches = match filter {
        Some(filter) => {
            info!(%filter, "Filtering streamed rows");
            filter_batches(stream, move |row| filter.matches(row))
        }
        None => stream.into_batches(),
    };

    let progress = ui::Progress::start("Streaming rows");
    let mut out = NdjsonWriter::stdout();
    let mut rows = 0u64;
    let mut fetched = 0u64;

    let outcome: Result<()> = async {
        while let Some(batch) = batches.try_next().await? {
            fetched += 1;
            rows += batch.len() as u64;
            if args.batches {
                out.write(&batch)?;
            } else {
                out.write_all(&batch)?;
            }
            progress.update(format!("{rows} rows in {fetched} fetches"));
        }
        out.flush()
    }
    .await;

    match outcome {
        Ok(()) => {
            progress.finish(true, format_args!("{rows} rows in {fetched} fetches"));
            info!(rows, fetches = fetched, fetch_size, "Stream complete");
            Ok(())
        }
        Err(e) => {
            progress.finish(false, format_args!("stream broke after {rows} rows"));
            Err(e)
        }
    }
}
