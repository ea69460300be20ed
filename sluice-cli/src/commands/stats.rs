use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use sluice_core::{summarize_column, ColumnSummary};

use super::{GlobalArgs, QueryArgs, Session};
use crate::output::NdjsonWriter;
use crate::ui;

#[derive(Parser, Debug)]
pub struct AverageArgs {
    /// Numeric column to aggregate
    #[arg(long, short = 'c')]
    pub column: String,

    #[command(flatten)]
    pub query: QueryArgs,

    /// Rows pulled per cursor fetch (default: [stream] fetch_size)
    #[arg(long, short = 'k')]
    pub fetch_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AverageReport<'a> {
    column: &'a str,
    #[serde(flatten)]
    summary: ColumnSummary,
    mean: Option<f64>,
}

/// Average a column over a stream without materializing the result.
pub async fn run_average(global: &GlobalArgs, args: AverageArgs) -> Result<()> {
    let session = Session::open(global).await?;
    let fetch_size = args.fetch_size.unwrap_or(session.config.stream.fetch_size);

    let summary = ui::track(format!("Averaging {}", args.column), async {
        let stream = session
            .scope
            .stream(&args.query.sql, &args.query.values(), fetch_size)
            .await?;
        summarize_column(stream, &args.column).await
    })
    .await
    .with_context(|| format!("Failed to average column {}", args.column))?;

    let mut out = NdjsonWriter::stdout();
    out.write(&AverageReport {
        column: &args.column,
        summary,
        mean: summary.mean(),
    })?;
    out.flush()
}
