use anyhow::{Context, Result};
use clap::Parser;
use sluice_core::{PageSource, Pagination};
use tracing::info;

use super::{GlobalArgs, QueryArgs, Session};
use crate::output::NdjsonWriter;
use crate::ui;

#[derive(Parser, Debug)]
pub struct PageArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// 1-based page number
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Rows per page (default: [stream] page_size, capped at 10000)
    #[arg(long)]
    pub per_page: Option<u32>,

    /// Emit one JSON object with page metadata and rows
    #[arg(long)]
    pub envelope: bool,
}

#[derive(Parser, Debug)]
pub struct PaginateArgs {
    #[command(flatten)]
    pub query: QueryArgs,

    /// Rows per page (default: [stream] page_size)
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Stop after this many pages
    #[arg(long)]
    pub max_pages: Option<u64>,
}

fn page_source(session: &Session, query: &QueryArgs) -> Result<PageSource> {
    let policy = session.config.retry_policy()?;
    Ok(PageSource::new(session.scope.clone(), query.sql.clone(), query.values()).with_retry(policy))
}

/// Fetch one LIMIT/OFFSET page.
pub async fn run_page(global: &GlobalArgs, args: PageArgs) -> Result<()> {
    let session = Session::open(global).await?;
    let per_page = args
        .per_page
        .unwrap_or_else(|| u32::try_from(session.config.stream.page_size).unwrap_or(u32::MAX));
    let pagination = Pagination::new(args.page, per_page);

    let page = page_source(&session, &args.query)?
        .page_at(pagination)
        .await
        .with_context(|| format!("Failed to fetch page {}", pagination.page))?;

    info!(
        page = page.page,
        per_page = page.per_page,
        offset = page.offset,
        rows = page.rows.len(),
        "Fetched page"
    );

    let mut out = NdjsonWriter::stdout();
    if args.envelope {
        out.write(&page)?;
    } else {
        out.write_all(&page.rows)?;
    }
    out.flush()
}

/// Walk every page lazily until an empty page comes back.
pub async fn run_paginate(global: &GlobalArgs, args: PaginateArgs) -> Result<()> {
    let session = Session::open(global).await?;
    let page_size = args.page_size.unwrap_or(session.config.stream.page_size);
    let mut pages = page_source(&session, &args.query)?.lazy_pages(page_size)?;

    let progress = ui::Progress::start("Paginating");
    let mut out = NdjsonWriter::stdout();

    let outcome: Result<()> = async {
        while args.max_pages.map_or(true, |max| pages.pages_fetched() < max) {
            let Some(rows) = pages.next_page().await.with_context(|| {
                format!("Failed to fetch page at offset {}", pages.offset())
            })?
            else {
                break;
            };
            out.write_all(&rows)?;
            progress.update(format!("page {} (offset {})", pages.pages_fetched(), pages.offset()));
        }
        out.flush()
    }
    .await;

    match outcome {
        Ok(()) => {
            progress.finish(
                true,
                format_args!("{} pages, {} rows", pages.pages_fetched(), out.lines()),
            );
            info!(pages = pages.pages_fetched(), rows = out.lines(), page_size, "Pagination complete");
            Ok(())
        }
        Err(e) => {
            progress.finish(false, "pagination");
            Err(e)
        }
    }
}
