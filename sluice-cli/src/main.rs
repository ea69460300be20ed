//! sluice CLI - memory-bounded database reads from the command line
//!
//! Drives `sluice-core` against PostgreSQL or the built-in `memory:` sample
//! database:
//! - Cursor streaming with a bounded fetch size (`stream`, `average`)
//! - LIMIT/OFFSET pagination (`page`, `paginate`)
//! - Concurrent reads with per-query scopes (`fetch`)
//! - Cached, retried reads and retried writes (`query`, `exec`)
//!
//! Rows go to stdout as NDJSON; logs and progress go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod output;
mod tracing_setup;
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "sluice",
    author,
    version,
    about = "Resilient, memory-bounded database reads",
    long_about = "Stream, paginate and fan out SQL reads with bounded memory. Every unit of \
                  work runs in its own transaction scope, transient failures are retried, and \
                  rows are written to stdout as NDJSON."
)]
struct Cli {
    #[command(flatten)]
    global: commands::GlobalArgs,

    /// Debug logging (RUST_LOG still takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    /// Export spans over OTLP (needs the telemetry feature)
    #[arg(long, global = true)]
    otel: bool,

    /// Suppress progress spinners (for script consumption)
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream query rows through a server-side cursor
    Stream(commands::stream::StreamArgs),
    /// Fetch one page with LIMIT/OFFSET
    Page(commands::pages::PageArgs),
    /// Walk every page until an empty one comes back
    Paginate(commands::pages::PaginateArgs),
    /// Average a numeric column over a stream
    Average(commands::stats::AverageArgs),
    /// Run several queries concurrently, each in its own scope
    Fetch(commands::fetch::FetchArgs),
    /// Cached read, retried on transient failures
    Query(commands::query::QueryCmdArgs),
    /// Retried write in its own transaction
    Exec(commands::exec::ExecArgs),
    /// Inspect and initialize configuration
    Config(commands::config::ConfigArgs),
    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)] // PowerShell is a proper noun, not a suffix
enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_setup::init(&tracing_setup::TracingConfig {
        debug: cli.debug,
        otel: cli.otel,
        log_queries: cli.global.log_queries,
    })
    .ok();
    ui::init_quiet_mode(cli.quiet);

    let global = &cli.global;
    let outcome = match cli.command {
        Commands::Stream(args) => commands::run_stream(global, args).await,
        Commands::Page(args) => commands::run_page(global, args).await,
        Commands::Paginate(args) => commands::run_paginate(global, args).await,
        Commands::Average(args) => commands::run_average(global, args).await,
        Commands::Fetch(args) => commands::run_fetch(global, args).await,
        Commands::Query(args) => commands::run_query(global, args).await,
        Commands::Exec(args) => commands::run_exec(global, args).await,
        Commands::Config(args) => commands::run_config(global, args),
        Commands::Completions(args) => run_completions(args),
    };

    tracing_setup::shutdown_otel();
    outcome
}

fn run_completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell as CompletionShell};
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    };

    generate(shell, &mut cmd, bin_name, &mut io::stdout());

    Ok(())
}
