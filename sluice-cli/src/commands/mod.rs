//! Subcommand implementations.
//!
//! Every command runs against a [`Session`]: the loaded configuration plus
//! one engine shared by all scopes the command opens.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use sluice_core::config::load_dotenv;
use sluice_core::{ConnectionScope, Engine, LoggedEngine, MemoryEngine, PgEngine, SluiceConfig, Value};
use tracing::{debug, info};

pub mod config;
pub mod exec;
pub mod fetch;
pub mod pages;
pub mod query;
pub mod stats;
pub mod stream;

pub use config::run_config;
pub use exec::run_exec;
pub use fetch::run_fetch;
pub use pages::{run_page, run_paginate};
pub use query::run_query;
pub use stats::run_average;
pub use stream::run_stream;

/// URL scheme for the built-in sample database.
pub const MEMORY_SCHEME: &str = "memory:";

const DEFAULT_SAMPLE_ROWS: usize = 100;

/// Connection options shared by every database command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Config file to use instead of ~/.sluice/config.toml and ./sluice.toml
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Database URL; `memory:` or `memory://?rows=N` uses a built-in sample table
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Log every statement at info level (target sluice::query)
    #[arg(long, global = true)]
    pub log_queries: bool,
}

/// SQL text plus positional `$n` parameters.
#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// SQL to run
    pub sql: String,

    /// Positional parameter, repeatable (`-p 25 -p "'text'"`)
    #[arg(long = "param", short = 'p', value_name = "VALUE")]
    pub params: Vec<String>,
}

impl QueryArgs {
    pub fn values(&self) -> Vec<Value> {
        parse_params(&self.params)
    }
}

pub fn parse_params(raw: &[String]) -> Vec<Value> {
    raw.iter().map(|p| Value::parse_literal(p)).collect()
}

pub fn load_config(global: &GlobalArgs) -> Result<SluiceConfig> {
    load_dotenv();
    let mut config = match &global.config_file {
        Some(path) => SluiceConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SluiceConfig::load(),
    };
    if let Some(url) = &global.database_url {
        config.database.url = Some(url.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub struct Session {
    pub config: SluiceConfig,
    pub scope: ConnectionScope,
}

impl Session {
    pub async fn open(global: &GlobalArgs) -> Result<Self> {
        let config = load_config(global)?;
        let url = config.database_url()?;

        let engine: Arc<dyn Engine> = match sample_rows(url)? {
            Some(rows) => {
                info!(rows, "Using in-memory sample database");
                Arc::new(MemoryEngine::with_sample_users(rows))
            }
            None => {
                debug!("Connecting to PostgreSQL");
                Arc::new(
                    PgEngine::from_config(&config)
                        .await
                        .context("Failed to connect to database")?,
                )
            }
        };
        let engine: Arc<dyn Engine> = if global.log_queries {
            Arc::new(LoggedEngine::new(engine))
        } else {
            engine
        };

        Ok(Self {
            config,
            scope: ConnectionScope::new(engine),
        })
    }

    pub fn engine(&self) -> &dyn Engine {
        self.scope.engine().as_ref()
    }
}

/// Row count for a `memory:` URL, `None` for anything else.
fn sample_rows(url: &str) -> Result<Option<usize>> {
    let Some(rest) = url.strip_prefix(MEMORY_SCHEME) else {
        return Ok(None);
    };
    let query = rest.trim_start_matches('/').trim_start_matches('?');
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some(("rows", n)) => {
                let rows = n
                    .parse()
                    .with_context(|| format!("Invalid rows in memory URL: {n}"))?;
                return Ok(Some(rows));
            }
            _ => bail!("Unknown memory URL option: {pair}"),
        }
    }
    Ok(Some(DEFAULT_SAMPLE_ROWS))
}
