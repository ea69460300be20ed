use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::concurrent::FailurePolicy;
use crate::error::{DbError, Result};
use crate::retry::{Backoff, RetryPolicy};

/// Project-local config file name, looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "sluice.toml";

/// Environment variable that overrides `[database] url`.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Load environment variables from .env files
///
/// Priority order (highest to lowest):
/// 1. Environment variables already set
/// 2. Current directory .env
/// 3. ~/.sluice/.env
pub fn load_dotenv() {
    let mut loaded_from = Vec::new();

    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded .env from current directory: {}", path.display());
        loaded_from.push(path.display().to_string());
    }

    if let Some(env_file) = config_dir().map(|d| d.join(".env")) {
        if env_file.exists() {
            // dotenvy never overwrites variables that are already set
            match dotenvy::from_path(&env_file) {
                Ok(()) => loaded_from.push(env_file.display().to_string()),
                Err(e) => debug!("Failed to load {}: {}", env_file.display(), e),
            }
        }
    }

    if loaded_from.is_empty() {
        debug!("No .env files found (current dir or ~/.sluice)");
    } else {
        info!("Loaded environment from: {}", loaded_from.join(", "));
    }
}

/// The sluice config directory (~/.sluice)
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".sluice"))
}

/// ~/.sluice/config.toml
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

// ============================================================================
// TOML Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SluiceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Connection URL; `DATABASE_URL` takes precedence when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default)]
    pub jitter: bool,

    /// Overall deadline for one retried operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff: Backoff::default(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fetch_size: default_fetch_size(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// Default value functions for serde
fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_fetch_size() -> usize {
    100
}

fn default_page_size() -> usize {
    100
}

fn default_max_in_flight() -> usize {
    num_cpus::get().max(1)
}

fn default_true() -> bool {
    true
}

impl SluiceConfig {
    /// Load config from TOML files, then apply environment overrides.
    ///
    /// Priority order (highest to lowest):
    /// 1. `DATABASE_URL`
    /// 2. ./sluice.toml (project-specific)
    /// 3. ~/.sluice/config.toml (user defaults)
    /// 4. Built-in defaults
    ///
    /// Unreadable or malformed files are skipped with a warning.
    pub fn load() -> Self {
        let mut layers = Vec::new();
        if let Some(global) = global_config_path() {
            layers.push(global);
        }
        layers.push(PathBuf::from(LOCAL_CONFIG_FILE));

        let mut merged = toml::Table::new();
        for path in layers.iter().filter(|p| p.exists()) {
            match read_table(path) {
                Ok(table) => {
                    debug!("Loaded config from {}", path.display());
                    merge_tables(&mut merged, table);
                }
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        let mut config = match toml::Value::Table(merged).try_into::<SluiceConfig>() {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid configuration, using defaults: {}", e);
                SluiceConfig::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load exactly one file, failing on any problem, then apply
    /// environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let table = read_table(path)?;
        let mut config: SluiceConfig = toml::Value::Table(table)
            .try_into()
            .map_err(|e| DbError::config(format!("{}: {}", path.display(), e)))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| DbError::config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DbError::config(e.to_string()))
    }

    /// Apply overrides read through `lookup` (normally the process env).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(DATABASE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            debug!("Using database url from {}", DATABASE_URL_ENV);
            self.database.url = Some(url);
        }
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database.url.as_deref().ok_or_else(|| {
            DbError::config(format!(
                "no database url: set {DATABASE_URL_ENV} or [database] url in {LOCAL_CONFIG_FILE}"
            ))
        })
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.database.acquire_timeout_ms)
    }

    /// Reject settings no component can work with.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.database.max_connections == 0, "database.max_connections"),
            (self.retry.max_attempts == 0, "retry.max_attempts"),
            (self.stream.fetch_size == 0, "stream.fetch_size"),
            (self.stream.page_size == 0, "stream.page_size"),
            (self.concurrency.max_in_flight == 0, "concurrency.max_in_flight"),
        ];
        if let Some((_, key)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(DbError::config(format!("{key} must be at least 1")));
        }
        if self.retry.backoff == Backoff::Exponential
            && self.retry.max_delay_ms < self.retry.base_delay_ms
        {
            return Err(DbError::config(
                "retry.max_delay_ms must not be below retry.base_delay_ms",
            ));
        }
        Ok(())
    }

    /// Build the configured retry policy. The deadline, if any, starts now.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let retry = &self.retry;
        let mut policy = RetryPolicy::new(retry.max_attempts, Duration::from_millis(retry.base_delay_ms))?
            .with_backoff(retry.backoff)
            .with_max_delay(Duration::from_millis(retry.max_delay_ms))
            .with_jitter(retry.jitter);
        if let Some(timeout_ms) = retry.timeout_ms {
            policy = policy.with_timeout(Duration::from_millis(timeout_ms));
        }
        Ok(policy)
    }
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| DbError::config(format!("failed to read {}: {}", path.display(), e)))?;
    contents
        .parse::<toml::Table>()
        .map_err(|e| DbError::config(format!("failed to parse {}: {}", path.display(), e)))
}

/// Deep merge: keys in `overlay` win, nested tables merge key by key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
