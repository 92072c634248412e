//! Configuration management for Tasklane
//!
//! Configuration is loaded once at startup from environment variables, with a
//! working-directory `.env` file as fallback. Every value is parsed and
//! validated here so that later lookups (credential tables, monitor
//! intervals) never see a malformed setting.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "./.tasklane";
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_MAX_TRANSACTION_MUTATIONS: usize = 1_000;
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_MS: u64 = 30_000;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 15_000;

// ---------------------------------------------------------------------------
// Key sources
// ---------------------------------------------------------------------------

/// Read-only key/value lookup used for configuration and secrets.
///
/// Production code reads the process environment (then `.env`); tests pass a
/// plain map so they never touch the real environment.
pub trait KeySource: Send + Sync {
    fn value(&self, key: &str) -> Option<String>;
}

/// Process environment first, working-directory `.env` second.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvKeySource;

impl KeySource for EnvKeySource {
    fn value(&self, key: &str) -> Option<String> {
        env_value(key)
    }
}

impl<S: std::hash::BuildHasher + Send + Sync> KeySource for HashMap<String, String, S> {
    fn value(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Look up `key` and treat blank values as absent.
pub fn non_blank(source: &dyn KeySource, key: &str) -> Option<String> {
    source
        .value(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Effective Tasklane configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding the shared and per-tenant SQLite files.
    pub data_dir: PathBuf,
    /// Raw remote tenant allow-list, as configured (normalized by the broker).
    pub remote_tenants: Vec<String>,
    /// Interval between connection health samples.
    pub health_interval: Duration,
    /// Consecutive failed samples before a connection is unhealthy.
    pub health_failure_threshold: u32,
    /// Upper bound on mutations grouped into one local write transaction.
    pub max_transaction_mutations: usize,
    /// First backoff delay after a failed drain.
    pub retry_base: Duration,
    /// Backoff cap for repeated drain failures.
    pub retry_max: Duration,
    /// Remote HTTP request timeout.
    pub http_timeout: Duration,
    /// Template name handed to the session token provider.
    pub token_template: Option<String>,
    /// `local -> remote` table name overrides.
    pub table_aliases: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            remote_tenants: Vec::new(),
            health_interval: Duration::from_millis(DEFAULT_HEALTH_INTERVAL_MS),
            health_failure_threshold: DEFAULT_HEALTH_FAILURE_THRESHOLD,
            max_transaction_mutations: DEFAULT_MAX_TRANSACTION_MUTATIONS,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            token_template: None,
            table_aliases: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the process environment with `.env` fallback.
    pub fn from_env() -> Result<Self> {
        Self::from_source(&EnvKeySource)
    }

    /// Load from an arbitrary key source.
    pub fn from_source(source: &dyn KeySource) -> Result<Self> {
        let defaults = Self::default();

        let data_dir = non_blank(source, "TASKLANE_DATA_DIR")
            .map_or(defaults.data_dir, PathBuf::from);

        let remote_tenants = non_blank(source, "TASKLANE_REMOTE_TENANTS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();

        let health_interval = Duration::from_millis(parse_u64(
            source,
            "TASKLANE_HEALTH_INTERVAL_MS",
            DEFAULT_HEALTH_INTERVAL_MS,
        )?);
        let health_failure_threshold = u32::try_from(parse_u64(
            source,
            "TASKLANE_HEALTH_FAILURE_THRESHOLD",
            u64::from(DEFAULT_HEALTH_FAILURE_THRESHOLD),
        )?)
        .map_err(|_| Error::config("TASKLANE_HEALTH_FAILURE_THRESHOLD", "out of range"))?;
        let max_transaction_mutations = usize::try_from(parse_u64(
            source,
            "TASKLANE_MAX_TRANSACTION_MUTATIONS",
            DEFAULT_MAX_TRANSACTION_MUTATIONS as u64,
        )?)
        .map_err(|_| Error::config("TASKLANE_MAX_TRANSACTION_MUTATIONS", "out of range"))?;

        let retry_base = Duration::from_millis(parse_u64(
            source,
            "TASKLANE_RETRY_BASE_MS",
            DEFAULT_RETRY_BASE_MS,
        )?);
        let retry_max = Duration::from_millis(parse_u64(
            source,
            "TASKLANE_RETRY_MAX_MS",
            DEFAULT_RETRY_MAX_MS,
        )?);
        let http_timeout = Duration::from_millis(parse_u64(
            source,
            "TASKLANE_HTTP_TIMEOUT_MS",
            DEFAULT_HTTP_TIMEOUT_MS,
        )?);

        let token_template = non_blank(source, "TASKLANE_TOKEN_TEMPLATE");
        let table_aliases = non_blank(source, "TASKLANE_TABLE_ALIASES")
            .map(|raw| parse_aliases(&raw))
            .transpose()?
            .unwrap_or_default();

        let config = Self {
            data_dir,
            remote_tenants,
            health_interval,
            health_failure_threshold,
            max_transaction_mutations,
            retry_base,
            retry_max,
            http_timeout,
            token_template,
            table_aliases,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would stall monitoring or draining.
    pub fn validate(&self) -> Result<()> {
        if self.health_interval.is_zero() {
            return Err(Error::config("TASKLANE_HEALTH_INTERVAL_MS", "must be > 0"));
        }
        if self.health_failure_threshold == 0 {
            return Err(Error::config(
                "TASKLANE_HEALTH_FAILURE_THRESHOLD",
                "must be > 0",
            ));
        }
        if self.max_transaction_mutations == 0 {
            return Err(Error::config(
                "TASKLANE_MAX_TRANSACTION_MUTATIONS",
                "must be > 0",
            ));
        }
        if self.retry_base > self.retry_max {
            return Err(Error::config(
                "TASKLANE_RETRY_BASE_MS",
                format!(
                    "base delay {}ms exceeds TASKLANE_RETRY_MAX_MS {}ms",
                    self.retry_base.as_millis(),
                    self.retry_max.as_millis()
                ),
            ));
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_aliases(raw: &str) -> Result<Vec<(String, String)>> {
    split_list(raw)
        .into_iter()
        .map(|pair| {
            let Some((local, remote)) = pair.split_once('=') else {
                return Err(Error::config(
                    "TASKLANE_TABLE_ALIASES",
                    format!("expected local=remote, got {pair:?}"),
                ));
            };
            let (local, remote) = (local.trim(), remote.trim());
            if local.is_empty() || remote.is_empty() {
                return Err(Error::config(
                    "TASKLANE_TABLE_ALIASES",
                    format!("empty table name in {pair:?}"),
                ));
            }
            Ok((local.to_string(), remote.to_string()))
        })
        .collect()
}

fn parse_u64(source: &dyn KeySource, key: &str, default: u64) -> Result<u64> {
    let Some(raw) = non_blank(source, key) else {
        return Ok(default);
    };
    raw.parse()
        .map_err(|_| Error::config(key, format!("expected an unsigned integer, got {raw:?}")))
}

/// Parse a boolean flag the lenient way (`1/true/yes/on`).
#[must_use]
pub fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => true,
        "0" | "false" | "f" | "no" | "n" | "off" => false,
        _ => default,
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

static DOTENV_VALUES: OnceLock<HashMap<String, String>> = OnceLock::new();

fn dotenv_values() -> &'static HashMap<String, String> {
    DOTENV_VALUES.get_or_init(|| load_dotenv_file(Path::new(".env")))
}

/// Read a value from the working-directory `.env` file (if present).
#[must_use]
pub fn dotenv_value(key: &str) -> Option<String> {
    dotenv_values().get(key).cloned()
}

/// Read a value from the real environment first, falling back to `.env`.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().or_else(|| dotenv_value(key))
}

fn load_dotenv_file(path: &Path) -> HashMap<String, String> {
    fs::read_to_string(path)
        .map(|contents| parse_env_file(&contents))
        .unwrap_or_default()
}

/// Parse `KEY=value` lines.
///
/// Blank lines and `#` lines are skipped. A value wrapped in one pair of
/// matching quotes is unwrapped; nothing else is interpreted, so secrets
/// may contain `#` and `=`.
#[must_use]
pub fn parse_env_file(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter_map(|(key, value)| {
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}
