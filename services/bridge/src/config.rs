use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::binder::BinderConfig;
use crate::client::ApiServerConfig;
use crate::db::{default_migrations_dir, DbConfig};
use crate::dispatch::DEFAULT_HANDOFF_CAPACITY;
use crate::pool::DispatchOrdering;
use crate::retry::{Backoff, RetryPolicy};
use crate::sync::SyncConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub api_server_url: String,
    pub api_token: Option<String>,
    pub scheduler_name: String,

    /// Run against the in-memory emulated cluster instead of an API server.
    pub emulate: bool,

    pub node_resync: Duration,
    pub dispatch_workers: usize,
    pub bind_workers: usize,
    pub dispatch_ordering: DispatchOrdering,
    pub handoff_capacity: usize,
    pub bind_timeout: Duration,
    pub bind_max_attempts: u32,
    pub verify_before_retry: bool,
    pub shutdown_timeout: Duration,

    /// `None` when `DATABASE_URL` is unset.
    pub database: Option<DbConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let flag = |key: &str| {
            get(key)
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false)
        };
        let secs = |key: &str, default: u64| -> Result<Duration> {
            parse_or(&get, key, default).map(Duration::from_secs)
        };

        let dispatch_ordering = match get("KBIND_DISPATCH_ORDERING") {
            Some(raw) => raw.parse::<DispatchOrdering>().map_err(|e| anyhow!(e))?,
            None => DispatchOrdering::default(),
        };

        let node_resync = secs("KBIND_NODE_RESYNC_SECS", 30)?;
        if node_resync.is_zero() {
            bail!("invalid KBIND_NODE_RESYNC_SECS=0: resync interval must be at least 1 second");
        }

        let database = match get("DATABASE_URL") {
            Some(database_url) => Some(DbConfig {
                database_url,
                max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", 10)?,
                min_connections: parse_or(&get, "DB_MIN_CONNECTIONS", 1)?,
                connect_timeout: secs("KBIND_DB_CONNECT_TIMEOUT_SECS", 10)?,
                migrations_dir: get("KBIND_MIGRATIONS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_migrations_dir),
            }),
            None => None,
        };

        Ok(Self {
            log_level: get("KBIND_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            api_server_url: get("KBIND_API_SERVER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8001".to_string()),
            api_token: get("KBIND_API_TOKEN").filter(|t| !t.trim().is_empty()),
            scheduler_name: get("KBIND_SCHEDULER_NAME").unwrap_or_else(|| "kbind".to_string()),
            emulate: flag("KBIND_EMULATE"),
            node_resync,
            dispatch_workers: parse_or(&get, "KBIND_DISPATCH_WORKERS", 10)?,
            bind_workers: parse_or(&get, "KBIND_BIND_WORKERS", 10)?,
            dispatch_ordering,
            handoff_capacity: parse_or(&get, "KBIND_HANDOFF_CAPACITY", DEFAULT_HANDOFF_CAPACITY)?,
            bind_timeout: secs("KBIND_BIND_TIMEOUT_SECS", 10)?,
            bind_max_attempts: parse_or(&get, "KBIND_BIND_MAX_ATTEMPTS", 2)?,
            verify_before_retry: flag("KBIND_VERIFY_BEFORE_RETRY"),
            shutdown_timeout: secs("KBIND_SHUTDOWN_TIMEOUT_SECS", 10)?,
            database,
        })
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            node_resync: self.node_resync,
            handoff_capacity: self.handoff_capacity,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    pub fn binder_config(&self) -> BinderConfig {
        BinderConfig {
            retry: RetryPolicy {
                max_attempts: self.bind_max_attempts,
                backoff: Backoff::None,
                verify_before_retry: self.verify_before_retry,
            },
            call_timeout: self.bind_timeout,
        }
    }

    pub fn api_server_config(&self) -> ApiServerConfig {
        ApiServerConfig {
            base_url: self.api_server_url.clone(),
            token: self.api_token.clone(),
            request_timeout: self.bind_timeout,
            scheduler_name: Some(self.scheduler_name.clone()),
            ..Default::default()
        }
    }
}

/// Parse `key` into `T`, or return `default` when unset. Out-of-range values
/// are rejected, not truncated.
fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(default),
    }
}
