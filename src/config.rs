//! The four configuration documents (spec §6), loaded with `figment` from
//! TOML files layered with environment variables (`CADENCE_` prefix).
//!
//! Each subcommand loads only the document(s) it needs; `dev` mode loads
//! all of them with relaxed requirements suited to a single local pool.

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;

use crate::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Sqlite,
    Postgres,
    Mysql,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_time_secs: u64,
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }
}

fn default_pool_size() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    1
}
fn default_acquire_timeout_secs() -> u64 {
    10
}
fn default_max_idle_secs() -> u64 {
    600
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_pool_size(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            max_idle_time_secs: default_max_idle_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseEntry {
    #[serde(rename = "type")]
    pub kind: DbKind,
    /// Backend connection string (file path for sqlite, DSN for others).
    pub url: String,
    #[serde(default)]
    pub pool: PoolSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub databases: HashMap<String, DatabaseEntry>,
}

pub const DEFAULT_DATABASE: &str = "default";

impl DatabaseConfig {
    pub fn from_file(path: &Path) -> SchedulerResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_DATABASE_"))
            .extract()
            .map_err(|err| SchedulerError::Config(err.to_string()))?;

        if !config.databases.contains_key(DEFAULT_DATABASE) {
            return Err(SchedulerError::Config(format!(
                "database configuration must define a '{DEFAULT_DATABASE}' entry"
            )));
        }

        Ok(config)
    }

    pub fn single_sqlite(url: impl Into<String>) -> Self {
        let mut databases = HashMap::new();
        databases.insert(
            DEFAULT_DATABASE.to_string(),
            DatabaseEntry {
                kind: DbKind::Sqlite,
                url: url.into(),
                pool: PoolSettings::default(),
            },
        );
        Self { databases }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_database_name")]
    pub database: String,
    #[serde(default = "default_dispatcher_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_max_sleep")]
    pub max_sleep_seconds: u64,
    #[serde(default = "default_min_cron_interval")]
    pub min_cron_interval_seconds: i64,
}

fn default_database_name() -> String {
    DEFAULT_DATABASE.to_string()
}
fn default_dispatcher_poll_interval() -> u64 {
    60
}
fn default_max_sleep() -> u64 {
    300
}
fn default_min_cron_interval() -> i64 {
    60
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            database: default_database_name(),
            poll_interval_seconds: default_dispatcher_poll_interval(),
            max_sleep_seconds: default_max_sleep(),
            min_cron_interval_seconds: default_min_cron_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_database_name")]
    pub database: String,
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default = "default_pool_size_usize")]
    pub pool_size: usize,
    #[serde(default = "default_worker_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    /// Deadline applied to event-provenance executions with no owning
    /// cron_job to read `timeout_seconds` from (data model §3 notes only
    /// cron_jobs carries a timeout; job_executions does not snapshot one).
    #[serde(default = "default_event_timeout")]
    pub default_event_timeout_seconds: i32,
}

fn default_pool_size_usize() -> usize {
    10
}
fn default_worker_poll_interval() -> u64 {
    5
}
fn default_claim_batch_size() -> usize {
    20
}
fn default_shutdown_timeout() -> u64 {
    30
}
fn default_event_timeout() -> i32 {
    60
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database: default_database_name(),
            databases: Vec::new(),
            pool_size: default_pool_size_usize(),
            poll_interval_seconds: default_worker_poll_interval(),
            claim_batch_size: default_claim_batch_size(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            default_event_timeout_seconds: default_event_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueDispatcherConfig {
    #[serde(default = "default_database_name")]
    pub database: String,
    pub bootstrap_servers: String,
    pub group_id: String,
    pub topic: String,
    #[serde(default = "default_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
}

fn default_offset_reset() -> String {
    "earliest".to_string()
}
fn default_max_poll_records() -> usize {
    100
}

/// Admin surface bind address (added: not one of the four named documents
/// in spec §6, since the admin surface itself is out of scope; the bind
/// address is the minimum ambient configuration needed to run it).
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AdminConfig {
    #[serde(default = "default_database_name")]
    pub database: String,
    #[serde(default = "default_admin_bind_address")]
    pub bind_address: String,
}

fn default_admin_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            database: default_database_name(),
            bind_address: default_admin_bind_address(),
        }
    }
}

/// Shared loader for document kinds that tolerate defaults (dispatcher,
/// worker); the database and queue_dispatcher documents have no sensible
/// defaults and are loaded with `load_required`.
pub fn load<T: serde::de::DeserializeOwned + Default + serde::Serialize>(
    path: Option<&Path>,
    env_prefix: &str,
) -> SchedulerResult<T> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(T::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment = figment.merge(Env::prefixed(env_prefix));

    figment
        .extract()
        .map_err(|err| SchedulerError::Config(err.to_string()))
}

/// Loader for documents with required fields (no `Default` impl).
pub fn load_required<T: serde::de::DeserializeOwned>(
    path: Option<&Path>,
    env_prefix: &str,
) -> SchedulerResult<T> {
    let mut figment = Figment::new();
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment = figment.merge(Env::prefixed(env_prefix));

    figment
        .extract()
        .map_err(|err| SchedulerError::Config(err.to_string()))
}
