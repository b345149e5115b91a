//! Database Registry & Pool Abstraction (spec §4.1).
//!
//! A process-wide mapping from logical database name to a live, bounded
//! pool over one of three backends. Callers resolve pools by name; the
//! sentinel name `default` must always exist. Backend-specific query text
//! lives in [`store`] behind match-on-[`DbKind`] dispatch, grounded on the
//! per-backend scheduler implementations in the reference corpus
//! (one `impl` per backend rather than a single SQL string shared via
//! `sqlx::Any`, since placeholder style and upsert syntax are backend
//! native per spec §6).

pub mod store;

use std::{collections::HashMap, sync::Arc, time::Duration};

use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPoolOptions},
    postgres::{PgConnectOptions, PgPoolOptions},
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    MySqlPool, PgPool, SqlitePool,
};

use crate::{
    config::{DatabaseConfig, DatabaseEntry, DbKind, DEFAULT_DATABASE},
    error::{SchedulerError, SchedulerResult},
};

/// A live pool over one of the three supported backends.
#[derive(Clone)]
pub enum Database {
    Sqlite(SqlitePool),
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl Database {
    pub fn kind(&self) -> DbKind {
        match self {
            Database::Sqlite(_) => DbKind::Sqlite,
            Database::Postgres(_) => DbKind::Postgres,
            Database::MySql(_) => DbKind::Mysql,
        }
    }

    pub async fn connect(name: &str, entry: &DatabaseEntry) -> SchedulerResult<Self> {
        let acquire_timeout = entry.pool.acquire_timeout();
        let max_idle = entry.pool.max_idle_time();

        let db = match entry.kind {
            DbKind::Sqlite => {
                let opts = SqliteConnectOptions::new()
                    .filename(&entry.url)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_millis(5_000))
                    .synchronous(SqliteSynchronous::Normal)
                    .foreign_keys(true);

                let pool = SqlitePoolOptions::new()
                    .max_connections(entry.pool.max_connections)
                    .min_connections(entry.pool.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(Some(max_idle))
                    .connect_with(opts)
                    .await
                    .map_err(|err| map_connect_err(name, err))?;

                Database::Sqlite(pool)
            }
            DbKind::Postgres => {
                let opts: PgConnectOptions = entry
                    .url
                    .parse()
                    .map_err(|err: sqlx::Error| map_connect_err(name, err))?;

                let pool = PgPoolOptions::new()
                    .max_connections(entry.pool.max_connections)
                    .min_connections(entry.pool.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(Some(max_idle))
                    .connect_with(opts)
                    .await
                    .map_err(|err| map_connect_err(name, err))?;

                Database::Postgres(pool)
            }
            DbKind::Mysql => {
                let opts: MySqlConnectOptions = entry
                    .url
                    .parse()
                    .map_err(|err: sqlx::Error| map_connect_err(name, err))?;

                let pool = MySqlPoolOptions::new()
                    .max_connections(entry.pool.max_connections)
                    .min_connections(entry.pool.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .idle_timeout(Some(max_idle))
                    .connect_with(opts)
                    .await
                    .map_err(|err| map_connect_err(name, err))?;

                Database::MySql(pool)
            }
        };

        Ok(db)
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        let migrator_dir = match self.kind() {
            DbKind::Sqlite => "migrations/sqlite",
            DbKind::Postgres => "migrations/postgres",
            DbKind::Mysql => "migrations/mysql",
        };

        let migrator = sqlx::migrate::Migrator::new(std::path::Path::new(migrator_dir))
            .await
            .map_err(|err| SchedulerError::TransactionError(err.to_string()))?;

        match self {
            Database::Sqlite(pool) => migrator.run(pool).await,
            Database::Postgres(pool) => migrator.run(pool).await,
            Database::MySql(pool) => migrator.run(pool).await,
        }
        .map_err(|err| SchedulerError::TransactionError(err.to_string()))
    }
}

fn map_connect_err(name: &str, err: sqlx::Error) -> SchedulerError {
    tracing::warn!(database = name, %err, "failed to establish database pool");
    SchedulerError::QueryExecutionError(err)
}

#[cfg(test)]
pub(crate) async fn test_sqlite(name: &str) -> Database {
    let opts = SqliteConnectOptions::new()
        .filename(format!("file:cadence_test_{name}"))
        .in_memory(true)
        .shared_cache(true)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .idle_timeout(None)
        .connect_with(opts)
        .await
        .expect("failed to open in-memory sqlite pool");

    let db = Database::Sqlite(pool);
    db.migrate().await.expect("failed to run migrations");
    db
}

/// Process-wide name -> pool mapping. Built once at startup, shared by
/// `Arc` across every component.
#[derive(Clone)]
pub struct Registry {
    pools: Arc<HashMap<String, Database>>,
}

impl Registry {
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let mut pools = HashMap::new();

        for (name, entry) in &config.databases {
            let db = Database::connect(name, entry).await?;
            pools.insert(name.clone(), db);
        }

        if !pools.contains_key(DEFAULT_DATABASE) {
            return Err(SchedulerError::Config(format!(
                "registry requires a '{DEFAULT_DATABASE}' database"
            )));
        }

        Ok(Self {
            pools: Arc::new(pools),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_single(name: &str, db: Database) -> Self {
        let mut pools = HashMap::new();
        pools.insert(name.to_string(), db);
        Self {
            pools: Arc::new(pools),
        }
    }

    pub fn get(&self, name: &str) -> SchedulerResult<&Database> {
        self.pools
            .get(name)
            .ok_or_else(|| SchedulerError::Config(format!("no database registered as '{name}'")))
    }

    pub fn default_db(&self) -> &Database {
        // Presence enforced at construction time.
        self.pools.get(DEFAULT_DATABASE).expect("default database missing")
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.pools.keys()
    }

    pub async fn migrate_all(&self) -> SchedulerResult<()> {
        for (name, db) in self.pools.iter() {
            tracing::info!(database = name, "running migrations");
            db.migrate().await?;
        }
        Ok(())
    }
}
