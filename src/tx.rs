//! Transaction Coordinator (spec §4.2): brackets a caller body with
//! transactions across one or more named databases, committing all on
//! success (in acquisition order) or rolling back all on failure (in
//! reverse order). *Best-effort atomicity, not 2PC* — if a later commit
//! fails after earlier ones succeeded, those partial commits stand and the
//! error propagates (spec "Guarantee").
//!
//! The per-name context is published into a task-local map so the caller's
//! body can fetch a transaction by name without threading it through every
//! function signature, per spec §4.2 step 3 and the §5 "Concurrency"
//! guarantee that this context is scoped to the current logical task.

use std::{collections::HashMap, future::Future, sync::Arc};

use tokio::sync::Mutex as AsyncMutex;

use crate::{
    db::Registry,
    error::{SchedulerError, SchedulerResult},
};

pub enum ActiveTx {
    /// `bool` records whether `query_only` was turned on for this
    /// transaction, so commit/rollback know to turn it back off before the
    /// connection returns to the pool (the pragma is connection-scoped, not
    /// undone by `ROLLBACK`).
    Sqlite(sqlx::Transaction<'static, sqlx::Sqlite>, bool),
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    MySql(sqlx::Transaction<'static, sqlx::MySql>),
}

impl ActiveTx {
    async fn begin(db: &crate::db::Database, readonly: bool) -> SchedulerResult<Self> {
        use crate::db::Database;

        let tx = match db {
            Database::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                if readonly {
                    // SQLite has no read-only transaction mode; `query_only`
                    // makes any write on this connection fail instead of
                    // committing silently.
                    sqlx::query("PRAGMA query_only = ON")
                        .execute(&mut *tx)
                        .await?;
                }
                ActiveTx::Sqlite(tx, readonly)
            }
            Database::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                if readonly {
                    sqlx::query("SET TRANSACTION READ ONLY")
                        .execute(&mut *tx)
                        .await?;
                }
                ActiveTx::Postgres(tx)
            }
            Database::MySql(pool) => {
                let mut tx = pool.begin().await?;
                if readonly {
                    sqlx::query("SET TRANSACTION READ ONLY")
                        .execute(&mut *tx)
                        .await?;
                }
                ActiveTx::MySql(tx)
            }
        };

        Ok(tx)
    }

    async fn commit(self) -> SchedulerResult<()> {
        match self {
            ActiveTx::Sqlite(mut tx, readonly) => {
                if readonly {
                    reset_query_only(&mut tx).await;
                }
                tx.commit().await
            }
            ActiveTx::Postgres(tx) => tx.commit().await,
            ActiveTx::MySql(tx) => tx.commit().await,
        }
        .map_err(SchedulerError::from)
    }

    async fn rollback(self) -> SchedulerResult<()> {
        match self {
            ActiveTx::Sqlite(mut tx, readonly) => {
                if readonly {
                    reset_query_only(&mut tx).await;
                }
                tx.rollback().await
            }
            ActiveTx::Postgres(tx) => tx.rollback().await,
            ActiveTx::MySql(tx) => tx.rollback().await,
        }
        .map_err(SchedulerError::from)
    }
}

async fn reset_query_only(tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>) {
    if let Err(err) = sqlx::query("PRAGMA query_only = OFF").execute(&mut **tx).await {
        tracing::warn!(%err, "failed to reset query_only pragma on pooled sqlite connection");
    }
}

struct Slot {
    readonly: bool,
    tx: Option<ActiveTx>,
}

type SharedContext = Arc<AsyncMutex<HashMap<String, Slot>>>;

tokio::task_local! {
    static CONTEXT: SharedContext;
}

/// RAII handle to one named database's transaction, checked out of the
/// task-local context for the duration of a single operation. Returned to
/// the context on drop so a later call for the same name can check it out
/// again.
pub struct NamedTx {
    name: String,
    ctx: SharedContext,
    readonly: bool,
    inner: Option<ActiveTx>,
}

impl NamedTx {
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn get_mut(&mut self) -> &mut ActiveTx {
        self.inner.as_mut().expect("transaction checked out twice")
    }
}

impl Drop for NamedTx {
    fn drop(&mut self) {
        if let Some(tx) = self.inner.take() {
            // Dropping a `NamedTx` without returning it to the context
            // (e.g. a panic mid-operation) loses the slot; the coordinator
            // notices at commit time and raises TransactionError instead of
            // committing a partial write set silently.
            if let Ok(mut guard) = self.ctx.try_lock() {
                if let Some(slot) = guard.get_mut(&self.name) {
                    slot.tx = Some(tx);
                }
            }
        }
    }
}

/// Fetch the named database's transaction out of the current task's
/// coordinator context. Must be called from within a `with_transactions`
/// body; fails fast otherwise (spec §9: nested/absent coordinators fail
/// fast rather than silently falling back to an implicit connection).
pub async fn named(name: &str) -> SchedulerResult<NamedTx> {
    let ctx = CONTEXT
        .try_with(|ctx| ctx.clone())
        .map_err(|_| SchedulerError::TransactionError(
            "no transaction coordinator active on this task".to_string(),
        ))?;

    let mut guard = ctx.lock().await;
    let slot = guard.get_mut(name).ok_or_else(|| {
        SchedulerError::TransactionError(format!("'{name}' was not opened by this coordinator"))
    })?;
    let tx = slot.tx.take().ok_or_else(|| {
        SchedulerError::TransactionError(format!(
            "'{name}' transaction is already checked out on this task"
        ))
    })?;
    let readonly = slot.readonly;
    drop(guard);

    Ok(NamedTx {
        name: name.to_string(),
        ctx,
        readonly,
        inner: Some(tx),
    })
}

/// Bracket `body` with transactions opened on every name in `names`, in
/// order, then commit all (in acquisition order) on success or roll back
/// all (in reverse order) on failure. Nested invocations on the same task
/// fail fast.
pub async fn with_transactions<T, Fut>(
    registry: &Registry,
    names: &[&str],
    readonly: bool,
    body: impl FnOnce() -> Fut,
) -> SchedulerResult<T>
where
    Fut: Future<Output = SchedulerResult<T>>,
{
    if CONTEXT.try_with(|_| ()).is_ok() {
        return Err(SchedulerError::TransactionError(
            "nested transaction coordinator invocation is not supported".to_string(),
        ));
    }

    let mut map = HashMap::with_capacity(names.len());
    for name in names {
        let db = registry.get(name)?;
        let tx = ActiveTx::begin(db, readonly).await?;
        map.insert((*name).to_string(), Slot { readonly, tx: Some(tx) });
    }

    let shared: SharedContext = Arc::new(AsyncMutex::new(map));
    let scoped = shared.clone();

    let result = CONTEXT.scope(scoped, body()).await;

    match result {
        Ok(value) => {
            let mut guard = shared.lock().await;
            for name in names {
                let slot = guard.remove(*name).ok_or_else(|| {
                    SchedulerError::TransactionError(format!("missing slot for '{name}'"))
                })?;
                let tx = slot.tx.ok_or_else(|| {
                    SchedulerError::TransactionError(format!(
                        "'{name}' transaction was never returned to the coordinator"
                    ))
                })?;
                tx.commit().await?;
            }
            Ok(value)
        }
        Err(err) => {
            let mut guard = shared.lock().await;
            for name in names.iter().rev() {
                if let Some(slot) = guard.remove(*name) {
                    if let Some(tx) = slot.tx {
                        if let Err(rollback_err) = tx.rollback().await {
                            tracing::error!(database = *name, err = %rollback_err, "rollback failed");
                        }
                    }
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn commits_on_success() {
        let db = db::test_sqlite("tx_commit").await;
        let registry = Registry::from_single("default", db);

        let job_id = crate::db::store::create_cron_job(
            registry.default_db(),
            &crate::model::NewCronJob {
                name: "tx-job".to_string(),
                cron_expression: "*/5 * * * *".to_string(),
                handler_name: "noop".to_string(),
                handler_params: None,
                is_enabled: true,
                allow_overlap: false,
                max_retry: 0,
                timeout_seconds: 10,
                retain_for_days: None,
            },
        )
        .await
        .unwrap()
        .id;

        let result = with_transactions(&registry, &["default"], false, || async move {
            let mut handle = named("default").await?;
            let query = sqlx::query("UPDATE cron_jobs SET is_enabled = 0 WHERE id = ?").bind(job_id);
            match handle.get_mut() {
                ActiveTx::Sqlite(tx, _) => {
                    query.execute(&mut *tx).await?;
                }
                _ => unreachable!(),
            }
            Ok(())
        })
        .await;

        assert!(result.is_ok());

        let job = crate::db::store::get_cron_job(registry.default_db(), job_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!job.is_enabled);
    }

    #[tokio::test]
    async fn rolls_back_on_failure() {
        let db = db::test_sqlite("tx_rollback").await;
        let registry = Registry::from_single("default", db);

        let job_id = crate::db::store::create_cron_job(
            registry.default_db(),
            &crate::model::NewCronJob {
                name: "tx-job-2".to_string(),
                cron_expression: "*/5 * * * *".to_string(),
                handler_name: "noop".to_string(),
                handler_params: None,
                is_enabled: true,
                allow_overlap: false,
                max_retry: 0,
                timeout_seconds: 10,
                retain_for_days: None,
            },
        )
        .await
        .unwrap()
        .id;

        let result: SchedulerResult<()> = with_transactions(&registry, &["default"], false, || async move {
            let mut handle = named("default").await?;
            let query = sqlx::query("UPDATE cron_jobs SET is_enabled = 0 WHERE id = ?").bind(job_id);
            match handle.get_mut() {
                ActiveTx::Sqlite(tx, _) => {
                    query.execute(&mut *tx).await?;
                }
                _ => unreachable!(),
            }
            Err(SchedulerError::HandlerFailure("deliberate failure".to_string()))
        })
        .await;

        assert!(result.is_err());

        let job = crate::db::store::get_cron_job(registry.default_db(), job_id)
            .await
            .unwrap()
            .unwrap();
        assert!(job.is_enabled);
    }

    #[tokio::test]
    async fn nested_invocation_fails_fast() {
        let db = db::test_sqlite("tx_nested").await;
        let registry = Registry::from_single("default", db);

        let result: SchedulerResult<()> = with_transactions(&registry, &["default"], false, || async {
            let inner: SchedulerResult<()> =
                with_transactions(&registry, &["default"], false, || async { Ok(()) }).await;
            assert!(matches!(inner, Err(SchedulerError::TransactionError(_))));
            Ok(())
        })
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn readonly_mode_rejects_a_write_on_sqlite() {
        let db = db::test_sqlite("tx_readonly").await;
        let registry = Registry::from_single("default", db);

        let job_id = crate::db::store::create_cron_job(
            registry.default_db(),
            &crate::model::NewCronJob {
                name: "tx-job-3".to_string(),
                cron_expression: "*/5 * * * *".to_string(),
                handler_name: "noop".to_string(),
                handler_params: None,
                is_enabled: true,
                allow_overlap: false,
                max_retry: 0,
                timeout_seconds: 10,
                retain_for_days: None,
            },
        )
        .await
        .unwrap()
        .id;

        let result: SchedulerResult<()> = with_transactions(&registry, &["default"], true, || async move {
            let mut handle = named("default").await?;
            let query = sqlx::query("UPDATE cron_jobs SET is_enabled = 0 WHERE id = ?").bind(job_id);
            match handle.get_mut() {
                ActiveTx::Sqlite(tx, _) => query.execute(&mut *tx).await.map(|_| ()).map_err(SchedulerError::from),
                _ => unreachable!(),
            }
        })
        .await;

        assert!(matches!(result, Err(SchedulerError::ReadOnlyViolation(_))));

        // The connection must come back out of the pool writable: a
        // subsequent non-readonly transaction on the same pool succeeds.
        let result: SchedulerResult<()> = with_transactions(&registry, &["default"], false, || async move {
            let mut handle = named("default").await?;
            let query = sqlx::query("UPDATE cron_jobs SET is_enabled = 0 WHERE id = ?").bind(job_id);
            match handle.get_mut() {
                ActiveTx::Sqlite(tx, _) => query.execute(&mut *tx).await.map(|_| ()).map_err(SchedulerError::from),
                _ => unreachable!(),
            }
        })
        .await;
        assert!(result.is_ok());

        let job = crate::db::store::get_cron_job(registry.default_db(), job_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!job.is_enabled);
    }
}
