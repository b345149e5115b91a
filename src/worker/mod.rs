//! Worker Pool (spec §4.5): drains PENDING executions and drives each to a
//! terminal status, respecting per-execution timeouts and retry budgets.
//! The supervisor loop mirrors the `FuturesUnordered`-of-`JoinHandle`
//! shape used elsewhere in this codebase for a pool of independent
//! long-running units, generalized here to a bounded, continuously
//! refilled pool of one-shot execution tasks instead of a fixed set of
//! long-lived loops.

use std::time::Duration;

use futures::stream::FuturesUnordered;
use tokio::{select, task::JoinHandle};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    config::WorkerConfig,
    db::{store, Database, Registry},
    error::SchedulerResult,
    handler::HandlerRegistry,
    model::ExecutionStatus,
};

pub struct WorkerPool {
    registry: Registry,
    config: WorkerConfig,
    handlers: HandlerRegistry,
}

impl WorkerPool {
    pub fn new(registry: Registry, config: WorkerConfig, handlers: HandlerRegistry) -> Self {
        Self {
            registry,
            config,
            handlers,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> SchedulerResult<()> {
        let db = self.registry.get(&self.config.database)?.clone();
        let poll_interval = Duration::from_secs(self.config.poll_interval_seconds);

        let mut in_flight: FuturesUnordered<JoinHandle<()>> = FuturesUnordered::new();
        let mut abort_handles: Vec<tokio::task::AbortHandle> = Vec::new();

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
                Some(join_result) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(err) = join_result {
                        tracing::error!(%err, "execution task panicked");
                    }
                    continue;
                }
            }

            let free = self.config.pool_size.saturating_sub(in_flight.len());
            if free == 0 {
                continue;
            }

            abort_handles.retain(|handle| !handle.is_finished());

            let batch_size = self.config.claim_batch_size.min(free) as i64;
            let candidates = match store::list_pending_ids(&db, batch_size).await {
                Ok(ids) => ids,
                Err(err) => {
                    tracing::warn!(%err, "failed to list pending executions, backing off");
                    continue;
                }
            };

            for id in candidates {
                match store::claim_execution(&db, id).await {
                    Ok(true) => {
                        let db = db.clone();
                        let handlers = self.handlers.clone();
                        let default_timeout = self.config.default_event_timeout_seconds;
                        let handle = tokio::spawn(execute_claimed(db, handlers, id, default_timeout));
                        abort_handles.push(handle.abort_handle());
                        in_flight.push(handle);
                    }
                    Ok(false) => {
                        // Another worker won the race (C2); nothing to do.
                    }
                    Err(err) => {
                        tracing::warn!(execution_id = id, %err, "failed to claim execution");
                    }
                }
            }
        }

        tracing::info!("worker pool shutting down, draining in-flight executions");
        let shutdown_budget = Duration::from_secs(self.config.shutdown_timeout_seconds);
        let drained = tokio::time::timeout(shutdown_budget, async {
            while let Some(join_result) = in_flight.next().await {
                if let Err(err) = join_result {
                    tracing::error!(%err, "execution task panicked during shutdown drain");
                }
            }
        })
        .await;

        if drained.is_err() {
            // Budget exceeded with executions still in flight: abort the
            // survivors instead of just dropping the handles, which would
            // only detach them to keep running unsupervised after this
            // function returns (spec §4.5 "Shutdown").
            let remaining = abort_handles.iter().filter(|h| !h.is_finished()).count();
            if remaining > 0 {
                tracing::warn!(remaining, "aborting executions still running past shutdown budget");
            }
            for handle in &abort_handles {
                handle.abort();
            }
        }

        Ok(())
    }
}

/// Execution of one claimed row (spec §4.5 steps 1-7). Runs as its own
/// spawned task so a slow or hung handler never blocks the claim loop;
/// errors are logged here rather than propagated since there is no
/// caller left to receive them once detached from the supervisor's
/// shutdown drain.
async fn execute_claimed(
    db: Database,
    handlers: HandlerRegistry,
    execution_id: i64,
    default_timeout_seconds: i32,
) {
    if let Err(err) =
        execute_claimed_inner(&db, &handlers, execution_id, default_timeout_seconds).await
    {
        tracing::error!(execution_id, %err, "failed to record execution outcome");
    }
}

pub(crate) async fn execute_claimed_inner(
    db: &Database,
    handlers: &HandlerRegistry,
    execution_id: i64,
    default_timeout_seconds: i32,
) -> SchedulerResult<()> {
    let execution = store::get_execution(db, execution_id)
        .await?
        .ok_or_else(|| {
            crate::error::SchedulerError::Config(format!(
                "claimed execution {execution_id} vanished before it could run"
            ))
        })?;

    // timeout_seconds and max_retry live on the owning cron_job and are
    // read live here, unlike handler_name which I5 snapshots at creation.
    let owning_job = match execution.job_id {
        Some(job_id) => store::get_cron_job(db, job_id).await?,
        None => None,
    };
    let timeout_seconds = owning_job
        .as_ref()
        .map(|job| job.timeout_seconds)
        .unwrap_or(default_timeout_seconds);
    let max_retry = owning_job.as_ref().map(|job| job.max_retry).unwrap_or(0);

    let Some(handler) = handlers.get(&execution.handler_name) else {
        // Non-transient: never re-queued regardless of retry budget, per
        // spec §4.5 step 1's explicit carve-out for a missing handler.
        store::record_outcome(
            db,
            execution_id,
            ExecutionStatus::Failed,
            Some("handler not found"),
            None,
        )
        .await?;
        return Ok(());
    };

    let deadline = Duration::from_secs(timeout_seconds.max(1) as u64);
    let outcome = tokio::time::timeout(deadline, handler.call(execution.params.clone())).await;

    let (status, error_message, result, retryable) = match outcome {
        Ok(Ok(value)) => (ExecutionStatus::Success, None, Some(value), false),
        Ok(Err(err)) => (ExecutionStatus::Failed, Some(err.to_string()), None, true),
        Err(_) => (
            ExecutionStatus::Timeout,
            Some("Execution timed out".to_string()),
            None,
            true,
        ),
    };

    let retry_count = store::record_outcome(
        db,
        execution_id,
        status,
        error_message.as_deref(),
        result.as_ref(),
    )
    .await?;

    if retryable && retry_count <= max_retry {
        store::requeue_pending(db, execution_id).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, handler::HandlerRegistryBuilder, model::NewCronJob};
    use chrono::Utc;

    async fn seed_job(db: &Database, max_retry: i32) -> i64 {
        store::create_cron_job(
            db,
            &NewCronJob {
                name: "worker-job".to_string(),
                cron_expression: "* * * * *".to_string(),
                handler_name: "noop".to_string(),
                handler_params: None,
                is_enabled: true,
                allow_overlap: true,
                max_retry,
                timeout_seconds: 5,
                retain_for_days: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    async fn seed_execution(db: &Database, job_id: i64) -> i64 {
        store::insert_cron_execution(db, job_id, "noop", Utc::now(), &serde_json::json!({}))
            .await
            .unwrap();
        store::list_pending_ids(db, 10).await.unwrap()[0]
    }

    #[tokio::test]
    async fn missing_handler_fails_terminally_without_requeue() {
        let db = db::test_sqlite("worker_missing_handler").await;
        let job_id = seed_job(&db, 5).await;
        let execution_id = seed_execution(&db, job_id).await;
        assert!(store::claim_execution(&db, execution_id).await.unwrap());

        let handlers = HandlerRegistryBuilder::new().build();
        execute_claimed_inner(&db, &handlers, execution_id, 60).await.unwrap();

        let execution = store::get_execution(&db, execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        // retry_count is bumped like any other FAILED outcome (spec §4.5
        // step 1: "retry budget is incremented but re-queue is
        // suppressed"); it is the re-queue, not the bump, that is skipped.
        assert_eq!(execution.retry_count, 1);
        assert!(store::list_pending_ids(&db, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_requeues_until_retry_budget_exhausted() {
        let db = db::test_sqlite("worker_retry_budget").await;
        let job_id = seed_job(&db, 1).await;
        let execution_id = seed_execution(&db, job_id).await;

        let handlers = HandlerRegistryBuilder::new()
            .register("always_fails", || AlwaysFails)
            .unwrap()
            .build();

        // cron_jobs.handler_name was seeded as "noop"; point the execution
        // row itself at the failing handler to drive the retry path.
        sqlx::query("UPDATE job_executions SET handler_name = 'always_fails' WHERE id = ?")
            .bind(execution_id)
            .execute(match &db {
                Database::Sqlite(pool) => pool,
                _ => unreachable!(),
            })
            .await
            .unwrap();

        assert!(store::claim_execution(&db, execution_id).await.unwrap());
        execute_claimed_inner(&db, &handlers, execution_id, 60).await.unwrap();

        // retry_count is now 1 <= max_retry (1), so it should have been
        // requeued to PENDING rather than left terminal.
        let execution = store::get_execution(&db, execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.retry_count, 1);

        assert!(store::claim_execution(&db, execution_id).await.unwrap());
        execute_claimed_inner(&db, &handlers, execution_id, 60).await.unwrap();

        // retry_count is now 2 > max_retry (1): stays terminal this time.
        let execution = store::get_execution(&db, execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.retry_count, 2);
        assert!(store::list_pending_ids(&db, 10).await.unwrap().is_empty());
    }

    struct AlwaysFails;

    #[async_trait::async_trait]
    impl crate::handler::Handler for AlwaysFails {
        async fn call(&self, _params: serde_json::Value) -> SchedulerResult<serde_json::Value> {
            Err(crate::error::SchedulerError::HandlerFailure("always fails".to_string()))
        }
    }

    struct SleepsForever;

    #[async_trait::async_trait]
    impl crate::handler::Handler for SleepsForever {
        async fn call(&self, _params: serde_json::Value) -> SchedulerResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::json!({}))
        }
    }

    /// The shutdown drain must abort survivors once `shutdown_timeout_seconds`
    /// elapses rather than just dropping their handles, or `run` would hang
    /// until a 60s handler finishes on its own.
    #[tokio::test]
    async fn shutdown_aborts_executions_past_the_budget() {
        let db = db::test_sqlite("worker_shutdown_abort").await;
        let job_id = store::create_cron_job(
            &db,
            &NewCronJob {
                name: "slow-job".to_string(),
                cron_expression: "* * * * *".to_string(),
                handler_name: "sleeps_forever".to_string(),
                handler_params: None,
                is_enabled: true,
                allow_overlap: true,
                max_retry: 0,
                timeout_seconds: 60,
                retain_for_days: None,
            },
        )
        .await
        .unwrap()
        .id;
        store::insert_cron_execution(&db, job_id, "sleeps_forever", Utc::now(), &serde_json::json!({}))
            .await
            .unwrap();

        let handlers = HandlerRegistryBuilder::new()
            .register("sleeps_forever", || SleepsForever)
            .unwrap()
            .build();

        let pool = WorkerPool::new(
            Registry::from_single("default", db.clone()),
            WorkerConfig {
                database: "default".to_string(),
                databases: vec![],
                pool_size: 4,
                poll_interval_seconds: 0,
                claim_batch_size: 4,
                shutdown_timeout_seconds: 0,
                default_event_timeout_seconds: 60,
            },
            handlers,
        );

        let shutdown = CancellationToken::new();
        let run_handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { pool.run(shutdown).await }
        });

        // Let the poll loop claim the execution and spawn the slow handler
        // before signalling shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), run_handle)
            .await
            .expect("worker pool did not honor its shutdown budget");
        assert!(result.unwrap().is_ok());
    }
}
