//! Cron Dispatcher (spec §4.3): for each enabled cron_job, materializes at
//! most one `job_executions` row per scheduled instant that is `<= now`.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::{
    config::DispatcherConfig,
    cron_expr::{exceeds_interval_floor, CronSchedule},
    db::{store, Registry},
    error::SchedulerResult,
    model::CronJob,
};

pub struct Dispatcher {
    registry: Registry,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(registry: Registry, config: DispatcherConfig) -> Self {
        Self { registry, config }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> SchedulerResult<()> {
        let db = self.registry.get(&self.config.database)?;

        loop {
            let next_sleep = self.tick(db).await?;

            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("dispatcher shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(next_sleep) => {}
            }
        }
    }

    /// Runs one full tick across every enabled job and returns how long to
    /// sleep before the next one (spec §4.3 step 5).
    async fn tick(&self, db: &crate::db::Database) -> SchedulerResult<Duration> {
        let jobs = match store::list_enabled_cron_jobs(db).await {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::warn!(%err, "failed to load enabled cron jobs, backing off");
                return Ok(Duration::from_secs(self.config.max_sleep_seconds));
            }
        };

        let floor = TimeDelta::seconds(self.config.min_cron_interval_seconds);
        let mut earliest_next: Option<chrono::DateTime<Utc>> = None;

        for job in &jobs {
            match self.dispatch_one(db, job, floor).await {
                Ok(next) => {
                    earliest_next = match (earliest_next, next) {
                        (None, n) => n,
                        (Some(e), Some(n)) => Some(e.min(n)),
                        (Some(e), None) => Some(e),
                    };
                }
                Err(err) => {
                    tracing::error!(job_id = job.id, job = %job.name, %err, "skipping cron job this tick");
                }
            }
        }

        match store::sweep_expired_executions(db).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "swept expired executions past retention"),
            Err(err) => tracing::warn!(%err, "retention sweep failed"),
        }

        let now = Utc::now();
        let sleep_for = earliest_next
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::from_secs(self.config.poll_interval_seconds));

        Ok(sleep_for.min(Duration::from_secs(self.config.max_sleep_seconds)))
    }

    /// Materializes every due instant for one job and returns its next
    /// upcoming firing (used to size the dispatcher's sleep).
    async fn dispatch_one(
        &self,
        db: &crate::db::Database,
        job: &CronJob,
        floor: TimeDelta,
    ) -> SchedulerResult<Option<chrono::DateTime<Utc>>> {
        let schedule = CronSchedule::parse(&job.cron_expression)?;

        let now = Utc::now();
        let interval = schedule.min_interval_seconds(now);
        if exceeds_interval_floor(interval, floor) {
            return Err(crate::error::SchedulerError::CronIntervalTooShort {
                expression: job.cron_expression.clone(),
                interval_seconds: interval,
                min_seconds: floor.num_seconds(),
            });
        }

        let seed = store::latest_scheduled_time(db, job.id)
            .await?
            .unwrap_or(job.created_at);

        let mut cursor = schedule.next_after(seed);

        while let Some(instant) = cursor {
            if instant > now {
                break;
            }

            if !job.allow_overlap && store::has_open_execution(db, job.id).await? {
                break;
            }

            let params = job.handler_params.clone().unwrap_or(serde_json::json!({}));
            store::insert_cron_execution(db, job.id, &job.handler_name, instant, &params).await?;

            cursor = schedule.next_after(instant);
        }

        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, model::NewCronJob};

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            database: "default".to_string(),
            poll_interval_seconds: 30,
            max_sleep_seconds: 60,
            min_cron_interval_seconds: 60,
        }
    }

    async fn seed_job(db: &crate::db::Database, allow_overlap: bool) -> i64 {
        store::create_cron_job(
            db,
            &NewCronJob {
                name: "dispatch-job".to_string(),
                cron_expression: "* * * * *".to_string(),
                handler_name: "noop".to_string(),
                handler_params: None,
                is_enabled: true,
                allow_overlap,
                max_retry: 0,
                timeout_seconds: 10,
                retain_for_days: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn overlap_guard_blocks_further_dispatch() {
        let db = db::test_sqlite("dispatch_overlap").await;
        let job_id = seed_job(&db, false).await;
        let job = store::get_cron_job(&db, job_id).await.unwrap().unwrap();

        let dispatcher = Dispatcher::new(Registry::from_single("default", db.clone()), config());
        let floor = TimeDelta::seconds(0);

        dispatcher.dispatch_one(&db, &job, floor).await.unwrap();
        assert!(store::has_open_execution(&db, job_id).await.unwrap());

        // A second tick must not create another execution while the first
        // is still open (allow_overlap = false).
        dispatcher.dispatch_one(&db, &job, floor).await.unwrap();
        let executions = store::list_executions(&db, Some(job_id), 10).await.unwrap();
        assert_eq!(executions.len(), 1);
    }

    /// C1: K dispatcher instances racing the same tick on the same job
    /// converge on exactly one inserted row for a given scheduled instant.
    #[tokio::test]
    async fn concurrent_dispatchers_insert_exactly_once() {
        let db = db::test_sqlite("dispatch_concurrent").await;
        let job_id = seed_job(&db, true).await;
        let job = store::get_cron_job(&db, job_id).await.unwrap().unwrap();
        let floor = TimeDelta::seconds(0);

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let db = db.clone();
            let job = job.clone();
            let dispatcher = Dispatcher::new(Registry::from_single("default", db.clone()), config());
            set.spawn(async move { dispatcher.dispatch_one(&db, &job, floor).await.unwrap() });
        }
        set.join_all().await;

        let executions = store::list_executions(&db, Some(job_id), 100).await.unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn too_frequent_expression_is_rejected() {
        let db = db::test_sqlite("dispatch_floor").await;
        let job_id = store::create_cron_job(
            &db,
            &NewCronJob {
                name: "too-fast".to_string(),
                cron_expression: "* * * * *".to_string(),
                handler_name: "noop".to_string(),
                handler_params: None,
                is_enabled: true,
                allow_overlap: true,
                max_retry: 0,
                timeout_seconds: 10,
                retain_for_days: None,
            },
        )
        .await
        .unwrap()
        .id;
        let job = store::get_cron_job(&db, job_id).await.unwrap().unwrap();

        let dispatcher = Dispatcher::new(Registry::from_single("default", db.clone()), config());
        let floor = TimeDelta::seconds(3600);

        let err = dispatcher.dispatch_one(&db, &job, floor).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::SchedulerError::CronIntervalTooShort { .. }
        ));
    }

    /// S1 happy path: a dispatcher tick materializes the due instant, then
    /// a worker claim-and-run cycle drives it to SUCCESS with the handler's
    /// echoed params as `result` (R1 + R2 combined).
    #[tokio::test]
    async fn dispatch_then_execute_reaches_success() {
        use crate::{handler::HandlerRegistryBuilder, handlers::NoopHandler, model::ExecutionStatus};

        let db = db::test_sqlite("dispatch_then_execute").await;
        let job_id = store::create_cron_job(
            &db,
            &NewCronJob {
                name: "echo-job".to_string(),
                cron_expression: "* * * * *".to_string(),
                handler_name: "noop".to_string(),
                handler_params: Some(serde_json::json!({"x": 1})),
                is_enabled: true,
                allow_overlap: true,
                max_retry: 0,
                timeout_seconds: 10,
                retain_for_days: None,
            },
        )
        .await
        .unwrap()
        .id;
        let job = store::get_cron_job(&db, job_id).await.unwrap().unwrap();

        let dispatcher = Dispatcher::new(Registry::from_single("default", db.clone()), config());
        dispatcher
            .dispatch_one(&db, &job, TimeDelta::seconds(0))
            .await
            .unwrap();

        let pending = store::list_pending_ids(&db, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let execution_id = pending[0];

        assert!(store::claim_execution(&db, execution_id).await.unwrap());

        let handlers = HandlerRegistryBuilder::new()
            .register("noop", || NoopHandler)
            .unwrap()
            .build();
        crate::worker::execute_claimed_inner(&db, &handlers, execution_id, 60)
            .await
            .unwrap();

        let execution = store::get_execution(&db, execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.result, Some(serde_json::json!({"x": 1})));
    }
}
