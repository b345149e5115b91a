//! Domain queries against `cron_jobs` / `job_executions`, one match arm per
//! backend. This is where the "hard parts" named in spec §1 live: the
//! idempotent cron-execution insert (I1), the atomic claim CAS (I2), and
//! the retry bookkeeping (I3).

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::Row;

use super::Database;
use crate::{
    error::{SchedulerError, SchedulerResult},
    model::{CronJob, CronJobPatch, ExecutionStatus, JobExecution, NewCronJob, ParamSource},
};

fn parse_sqlite_ts(raw: &str) -> SchedulerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.fZ")
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
        .map_err(|err| SchedulerError::QueryExecutionError(sqlx::Error::Decode(Box::new(err))))
}

fn cron_job_from_sqlite(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<CronJob> {
    let handler_params: Option<String> = row.try_get("handler_params")?;
    Ok(CronJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cron_expression: row.try_get("cron_expression")?,
        handler_name: row.try_get("handler_name")?,
        handler_params: handler_params
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        is_enabled: row.try_get::<i64, _>("is_enabled")? != 0,
        allow_overlap: row.try_get::<i64, _>("allow_overlap")? != 0,
        max_retry: row.try_get("max_retry")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        retain_for_days: row.try_get("retain_for_days")?,
        created_at: parse_sqlite_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_sqlite_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn cron_job_from_postgres(row: &sqlx::postgres::PgRow) -> SchedulerResult<CronJob> {
    Ok(CronJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cron_expression: row.try_get("cron_expression")?,
        handler_name: row.try_get("handler_name")?,
        handler_params: row.try_get("handler_params")?,
        is_enabled: row.try_get("is_enabled")?,
        allow_overlap: row.try_get("allow_overlap")?,
        max_retry: row.try_get("max_retry")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        retain_for_days: row.try_get("retain_for_days")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cron_job_from_mysql(row: &sqlx::mysql::MySqlRow) -> SchedulerResult<CronJob> {
    let created_naive: chrono::NaiveDateTime = row.try_get("created_at")?;
    let updated_naive: chrono::NaiveDateTime = row.try_get("updated_at")?;
    Ok(CronJob {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cron_expression: row.try_get("cron_expression")?,
        handler_name: row.try_get("handler_name")?,
        handler_params: row.try_get("handler_params")?,
        is_enabled: row.try_get("is_enabled")?,
        allow_overlap: row.try_get("allow_overlap")?,
        max_retry: row.try_get("max_retry")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        retain_for_days: row.try_get("retain_for_days")?,
        created_at: Utc.from_utc_datetime(&created_naive),
        updated_at: Utc.from_utc_datetime(&updated_naive),
    })
}

fn execution_from_sqlite(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<JobExecution> {
    let params: String = row.try_get("params")?;
    let result: Option<String> = row.try_get("result")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    Ok(JobExecution {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        handler_name: row.try_get("handler_name")?,
        scheduled_time: parse_sqlite_ts(&row.try_get::<String, _>("scheduled_time")?)?,
        params: serde_json::from_str(&params)?,
        param_source: ParamSource::from_db_str(&row.try_get::<String, _>("param_source")?)
            .ok_or_else(|| SchedulerError::Config("invalid param_source".into()))?,
        status: ExecutionStatus::from_db_str(&row.try_get::<String, _>("status")?)
            .ok_or_else(|| SchedulerError::Config("invalid status".into()))?,
        started_at: started_at.map(|s| parse_sqlite_ts(&s)).transpose()?,
        finished_at: finished_at.map(|s| parse_sqlite_ts(&s)).transpose()?,
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
        result: result.map(|raw| serde_json::from_str(&raw)).transpose()?,
        created_at: parse_sqlite_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn execution_from_postgres(row: &sqlx::postgres::PgRow) -> SchedulerResult<JobExecution> {
    Ok(JobExecution {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        handler_name: row.try_get("handler_name")?,
        scheduled_time: row.try_get("scheduled_time")?,
        params: row.try_get("params")?,
        param_source: ParamSource::from_db_str(&row.try_get::<String, _>("param_source")?)
            .ok_or_else(|| SchedulerError::Config("invalid param_source".into()))?,
        status: ExecutionStatus::from_db_str(&row.try_get::<String, _>("status")?)
            .ok_or_else(|| SchedulerError::Config("invalid status".into()))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
        result: row.try_get("result")?,
        created_at: row.try_get("created_at")?,
    })
}

fn execution_from_mysql(row: &sqlx::mysql::MySqlRow) -> SchedulerResult<JobExecution> {
    let scheduled_naive: chrono::NaiveDateTime = row.try_get("scheduled_time")?;
    let started_naive: Option<chrono::NaiveDateTime> = row.try_get("started_at")?;
    let finished_naive: Option<chrono::NaiveDateTime> = row.try_get("finished_at")?;
    let created_naive: chrono::NaiveDateTime = row.try_get("created_at")?;
    Ok(JobExecution {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        handler_name: row.try_get("handler_name")?,
        scheduled_time: Utc.from_utc_datetime(&scheduled_naive),
        params: row.try_get("params")?,
        param_source: ParamSource::from_db_str(&row.try_get::<String, _>("param_source")?)
            .ok_or_else(|| SchedulerError::Config("invalid param_source".into()))?,
        status: ExecutionStatus::from_db_str(&row.try_get::<String, _>("status")?)
            .ok_or_else(|| SchedulerError::Config("invalid status".into()))?,
        started_at: started_naive.map(|n| Utc.from_utc_datetime(&n)),
        finished_at: finished_naive.map(|n| Utc.from_utc_datetime(&n)),
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
        result: row.try_get("result")?,
        created_at: Utc.from_utc_datetime(&created_naive),
    })
}

const CRON_JOB_COLUMNS: &str = "id, name, cron_expression, handler_name, handler_params, \
    is_enabled, allow_overlap, max_retry, timeout_seconds, retain_for_days, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, job_id, handler_name, scheduled_time, params, param_source, \
    status, started_at, finished_at, retry_count, error_message, result, created_at";

/// All enabled cron jobs (spec §4.3 step 1).
pub async fn list_enabled_cron_jobs(db: &Database) -> SchedulerResult<Vec<CronJob>> {
    match db {
        Database::Sqlite(pool) => {
            let rows = sqlx::query(&format!(
                "SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE is_enabled = 1"
            ))
            .fetch_all(pool)
            .await?;
            rows.iter().map(cron_job_from_sqlite).collect()
        }
        Database::Postgres(pool) => {
            let rows = sqlx::query(&format!(
                "SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE is_enabled = true"
            ))
            .fetch_all(pool)
            .await?;
            rows.iter().map(cron_job_from_postgres).collect()
        }
        Database::MySql(pool) => {
            let rows = sqlx::query(&format!(
                "SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE is_enabled = true"
            ))
            .fetch_all(pool)
            .await?;
            rows.iter().map(cron_job_from_mysql).collect()
        }
    }
}

/// The latest `scheduled_time` already materialized for a cron job, among
/// non-retry rows (spec §4.3 step 3 "seeded at that prior instant").
pub async fn latest_scheduled_time(
    db: &Database,
    job_id: i64,
) -> SchedulerResult<Option<DateTime<Utc>>> {
    match db {
        Database::Sqlite(pool) => {
            let row = sqlx::query(
                "SELECT MAX(scheduled_time) as max_time FROM job_executions WHERE job_id = ? AND param_source = 'cron'",
            )
            .bind(job_id)
            .fetch_one(pool)
            .await?;
            let raw: Option<String> = row.try_get("max_time")?;
            raw.map(|s| parse_sqlite_ts(&s)).transpose()
        }
        Database::Postgres(pool) => {
            let row = sqlx::query(
                "SELECT MAX(scheduled_time) as max_time FROM job_executions WHERE job_id = $1 AND param_source = 'cron'",
            )
            .bind(job_id)
            .fetch_one(pool)
            .await?;
            Ok(row.try_get("max_time")?)
        }
        Database::MySql(pool) => {
            let row = sqlx::query(
                "SELECT MAX(scheduled_time) as max_time FROM job_executions WHERE job_id = ? AND param_source = 'cron'",
            )
            .bind(job_id)
            .fetch_one(pool)
            .await?;
            let raw: Option<chrono::NaiveDateTime> = row.try_get("max_time")?;
            Ok(raw.map(|n| Utc.from_utc_datetime(&n)))
        }
    }
}

/// Whether a PENDING or RUNNING row already exists for this job (spec
/// §4.3 step 4a, the `allow_overlap = false` guard).
pub async fn has_open_execution(db: &Database, job_id: i64) -> SchedulerResult<bool> {
    match db {
        Database::Sqlite(pool) => {
            let row = sqlx::query(
                "SELECT EXISTS(SELECT 1 FROM job_executions WHERE job_id = ? AND status IN ('PENDING','RUNNING')) as found",
            )
            .bind(job_id)
            .fetch_one(pool)
            .await?;
            Ok(row.try_get::<i64, _>("found")? != 0)
        }
        Database::Postgres(pool) => {
            let row = sqlx::query(
                "SELECT EXISTS(SELECT 1 FROM job_executions WHERE job_id = $1 AND status IN ('PENDING','RUNNING')) as found",
            )
            .bind(job_id)
            .fetch_one(pool)
            .await?;
            Ok(row.try_get("found")?)
        }
        Database::MySql(pool) => {
            let row = sqlx::query(
                "SELECT EXISTS(SELECT 1 FROM job_executions WHERE job_id = ? AND status IN ('PENDING','RUNNING')) as found",
            )
            .bind(job_id)
            .fetch_one(pool)
            .await?;
            Ok(row.try_get::<i64, _>("found")? != 0)
        }
    }
}

/// Idempotent insert of one cron-provenance execution row (I1). Returns
/// `true` if a row was actually inserted, `false` if the unique
/// `(job_id, scheduled_time)` constraint silently absorbed a duplicate
/// from a racing dispatcher (spec §4.3 "Correctness under replicated
/// dispatchers").
pub async fn insert_cron_execution(
    db: &Database,
    job_id: i64,
    handler_name: &str,
    scheduled_time: DateTime<Utc>,
    params: &Value,
) -> SchedulerResult<bool> {
    let params_text = serde_json::to_string(params)?;

    let affected = match db {
        Database::Sqlite(pool) => {
            sqlx::query(
                "INSERT INTO job_executions (job_id, handler_name, scheduled_time, params, param_source, status) \
                 VALUES (?, ?, ?, ?, 'cron', 'PENDING') \
                 ON CONFLICT (job_id, scheduled_time) DO NOTHING",
            )
            .bind(job_id)
            .bind(handler_name)
            .bind(scheduled_time.to_rfc3339())
            .bind(params_text)
            .execute(pool)
            .await?
            .rows_affected()
        }
        Database::Postgres(pool) => {
            sqlx::query(
                "INSERT INTO job_executions (job_id, handler_name, scheduled_time, params, param_source, status) \
                 VALUES ($1, $2, $3, $4, 'cron', 'PENDING') \
                 ON CONFLICT (job_id, scheduled_time) DO NOTHING",
            )
            .bind(job_id)
            .bind(handler_name)
            .bind(scheduled_time)
            .bind(params)
            .execute(pool)
            .await?
            .rows_affected()
        }
        Database::MySql(pool) => {
            sqlx::query(
                "INSERT IGNORE INTO job_executions (job_id, handler_name, scheduled_time, params, param_source, status) \
                 VALUES (?, ?, ?, ?, 'cron', 'PENDING')",
            )
            .bind(job_id)
            .bind(handler_name)
            .bind(scheduled_time.naive_utc())
            .bind(params_text)
            .execute(pool)
            .await?
            .rows_affected()
        }
    };

    Ok(affected > 0)
}

/// Insert an event-provenance execution (spec §4.4 step 4). `job_id` may be
/// absent.
pub async fn insert_event_execution(
    db: &Database,
    job_id: Option<i64>,
    handler_name: &str,
    params: &Value,
) -> SchedulerResult<i64> {
    let now = Utc::now();
    let params_text = serde_json::to_string(params)?;

    match db {
        Database::Sqlite(pool) => {
            let result = sqlx::query(
                "INSERT INTO job_executions (job_id, handler_name, scheduled_time, params, param_source, status) \
                 VALUES (?, ?, ?, ?, 'event', 'PENDING')",
            )
            .bind(job_id)
            .bind(handler_name)
            .bind(now.to_rfc3339())
            .bind(params_text)
            .execute(pool)
            .await?;
            Ok(result.last_insert_rowid())
        }
        Database::Postgres(pool) => {
            let row = sqlx::query(
                "INSERT INTO job_executions (job_id, handler_name, scheduled_time, params, param_source, status) \
                 VALUES ($1, $2, $3, $4, 'event', 'PENDING') RETURNING id",
            )
            .bind(job_id)
            .bind(handler_name)
            .bind(now)
            .bind(params)
            .fetch_one(pool)
            .await?;
            Ok(row.try_get("id")?)
        }
        Database::MySql(pool) => {
            let result = sqlx::query(
                "INSERT INTO job_executions (job_id, handler_name, scheduled_time, params, param_source, status) \
                 VALUES (?, ?, ?, ?, 'event', 'PENDING')",
            )
            .bind(job_id)
            .bind(handler_name)
            .bind(now.naive_utc())
            .bind(params_text)
            .execute(pool)
            .await?;
            Ok(result.last_insert_id() as i64)
        }
    }
}

/// Up to `limit` PENDING rows ordered by `created_at` ascending (spec
/// §4.5 step 1).
pub async fn list_pending_ids(db: &Database, limit: i64) -> SchedulerResult<Vec<i64>> {
    match db {
        Database::Sqlite(pool) => {
            let rows = sqlx::query(
                "SELECT id FROM job_executions WHERE status = 'PENDING' ORDER BY created_at ASC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?;
            rows.iter().map(|r| r.try_get::<i64, _>("id")).collect::<Result<_, _>>().map_err(Into::into)
        }
        Database::Postgres(pool) => {
            let rows = sqlx::query(
                "SELECT id FROM job_executions WHERE status = 'PENDING' ORDER BY created_at ASC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?;
            rows.iter().map(|r| r.try_get::<i64, _>("id")).collect::<Result<_, _>>().map_err(Into::into)
        }
        Database::MySql(pool) => {
            let rows = sqlx::query(
                "SELECT id FROM job_executions WHERE status = 'PENDING' ORDER BY created_at ASC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?;
            rows.iter().map(|r| r.try_get::<i64, _>("id")).collect::<Result<_, _>>().map_err(Into::into)
        }
    }
}

/// Atomic PENDING -> RUNNING CAS (spec §4.5 step 2). Returns `true` iff
/// this caller won the race (exactly one row affected); `false` means
/// another worker claimed it first (C2).
pub async fn claim_execution(db: &Database, id: i64) -> SchedulerResult<bool> {
    let affected = match db {
        Database::Sqlite(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = 'RUNNING', started_at = ? WHERE id = ? AND status = 'PENDING'",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(pool)
            .await?
            .rows_affected()
        }
        Database::Postgres(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = 'RUNNING', started_at = $1 WHERE id = $2 AND status = 'PENDING'",
            )
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?
            .rows_affected()
        }
        Database::MySql(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = 'RUNNING', started_at = ? WHERE id = ? AND status = 'PENDING'",
            )
            .bind(Utc::now().naive_utc())
            .bind(id)
            .execute(pool)
            .await?
            .rows_affected()
        }
    };

    Ok(affected == 1)
}

pub async fn get_execution(db: &Database, id: i64) -> SchedulerResult<Option<JobExecution>> {
    match db {
        Database::Sqlite(pool) => {
            let row = sqlx::query(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE id = ?"
            ))
            .bind(id)
            .fetch_optional(pool)
            .await?;
            row.as_ref().map(execution_from_sqlite).transpose()
        }
        Database::Postgres(pool) => {
            let row = sqlx::query(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(pool)
            .await?;
            row.as_ref().map(execution_from_postgres).transpose()
        }
        Database::MySql(pool) => {
            let row = sqlx::query(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE id = ?"
            ))
            .bind(id)
            .fetch_optional(pool)
            .await?;
            row.as_ref().map(execution_from_mysql).transpose()
        }
    }
}

pub async fn get_cron_job(db: &Database, id: i64) -> SchedulerResult<Option<CronJob>> {
    match db {
        Database::Sqlite(pool) => {
            let row = sqlx::query(&format!("SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await?;
            row.as_ref().map(cron_job_from_sqlite).transpose()
        }
        Database::Postgres(pool) => {
            let row = sqlx::query(&format!("SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE id = $1"))
                .bind(id)
                .fetch_optional(pool)
                .await?;
            row.as_ref().map(cron_job_from_postgres).transpose()
        }
        Database::MySql(pool) => {
            let row = sqlx::query(&format!("SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE id = ?"))
                .bind(id)
                .fetch_optional(pool)
                .await?;
            row.as_ref().map(cron_job_from_mysql).transpose()
        }
    }
}

/// First enabled cron_job matching `handler_name` (spec §4.4 step 2,
/// fallback base-params lookup).
pub async fn find_enabled_cron_job_by_handler(
    db: &Database,
    handler_name: &str,
) -> SchedulerResult<Option<CronJob>> {
    match db {
        Database::Sqlite(pool) => {
            let row = sqlx::query(&format!(
                "SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE handler_name = ? AND is_enabled = 1 ORDER BY id ASC LIMIT 1"
            ))
            .bind(handler_name)
            .fetch_optional(pool)
            .await?;
            row.as_ref().map(cron_job_from_sqlite).transpose()
        }
        Database::Postgres(pool) => {
            let row = sqlx::query(&format!(
                "SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE handler_name = $1 AND is_enabled = true ORDER BY id ASC LIMIT 1"
            ))
            .bind(handler_name)
            .fetch_optional(pool)
            .await?;
            row.as_ref().map(cron_job_from_postgres).transpose()
        }
        Database::MySql(pool) => {
            let row = sqlx::query(&format!(
                "SELECT {CRON_JOB_COLUMNS} FROM cron_jobs WHERE handler_name = ? AND is_enabled = true ORDER BY id ASC LIMIT 1"
            ))
            .bind(handler_name)
            .fetch_optional(pool)
            .await?;
            row.as_ref().map(cron_job_from_mysql).transpose()
        }
    }
}

/// Record a terminal outcome and bump `retry_count` (spec §4.5 steps 4-6).
/// `result` is set only for SUCCESS; `error_message` only for
/// FAILED/TIMEOUT. Returns the row's retry_count after the update.
pub async fn record_outcome(
    db: &Database,
    id: i64,
    status: ExecutionStatus,
    error_message: Option<&str>,
    result: Option<&Value>,
) -> SchedulerResult<i32> {
    let now = Utc::now();
    let bump_retry = matches!(status, ExecutionStatus::Failed | ExecutionStatus::Timeout);
    let result_text = result.map(serde_json::to_string).transpose()?;

    match db {
        Database::Sqlite(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = ?, finished_at = ?, error_message = ?, result = ?, \
                 retry_count = retry_count + ? WHERE id = ?",
            )
            .bind(status.as_db_str())
            .bind(now.to_rfc3339())
            .bind(error_message)
            .bind(result_text)
            .bind(if bump_retry { 1 } else { 0 })
            .bind(id)
            .execute(pool)
            .await?;

            let row = sqlx::query("SELECT retry_count FROM job_executions WHERE id = ?")
                .bind(id)
                .fetch_one(pool)
                .await?;
            Ok(row.try_get("retry_count")?)
        }
        Database::Postgres(pool) => {
            let row = sqlx::query(
                "UPDATE job_executions SET status = $1, finished_at = $2, error_message = $3, result = $4, \
                 retry_count = retry_count + $5 WHERE id = $6 RETURNING retry_count",
            )
            .bind(status.as_db_str())
            .bind(now)
            .bind(error_message)
            .bind(result)
            .bind(if bump_retry { 1 } else { 0 })
            .bind(id)
            .fetch_one(pool)
            .await?;
            Ok(row.try_get("retry_count")?)
        }
        Database::MySql(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = ?, finished_at = ?, error_message = ?, result = ?, \
                 retry_count = retry_count + ? WHERE id = ?",
            )
            .bind(status.as_db_str())
            .bind(now.naive_utc())
            .bind(error_message)
            .bind(result_text)
            .bind(if bump_retry { 1 } else { 0 })
            .bind(id)
            .execute(pool)
            .await?;

            let row = sqlx::query("SELECT retry_count FROM job_executions WHERE id = ?")
                .bind(id)
                .fetch_one(pool)
                .await?;
            Ok(row.try_get("retry_count")?)
        }
    }
}

/// Requeue a terminally-failed row back to PENDING (spec §4.5 step 7 and
/// the admin retry action, §4.6b). Preserves `error_message` as history.
pub async fn requeue_pending(db: &Database, id: i64) -> SchedulerResult<()> {
    match db {
        Database::Sqlite(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = 'PENDING', started_at = NULL, finished_at = NULL WHERE id = ?",
            )
            .bind(id)
            .execute(pool)
            .await?;
        }
        Database::Postgres(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = 'PENDING', started_at = NULL, finished_at = NULL WHERE id = $1",
            )
            .bind(id)
            .execute(pool)
            .await?;
        }
        Database::MySql(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = 'PENDING', started_at = NULL, finished_at = NULL WHERE id = ?",
            )
            .bind(id)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

/// Admin retry action (spec §4.6b): only applies to FAILED/TIMEOUT rows,
/// clears `started_at`/`finished_at`/`error_message`/`result`.
pub async fn admin_retry(db: &Database, id: i64) -> SchedulerResult<bool> {
    let affected = match db {
        Database::Sqlite(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = 'PENDING', started_at = NULL, finished_at = NULL, \
                 error_message = NULL, result = NULL WHERE id = ? AND status IN ('FAILED','TIMEOUT')",
            )
            .bind(id)
            .execute(pool)
            .await?
            .rows_affected()
        }
        Database::Postgres(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = 'PENDING', started_at = NULL, finished_at = NULL, \
                 error_message = NULL, result = NULL WHERE id = $1 AND status IN ('FAILED','TIMEOUT')",
            )
            .bind(id)
            .execute(pool)
            .await?
            .rows_affected()
        }
        Database::MySql(pool) => {
            sqlx::query(
                "UPDATE job_executions SET status = 'PENDING', started_at = NULL, finished_at = NULL, \
                 error_message = NULL, result = NULL WHERE id = ? AND status IN ('FAILED','TIMEOUT')",
            )
            .bind(id)
            .execute(pool)
            .await?
            .rows_affected()
        }
    };
    Ok(affected == 1)
}

pub async fn set_enabled(db: &Database, id: i64, enabled: bool) -> SchedulerResult<bool> {
    let affected = match db {
        Database::Sqlite(pool) => {
            sqlx::query("UPDATE cron_jobs SET is_enabled = ?, updated_at = ? WHERE id = ?")
                .bind(enabled as i64)
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected()
        }
        Database::Postgres(pool) => {
            sqlx::query("UPDATE cron_jobs SET is_enabled = $1, updated_at = $2 WHERE id = $3")
                .bind(enabled)
                .bind(Utc::now())
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected()
        }
        Database::MySql(pool) => {
            sqlx::query("UPDATE cron_jobs SET is_enabled = ?, updated_at = ? WHERE id = ?")
                .bind(enabled)
                .bind(Utc::now().naive_utc())
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected()
        }
    };
    Ok(affected == 1)
}

pub async fn create_cron_job(db: &Database, new_job: &NewCronJob) -> SchedulerResult<CronJob> {
    let id = match db {
        Database::Sqlite(pool) => {
            let params_text = new_job
                .handler_params
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let result = sqlx::query(
                "INSERT INTO cron_jobs (name, cron_expression, handler_name, handler_params, \
                 is_enabled, allow_overlap, max_retry, timeout_seconds, retain_for_days) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&new_job.name)
            .bind(&new_job.cron_expression)
            .bind(&new_job.handler_name)
            .bind(params_text)
            .bind(new_job.is_enabled as i64)
            .bind(new_job.allow_overlap as i64)
            .bind(new_job.max_retry)
            .bind(new_job.timeout_seconds)
            .bind(new_job.retain_for_days)
            .execute(pool)
            .await?;
            result.last_insert_rowid()
        }
        Database::Postgres(pool) => {
            let row = sqlx::query(
                "INSERT INTO cron_jobs (name, cron_expression, handler_name, handler_params, \
                 is_enabled, allow_overlap, max_retry, timeout_seconds, retain_for_days) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
            )
            .bind(&new_job.name)
            .bind(&new_job.cron_expression)
            .bind(&new_job.handler_name)
            .bind(&new_job.handler_params)
            .bind(new_job.is_enabled)
            .bind(new_job.allow_overlap)
            .bind(new_job.max_retry)
            .bind(new_job.timeout_seconds)
            .bind(new_job.retain_for_days)
            .fetch_one(pool)
            .await?;
            row.try_get::<i64, _>("id")?
        }
        Database::MySql(pool) => {
            let params_text = new_job
                .handler_params
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let result = sqlx::query(
                "INSERT INTO cron_jobs (name, cron_expression, handler_name, handler_params, \
                 is_enabled, allow_overlap, max_retry, timeout_seconds, retain_for_days) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&new_job.name)
            .bind(&new_job.cron_expression)
            .bind(&new_job.handler_name)
            .bind(params_text)
            .bind(new_job.is_enabled)
            .bind(new_job.allow_overlap)
            .bind(new_job.max_retry)
            .bind(new_job.timeout_seconds)
            .bind(new_job.retain_for_days)
            .execute(pool)
            .await?;
            result.last_insert_id() as i64
        }
    };

    get_cron_job(db, id)
        .await?
        .ok_or_else(|| SchedulerError::Config("cron job vanished immediately after insert".into()))
}

pub async fn delete_cron_job(db: &Database, id: i64) -> SchedulerResult<bool> {
    let affected = match db {
        Database::Sqlite(pool) => {
            sqlx::query("DELETE FROM cron_jobs WHERE id = ?")
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected()
        }
        Database::Postgres(pool) => {
            sqlx::query("DELETE FROM cron_jobs WHERE id = $1")
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected()
        }
        Database::MySql(pool) => {
            sqlx::query("DELETE FROM cron_jobs WHERE id = ?")
                .bind(id)
                .execute(pool)
                .await?
                .rows_affected()
        }
    };
    Ok(affected == 1)
}

pub async fn list_cron_jobs(db: &Database) -> SchedulerResult<Vec<CronJob>> {
    match db {
        Database::Sqlite(pool) => {
            let rows = sqlx::query(&format!("SELECT {CRON_JOB_COLUMNS} FROM cron_jobs ORDER BY id ASC"))
                .fetch_all(pool)
                .await?;
            rows.iter().map(cron_job_from_sqlite).collect()
        }
        Database::Postgres(pool) => {
            let rows = sqlx::query(&format!("SELECT {CRON_JOB_COLUMNS} FROM cron_jobs ORDER BY id ASC"))
                .fetch_all(pool)
                .await?;
            rows.iter().map(cron_job_from_postgres).collect()
        }
        Database::MySql(pool) => {
            let rows = sqlx::query(&format!("SELECT {CRON_JOB_COLUMNS} FROM cron_jobs ORDER BY id ASC"))
                .fetch_all(pool)
                .await?;
            rows.iter().map(cron_job_from_mysql).collect()
        }
    }
}

pub async fn list_executions(
    db: &Database,
    job_id: Option<i64>,
    limit: i64,
) -> SchedulerResult<Vec<JobExecution>> {
    match db {
        Database::Sqlite(pool) => {
            let sql = format!(
                "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE (?1 IS NULL OR job_id = ?1) \
                 ORDER BY created_at DESC LIMIT ?2"
            );
            let rows = sqlx::query(&sql).bind(job_id).bind(limit).fetch_all(pool).await?;
            rows.iter().map(execution_from_sqlite).collect()
        }
        Database::Postgres(pool) => {
            let sql = format!(
                "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE ($1::bigint IS NULL OR job_id = $1) \
                 ORDER BY created_at DESC LIMIT $2"
            );
            let rows = sqlx::query(&sql).bind(job_id).bind(limit).fetch_all(pool).await?;
            rows.iter().map(execution_from_postgres).collect()
        }
        Database::MySql(pool) => {
            let sql = format!(
                "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE (? IS NULL OR job_id = ?) \
                 ORDER BY created_at DESC LIMIT ?"
            );
            let rows = sqlx::query(&sql)
                .bind(job_id)
                .bind(job_id)
                .bind(limit)
                .fetch_all(pool)
                .await?;
            rows.iter().map(execution_from_mysql).collect()
        }
    }
}

/// Patch mutable fields of a cron_job (spec §4.6a: all mutation happens
/// through the admin surface).
pub async fn update_cron_job(
    db: &Database,
    id: i64,
    patch: &CronJobPatch,
) -> SchedulerResult<Option<CronJob>> {
    let Some(existing) = get_cron_job(db, id).await? else {
        return Ok(None);
    };

    let name = patch.name.clone().unwrap_or(existing.name);
    let cron_expression = patch.cron_expression.clone().unwrap_or(existing.cron_expression);
    let handler_name = patch.handler_name.clone().unwrap_or(existing.handler_name);
    let handler_params = patch
        .handler_params
        .clone()
        .unwrap_or(existing.handler_params);
    let allow_overlap = patch.allow_overlap.unwrap_or(existing.allow_overlap);
    let max_retry = patch.max_retry.unwrap_or(existing.max_retry);
    let timeout_seconds = patch.timeout_seconds.unwrap_or(existing.timeout_seconds);
    let retain_for_days = patch.retain_for_days.clone().unwrap_or(existing.retain_for_days);

    match db {
        Database::Sqlite(pool) => {
            let params_text = handler_params.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                "UPDATE cron_jobs SET name = ?, cron_expression = ?, handler_name = ?, handler_params = ?, \
                 allow_overlap = ?, max_retry = ?, timeout_seconds = ?, retain_for_days = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(&name)
            .bind(&cron_expression)
            .bind(&handler_name)
            .bind(params_text)
            .bind(allow_overlap as i64)
            .bind(max_retry)
            .bind(timeout_seconds)
            .bind(retain_for_days)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(pool)
            .await?;
        }
        Database::Postgres(pool) => {
            sqlx::query(
                "UPDATE cron_jobs SET name = $1, cron_expression = $2, handler_name = $3, handler_params = $4, \
                 allow_overlap = $5, max_retry = $6, timeout_seconds = $7, retain_for_days = $8, updated_at = $9 \
                 WHERE id = $10",
            )
            .bind(&name)
            .bind(&cron_expression)
            .bind(&handler_name)
            .bind(&handler_params)
            .bind(allow_overlap)
            .bind(max_retry)
            .bind(timeout_seconds)
            .bind(retain_for_days)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        }
        Database::MySql(pool) => {
            let params_text = handler_params.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                "UPDATE cron_jobs SET name = ?, cron_expression = ?, handler_name = ?, handler_params = ?, \
                 allow_overlap = ?, max_retry = ?, timeout_seconds = ?, retain_for_days = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(&name)
            .bind(&cron_expression)
            .bind(&handler_name)
            .bind(params_text)
            .bind(allow_overlap)
            .bind(max_retry)
            .bind(timeout_seconds)
            .bind(retain_for_days)
            .bind(Utc::now().naive_utc())
            .bind(id)
            .execute(pool)
            .await?;
        }
    }

    get_cron_job(db, id).await
}

/// Retention sweep (added, §3 "Retention"): delete terminal executions
/// older than each job's `retain_for_days`. Returns the number deleted.
pub async fn sweep_expired_executions(db: &Database) -> SchedulerResult<u64> {
    match db {
        Database::Sqlite(pool) => {
            let result = sqlx::query(
                "DELETE FROM job_executions WHERE id IN ( \
                   SELECT exec.id FROM job_executions exec \
                   JOIN cron_jobs job ON job.id = exec.job_id \
                   WHERE job.retain_for_days IS NOT NULL \
                     AND exec.status IN ('SUCCESS','FAILED','TIMEOUT') \
                     AND exec.finished_at < datetime('now', '-' || job.retain_for_days || ' days') \
                   LIMIT 100)",
            )
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        }
        Database::Postgres(pool) => {
            let result = sqlx::query(
                "DELETE FROM job_executions WHERE id IN ( \
                   SELECT exec.id FROM job_executions exec \
                   JOIN cron_jobs job ON job.id = exec.job_id \
                   WHERE job.retain_for_days IS NOT NULL \
                     AND exec.status IN ('SUCCESS','FAILED','TIMEOUT') \
                     AND exec.finished_at < now() - (job.retain_for_days * interval '1 day') \
                   LIMIT 100)",
            )
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        }
        Database::MySql(pool) => {
            let result = sqlx::query(
                "DELETE exec FROM job_executions exec \
                   JOIN cron_jobs job ON job.id = exec.job_id \
                   WHERE job.retain_for_days IS NOT NULL \
                     AND exec.status IN ('SUCCESS','FAILED','TIMEOUT') \
                     AND exec.finished_at < DATE_SUB(NOW(), INTERVAL job.retain_for_days DAY) \
                   LIMIT 100",
            )
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_sqlite;
    use crate::model::NewCronJob;

    async fn seed_job(db: &Database, name: &str) -> CronJob {
        let new_job = NewCronJob {
            name: name.to_string(),
            cron_expression: "*/5 * * * *".to_string(),
            handler_name: "noop".to_string(),
            handler_params: None,
            is_enabled: true,
            allow_overlap: false,
            max_retry: 1,
            timeout_seconds: 30,
            retain_for_days: None,
        };
        create_cron_job(db, &new_job).await.unwrap()
    }

    #[tokio::test]
    async fn idempotent_insert_absorbs_duplicate() {
        let db = test_sqlite("idempotent_insert").await;
        let job = seed_job(&db, "every-five").await;
        let when = Utc::now();

        let first = insert_cron_execution(&db, job.id, &job.handler_name, when, &Value::Null)
            .await
            .unwrap();
        let second = insert_cron_execution(&db, job.id, &job.handler_name, when, &Value::Null)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);

        let executions = list_executions(&db, Some(job.id), 10).await.unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let db = test_sqlite("claim_is_exclusive").await;
        let job = seed_job(&db, "claimable").await;
        insert_cron_execution(&db, job.id, &job.handler_name, Utc::now(), &Value::Null)
            .await
            .unwrap();

        let ids = list_pending_ids(&db, 10).await.unwrap();
        assert_eq!(ids.len(), 1);
        let id = ids[0];

        assert!(claim_execution(&db, id).await.unwrap());
        // A second claim attempt on the now-RUNNING row loses the race.
        assert!(!claim_execution(&db, id).await.unwrap());
    }

    #[tokio::test]
    async fn retry_requeue_round_trip() {
        let db = test_sqlite("retry_requeue").await;
        let job = seed_job(&db, "retry-me").await;
        insert_cron_execution(&db, job.id, &job.handler_name, Utc::now(), &Value::Null)
            .await
            .unwrap();
        let id = list_pending_ids(&db, 10).await.unwrap()[0];
        claim_execution(&db, id).await.unwrap();

        let retry_count = record_outcome(&db, id, ExecutionStatus::Failed, Some("boom"), None)
            .await
            .unwrap();
        assert_eq!(retry_count, 1);

        requeue_pending(&db, id).await.unwrap();
        let execution = get_execution(&db, id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn admin_retry_rejects_non_terminal_rows() {
        let db = test_sqlite("admin_retry_guard").await;
        let job = seed_job(&db, "guarded").await;
        insert_cron_execution(&db, job.id, &job.handler_name, Utc::now(), &Value::Null)
            .await
            .unwrap();
        let id = list_pending_ids(&db, 10).await.unwrap()[0];

        assert!(!admin_retry(&db, id).await.unwrap());

        claim_execution(&db, id).await.unwrap();
        record_outcome(&db, id, ExecutionStatus::Failed, Some("x"), None)
            .await
            .unwrap();

        assert!(admin_retry(&db, id).await.unwrap());
        let execution = get_execution(&db, id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(execution.error_message.is_none());
    }

    /// C2: K tasks racing the same PENDING row's claim CAS; exactly one
    /// wins regardless of scheduling order.
    #[tokio::test]
    async fn concurrent_claims_are_exclusive() {
        let db = test_sqlite("concurrent_claims").await;
        let job = seed_job(&db, "raced").await;
        insert_cron_execution(&db, job.id, &job.handler_name, Utc::now(), &Value::Null)
            .await
            .unwrap();
        let id = list_pending_ids(&db, 10).await.unwrap()[0];

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let db = db.clone();
            set.spawn(async move { claim_execution(&db, id).await.unwrap() });
        }

        let wins = set
            .join_all()
            .await
            .into_iter()
            .filter(|&won| won)
            .count();

        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn update_cron_job_preserves_unpatched_fields() {
        let db = test_sqlite("patch_preserve").await;
        let job = seed_job(&db, "patchable").await;

        let patch = CronJobPatch {
            max_retry: Some(5),
            ..Default::default()
        };
        let updated = update_cron_job(&db, job.id, &patch).await.unwrap().unwrap();

        assert_eq!(updated.max_retry, 5);
        assert_eq!(updated.cron_expression, job.cron_expression);
        assert_eq!(updated.handler_name, job.handler_name);
    }
}
