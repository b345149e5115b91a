//! Error kinds and their propagation policy (spec §7). Each variant names
//! where it is raised; the comment on each documents local recovery vs.
//! what is surfaced, matching the error-kind table.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Pool acquire timed out. Dispatchers/workers retry on the next tick.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Any SQL execution failure. Aborts the enclosing transaction.
    #[error("query execution error: {0}")]
    QueryExecutionError(#[source] sqlx::Error),

    /// Raised by the transaction coordinator; rollback occurs, then this
    /// propagates to the caller.
    #[error("transaction error: {0}")]
    TransactionError(String),

    /// A write was attempted against a read-only coordinator transaction.
    #[error("attempted write in a read-only transaction: {0}")]
    ReadOnlyViolation(String),

    /// Cron expression failed to parse. The offending job is skipped.
    #[error("cron expression '{expression}' is invalid: {reason}")]
    CronParseError { expression: String, reason: String },

    /// Cron expression fires more often than `min_cron_interval_seconds`.
    #[error(
        "cron expression '{expression}' has a minimum interval of {interval_seconds}s, below the configured minimum of {min_seconds}s"
    )]
    CronIntervalTooShort {
        expression: String,
        interval_seconds: i64,
        min_seconds: i64,
    },

    /// No handler registered under this name. Terminal, not retried.
    #[error("handler '{0}' not found")]
    HandlerNotFound(String),

    /// Handler exceeded its deadline.
    #[error("execution timed out")]
    HandlerTimeout,

    /// Handler raised during execution (including param deserialization).
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// Queue adapter failed to deliver/ack/abandon a message.
    #[error("queue adapter error: {0}")]
    QueueAdapterError(String),

    /// Two handler factories registered under the same name. Fatal at
    /// startup, never a per-item error.
    #[error("duplicate handler name: {0}")]
    DuplicateHandlerName(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::PoolTimedOut) {
            return SchedulerError::PoolExhausted(err.to_string());
        }

        if is_read_only_violation(&err) {
            return SchedulerError::ReadOnlyViolation(err.to_string());
        }

        SchedulerError::QueryExecutionError(err)
    }
}

/// SQLite's `query_only` pragma, Postgres's `SET TRANSACTION READ ONLY`,
/// and MySQL's equivalent all reject a write with a message mentioning
/// "read only"/"readonly" rather than a single shared error code.
fn is_read_only_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_lowercase();
            message.contains("readonly") || message.contains("read-only") || message.contains("read only")
        }
        _ => false,
    }
}

impl From<croner::errors::CronError> for SchedulerError {
    fn from(value: croner::errors::CronError) -> Self {
        SchedulerError::CronParseError {
            expression: String::new(),
            reason: value.to_string(),
        }
    }
}
