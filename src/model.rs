//! Row types shared by every component that touches `cron_jobs` or
//! `job_executions`. These are backend-agnostic: the `db` module is
//! responsible for mapping backend-native rows into these shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `job_executions.status`. Transitions are constrained to I2 in the data
/// model: PENDING -> RUNNING -> {SUCCESS, FAILED, TIMEOUT}, and
/// {FAILED, TIMEOUT} -> PENDING when a retry budget remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout)
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        Some(match value {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "SUCCESS" => Self::Success,
            "FAILED" => Self::Failed,
            "TIMEOUT" => Self::Timeout,
            _ => return None,
        })
    }
}

/// `job_executions.param_source` — provenance of the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamSource {
    Cron,
    Event,
}

impl ParamSource {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Event => "event",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        Some(match value {
            "cron" => Self::Cron,
            "event" => Self::Event,
            _ => return None,
        })
    }
}

/// A row of `cron_jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: i64,
    pub name: String,
    pub cron_expression: String,
    pub handler_name: String,
    pub handler_params: Option<Value>,
    pub is_enabled: bool,
    pub allow_overlap: bool,
    pub max_retry: i32,
    pub timeout_seconds: i32,
    /// Retention window for terminal executions owned by this job. `None`
    /// means no automatic sweep.
    pub retain_for_days: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row of `job_executions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_id: Option<i64>,
    pub handler_name: String,
    pub scheduled_time: DateTime<Utc>,
    pub params: Value,
    pub param_source: ParamSource,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a new cron_job, supplied by the admin surface.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCronJob {
    pub name: String,
    pub cron_expression: String,
    pub handler_name: String,
    pub handler_params: Option<Value>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub allow_overlap: bool,
    #[serde(default)]
    pub max_retry: i32,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub retain_for_days: Option<i32>,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> i32 {
    60
}

/// Patch applied by the admin surface to an existing cron_job. `None` means
/// "leave unchanged" for every field but `is_enabled`, which is handled by
/// the dedicated enable/disable endpoints instead.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CronJobPatch {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub handler_name: Option<String>,
    pub handler_params: Option<Option<Value>>,
    pub allow_overlap: Option<bool>,
    pub max_retry: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub retain_for_days: Option<Option<i32>>,
}
