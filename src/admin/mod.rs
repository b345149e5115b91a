//! Admin Surface (spec §4.6, boundary-only): the one place `cron_jobs`
//! mutation happens, plus a retry action and observation of
//! `job_executions`. Deliberately thin; it places no contract on the core
//! beyond what's listed in §4.6.

use axum::{
    extract::{FromRequest, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    db::{store, Database},
    model::{CronJob, CronJobPatch, JobExecution, NewCronJob},
};

#[derive(Clone)]
pub struct AdminState {
    db: Database,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<crate::error::SchedulerError> for ApiError {
    fn from(value: crate::error::SchedulerError) -> Self {
        ApiError::internal(value.to_string())
    }
}

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct JsonBody<T>(pub T);

impl From<axum::extract::rejection::JsonRejection> for ApiError {
    fn from(value: axum::extract::rejection::JsonRejection) -> Self {
        ApiError::bad_request(value.body_text())
    }
}

pub fn router(db: Database) -> Router {
    let state = AdminState { db };

    Router::new()
        .route("/cron-jobs", post(create_cron_job).get(list_cron_jobs))
        .route(
            "/cron-jobs/{id}",
            get(get_cron_job).put(update_cron_job).delete(delete_cron_job),
        )
        .route("/cron-jobs/{id}/enable", post(enable_cron_job))
        .route("/cron-jobs/{id}/disable", post(disable_cron_job))
        .route("/job-executions", get(list_executions))
        .route("/job-executions/{id}/retry", post(retry_execution))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn create_cron_job(
    State(state): State<AdminState>,
    JsonBody(new_job): JsonBody<NewCronJob>,
) -> Result<Json<CronJob>, ApiError> {
    if crate::cron_expr::CronSchedule::parse(&new_job.cron_expression).is_err() {
        return Err(ApiError::bad_request(format!(
            "'{}' is not a valid cron expression",
            new_job.cron_expression
        )));
    }

    let job = store::create_cron_job(&state.db, &new_job).await?;
    Ok(Json(job))
}

async fn list_cron_jobs(State(state): State<AdminState>) -> Result<Json<Vec<CronJob>>, ApiError> {
    Ok(Json(store::list_cron_jobs(&state.db).await?))
}

async fn get_cron_job(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<Json<CronJob>, ApiError> {
    store::get_cron_job(&state.db, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("cron job {id} not found")))
}

async fn update_cron_job(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    JsonBody(patch): JsonBody<CronJobPatch>,
) -> Result<Json<CronJob>, ApiError> {
    if let Some(expression) = &patch.cron_expression {
        if crate::cron_expr::CronSchedule::parse(expression).is_err() {
            return Err(ApiError::bad_request(format!(
                "'{expression}' is not a valid cron expression"
            )));
        }
    }

    store::update_cron_job(&state.db, id, &patch)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("cron job {id} not found")))
}

async fn delete_cron_job(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if store::delete_cron_job(&state.db, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("cron job {id} not found")))
    }
}

async fn enable_cron_job(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    set_enabled(&state, id, true).await
}

async fn disable_cron_job(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    set_enabled(&state, id, false).await
}

async fn set_enabled(state: &AdminState, id: i64, enabled: bool) -> Result<StatusCode, ApiError> {
    if store::set_enabled(&state.db, id, enabled).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("cron job {id} not found")))
    }
}

#[derive(Debug, Deserialize)]
struct ExecutionListQuery {
    job_id: Option<i64>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_executions(
    State(state): State<AdminState>,
    Query(query): Query<ExecutionListQuery>,
) -> Result<Json<Vec<JobExecution>>, ApiError> {
    let executions = store::list_executions(&state.db, query.job_id, query.limit).await?;
    Ok(Json(executions))
}

async fn retry_execution(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if store::admin_retry(&state.db, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "execution {id} not found, or not in a retryable state"
        )))
    }
}
