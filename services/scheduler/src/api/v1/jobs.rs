//! Job endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use convoy_id::JobId;

use super::parse_app_id;
use crate::api::error::ApiError;
use crate::scheduler::RunJobRequest;
use crate::state::AppState;
use crate::store::JobView;

/// Run a one-off job.
pub async fn run_job(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    payload: Result<Json<RunJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
    let app_id = parse_app_id(&app_id)?;
    let Json(request) = payload?;
    let job = state.scheduler().run_job(app_id, request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    Ok(Json(state.scheduler().list_jobs(Some(app_id)).await?))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path((app_id, job_id)): Path<(String, String)>,
) -> Result<Json<JobView>, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    let job_id: JobId = job_id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid_job_id", "Invalid job ID format"))?;

    let job = state.scheduler().get_job(job_id).await?;
    if job.app_id != app_id {
        return Err(ApiError::not_found(
            "job_not_found",
            format!("job {job_id} not found"),
        ));
    }
    Ok(Json(job))
}
