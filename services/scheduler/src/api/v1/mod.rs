//! API v1 routes.

mod events;
mod formations;
mod hosts;
mod jobs;

use axum::{
    routing::{get, post, put},
    Router,
};
use convoy_id::AppId;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        // Controller feed
        .route(
            "/formations",
            put(formations::put_formation).get(formations::list_formations),
        )
        // Jobs are scoped to apps: /v1/apps/{app_id}/jobs
        .route(
            "/apps/{app_id}/jobs",
            post(jobs::run_job).get(jobs::list_jobs),
        )
        .route("/apps/{app_id}/jobs/{job_id}", get(jobs::get_job))
        .route("/apps/{app_id}/events", get(events::stream_app_events))
        .route("/events", get(events::stream_events))
        // Host agent feed
        .route("/hosts", get(hosts::list_hosts))
        .route("/hosts/{host_id}/reports", post(hosts::report))
        .route("/hosts/{host_id}/jobs", put(hosts::sync))
}

fn parse_app_id(app_id: &str) -> Result<AppId, ApiError> {
    app_id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid_app_id", "Invalid app ID format"))
}
