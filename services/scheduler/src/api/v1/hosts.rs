//! Host agent feed and host listing.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use convoy_events::{AgentJobStatus, AgentReport};
use convoy_id::HostId;

use crate::api::error::ApiError;
use crate::hosts::Host;
use crate::state::AppState;

fn parse_host_id(host_id: &str) -> Result<HostId, ApiError> {
    HostId::parse(host_id).map_err(|e| ApiError::bad_request("invalid_host_id", e.to_string()))
}

/// Accept a lifecycle report from a host agent.
pub async fn report(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    payload: Result<Json<AgentReport>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let host_id = parse_host_id(&host_id)?;
    let Json(report) = payload?;
    state.scheduler().report(host_id, report).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Accept a host agent's full job listing after it reconnects.
pub async fn sync(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    payload: Result<Json<Vec<AgentJobStatus>>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let host_id = parse_host_id(&host_id)?;
    let Json(jobs) = payload?;
    state.scheduler().sync(host_id, jobs).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Active hosts.
pub async fn list_hosts(State(state): State<AppState>) -> Result<Json<Vec<Host>>, ApiError> {
    let hosts = state.scheduler().list_hosts().await?;
    Ok(Json(hosts.into_iter().filter(|h| h.active).collect()))
}
