//! Formation endpoints.

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use convoy_events::Formation;
use tracing::info;

use crate::api::error::ApiError;
use crate::scheduler::{FormationReceipt, FormationView};
use crate::state::AppState;

/// Create or replace a formation. Process types that fail validation are
/// listed under `rejected`; the others are reconciled.
pub async fn put_formation(
    State(state): State<AppState>,
    payload: Result<Json<Formation>, JsonRejection>,
) -> Result<Json<FormationReceipt>, ApiError> {
    let Json(formation) = payload?;
    info!(
        app_id = %formation.app_id,
        release_id = %formation.release_id,
        "Formation received"
    );
    let receipt = state.scheduler().put_formation(formation).await?;
    Ok(Json(receipt))
}

pub async fn list_formations(
    State(state): State<AppState>,
) -> Result<Json<Vec<FormationView>>, ApiError> {
    Ok(Json(state.scheduler().list_formations().await?))
}
