//! Job event stream.
//!
//! NDJSON, one [`JobEventLine`] per line: retained history after `after`,
//! then the caught-up marker, then live events until the client goes away.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderValue},
    response::Response,
};
use bytes::Bytes;
use convoy_events::{JobEventLine, JobStreamItem};
use convoy_id::{AppId, SequenceId};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use super::parse_app_id;
use crate::api::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamEventsQuery {
    /// Deliver events with sequence ID greater than this. 0 replays all
    /// retained history.
    pub after: Option<u64>,
    pub app_id: Option<String>,
}

pub async fn stream_events(
    State(state): State<AppState>,
    query: Result<Query<StreamEventsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let app_id = query.app_id.as_deref().map(parse_app_id).transpose()?;
    subscribe(&state, query.after, app_id).await
}

pub async fn stream_app_events(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    query: Result<Query<StreamEventsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    let Query(query) = query?;
    subscribe(&state, query.after, Some(app_id)).await
}

async fn subscribe(
    state: &AppState,
    after: Option<u64>,
    app_id: Option<AppId>,
) -> Result<Response, ApiError> {
    let after = SequenceId::new(after.unwrap_or(0));
    let rx = state.scheduler().subscribe(after, app_id).await?;
    debug!(after = %after, "Event stream opened");

    let stream = ReceiverStream::new(rx).filter_map(|item| async move {
        match encode_line(&item) {
            Ok(line) => Some(Ok::<Bytes, Infallible>(line)),
            Err(e) => {
                error!(error = %e, "Failed to serialize event stream line");
                None
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    Ok(response)
}

fn encode_line(item: &JobStreamItem) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_string(&JobEventLine::from(item))?;
    Ok(Bytes::from(format!("{data}\n")))
}
