use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::{
    handler::ApiResult,
    relay::{RelayController, RelayError, RelayRequest, RelayStatus},
};

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayController>,
}

pub fn ytmp3_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(convert))
        .route("/status", get(status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConvertQuery {
    url: Option<String>,
    bitrate: Option<String>,
}

fn parse_bitrate(raw: Option<String>) -> Result<Option<u32>, RelayError> {
    match raw {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RelayError::InvalidBitrate(raw)),
    }
}

async fn convert(
    State(state): State<AppState>,
    Query(query): Query<ConvertQuery>,
) -> ApiResult<Response> {
    let locator = query.url.ok_or(RelayError::InvalidLocator)?;
    let bitrate_kbps = parse_bitrate(query.bitrate)?;

    let stream = state
        .relay
        .start(RelayRequest {
            locator,
            bitrate_kbps,
        })
        .await?;
    log::debug!("Job {}: headers committed", stream.job_id);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, stream.format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"audio.{}\"", stream.format.extension()),
            ),
        ],
        Body::from_stream(stream.body),
    )
        .into_response())
}

async fn status(State(state): State<AppState>) -> Json<RelayStatus> {
    Json(state.relay.status())
}

#[cfg(test)]
#[path = "ytmp3_test.rs"]
mod ytmp3_test;
