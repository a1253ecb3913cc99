use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::relay::RelayError;

pub mod ytmp3;

/// Seconds a rejected client is asked to wait before retrying.
const RETRY_AFTER_SECS: &str = "5";

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError(RelayError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            RelayError::InvalidLocator | RelayError::InvalidBitrate(_) => StatusCode::BAD_REQUEST,
            RelayError::AtCapacity => StatusCode::TOO_MANY_REQUESTS,
            RelayError::PipeStart(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Resolution(_) => StatusCode::BAD_GATEWAY,
            RelayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Transcode(_) | RelayError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("ApiError: {}", self.0);
        }
        let json = || {
            Json(ErrorBody {
                error: self.0.to_string(),
            })
        };
        match self.0 {
            RelayError::InvalidLocator | RelayError::InvalidBitrate(_) => {
                (status, json()).into_response()
            }
            RelayError::AtCapacity => {
                (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)], json()).into_response()
            }
            RelayError::PipeStart(_) => {
                (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)]).into_response()
            }
            _ => status.into_response(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}
