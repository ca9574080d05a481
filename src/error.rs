use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::persist::lnurl::LnurlStoreError;
use crate::persist::nwc::NwcStoreError;

/// Error surface of the registration endpoints. Bridge endpoints that must
/// keep the LNURL wire shape respond with `200` status envelopes instead and
/// never go through this type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Malformed(String),
    #[error("invalid signature")]
    Unauthorized,
    #[error("username taken")]
    UsernameConflict,
    #[error("not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Malformed(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::UsernameConflict => StatusCode::CONFLICT,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            ApiError::Internal(e) => {
                error!("internal server error: {e:#}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (self.status_code(), body).into_response()
    }
}

impl From<LnurlStoreError> for ApiError {
    fn from(err: LnurlStoreError) -> Self {
        match err {
            LnurlStoreError::UsernameConflict => ApiError::UsernameConflict,
            LnurlStoreError::General(e) => ApiError::Internal(e),
        }
    }
}

impl From<NwcStoreError> for ApiError {
    fn from(err: NwcStoreError) -> Self {
        match err {
            NwcStoreError::RelayLimitExceeded => {
                ApiError::Malformed("too many relays".to_string())
            }
            NwcStoreError::General(e) => ApiError::Internal(e),
        }
    }
}
