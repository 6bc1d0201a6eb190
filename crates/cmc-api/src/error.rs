//! ---
//! cmc_section: "05-networking-external-interfaces"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "HTTP error mapping for coordinator failures."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cmc_core::CoreError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// JSON body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_owned(),
                message: message.into(),
                retryable: false,
            },
        }
    }

    pub fn unauthorised() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorised", "missing API key")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", "API key is not permitted")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let (status, kind) = match &err {
            CoreError::NotReady(_) => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
            CoreError::AlreadyInitialized => (StatusCode::CONFLICT, "already_initialized"),
            CoreError::InvalidManifest(_) => (StatusCode::BAD_REQUEST, "invalid_manifest"),
            CoreError::ActivationDenied(reason) => (StatusCode::FORBIDDEN, reason.kind()),
            CoreError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            CoreError::StaleReplica(_) => (StatusCode::SERVICE_UNAVAILABLE, "stale_replica"),
            CoreError::Storage(_) => (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable"),
            CoreError::AttestationUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "attestation_unavailable")
            }
            CoreError::TamperedOrWrongKey
            | CoreError::Seal(_)
            | CoreError::UnsupportedStateFormat { .. }
            | CoreError::CorruptState(_)
            | CoreError::Certificate(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed with internal error");
        }
        let mut api = ApiError::new(status, kind, err.to_string());
        api.body.retryable = err.is_retryable();
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
