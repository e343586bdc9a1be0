//! HTTP-facing error taxonomy.
//!
//! Every handler and every state transition reports failure as an
//! [`ApiError`], which renders as
//!
//! ```json
//! { "error": { "code": "forbidden", "message": "insert is only allowed on the leader" } }
//! ```
//!
//! | Variant | Status | Code |
//! |---------|--------|------|
//! | `BadRequest` | 400 | `bad_request` |
//! | `Forbidden` | 403 | `forbidden` |
//! | `Unprocessable` | 422 | `unprocessable` |
//! | `Engine` | 500 | `engine_error` |
//! | `Checkpoint` | 500 | `checkpoint_error` |
//! | `NotConfigured` | 503 | `not_configured` |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("checkpointing is not configured on this node")]
    NotConfigured,

    #[error("{op} failed: {err:#}")]
    Engine { op: &'static str, err: anyhow::Error },

    #[error("checkpoint failed: {0:#}")]
    Checkpoint(anyhow::Error),
}

impl ApiError {
    /// Adapter for `map_err` on engine calls.
    pub fn engine(op: &'static str) -> impl FnOnce(anyhow::Error) -> ApiError {
        move |err| ApiError::Engine { op, err }
    }

    pub fn leader_only(op: &str) -> ApiError {
        ApiError::Forbidden(format!("{} is only allowed on the leader", op))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Engine { .. } | ApiError::Checkpoint(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unprocessable(_) => "unprocessable",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotConfigured => "not_configured",
            ApiError::Engine { .. } => "engine_error",
            ApiError::Checkpoint(_) => "checkpoint_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %message, "request failed");
        } else {
            tracing::warn!(code = self.code(), error = %message, "request rejected");
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Unprocessable("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ApiError::leader_only("insert").status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotConfigured.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ApiError::Checkpoint(anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_engine_message_includes_cause_chain() {
        let err = anyhow!("disk full").context("saving index");
        let api = ApiError::engine("insert")(err);
        assert_eq!(api.code(), "engine_error");
        assert_eq!(api.to_string(), "insert failed: saving index: disk full");
    }
}
