//! HTTP mapping of [`AppError`].
//!
//! Every handler returns `Result<_, AppError>`; this impl renders the
//! error envelope `{"error": "<msg>"}` with extra fields for pipe
//! conflicts (`current_version`, `current_updated_at`) and upstream
//! registry failures (`upstream_status`, `detail`).

use crate::error::AppError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) | AppError::AuthGate(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            AppError::Canceled(_)
            | AppError::Io(_)
            | AppError::Parse(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({ "error": self.to_string() });
        match &self {
            AppError::Conflict {
                current_version,
                current_updated_at,
                ..
            } => {
                if let Some(version) = current_version {
                    body["current_version"] = json!(version);
                }
                if let Some(updated_at) = current_updated_at {
                    body["current_updated_at"] = json!(updated_at);
                }
            }
            AppError::Upstream {
                status: upstream,
                detail,
                ..
            } => {
                if let Some(upstream) = upstream {
                    body["upstream_status"] = json!(upstream);
                }
                if let Some(detail) = detail {
                    body["detail"] = json!(detail);
                }
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
