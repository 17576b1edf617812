//! HTTP transport
//!
//! A thin axum layer over the engine's operations: no logic of its own,
//! just extraction, delegation, and the `{code, message}` error shape.

pub mod routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::EngineError;

/// Wire shape for every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<String>,
}

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let e = self.0;
        let status = match &e {
            EngineError::Validation(_) | EngineError::CycleDetected(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::StrategyLocked { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::VersionConflict { .. }
            | EngineError::UpstreamOnlyActivation(_) => StatusCode::CONFLICT,
            EngineError::VerificationRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::DataUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::GatewayTimeout(_)
            | EngineError::GatewayRejected(_)
            | EngineError::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
            EngineError::Integrity(_) | EngineError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let lock_until = match &e {
            EngineError::StrategyLocked { lock_until, .. } => Some(lock_until.to_rfc3339()),
            _ => None,
        };
        let body = ErrorBody {
            code: e.code(),
            message: e.to_string(),
            lock_until,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn locking_errors_map_to_conflict() {
        let resp = ApiError(EngineError::StrategyLocked {
            strategy_id: "s-1".into(),
            lock_until: Utc::now(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_maps_to_422() {
        let resp = ApiError(EngineError::Validation("bad".into())).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
