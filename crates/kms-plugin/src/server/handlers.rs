//! Axum handlers for the local debug endpoint.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use common::protocol::VersionResponse;

use super::state::{PluginState, ServerPhase};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub phase: ServerPhase,
    pub key_resolved: bool,
    pub key_version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VersionBody {
    pub version: String,
    pub runtime_name: String,
    pub runtime_version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
}

/// `GET /health`: readiness of the plugin socket.
///
/// Returns `200 OK` while the gRPC server is serving and `503 Service
/// Unavailable` in every other phase. Key resolution is reported but does
/// not affect the status; the key is resolved lazily on the first request.
pub async fn health(State(state): State<PluginState>) -> Response {
    let phase = state.phase();
    let (code, status) = if phase == ServerPhase::Serving {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };

    let body = HealthResponse {
        status,
        phase,
        key_resolved: state.envelope.resolver().cached().is_some(),
        key_version: state.envelope.key_version().map(|v| v.to_string()),
    };
    (code, Json(body)).into_response()
}

/// `GET /version`: the identity reported by the gRPC `Version` call.
pub async fn version() -> Json<VersionBody> {
    let v = VersionResponse::current();
    Json(VersionBody {
        version: v.version,
        runtime_name: v.runtime_name,
        runtime_version: v.runtime_version,
    })
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorBody {
        error: "not_found",
        message: "the requested resource does not exist",
    };
    (StatusCode::NOT_FOUND, Json(err))
}
