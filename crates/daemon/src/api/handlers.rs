/// API request handlers
use super::responses::*;
use crate::runtime::CoreHandle;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub core: CoreHandle,
}

/// Handler for GET /api/channels
pub async fn list_channels(
    State(state): State<AppState>,
) -> Result<Json<ChannelsResponse>, ApiError> {
    debug!("API: GET /api/channels");

    let channels: Vec<ChannelEntry> = state
        .core
        .list_channels()
        .await
        .into_iter()
        .map(|c| ChannelEntry {
            index: c.index,
            peer_addr: c.peer_addr,
            peer_identity: c.peer_identity,
            link_version: c.link_version,
            direction: c.direction.to_string(),
            open: c.open,
            n_circuits: c.n_circuits,
            cells_in: c.cells_in,
            cells_out: c.cells_out,
            padding_out: c.padding_out,
        })
        .collect();

    let total = channels.len();
    Ok(Json(ChannelsResponse { channels, total }))
}

/// Handler for GET /api/circuits
pub async fn list_circuits(
    State(state): State<AppState>,
) -> Result<Json<CircuitsResponse>, ApiError> {
    debug!("API: GET /api/circuits");

    let circuits: Vec<CircuitEntry> = state
        .core
        .list_circuits()
        .await
        .into_iter()
        .map(|c| CircuitEntry {
            kind: c.kind.to_string(),
            global_id: c.global_id,
            state: c.state,
            n_hops: c.n_hops,
            n_streams: c.n_streams,
            queued_bytes: c.queued_bytes,
        })
        .collect();

    let total = circuits.len();
    Ok(Json(CircuitsResponse { circuits, total }))
}

/// Handler for POST /api/circuits/:id/close
pub async fn close_circuit(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<CloseCircuitResponse>, ApiError> {
    debug!("API: POST /api/circuits/{}/close", id);

    let closed = state.core.close_circuit(id).await;
    if !closed {
        return Err(ApiError::NotFound(format!("no circuit {}", id)));
    }
    Ok(Json(CloseCircuitResponse { closed }))
}

/// Handler for GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    debug!("API: GET /api/status");

    let status = state
        .core
        .status()
        .await
        .ok_or_else(|| ApiError::Internal("core unavailable".to_string()))?;

    Ok(Json(StatusResponse {
        identity: status.identity,
        channels: status.channels,
        circuits: status.circuits,
        bug_count: status.bug_count,
    }))
}

/// Handler for GET /health: liveness only, no core round-trip
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

/// Failures the API maps onto a status code plus a JSON body.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::NotFound(error) => (StatusCode::NOT_FOUND, error),
            Self::Internal(error) => (StatusCode::INTERNAL_SERVER_ERROR, error),
        };
        warn!(%error, code = status.as_u16(), "operator API request failed");
        let body = ErrorResponse {
            error,
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
