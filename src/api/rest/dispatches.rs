use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde_json::json;

use crate::error::AppError;
use crate::messaging::events::DispatchMessage;
use crate::messaging::topology::{ORDER_EXCHANGE, ORDER_READY_KEY};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/dispatches", post(publish_dispatch))
}

/// Thin publisher standing in for the order subsystem: accepts the dispatch
/// message as-is and hands it to the broker. Coordinate validation happens at
/// the consumer boundary, where malformed payloads take the discard path.
async fn publish_dispatch(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DispatchMessage>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let order_id = payload.order_id.clone();

    let bytes = serde_json::to_vec(&payload)
        .map_err(|err| AppError::Internal(format!("failed to serialize dispatch: {err}")))?;
    state
        .broker
        .publish(ORDER_EXCHANGE, ORDER_READY_KEY, &bytes, true)?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "orderId": order_id }))))
}
