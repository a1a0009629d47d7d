//! API route handlers for the gateway.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;

use agentcell_registry::{DEFAULT_INSTANCE_KEY, InstanceRequest};

use super::server::AppState;

fn json_response(status: u16, body: serde_json::Value) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

/// Liveness endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agentcell-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.start_time.elapsed().as_secs(),
        "agents": state.registry.agent_types(),
    }))
}

/// Aggregate state of every registered agent type's default instance.
pub async fn agents_state(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let states = state.registry.fan_out(InstanceRequest::get("/state")).await;
    Json(serde_json::json!({"agents": states}))
}

/// Translate an external request into a synthetic instance request and
/// forward it. The target instance is picked by the `?instance=` key,
/// defaulting to each type's default instance.
pub async fn forward_to_instance(
    State(state): State<Arc<AppState>>,
    Path((agent_type, path)): Path<(String, String)>,
    Query(mut query): Query<HashMap<String, String>>,
    method: Method,
    body: Bytes,
) -> Response {
    let instance_key = query
        .remove("instance")
        .unwrap_or_else(|| DEFAULT_INSTANCE_KEY.to_string());

    let body = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(_) => {
                return json_response(400, serde_json::json!({"error": "Invalid JSON body"}));
            }
        }
    };

    let request = InstanceRequest {
        method: method.as_str().to_string(),
        path: format!("/{path}"),
        query,
        body,
    };

    match state.registry.forward(&agent_type, &instance_key, request).await {
        Ok(resp) => json_response(resp.status, resp.body),
        Err(e) => json_response(e.status_code(), serde_json::json!({"error": e.to_string()})),
    }
}
