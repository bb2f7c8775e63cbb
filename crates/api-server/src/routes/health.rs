//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use coord_core::runtime::registry::EntityKind;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
    timestamp: String,
    uptime_seconds: i64,
    entities: Vec<&'static str>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "agent-coordination".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: now.to_rfc3339(),
        uptime_seconds: (now - state.started_at()).num_seconds(),
        entities: EntityKind::ALL.iter().map(|kind| kind.as_str()).collect(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
