//! API server for the agent coordination control plane
//!
//! This is the front door: CORS, request tracing, and prefix dispatch to
//! the entity runtime.

mod routes;
mod socket;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::http::{header, HeaderName, Method};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_server=debug,coord_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine data directory
    let data_dir = std::env::var("COORD_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".coord-data"));
    tracing::info!("Using data directory: {:?}", data_dir);

    let github_token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
    if github_token.is_none() {
        tracing::warn!("GITHUB_TOKEN is not set; GitTree requests run unauthenticated");
    }

    // Create application state
    let state = AppState::new(data_dir, github_token);

    // Build the router
    let app = build_router(state);

    // Start the server
    let addr: SocketAddr = std::env::var("COORD_BIND_ADDR")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8787)));
    tracing::info!("Coordination API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::dispatch::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::PATCH,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    HeaderName::from_static("x-agent-id"),
                    HeaderName::from_static("x-resource-path"),
                ]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path().to_path_buf(), None);
        (build_router(state), dir)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(value) => Body::from(value.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_entities() {
        let (app, _dir) = test_app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "agent-coordination");
        assert_eq!(body["entities"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn unknown_prefix_is_404() {
        let (app, _dir) = test_app();
        let (status, _) = send(&app, "GET", "/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let (app, _dir) = test_app();
        let (status, _) = send(&app, "DELETE", "/coordinator/agents", None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn lock_contention_over_http() {
        let (app, _dir) = test_app();

        let (status, body) = send(
            &app,
            "POST",
            "/lock/src%2Fserver/lock",
            Some(json!({ "agentId": "a1", "ttlMs": 60000 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["lock"]["lockedBy"], "a1");
        assert_eq!(body["lock"]["resourcePath"], "src/server");

        let (status, body) = send(
            &app,
            "POST",
            "/lock/src%2Fserver/lock",
            Some(json!({ "agentId": "a2" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["lockedBy"], "a1");
        assert!(body["remainingMs"].as_i64().unwrap() > 0);

        let (status, _) = send(
            &app,
            "POST",
            "/lock/src%2Fserver/unlock",
            Some(json!({ "agentId": "a1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/lock/src%2Fserver/lock",
            Some(json!({ "agentId": "a2" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lock"]["lockedBy"], "a2");
    }

    #[tokio::test]
    async fn claim_race_over_http() {
        let (app, _dir) = test_app();

        let (status, _) = send(
            &app,
            "POST",
            "/coordinator/claims",
            Some(json!({ "action": "claim", "what": "refactor-auth", "by": "phoenix" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/coordinator/claims",
            Some(json!({ "action": "claim", "what": "refactor-auth", "by": "raven" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["claim"]["by"], "phoenix");
        assert_eq!(body["claim"]["stale"], false);
    }

    #[tokio::test]
    async fn vm_spawn_flow_over_http() {
        let (app, _dir) = test_app();

        let (status, body) = send(
            &app,
            "POST",
            "/vmpool/vms",
            Some(json!({ "vmId": "vm-1", "instanceId": "i-1", "vmSize": "small" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["vm"]["status"], "provisioning");

        let (status, body) = send(&app, "POST", "/vmpool/vms/vm-1/ready", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["vm"]["status"], "ready");

        let (_, body) = send(&app, "POST", "/vmpool/spawn", Some(json!({ "agentId": "a1" }))).await;
        assert_eq!(body["vm"]["agentCount"], 1);
        let (_, body) = send(&app, "POST", "/vmpool/spawn", Some(json!({ "agentId": "a2" }))).await;
        assert_eq!(body["vm"]["agentCount"], 2);
        assert_eq!(body["vm"]["status"], "busy");

        let (status, body) =
            send(&app, "POST", "/vmpool/spawn", Some(json!({ "agentId": "a3" }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body["recommendation"]["reason"]
            .as_str()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn agent_checkpoint_over_http() {
        let (app, _dir) = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/agent/phoenix/checkpoint",
            Some(json!({ "conversationSummary": "midway through the refactor" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, body) = send(&app, "GET", "/agent/phoenix/checkpoint", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["checkpoint"]["conversationSummary"],
            "midway through the refactor"
        );
    }

    #[tokio::test]
    async fn work_bundle_over_http() {
        let (app, _dir) = test_app();
        send(
            &app,
            "POST",
            "/coordinator/chat",
            Some(json!({ "author": "phoenix", "message": "hey @raven can you review?" })),
        )
        .await;

        let (status, body) = send(&app, "GET", "/coordinator/work?agentId=raven", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inbox"]["count"], 1);

        let (_, body) = send(&app, "GET", "/coordinator/work?agentId=raven", None).await;
        assert_eq!(body["inbox"]["count"], 0);
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let (app, _dir) = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/coordinator/chat")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
