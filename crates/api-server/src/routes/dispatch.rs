//! Front-door dispatch: URL prefix → (entity kind, name, subpath)

use std::collections::HashMap;
use std::str::FromStr;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, FromRequestParts, Path, Request, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};

use coord_core::request::{EntityRequest, Method};
use coord_core::runtime::registry::{EntityKind, SINGLETON};

use crate::socket;
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/coordinator", any(coordinator_root))
        .route("/coordinator/{*path}", any(coordinator_sub))
        .route("/agent/{agent_id}", any(agent_root))
        .route("/agent/{agent_id}/{*path}", any(agent_sub))
        .route("/lock/{resource}", any(lock_root))
        .route("/lock/{resource}/{*path}", any(lock_sub))
        .route("/vmpool", any(vmpool_root))
        .route("/vmpool/{*path}", any(vmpool_sub))
        .route("/gittree/{repo_id}", any(gittree_root))
        .route("/gittree/{repo_id}/{*path}", any(gittree_sub))
}

/// True for the paths that accept a WebSocket upgrade: the entity's
/// primary path or its `/ws` alias.
fn is_socket_path(path: &str) -> bool {
    path.is_empty() || path == "ws"
}

fn wants_websocket(req: &Request) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn parse_query(uri: &Uri) -> HashMap<String, String> {
    let mut query = HashMap::new();
    for pair in uri.query().unwrap_or("").split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |raw: &str| {
            urlencoding::decode(&raw.replace('+', " "))
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| raw.to_string())
        };
        query.insert(decode(key), decode(value));
    }
    query
}

async fn dispatch(
    state: AppState,
    kind: EntityKind,
    name: String,
    path: String,
    req: Request,
) -> Response {
    let upgrade = wants_websocket(&req);
    let (mut parts, body) = req.into_parts();
    let query = parse_query(&parts.uri);

    if upgrade && parts.method == axum::http::Method::GET && is_socket_path(&path) {
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };
        let identity = match kind {
            EntityKind::Agent => Some(name.clone()),
            _ => query.get("agentId").cloned(),
        };
        return socket::upgrade(state, kind, name, identity, ws);
    }

    let method = match Method::from_str(parts.method.as_str()) {
        Ok(method) => method,
        Err(err) => return error_response(err.status(), err.body()),
    };
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(
                400,
                serde_json::json!({ "error": format!("Failed to read body: {}", err) }),
            )
        }
    };
    let body = if bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                return error_response(
                    400,
                    serde_json::json!({ "error": format!("Invalid JSON body: {}", err) }),
                )
            }
        }
    };

    let mut entity_req = EntityRequest::new(method, format!("/{}", path));
    entity_req.query = query;
    entity_req.body = body;

    let response = state.registry().dispatch(kind, &name, entity_req).await;
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}

fn error_response(status: u16, body: serde_json::Value) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

async fn coordinator_root(State(state): State<AppState>, req: Request<Body>) -> Response {
    dispatch(
        state,
        EntityKind::Coordinator,
        SINGLETON.to_string(),
        String::new(),
        req,
    )
    .await
}

async fn coordinator_sub(
    State(state): State<AppState>,
    Path(path): Path<String>,
    req: Request<Body>,
) -> Response {
    dispatch(
        state,
        EntityKind::Coordinator,
        SINGLETON.to_string(),
        path,
        req,
    )
    .await
}

async fn agent_root(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    req: Request<Body>,
) -> Response {
    dispatch(state, EntityKind::Agent, agent_id, String::new(), req).await
}

async fn agent_sub(
    State(state): State<AppState>,
    Path((agent_id, path)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    dispatch(state, EntityKind::Agent, agent_id, path, req).await
}

async fn lock_root(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    req: Request<Body>,
) -> Response {
    dispatch(state, EntityKind::Lock, resource, String::new(), req).await
}

async fn lock_sub(
    State(state): State<AppState>,
    Path((resource, path)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    dispatch(state, EntityKind::Lock, resource, path, req).await
}

async fn vmpool_root(State(state): State<AppState>, req: Request<Body>) -> Response {
    dispatch(
        state,
        EntityKind::VmPool,
        SINGLETON.to_string(),
        String::new(),
        req,
    )
    .await
}

async fn vmpool_sub(
    State(state): State<AppState>,
    Path(path): Path<String>,
    req: Request<Body>,
) -> Response {
    dispatch(state, EntityKind::VmPool, SINGLETON.to_string(), path, req).await
}

async fn gittree_root(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    req: Request<Body>,
) -> Response {
    dispatch(state, EntityKind::GitTree, repo_id, String::new(), req).await
}

async fn gittree_sub(
    State(state): State<AppState>,
    Path((repo_id, path)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    dispatch(state, EntityKind::GitTree, repo_id, path, req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_decodes_pairs() {
        let uri: Uri = "/coordinator/chat?agentId=raven&limit=10&q=a%20b&flag"
            .parse()
            .unwrap();
        let query = parse_query(&uri);
        assert_eq!(query.get("agentId").map(String::as_str), Some("raven"));
        assert_eq!(query.get("limit").map(String::as_str), Some("10"));
        assert_eq!(query.get("q").map(String::as_str), Some("a b"));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn socket_paths() {
        assert!(is_socket_path(""));
        assert!(is_socket_path("ws"));
        assert!(!is_socket_path("chat"));
    }
}
