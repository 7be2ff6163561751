//! Router assembly: the HTTP/WS surface laid out the way the original
//! `build_router`/`api_router` split does — one top-level `Router` with
//! health + the API nest, shared middleware layered outermost.

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::pty::{WsQuery, ws_upgrade};

use super::{AppState, handlers};

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|| async { Json(json!({ "status": "ok" })) }),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .nest("/health", health_routes)
        .merge(api_router())
        .route("/ws", get(ws_handler))
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .route("/me", get(handlers::me))
        .route("/containers", post(handlers::create_container))
        .route("/containers/my", get(handlers::list_containers))
        .route("/containers/{id}/urls", get(handlers::container_urls))
        .route("/containers/{id}", delete(handlers::delete_container))
        .route("/containers/{id}", patch(handlers::rename_container))
        .route("/files/{id}", get(handlers::get_files))
        .route("/files/{id}", patch(handlers::rename_file))
        .route("/files/{id}", delete(handlers::delete_file))
        .route("/save", post(handlers::save_files))
        .route("/run", post(handlers::run))
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws_upgrade(state.orchestrator.clone(), state.sessions.clone(), query, ws)
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!(path = %req.uri(), "unhandled path");
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
