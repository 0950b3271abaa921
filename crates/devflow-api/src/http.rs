// HTTP transport: a single POST /mcp endpoint plus GET /health

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use devflow_storage::Database;

use crate::dispatcher::McpDispatcher;
use crate::protocol::PROTOCOL_VERSION;

#[derive(Clone)]
struct HealthState {
    db: Option<Database>,
}

/// Assemble the HTTP router
pub fn router(dispatcher: McpDispatcher, db: Option<Database>) -> Router {
    let server_header = format!(
        "{}/{}",
        dispatcher.state().server_name,
        dispatcher.state().server_version
    );

    Router::new()
        .route("/mcp", post(mcp).with_state(dispatcher))
        .route("/health", get(health).with_state(HealthState { db }))
        .layer(middleware::from_fn(
            move |request: Request<Body>, next: Next| {
                let server_header = server_header.clone();
                async move {
                    let mut response = next.run(request).await;
                    let headers = response.headers_mut();
                    if let Ok(value) = HeaderValue::from_str(&server_header) {
                        headers.insert("X-MCP-Server", value);
                    }
                    headers.insert(
                        "X-Protocol-Version",
                        HeaderValue::from_static(PROTOCOL_VERSION),
                    );
                    response
                }
            },
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// POST /mcp - the JSON-RPC endpoint
async fn mcp(State(dispatcher): State<McpDispatcher>, body: String) -> Response {
    match dispatcher.handle_body(&body).await {
        Some(value) => Json(value).into_response(),
        // All-notification batch: nothing to answer
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// GET /health - 200 when the dispatcher and database are reachable
async fn health(State(state): State<HealthState>) -> Response {
    if let Some(db) = &state.db {
        if let Err(e) = db.ping().await {
            tracing::error!(error = %e, "health check failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "degraded"})),
            )
                .into_response();
        }
    }
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}
