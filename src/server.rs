//! Webhook HTTP surface.
//!
//! | Method | Path      | Purpose                               |
//! |--------|-----------|---------------------------------------|
//! | POST   | `/api`    | database webhook: analyse one document |
//! | POST   | `/`       | same, for deployments mounted at root |
//! | GET    | `/health` | liveness probe                        |
//!
//! The POST handlers answer only after the analysis run has finished.

use crate::handler::DocumentAnalysisHandler;
use crate::record::{WebhookEvent, WebhookResponse};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<DocumentAnalysisHandler>,
}

impl AppState {
    pub fn new(handler: DocumentAnalysisHandler) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api", post(webhook))
        .route("/", post(webhook))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(handler: DocumentAnalysisHandler, addr: SocketAddr) -> std::io::Result<()> {
    let app = create_router(AppState::new(handler));

    info!("Listening for webhooks at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookEvent>, JsonRejection>,
) -> (StatusCode, Json<WebhookResponse>) {
    let event = match payload {
        Ok(Json(event)) => event,
        Err(rejection) => {
            warn!("Rejecting malformed webhook body: {}", rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::err(rejection.body_text())),
            );
        }
    };

    if let Some(ref t) = event.event_type {
        info!("Webhook received: {} on {}", t, event.table.as_deref().unwrap_or("?"));
    }

    let (status, body) = state.handler.handle(&event).await;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
