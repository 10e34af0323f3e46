use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::control::{self, WebhookControl};
use crate::ingress;
use crate::runtime::BotRuntime;

/// Shared state behind every route.
pub struct AppState {
    pub runtime: Arc<BotRuntime>,
    pub control: WebhookControl,
}

pub fn router(state: Arc<AppState>, ack_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route(
            "/webhook/{secret}",
            post(ingress::receive_update).layer(ack_budget(ack_timeout)),
        )
        .route("/set_webhook", post(control::set_webhook))
        .route("/webhook_info", get(control::webhook_info))
        .route("/webhook", delete(control::delete_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Deliveries that miss the acknowledgement budget answer 503 so Telegram
/// redelivers them.
fn ack_budget(ack_timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::SERVICE_UNAVAILABLE, ack_timeout)
}

async fn root(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "mode": "webhook",
        "bot": state.runtime.identity().map(|me| me.first_name),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "bot_running": state.runtime.is_running(),
    }))
}
