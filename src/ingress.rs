//! Inbound webhook deliveries from Telegram.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use teloxide::types::Update;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::runtime::BotRuntime;
use crate::server::AppState;

/// Authenticate, parse and hand one delivery to the runtime. Returns once the
/// dispatch is accepted; the handler itself runs in the background.
///
/// Check order matters: a bad secret is rejected before the runtime state is
/// consulted and before the body is parsed.
pub fn accept_delivery(
    runtime: &BotRuntime,
    expected_secret: &str,
    secret: &str,
    body: &[u8],
) -> GatewayResult<()> {
    if secret != expected_secret {
        warn!("Received webhook call with an invalid secret");
        return Err(GatewayError::Unauthorized);
    }
    if !runtime.is_running() {
        warn!("Webhook call while bot runtime is {:?}", runtime.state());
        return Err(GatewayError::not_running());
    }
    let update: Update = serde_json::from_slice(body).map_err(|e| {
        warn!("Malformed update payload: {}", e);
        GatewayError::BadRequest(format!("malformed update: {}", e))
    })?;
    debug!("Accepted update {}", update.id.0);
    runtime.process_update(update)
}

/// POST /webhook/{secret}
pub async fn receive_update(
    State(state): State<Arc<AppState>>,
    Path(secret): Path<String>,
    body: Bytes,
) -> GatewayResult<StatusCode> {
    accept_delivery(&state.runtime, state.control.secret(), &secret, &body)?;
    Ok(StatusCode::OK)
}
