//! Webhook control plane: register, inspect and remove the delivery URL.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use teloxide::types::AllowedUpdate;
use tracing::{error, info, warn};

use crate::api::{WebhookRegistration, WebhookSnapshot};
use crate::config::WebhookConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::runtime::BotRuntime;
use crate::server::AppState;

pub struct WebhookControl {
    runtime: Arc<BotRuntime>,
    admin_id: u64,
    secret: String,
    drop_pending_updates: bool,
    allowed_updates: Vec<AllowedUpdate>,
    upstream_timeout: Duration,
    registered: RwLock<Option<String>>,
}

impl WebhookControl {
    pub fn new(runtime: Arc<BotRuntime>, settings: &WebhookConfig, admin_id: u64) -> Self {
        Self {
            runtime,
            admin_id,
            secret: settings.secret.clone(),
            drop_pending_updates: settings.drop_pending_updates,
            allowed_updates: settings.allowed_updates.clone(),
            upstream_timeout: settings.upstream_timeout(),
            registered: RwLock::new(None),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// `{base}/webhook/{secret}`
    pub fn delivery_url(&self, base_url: &str) -> String {
        format!(
            "{}/webhook/{}",
            base_url.trim().trim_end_matches('/'),
            self.secret
        )
    }

    /// The delivery URL last registered through this control plane.
    pub fn registered_url(&self) -> Option<String> {
        self.registered.read().clone()
    }

    /// Run one Bot API call under the upstream budget. A timeout is reported
    /// as an upstream failure.
    async fn upstream<T>(
        &self,
        method: &str,
        call: impl Future<Output = GatewayResult<T>>,
    ) -> GatewayResult<T> {
        match tokio::time::timeout(self.upstream_timeout, call).await {
            Ok(result) => result.inspect_err(|e| error!("{} failed: {}", method, e)),
            Err(_) => {
                error!("{} timed out after {:?}", method, self.upstream_timeout);
                Err(GatewayError::UpstreamApi(format!(
                    "{} timed out after {:?}",
                    method, self.upstream_timeout
                )))
            }
        }
    }

    fn authorize(&self, caller: Option<u64>) -> GatewayResult<()> {
        if caller != Some(self.admin_id) {
            warn!("Rejected control-plane call from {:?}", caller);
            return Err(GatewayError::Unauthorized);
        }
        Ok(())
    }

    /// Admin entry point for `setWebhook`.
    pub async fn set_webhook(&self, caller: Option<u64>, base_url: Option<&str>) -> GatewayResult<String> {
        self.authorize(caller)?;
        let base_url = base_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| GatewayError::BadRequest("webhook_url is required".to_string()))?;
        self.register(base_url).await
    }

    /// Register `{base_url}/webhook/{secret}` with Telegram. Re-registering
    /// replaces the previous URL.
    pub async fn register(&self, base_url: &str) -> GatewayResult<String> {
        let client = self.runtime.client()?;
        let url = self.delivery_url(base_url);
        info!("Setting webhook: {}/webhook/***", base_url.trim_end_matches('/'));
        let registration = WebhookRegistration {
            url: url.clone(),
            drop_pending_updates: self.drop_pending_updates,
            allowed_updates: self.allowed_updates.clone(),
        };
        self.upstream("setWebhook", client.set_webhook(registration))
            .await?;
        *self.registered.write() = Some(url.clone());
        info!("Webhook set");
        Ok(url)
    }

    pub async fn webhook_info(&self) -> GatewayResult<WebhookSnapshot> {
        let client = self.runtime.client()?;
        self.upstream("getWebhookInfo", client.get_webhook_info())
            .await
    }

    /// Deregister and discard pending updates.
    pub async fn delete_webhook(&self, caller: Option<u64>) -> GatewayResult<()> {
        self.authorize(caller)?;
        let client = self.runtime.client()?;
        self.upstream("deleteWebhook", client.delete_webhook(true))
            .await?;
        *self.registered.write() = None;
        info!("Webhook deleted");
        Ok(())
    }
}

/// Body of `POST /set_webhook`. Fields are read loosely so that a
/// malformed caller id is rejected as unauthorized, not as a bad request.
#[derive(Debug, Default, Deserialize)]
pub struct SetWebhookRequest {
    #[serde(default)]
    pub admin_id: Option<Value>,
    #[serde(default)]
    pub webhook_url: Option<Value>,
}

impl SetWebhookRequest {
    fn caller(&self) -> Option<u64> {
        self.admin_id.as_ref().and_then(Value::as_u64)
    }

    fn webhook_url(&self) -> Option<&str> {
        self.webhook_url.as_ref().and_then(Value::as_str)
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    #[serde(default)]
    pub admin_id: Option<String>,
}

impl AdminQuery {
    fn caller(&self) -> Option<u64> {
        self.admin_id.as_deref().and_then(|id| id.trim().parse().ok())
    }
}

/// POST /set_webhook
pub async fn set_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> GatewayResult<Json<Value>> {
    let request: SetWebhookRequest = serde_json::from_slice(&body).unwrap_or_default();
    let webhook_url = state
        .control
        .set_webhook(request.caller(), request.webhook_url())
        .await?;
    Ok(Json(json!({
        "status": "success",
        "webhook_url": webhook_url,
        "message": "Webhook set",
    })))
}

/// GET /webhook_info
pub async fn webhook_info(State(state): State<Arc<AppState>>) -> GatewayResult<Json<WebhookSnapshot>> {
    Ok(Json(state.control.webhook_info().await?))
}

/// DELETE /webhook?admin_id=
pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AdminQuery>,
) -> GatewayResult<Json<Value>> {
    state.control.delete_webhook(query.caller()).await?;
    Ok(Json(json!({
        "status": "success",
        "message": "Webhook deleted",
    })))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::api::fake::FakeApi;

    const ADMIN: u64 = 1000;

    fn settings() -> WebhookConfig {
        WebhookConfig {
            secret: "s3cret".to_string(),
            ..WebhookConfig::default()
        }
    }

    async fn control(api: Arc<FakeApi>) -> WebhookControl {
        let runtime = Arc::new(BotRuntime::new(api));
        runtime.initialize().await.unwrap();
        runtime.start().unwrap();
        WebhookControl::new(runtime, &settings(), ADMIN)
    }

    #[tokio::test]
    async fn test_set_webhook_appends_secret() {
        let api = Arc::new(FakeApi::new());
        let control = control(api.clone()).await;

        let url = control
            .set_webhook(Some(ADMIN), Some("https://example.test/"))
            .await
            .unwrap();
        assert_eq!(url, "https://example.test/webhook/s3cret");

        let calls = api.set_webhook_calls.lock();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].drop_pending_updates);
        assert!(calls[0].allowed_updates.contains(&AllowedUpdate::Message));
    }

    #[tokio::test]
    async fn test_non_admin_cannot_set_webhook() {
        let api = Arc::new(FakeApi::new());
        let control = control(api.clone()).await;

        for caller in [None, Some(ADMIN + 1)] {
            let err = control
                .set_webhook(caller, Some("https://evil.test"))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Unauthorized));
        }
        assert!(api.set_webhook_calls.lock().is_empty());
        assert_eq!(control.registered_url(), None);
        assert_eq!(control.webhook_info().await.unwrap().url, None);
    }

    #[tokio::test]
    async fn test_missing_url_is_bad_request() {
        let api = Arc::new(FakeApi::new());
        let control = control(api.clone()).await;
        for url in [None, Some(""), Some("   ")] {
            let err = control.set_webhook(Some(ADMIN), url).await.unwrap_err();
            assert!(matches!(err, GatewayError::BadRequest(_)));
        }
        assert!(api.set_webhook_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_set_webhook_keeps_one_registration() {
        let api = Arc::new(FakeApi::new());
        let control = control(api.clone()).await;

        for _ in 0..3 {
            control
                .set_webhook(Some(ADMIN), Some("https://example.test"))
                .await
                .unwrap();
        }
        let info = control.webhook_info().await.unwrap();
        assert_eq!(
            info.url.as_deref(),
            Some("https://example.test/webhook/s3cret")
        );
        assert_eq!(
            control.registered_url().as_deref(),
            Some("https://example.test/webhook/s3cret")
        );
    }

    #[tokio::test]
    async fn test_delete_webhook() {
        let api = Arc::new(FakeApi::new());
        let control = control(api.clone()).await;
        control
            .set_webhook(Some(ADMIN), Some("https://example.test"))
            .await
            .unwrap();

        assert!(matches!(
            control.delete_webhook(Some(7)).await,
            Err(GatewayError::Unauthorized)
        ));
        control.delete_webhook(Some(ADMIN)).await.unwrap();

        assert_eq!(*api.delete_calls.lock(), vec![true]);
        assert_eq!(control.registered_url(), None);
        assert_eq!(control.webhook_info().await.unwrap().url, None);
    }

    #[tokio::test]
    async fn test_requires_initialized_runtime() {
        let api = Arc::new(FakeApi::new());
        let runtime = Arc::new(BotRuntime::new(api.clone()));
        let control = WebhookControl::new(runtime.clone(), &settings(), ADMIN);

        assert!(matches!(
            control.webhook_info().await,
            Err(GatewayError::ServiceUnavailable(_))
        ));
        assert!(matches!(
            control.set_webhook(Some(ADMIN), Some("https://example.test")).await,
            Err(GatewayError::ServiceUnavailable(_))
        ));
        assert!(matches!(
            control.delete_webhook(Some(ADMIN)).await,
            Err(GatewayError::ServiceUnavailable(_))
        ));

        runtime.initialize().await.unwrap();
        runtime.start().unwrap();
        runtime.shutdown().await.unwrap();
        assert!(matches!(
            control.webhook_info().await,
            Err(GatewayError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_upstream_is_an_upstream_error() {
        let api = Arc::new(FakeApi::new());
        let runtime = Arc::new(BotRuntime::new(api.clone()));
        runtime.initialize().await.unwrap();
        let settings = WebhookConfig {
            upstream_timeout_secs: 0,
            ..settings()
        };
        let control = WebhookControl::new(runtime, &settings, ADMIN);
        api.delay_ms.store(200, Ordering::SeqCst);

        let err = control.webhook_info().await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamApi(ref msg) if msg.contains("timed out")));
        let err = control
            .set_webhook(Some(ADMIN), Some("https://example.test"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(control.registered_url(), None);
    }

    #[tokio::test]
    async fn test_upstream_failure_surfaces() {
        let api = Arc::new(FakeApi::new());
        let control = control(api.clone()).await;
        api.fail_calls.store(true, Ordering::SeqCst);

        let err = control
            .set_webhook(Some(ADMIN), Some("https://example.test"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamApi(ref msg) if msg == "Bad Gateway"));
        assert_eq!(control.registered_url(), None);
    }
}
