use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use teloxide::prelude::*;
use teloxide::types::AllowedUpdate;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

/// Identity of the bot account behind the token, as reported by `getMe`.
#[derive(Debug, Clone, Default)]
pub struct BotIdentity {
    pub id: u64,
    pub username: Option<String>,
    pub first_name: String,
}

/// Parameters of a `setWebhook` call.
#[derive(Debug, Clone)]
pub struct WebhookRegistration {
    pub url: String,
    pub drop_pending_updates: bool,
    pub allowed_updates: Vec<AllowedUpdate>,
}

/// Current webhook registration as seen by Telegram.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebhookSnapshot {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub has_custom_certificate: bool,
    #[serde(default)]
    pub pending_update_count: u32,
    #[serde(default)]
    pub last_error_date: Option<serde_json::Value>,
    #[serde(default)]
    pub last_error_message: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub allowed_updates: Option<Vec<String>>,
}

/// Outbound calls the gateway and its command handlers make to the Bot API.
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn get_me(&self) -> GatewayResult<BotIdentity>;

    async fn set_webhook(&self, registration: WebhookRegistration) -> GatewayResult<()>;

    async fn get_webhook_info(&self) -> GatewayResult<WebhookSnapshot>;

    async fn delete_webhook(&self, drop_pending_updates: bool) -> GatewayResult<()>;

    async fn send_message(&self, chat_id: i64, text: String) -> GatewayResult<()>;
}

/// `BotApi` backed by a teloxide `Bot`.
pub struct TelegramApi {
    bot: Bot,
}

impl TelegramApi {
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }
}

#[async_trait]
impl BotApi for TelegramApi {
    async fn get_me(&self) -> GatewayResult<BotIdentity> {
        let me = self.bot.get_me().await?;
        Ok(BotIdentity {
            id: me.user.id.0,
            username: me.user.username.clone(),
            first_name: me.user.first_name.clone(),
        })
    }

    async fn set_webhook(&self, registration: WebhookRegistration) -> GatewayResult<()> {
        let url = url::Url::parse(&registration.url)
            .map_err(|e| GatewayError::BadRequest(format!("invalid webhook url: {}", e)))?;
        self.bot
            .set_webhook(url)
            .drop_pending_updates(registration.drop_pending_updates)
            .allowed_updates(registration.allowed_updates)
            .await?;
        Ok(())
    }

    async fn get_webhook_info(&self) -> GatewayResult<WebhookSnapshot> {
        let info = self.bot.get_webhook_info().await?;
        // Round-trip through the wire format so the snapshot does not depend
        // on teloxide's field types.
        let value = serde_json::to_value(&info)
            .map_err(|e| GatewayError::UpstreamApi(format!("unreadable webhook info: {}", e)))?;
        debug!("getWebhookInfo: {}", value);
        serde_json::from_value(value)
            .map_err(|e| GatewayError::UpstreamApi(format!("unreadable webhook info: {}", e)))
    }

    async fn delete_webhook(&self, drop_pending_updates: bool) -> GatewayResult<()> {
        self.bot
            .delete_webhook()
            .drop_pending_updates(drop_pending_updates)
            .await?;
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: String) -> GatewayResult<()> {
        self.bot.send_message(ChatId(chat_id), text).await?;
        Ok(())
    }
}
