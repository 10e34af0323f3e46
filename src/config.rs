use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teloxide::types::AllowedUpdate;
use tracing::{info, warn};

/// Placeholder secret shipped in sample deployments; never use it in production.
pub const PLACEHOLDER_SECRET: &str = "your-secret-token-here";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// The single user allowed to call control-plane endpoints and admin commands.
    #[serde(default)]
    pub admin_user_id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// Public base URL, e.g. https://your-app.example. Unset means degraded mode.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_secret")]
    pub secret: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_drop_pending_updates")]
    pub drop_pending_updates: bool,
    #[serde(default = "default_allowed_updates")]
    pub allowed_updates: Vec<AllowedUpdate>,
    /// Response budget for the acknowledgement of one webhook delivery.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// How long shutdown waits for in-flight dispatches.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Budget for one Bot API call made by the control plane.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_secret() -> String {
    PLACEHOLDER_SECRET.to_string()
}

fn default_port() -> u16 {
    7860
}

fn default_drop_pending_updates() -> bool {
    true
}

fn default_allowed_updates() -> Vec<AllowedUpdate> {
    vec![
        AllowedUpdate::Message,
        AllowedUpdate::EditedMessage,
        AllowedUpdate::ChannelPost,
        AllowedUpdate::EditedChannelPost,
        AllowedUpdate::InlineQuery,
        AllowedUpdate::ChosenInlineResult,
        AllowedUpdate::CallbackQuery,
        AllowedUpdate::ShippingQuery,
        AllowedUpdate::PreCheckoutQuery,
        AllowedUpdate::Poll,
        AllowedUpdate::PollAnswer,
        AllowedUpdate::MyChatMember,
        AllowedUpdate::ChatMember,
        AllowedUpdate::ChatJoinRequest,
    ]
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_upstream_timeout_secs() -> u64 {
    10
}

fn default_db_path() -> PathBuf {
    PathBuf::from("bot.db")
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: default_secret(),
            port: default_port(),
            drop_pending_updates: default_drop_pending_updates(),
            allowed_updates: default_allowed_updates(),
            ack_timeout_secs: default_ack_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl WebhookConfig {
    /// Public base URL without a trailing slash, if one is configured.
    pub fn base_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/'))
            .filter(|url| !url.is_empty())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

impl Config {
    /// Load from a TOML file (missing file means defaults), then apply
    /// environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)?
        } else {
            info!(
                "Config file {} not found, using defaults and environment",
                path.display()
            );
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Override values from `BOT_TOKEN`, `ADMIN_USER_ID`, `WEBHOOK_URL`,
    /// `WEBHOOK_SECRET`, `PORT` and `DATABASE_PATH`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(admin) = lookup("ADMIN_USER_ID") {
            self.telegram.admin_user_id = admin
                .trim()
                .parse()
                .with_context(|| format!("ADMIN_USER_ID is not a user id: {}", admin))?;
        }
        if let Some(url) = lookup("WEBHOOK_URL") {
            self.webhook.url = Some(url);
        }
        if let Some(secret) = lookup("WEBHOOK_SECRET") {
            self.webhook.secret = secret;
        }
        if let Some(port) = lookup("PORT") {
            self.webhook.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a port number: {}", port))?;
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token (or BOT_TOKEN) is required");
        }
        if self.telegram.admin_user_id == 0 {
            bail!("telegram.admin_user_id (or ADMIN_USER_ID) is required");
        }
        let secret = &self.webhook.secret;
        if secret.is_empty() || secret.contains('/') {
            bail!("webhook.secret must be a non-empty path segment");
        }
        if secret == PLACEHOLDER_SECRET {
            warn!("webhook.secret is the placeholder value; set WEBHOOK_SECRET");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.webhook.port, 7860);
        assert_eq!(config.webhook.secret, PLACEHOLDER_SECRET);
        assert!(config.webhook.drop_pending_updates);
        assert!(config.webhook.allowed_updates.contains(&AllowedUpdate::Message));
        assert_eq!(config.webhook.base_url(), None);
        assert_eq!(config.webhook.upstream_timeout(), Duration::from_secs(10));
        assert_eq!(config.database.path, PathBuf::from("bot.db"));
    }

    #[test]
    fn test_parse_file() {
        let config = Config::parse(
            r#"
[telegram]
bot_token = "123:abc"
admin_user_id = 42

[webhook]
url = "https://bot.example/"
secret = "s3cret"
port = 8080
drop_pending_updates = false
allowed_updates = ["message", "callback_query"]
"#,
        )
        .unwrap();
        assert_eq!(config.telegram.admin_user_id, 42);
        assert_eq!(config.webhook.base_url(), Some("https://bot.example"));
        assert_eq!(config.webhook.port, 8080);
        assert!(!config.webhook.drop_pending_updates);
        assert_eq!(
            config.webhook.allowed_updates,
            vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery]
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::parse("[webhook]\nport = 1\n").unwrap();
        config
            .apply_env(env(&[
                ("BOT_TOKEN", "t"),
                ("ADMIN_USER_ID", "99"),
                ("WEBHOOK_URL", "https://x.test"),
                ("WEBHOOK_SECRET", "abc"),
                ("PORT", "9000"),
                ("DATABASE_PATH", "/data/bot.db"),
            ]))
            .unwrap();
        assert_eq!(config.telegram.bot_token, "t");
        assert_eq!(config.telegram.admin_user_id, 99);
        assert_eq!(config.webhook.base_url(), Some("https://x.test"));
        assert_eq!(config.webhook.secret, "abc");
        assert_eq!(config.webhook.port, 9000);
        assert_eq!(config.database.path, PathBuf::from("/data/bot.db"));
    }

    #[test]
    fn test_bad_env_values_rejected() {
        let mut config = Config::default();
        assert!(config.apply_env(env(&[("PORT", "eighty")])).is_err());
        assert!(config.apply_env(env(&[("ADMIN_USER_ID", "admin")])).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
        config.telegram.bot_token = "t".into();
        assert!(config.validate().is_err());
        config.telegram.admin_user_id = 5;
        config.validate().unwrap();
        config.webhook.secret = "a/b".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_url_is_degraded_mode() {
        let mut config = Config::default();
        config.webhook.url = Some("  ".into());
        assert_eq!(config.webhook.base_url(), None);
    }
}
