use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use teloxide::types::Message;
use tracing::{debug, info};

use crate::api::BotApi;
use crate::db::Database;
use crate::error::{GatewayError, GatewayResult};

/// Telegram's limit is 4096; leave headroom.
const MAX_REPLY_LEN: usize = 4000;

/// Shared dependencies injected into every handler invocation.
#[derive(Clone)]
pub struct Deps {
    pub db: Database,
    pub admin_id: u64,
}

/// Everything a handler gets for one update.
pub struct CommandContext {
    pub update_id: u32,
    /// Lowercased command name without the leading slash.
    pub command: String,
    pub args: Vec<String>,
    pub message: Message,
    /// Username of this bot, known after `getMe`.
    pub bot_username: Option<String>,
    pub api: Arc<dyn BotApi>,
    pub deps: Deps,
}

impl CommandContext {
    pub fn chat_id(&self) -> i64 {
        self.message.chat.id.0
    }

    pub fn user_id(&self) -> Option<u64> {
        self.message.from.as_ref().map(|user| user.id.0)
    }

    pub fn is_admin(&self) -> bool {
        self.user_id() == Some(self.deps.admin_id)
    }

    /// Send a reply to the originating chat, split into Telegram-sized chunks.
    pub async fn reply(&self, text: impl Into<String>) -> GatewayResult<()> {
        let text = text.into();
        debug!(update_id = self.update_id, "Replying to /{} in chat {}", self.command, self.chat_id());
        for chunk in split_message(&text, MAX_REPLY_LEN) {
            self.api.send_message(self.chat_id(), chunk).await?;
        }
        Ok(())
    }
}

/// A command implementation. Errors are caught at the dispatch boundary, but
/// handlers should reply with user-facing errors themselves.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// One entry of the dispatch table.
#[derive(Clone)]
pub struct CommandBinding {
    pub name: String,
    pub handler: Arc<dyn CommandHandler>,
    pub deps: Deps,
}

/// Fixed map from command name to binding. Names are case-insensitive.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    bindings: HashMap<String, CommandBinding>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        handler: impl CommandHandler + 'static,
        deps: Deps,
    ) -> GatewayResult<()> {
        let key = name.trim_start_matches('/').to_lowercase();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(GatewayError::BadRequest(format!(
                "invalid command name: {:?}",
                name
            )));
        }
        if self.bindings.contains_key(&key) {
            return Err(GatewayError::DuplicateCommand(key));
        }
        info!("Registered command: /{}", key);
        self.bindings.insert(
            key.clone(),
            CommandBinding {
                name: key,
                handler: Arc::new(handler),
                deps,
            },
        );
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<&CommandBinding> {
        self.bindings.get(&name.to_lowercase())
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Break a reply into chunks of at most `limit` bytes, cutting after the last
/// newline in range, else after the last space. Concatenating the chunks
/// gives back `text`.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > limit {
        let window = &rest[..floor_char_boundary(rest, limit)];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(window.len());
        // A char wider than the limit goes out whole.
        let cut = if cut == 0 {
            rest.chars().next().map_or(rest.len(), char::len_utf8)
        } else {
            cut
        };
        let (head, tail) = rest.split_at(cut);
        chunks.push(head.to_string());
        rest = tail;
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    (0..=index.min(text.len()))
        .rev()
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(0)
}
