use anyhow::Result;
use tracing::{info, warn};

use crate::db::{self, BalanceUpdate};
use crate::registry::CommandContext;

/// Replies with a refusal unless the caller is the admin.
async fn require_admin(ctx: &CommandContext) -> Result<bool> {
    if ctx.is_admin() {
        return Ok(true);
    }
    warn!("Non-admin {:?} tried /{}", ctx.user_id(), ctx.command);
    ctx.reply("This command is for the admin only.").await?;
    Ok(false)
}

fn parse_user_id(ctx: &CommandContext) -> Option<u64> {
    ctx.args.first().and_then(|arg| arg.parse().ok())
}

/// `/addbalance <user_id> <amount>`; the amount may be negative.
pub async fn add_balance(ctx: CommandContext) -> Result<()> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }
    let amount = ctx.args.get(1).and_then(|arg| arg.parse::<i64>().ok());
    let (Some(user_id), Some(amount)) = (parse_user_id(&ctx), amount) else {
        ctx.reply("Usage: /addbalance <user_id> <amount>").await?;
        return Ok(());
    };

    let text = match ctx.deps.db.add_balance(user_id, amount).await? {
        BalanceUpdate::Applied { balance } => {
            info!("Admin adjusted balance of {} by {}", user_id, amount);
            format!("User {} balance: {}", user_id, balance)
        }
        BalanceUpdate::UnknownUser => format!("User {} not found.", user_id),
        BalanceUpdate::OutOfRange => format!(
            "Balance of user {} would go negative or out of range; nothing changed.",
            user_id
        ),
    };
    ctx.reply(text).await?;
    Ok(())
}

pub async fn block(ctx: CommandContext) -> Result<()> {
    set_blocked(ctx, true).await
}

/// `/white <user_id>` lifts a block.
pub async fn white(ctx: CommandContext) -> Result<()> {
    set_blocked(ctx, false).await
}

async fn set_blocked(ctx: CommandContext, blocked: bool) -> Result<()> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }
    let Some(user_id) = parse_user_id(&ctx) else {
        ctx.reply(format!("Usage: /{} <user_id>", ctx.command)).await?;
        return Ok(());
    };

    if ctx.deps.db.set_blocked(user_id, blocked).await? {
        let verb = if blocked { "blocked" } else { "unblocked" };
        info!("Admin {} user {}", verb, user_id);
        ctx.reply(format!("User {} {}.", user_id, verb)).await?;
    } else {
        ctx.reply(format!("User {} not found.", user_id)).await?;
    }
    Ok(())
}

pub async fn blacklist(ctx: CommandContext) -> Result<()> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }
    let users = ctx.deps.db.blocked_users().await?;
    if users.is_empty() {
        ctx.reply("Blacklist is empty.").await?;
        return Ok(());
    }
    let mut text = format!("Blocked users ({}):\n", users.len());
    for user in &users {
        let handle = user
            .username
            .as_deref()
            .map(|name| format!(" @{}", name))
            .unwrap_or_default();
        text.push_str(&format!("  - {} {}{}\n", user.user_id, user.full_name, handle));
    }
    ctx.reply(text).await?;
    Ok(())
}

/// `/genkey <balance> [max_uses] [expire_days]`
pub async fn genkey(ctx: CommandContext) -> Result<()> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }
    let mut numbers = ctx.args.iter().map(|arg| arg.parse::<i64>());
    let balance = numbers.next().and_then(|n| n.ok()).filter(|n| *n > 0);
    let max_uses = match numbers.next() {
        None => Some(1),
        Some(n) => n.ok().filter(|n| *n > 0),
    };
    let expire_at = match numbers.next() {
        None => Some(None),
        Some(n) => n.ok().filter(|n| *n > 0).and_then(db::expiry_after).map(Some),
    };
    let (Some(balance), Some(max_uses), Some(expire_at)) = (balance, max_uses, expire_at)
    else {
        ctx.reply("Usage: /genkey <balance> [max_uses] [expire_days]")
            .await?;
        return Ok(());
    };

    let code = format!(
        "KEY-{}",
        uuid::Uuid::new_v4().simple().to_string()[..12].to_uppercase()
    );
    let key = ctx
        .deps
        .db
        .create_card_key(&code, balance, max_uses, expire_at, ctx.deps.admin_id)
        .await?;
    info!("Admin created card key {}", key.key_code);

    let expiry = key.expire_at.as_deref().unwrap_or("never");
    ctx.reply(format!(
        "Card key created:\n{}\nValue: {} credit(s)\nUses: {}\nExpires: {}",
        key.key_code, key.balance, key.max_uses, expiry
    ))
    .await?;
    Ok(())
}

pub async fn listkeys(ctx: CommandContext) -> Result<()> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }
    let keys = ctx.deps.db.list_card_keys().await?;
    if keys.is_empty() {
        ctx.reply("No card keys yet.").await?;
        return Ok(());
    }
    let mut text = format!("Card keys ({}):\n", keys.len());
    for key in &keys {
        text.push_str(&format!(
            "  - {}: {} credit(s), used {}/{}, expires {}, created {}\n",
            key.key_code,
            key.balance,
            key.current_uses,
            key.max_uses,
            key.expire_at.as_deref().unwrap_or("never"),
            key.created_at
        ));
    }
    ctx.reply(text).await?;
    Ok(())
}

/// `/broadcast <text>` to every unblocked user. Individual send failures are
/// counted, not fatal.
pub async fn broadcast(ctx: CommandContext) -> Result<()> {
    if !require_admin(&ctx).await? {
        return Ok(());
    }
    if ctx.args.is_empty() {
        ctx.reply("Usage: /broadcast <text>").await?;
        return Ok(());
    }
    // Keep the admin's original spacing and line breaks.
    let text = ctx
        .message
        .text()
        .and_then(|t| t.split_once(char::is_whitespace))
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_else(|| ctx.args.join(" "));

    let recipients = ctx.deps.db.active_user_ids().await?;
    let mut delivered = 0;
    let mut failed = 0;
    for user_id in recipients {
        match ctx.api.send_message(user_id as i64, text.clone()).await {
            Ok(()) => delivered += 1,
            Err(e) => {
                warn!("Broadcast to {} failed: {}", user_id, e);
                failed += 1;
            }
        }
    }
    info!("Broadcast finished: {} delivered, {} failed", delivered, failed);
    ctx.reply(format!(
        "Broadcast finished: {} delivered, {} failed.",
        delivered, failed
    ))
    .await?;
    Ok(())
}
