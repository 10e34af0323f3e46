use anyhow::Result;
use chrono::Utc;
use tracing::info;

use super::active_user;
use crate::db::{Redemption, CHECKIN_REWARD, INVITE_REWARD, SIGNUP_BONUS};
use crate::registry::CommandContext;

const USER_HELP: &str = "Commands:\n\
    /start - Register\n\
    /balance - Show your balance\n\
    /qd - Daily check-in\n\
    /invite - Get your invite link\n\
    /use <key> - Redeem a card key\n\
    /about - About this bot\n\
    /help - Show this help";

const ADMIN_HELP: &str = "Admin commands:\n\
    /addbalance <user_id> <amount> - Adjust a balance\n\
    /block <user_id> - Block a user\n\
    /white <user_id> - Unblock a user\n\
    /blacklist - List blocked users\n\
    /genkey <balance> [max_uses] [expire_days] - Create a card key\n\
    /listkeys - List card keys\n\
    /broadcast <text> - Message every active user";

/// `/start [inviter_id]`
pub async fn start(ctx: CommandContext) -> Result<()> {
    let Some(user) = ctx.message.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0;
    if ctx.deps.db.is_user_blocked(user_id).await? {
        ctx.reply("Your account has been blocked.").await?;
        return Ok(());
    }

    let inviter = ctx.args.first().and_then(|arg| arg.parse::<u64>().ok());
    let created = ctx
        .deps
        .db
        .create_user(user_id, user.username.as_deref(), &user.full_name(), inviter)
        .await?;

    if created {
        info!("New user {} (invited by {:?})", user_id, inviter);
        let mut text = format!(
            "Welcome, {}! You received {} credit(s) for signing up.",
            user.first_name, SIGNUP_BONUS
        );
        if inviter.is_some_and(|id| id != user_id) {
            text.push_str("\nYour inviter has been rewarded.");
        }
        text.push_str("\n\n");
        text.push_str(USER_HELP);
        ctx.reply(text).await?;
    } else {
        ctx.reply(format!("Welcome back, {}!", user.first_name)).await?;
    }
    Ok(())
}

pub async fn about(ctx: CommandContext) -> Result<()> {
    ctx.reply(
        "Credit bot running in webhook mode.\n\
         Earn credits by checking in daily with /qd, inviting friends with /invite, \
         or redeeming card keys with /use.",
    )
    .await?;
    Ok(())
}

pub async fn help(ctx: CommandContext) -> Result<()> {
    if ctx.is_admin() {
        ctx.reply(format!("{}\n\n{}", USER_HELP, ADMIN_HELP)).await?;
    } else {
        ctx.reply(USER_HELP).await?;
    }
    Ok(())
}

pub async fn balance(ctx: CommandContext) -> Result<()> {
    let Some(user_id) = active_user(&ctx).await? else {
        return Ok(());
    };
    let Some(user) = ctx.deps.db.get_user(user_id).await? else {
        return Ok(());
    };
    let last_checkin = user.last_checkin.as_deref().unwrap_or("never");
    ctx.reply(format!(
        "Balance: {} credit(s)\nLast check-in: {}",
        user.balance, last_checkin
    ))
    .await?;
    Ok(())
}

/// `/qd`, the daily check-in.
pub async fn checkin(ctx: CommandContext) -> Result<()> {
    let Some(user_id) = active_user(&ctx).await? else {
        return Ok(());
    };
    let today = Utc::now().date_naive();
    if ctx.deps.db.checkin(user_id, today).await? {
        ctx.reply(format!(
            "Check-in successful! +{} credit(s).",
            CHECKIN_REWARD
        ))
        .await?;
    } else {
        ctx.reply("You have already checked in today. Come back tomorrow!")
            .await?;
    }
    Ok(())
}

pub async fn invite(ctx: CommandContext) -> Result<()> {
    let Some(user_id) = active_user(&ctx).await? else {
        return Ok(());
    };
    let invited = ctx.deps.db.count_invites(user_id).await?;
    let link = match ctx.bot_username.as_deref() {
        Some(bot) => format!("https://t.me/{}?start={}", bot, user_id),
        None => format!("/start {}", user_id),
    };
    ctx.reply(format!(
        "Invite friends and earn {} credit(s) each.\nYour link: {}\nInvited so far: {}",
        INVITE_REWARD, link, invited
    ))
    .await?;
    Ok(())
}

/// `/use <key>`
pub async fn use_key(ctx: CommandContext) -> Result<()> {
    let Some(user_id) = active_user(&ctx).await? else {
        return Ok(());
    };
    let Some(key) = ctx.args.first() else {
        ctx.reply("Usage: /use <key>").await?;
        return Ok(());
    };

    let text = match ctx.deps.db.use_card_key(key, user_id).await? {
        Redemption::Redeemed { balance } => {
            info!("User {} redeemed key {}", user_id, key);
            format!("Key redeemed: +{} credit(s).", balance)
        }
        Redemption::NotFound => "This key does not exist.".to_string(),
        Redemption::Expired => "This key has expired.".to_string(),
        Redemption::Exhausted => "This key has already been fully used.".to_string(),
        Redemption::AlreadyUsed => "You have already used this key.".to_string(),
        Redemption::BalanceOverflow => {
            "Your balance cannot hold this key's value; the key was not used.".to_string()
        }
    };
    ctx.reply(text).await?;
    Ok(())
}
