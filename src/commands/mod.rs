//! Bot commands bound at startup.

pub mod admin;
pub mod user;

use anyhow::Result;

use crate::error::GatewayResult;
use crate::registry::{CommandContext, Deps};
use crate::runtime::BotRuntime;

/// Bind every command to the runtime. Must run before `BotRuntime::start`.
pub fn register_all(runtime: &BotRuntime, deps: &Deps) -> GatewayResult<()> {
    runtime.register("start", user::start, deps.clone())?;
    runtime.register("about", user::about, deps.clone())?;
    runtime.register("help", user::help, deps.clone())?;
    runtime.register("balance", user::balance, deps.clone())?;
    runtime.register("qd", user::checkin, deps.clone())?;
    runtime.register("invite", user::invite, deps.clone())?;
    runtime.register("use", user::use_key, deps.clone())?;

    runtime.register("addbalance", admin::add_balance, deps.clone())?;
    runtime.register("block", admin::block, deps.clone())?;
    runtime.register("white", admin::white, deps.clone())?;
    runtime.register("blacklist", admin::blacklist, deps.clone())?;
    runtime.register("genkey", admin::genkey, deps.clone())?;
    runtime.register("listkeys", admin::listkeys, deps.clone())?;
    runtime.register("broadcast", admin::broadcast, deps.clone())?;
    Ok(())
}

/// Resolve the caller to a registered, unblocked user id, replying otherwise.
async fn active_user(ctx: &CommandContext) -> Result<Option<u64>> {
    let Some(user_id) = ctx.user_id() else {
        return Ok(None);
    };
    match ctx.deps.db.get_user(user_id).await? {
        None => {
            ctx.reply("You are not registered yet. Send /start first.").await?;
            Ok(None)
        }
        Some(user) if user.is_blocked => {
            ctx.reply("Your account has been blocked.").await?;
            Ok(None)
        }
        Some(_) => Ok(Some(user_id)),
    }
}
