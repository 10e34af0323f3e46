use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use teloxide::types::{Update, UpdateKind};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::api::{BotApi, BotIdentity};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::{CommandContext, CommandHandler, CommandRegistry, Deps};

/// How many recent update ids are remembered for redelivery suppression.
const RECENT_UPDATE_WINDOW: usize = 1024;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// Result of dispatching a single update.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Completed { command: String },
    /// Not a command, or no handler bound to it.
    Ignored { reason: String },
    /// The update id was already accepted once.
    Duplicate,
    Failed { command: String, error: String },
    Panicked { command: String, message: String },
}

impl DispatchOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }

    /// The handler failure carried by this outcome, if any.
    pub fn error(&self) -> Option<GatewayError> {
        match self {
            Self::Failed { command, error } => Some(GatewayError::Handler {
                command: command.clone(),
                message: error.clone(),
            }),
            Self::Panicked { command, message } => Some(GatewayError::Handler {
                command: command.clone(),
                message: format!("panicked: {}", message),
            }),
            _ => None,
        }
    }

    fn log(&self, update_id: u32) {
        match self {
            Self::Completed { command } => debug!("Update {} handled by /{}", update_id, command),
            Self::Ignored { reason } => debug!("Update {} ignored: {}", update_id, reason),
            Self::Duplicate => info!("Update {} already accepted, skipping redelivery", update_id),
            Self::Failed { .. } | Self::Panicked { .. } => {
                if let Some(err) = self.error() {
                    error!(update_id, "{}", err);
                }
            }
        }
    }
}

/// A routed update, ready to run.
struct Dispatch {
    handler: Arc<dyn CommandHandler>,
    ctx: CommandContext,
}

impl Dispatch {
    async fn run(self) -> DispatchOutcome {
        let command = self.ctx.command.clone();
        let handler = self.handler;
        match AssertUnwindSafe(handler.handle(self.ctx)).catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Completed { command },
            Ok(Err(e)) => DispatchOutcome::Failed {
                command,
                error: format!("{:#}", e),
            },
            Err(panic) => DispatchOutcome::Panicked {
                command,
                message: panic_message(panic.as_ref()),
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Bounded memory of accepted update ids.
struct RecentUpdates {
    order: VecDeque<u32>,
    seen: HashSet<u32>,
}

impl RecentUpdates {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(RECENT_UPDATE_WINDOW),
            seen: HashSet::with_capacity(RECENT_UPDATE_WINDOW),
        }
    }

    /// Returns false if the id was already recorded.
    fn insert(&mut self, id: u32) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > RECENT_UPDATE_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Split `/cmd@bot arg1 arg2` into the command name and its arguments.
/// Commands addressed to a different bot yield None.
pub fn parse_command(text: &str, bot_username: Option<&str>) -> Option<(String, Vec<String>)> {
    let mut tokens = text.split_whitespace();
    let head = tokens.next()?.strip_prefix('/')?;
    let (name, target) = match head.split_once('@') {
        Some((name, target)) => (name, Some(target)),
        None => (head, None),
    };
    if name.is_empty() {
        return None;
    }
    if let (Some(target), Some(me)) = (target, bot_username) {
        if !target.eq_ignore_ascii_case(me) {
            return None;
        }
    }
    Some((
        name.to_lowercase(),
        tokens.map(str::to_string).collect(),
    ))
}

/// Owns the upstream client, the dispatch table and the lifecycle.
pub struct BotRuntime {
    api: Arc<dyn BotApi>,
    state: RwLock<RuntimeState>,
    identity: RwLock<Option<BotIdentity>>,
    registry: RwLock<CommandRegistry>,
    tasks: TaskTracker,
    recent: Mutex<RecentUpdates>,
    drain_timeout: Duration,
}

impl BotRuntime {
    pub fn new(api: Arc<dyn BotApi>) -> Self {
        Self {
            api,
            state: RwLock::new(RuntimeState::Uninitialized),
            identity: RwLock::new(None),
            registry: RwLock::new(CommandRegistry::new()),
            tasks: TaskTracker::new(),
            recent: Mutex::new(RecentUpdates::new()),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RuntimeState::Running
    }

    /// True between a successful `initialize` and `stop`.
    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state(),
            RuntimeState::Initializing | RuntimeState::Running
        )
    }

    pub fn identity(&self) -> Option<BotIdentity> {
        self.identity.read().clone()
    }

    /// The outbound client, available only while initialized.
    pub fn client(&self) -> GatewayResult<Arc<dyn BotApi>> {
        if !self.is_initialized() {
            return Err(GatewayError::not_initialized());
        }
        Ok(self.api.clone())
    }

    pub fn command_names(&self) -> Vec<String> {
        self.registry
            .read()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn transition(&self, from: &[RuntimeState], to: RuntimeState) -> GatewayResult<()> {
        let mut state = self.state.write();
        if !from.contains(&*state) {
            return Err(GatewayError::InvalidTransition { from: *state, to });
        }
        debug!("Runtime state {:?} -> {:?}", *state, to);
        *state = to;
        Ok(())
    }

    /// Bind a command. Only allowed before the runtime starts.
    pub fn register(
        &self,
        name: &str,
        handler: impl CommandHandler + 'static,
        deps: Deps,
    ) -> GatewayResult<()> {
        let state = self.state.read();
        if !matches!(
            *state,
            RuntimeState::Uninitialized | RuntimeState::Initializing
        ) {
            return Err(GatewayError::InvalidTransition {
                from: *state,
                to: RuntimeState::Running,
            });
        }
        self.registry.write().register(name, handler, deps)
    }

    /// Verify the credentials with `getMe`. Fails without changing state.
    pub async fn initialize(&self) -> GatewayResult<()> {
        if self.state() != RuntimeState::Uninitialized {
            return Err(GatewayError::InvalidTransition {
                from: self.state(),
                to: RuntimeState::Initializing,
            });
        }
        let me = self.api.get_me().await?;
        info!(
            "Authenticated as @{} ({})",
            me.username.as_deref().unwrap_or("?"),
            me.id
        );
        *self.identity.write() = Some(me);
        self.transition(&[RuntimeState::Uninitialized], RuntimeState::Initializing)
    }

    pub fn start(&self) -> GatewayResult<()> {
        self.transition(&[RuntimeState::Initializing], RuntimeState::Running)?;
        if self.registry.read().is_empty() {
            warn!("Bot runtime started with no commands; every update will be ignored");
        }
        info!(
            "Bot runtime running with {} commands",
            self.registry.read().len()
        );
        Ok(())
    }

    /// Accept an update for asynchronous dispatch. Returns as soon as the
    /// dispatch task is spawned; the handler outcome is only logged.
    pub fn process_update(&self, update: Update) -> GatewayResult<()> {
        if !self.is_running() {
            return Err(GatewayError::not_running());
        }
        let update_id = update.id.0;
        if !self.recent.lock().insert(update_id) {
            DispatchOutcome::Duplicate.log(update_id);
            return Ok(());
        }
        match self.route(update) {
            Ok(dispatch) => {
                self.tasks.spawn(async move {
                    let outcome = dispatch.run().await;
                    outcome.log(update_id);
                });
            }
            Err(outcome) => outcome.log(update_id),
        }
        Ok(())
    }

    /// Dispatch an update and wait for the handler to finish.
    pub async fn dispatch(&self, update: Update) -> GatewayResult<DispatchOutcome> {
        if !self.is_running() {
            return Err(GatewayError::not_running());
        }
        let update_id = update.id.0;
        if !self.recent.lock().insert(update_id) {
            return Ok(DispatchOutcome::Duplicate);
        }
        let outcome = match self.route(update) {
            Ok(dispatch) => dispatch.run().await,
            Err(outcome) => outcome,
        };
        outcome.log(update_id);
        Ok(outcome)
    }

    fn route(&self, update: Update) -> Result<Dispatch, DispatchOutcome> {
        let update_id = update.id.0;
        let message = match update.kind {
            UpdateKind::Message(message) | UpdateKind::EditedMessage(message) => message,
            _ => return Err(DispatchOutcome::ignored("not a message")),
        };
        let Some(text) = message.text() else {
            return Err(DispatchOutcome::ignored("no text"));
        };

        let username = self
            .identity
            .read()
            .as_ref()
            .and_then(|me| me.username.clone());
        let Some((command, args)) = parse_command(text, username.as_deref()) else {
            return Err(DispatchOutcome::ignored("not a command for this bot"));
        };

        let binding = match self.registry.read().resolve(&command) {
            Some(binding) => binding.clone(),
            None => return Err(DispatchOutcome::ignored(format!("unknown command /{}", command))),
        };

        Ok(Dispatch {
            handler: binding.handler,
            ctx: CommandContext {
                update_id,
                command: binding.name,
                args,
                message,
                bot_username: username,
                api: self.api.clone(),
                deps: binding.deps,
            },
        })
    }

    /// Stop intake and drain in-flight dispatches, best effort. Idempotent;
    /// a runtime that never started goes straight to Stopped.
    pub async fn stop(&self) -> GatewayResult<()> {
        match self.state() {
            RuntimeState::Stopping | RuntimeState::Stopped => return Ok(()),
            RuntimeState::Running => {
                self.transition(&[RuntimeState::Running], RuntimeState::Stopping)?;
            }
            RuntimeState::Uninitialized | RuntimeState::Initializing => {
                self.tasks.close();
                return self.transition(
                    &[RuntimeState::Uninitialized, RuntimeState::Initializing],
                    RuntimeState::Stopped,
                );
            }
        }

        info!("Stopping bot runtime, {} dispatches in flight", self.tasks.len());
        self.tasks.close();
        if tokio::time::timeout(self.drain_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "Drain timed out after {:?}, abandoning {} dispatches",
                self.drain_timeout,
                self.tasks.len()
            );
        }
        self.transition(&[RuntimeState::Stopping], RuntimeState::Stopped)
    }

    /// Stop if needed, then release the upstream identity. Idempotent.
    pub async fn shutdown(&self) -> GatewayResult<()> {
        self.stop().await?;
        if self.identity.write().take().is_some() {
            info!("Bot runtime shut down");
        }
        Ok(())
    }
}
