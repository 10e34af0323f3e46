//! Process lifecycle: bring services up in order, serve, tear down in reverse.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tracing::{error, info, warn};

use crate::api::{BotApi, TelegramApi};
use crate::commands;
use crate::config::Config;
use crate::control::WebhookControl;
use crate::db::Database;
use crate::registry::Deps;
use crate::runtime::BotRuntime;
use crate::server::{self, AppState};

pub struct Supervisor {
    config: Config,
    db: Database,
    runtime: Arc<BotRuntime>,
    state: Arc<AppState>,
}

impl Supervisor {
    pub fn new(config: Config, api: Arc<dyn BotApi>, db: Database) -> Self {
        let runtime =
            Arc::new(BotRuntime::new(api).with_drain_timeout(config.webhook.drain_timeout()));
        let control = WebhookControl::new(
            runtime.clone(),
            &config.webhook,
            config.telegram.admin_user_id,
        );
        let state = Arc::new(AppState {
            runtime: runtime.clone(),
            control,
        });
        Self {
            config,
            db,
            runtime,
            state,
        }
    }

    pub fn runtime(&self) -> &Arc<BotRuntime> {
        &self.runtime
    }

    pub fn router(&self) -> Router {
        server::router(self.state.clone(), self.config.webhook.ack_timeout())
    }

    /// Initialize the bot, bind commands, start the runtime, then register the
    /// webhook if a public URL is configured. Any failure tears down what was
    /// already started.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.bring_up().await {
            error!("Startup failed: {:#}", e);
            if let Err(e) = self.runtime.shutdown().await {
                warn!("Cleanup after failed startup: {}", e);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn bring_up(&self) -> Result<()> {
        self.runtime
            .initialize()
            .await
            .context("Failed to initialize bot, check the bot token")?;

        let deps = Deps {
            db: self.db.clone(),
            admin_id: self.config.telegram.admin_user_id,
        };
        commands::register_all(&self.runtime, &deps).context("Failed to register commands")?;
        self.runtime.start()?;

        match self.config.webhook.base_url() {
            Some(base_url) => {
                self.state
                    .control
                    .register(base_url)
                    .await
                    .context("Failed to register webhook")?;
            }
            None => warn!(
                "WEBHOOK_URL not set; serving without a registered webhook. \
                 Call POST /set_webhook to register one."
            ),
        }
        Ok(())
    }

    /// Stop intake, drain dispatches and release the bot. The database is
    /// released when the supervisor drops.
    pub async fn shutdown(&self) -> Result<()> {
        self.runtime.stop().await?;
        self.runtime.shutdown().await?;
        if self.state.control.registered_url().is_some() {
            info!("Webhook left registered; Telegram queues updates until the next start");
        }
        info!("Bot runtime stopped");
        Ok(())
    }
}

pub async fn run(config: Config) -> Result<()> {
    let db = Database::open(&config.database.path)?;
    let api = Arc::new(TelegramApi::new(&config.telegram.bot_token));
    let port = config.webhook.port;
    let supervisor = Supervisor::new(config, api, db);

    supervisor.start().await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let served = serve(&supervisor, addr).await;

    supervisor.shutdown().await?;
    drop(supervisor);
    info!("Shutdown complete");
    served
}

async fn serve(supervisor: &Supervisor, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, supervisor.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
