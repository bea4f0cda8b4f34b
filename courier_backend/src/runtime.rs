use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::broadcast::BroadcastOrchestrator;
use crate::config::CourierConfig;
use crate::database::{BroadcastLog, ConfigStore, CourierDatabase};
use crate::dialogue::{DialogueLimits, DialogueStore};
use crate::dispatch::InboundDispatcher;
use crate::gateway::{MessagingGateway, TelegramGateway};
use crate::handler::ConversationHandler;
use crate::llm_client::{CompletionService, LlmClient};
use crate::server::{serve_admin, AdminState};
use crate::settings::{Settings, SettingsDefaults};

/// Conversation workers exit after this long without a message.
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct CourierRuntime {
    pub config: CourierConfig,
    pub database: Option<Arc<CourierDatabase>>,
    pub settings: Arc<Settings>,
    pub dialogues: Arc<DialogueStore>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub handler: Arc<ConversationHandler>,
    pub broadcaster: Arc<BroadcastOrchestrator>,
}

pub struct CourierRuntimeBuilder {
    config: CourierConfig,
    gateway: Option<Arc<dyn MessagingGateway>>,
    completion: Option<Arc<dyn CompletionService>>,
}

impl CourierRuntimeBuilder {
    pub fn new(config: CourierConfig) -> Self {
        Self {
            config,
            gateway: None,
            completion: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn MessagingGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionService>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn build(self) -> Result<CourierRuntime> {
        let config = self.config;
        config.ensure_credentials()?;

        let database = match CourierDatabase::new(&config.database_path) {
            Ok(db) => Some(Arc::new(db)),
            Err(e) => {
                tracing::warn!(
                    "Failed to open database {:?}, running on defaults only: {:#}",
                    config.database_path,
                    e
                );
                None
            }
        };
        let store = database.clone().map(|db| db as Arc<dyn ConfigStore>);
        let log = database.clone().map(|db| db as Arc<dyn BroadcastLog>);

        let settings = Arc::new(Settings::new(store, SettingsDefaults::from_config(&config)));

        let gateway: Arc<dyn MessagingGateway> = match self.gateway {
            Some(gateway) => gateway,
            None => Arc::new(
                TelegramGateway::from_config(&config)
                    .context("Failed to initialize Telegram gateway")?,
            ),
        };

        let completion: Arc<dyn CompletionService> = match self.completion {
            Some(completion) => completion,
            None => Arc::new(
                LlmClient::new(
                    config.llm_api_url.clone(),
                    config.llm_api_key.clone().unwrap_or_default(),
                    config.llm_model.clone(),
                    Some(config.llm_timeout()),
                )
                .context("Failed to initialize LLM client")?,
            ),
        };

        let dialogues = Arc::new(DialogueStore::new(DialogueLimits {
            retention: config.effective_history_retention(),
            max_conversations: config.max_conversations.max(1),
            idle_ttl: config.dialogue_idle_ttl(),
        }));

        let handler = Arc::new(ConversationHandler::new(
            settings.clone(),
            dialogues.clone(),
            completion,
            gateway.clone(),
            config.history_window,
        ));

        let broadcaster = Arc::new(BroadcastOrchestrator::new(
            settings.clone(),
            gateway.clone(),
            log,
        ));

        tracing::info!(
            "Courier runtime ready (model: {}, history window: {}, store: {})",
            config.llm_model,
            config.history_window,
            if database.is_some() { "sqlite" } else { "defaults only" }
        );

        Ok(CourierRuntime {
            config,
            database,
            settings,
            dialogues,
            gateway,
            handler,
            broadcaster,
        })
    }
}

impl CourierRuntime {
    pub fn bootstrap(config: CourierConfig) -> Result<Self> {
        CourierRuntimeBuilder::new(config).build()
    }

    /// Start the gateway listener, the inbound dispatcher, the dialogue
    /// sweeper and, if enabled, the startup broadcast.
    pub fn spawn_services(&self) -> Vec<JoinHandle<()>> {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let mut handles = Vec::new();

        let gateway = self.gateway.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = gateway.listen(inbound_tx).await {
                tracing::error!("Gateway listener stopped: {:#}", e);
            }
        }));

        let dispatcher = InboundDispatcher::new(self.handler.clone(), WORKER_IDLE_TIMEOUT);
        handles.push(tokio::spawn(async move {
            dispatcher.run(inbound_rx).await;
        }));

        handles.push(
            self.dialogues
                .spawn_sweeper(sweep_interval(self.config.dialogue_idle_ttl())),
        );

        if self.config.broadcast_on_startup {
            let broadcaster = self.broadcaster.clone();
            handles.push(tokio::spawn(async move {
                match broadcaster.run().await {
                    Ok(summary) => tracing::info!(
                        "Startup broadcast done: {}/{} delivered",
                        summary.succeeded,
                        summary.total
                    ),
                    Err(e) if e.is_precondition() => {
                        tracing::info!("Startup broadcast skipped: {}", e)
                    }
                    Err(e) => tracing::warn!("Startup broadcast failed: {}", e),
                }
            }));
        }

        handles
    }

    pub fn admin_state(&self) -> Arc<AdminState> {
        Arc::new(AdminState {
            settings: self.settings.clone(),
            gateway: self.gateway.clone(),
            broadcaster: self.broadcaster.clone(),
        })
    }

    /// Run every service and serve the admin API until it fails.
    pub async fn run(self) -> Result<()> {
        let _services = self.spawn_services();
        serve_admin(self.admin_state(), &self.config.admin_bind).await
    }
}

fn sweep_interval(idle_ttl: Duration) -> Duration {
    (idle_ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(10 * 60))
}
