use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::MissingCredentials;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    // Telegram Bot API
    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default = "default_telegram_poll_timeout_secs")]
    pub telegram_poll_timeout_secs: u64,

    // LLM configuration (OpenAI-compatible)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    // Static defaults for the operator-editable settings
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub broadcast_targets: String,
    #[serde(default)]
    pub broadcast_start_message: String,
    #[serde(default)]
    pub broadcast_on_startup: bool,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Dialogue memory
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
    #[serde(default = "default_dialogue_idle_ttl_secs")]
    pub dialogue_idle_ttl_secs: u64,
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,

    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_poll_timeout_secs() -> u64 {
    30
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_system_prompt() -> String {
    "You are a friendly Telegram agent. Answer briefly and to the point.".to_string()
}

fn default_database_path() -> String {
    "courier.db".to_string()
}

fn default_history_window() -> usize {
    10
}

fn default_history_retention() -> usize {
    40
}

fn default_dialogue_idle_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_conversations() -> usize {
    10_000
}

fn default_admin_bind() -> String {
    "127.0.0.1:8788".to_string()
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            telegram_api_url: default_telegram_api_url(),
            telegram_bot_token: None,
            telegram_poll_timeout_secs: default_telegram_poll_timeout_secs(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_timeout_secs: default_llm_timeout_secs(),
            system_prompt: default_system_prompt(),
            broadcast_targets: String::new(),
            broadcast_start_message: String::new(),
            broadcast_on_startup: false,
            database_path: default_database_path(),
            history_window: default_history_window(),
            history_retention: default_history_retention(),
            dialogue_idle_ttl_secs: default_dialogue_idle_ttl_secs(),
            max_conversations: default_max_conversations(),
            admin_bind: default_admin_bind(),
        }
    }
}

impl CourierConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("courier_config.toml")
    }

    /// Load config from courier_config.toml (next to executable), then apply
    /// environment overrides.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<CourierConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::default()
            }
        };

        config.apply_env(|key| env::var(key).ok());
        config
    }

    /// Defaults plus environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok());
        config
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("TELEGRAM_API_URL") {
            self.telegram_api_url = url;
        }

        if let Some(token) = non_empty("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = Some(token.trim().to_string());
        }

        if let Some(secs) = non_empty("TELEGRAM_POLL_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok())
        {
            self.telegram_poll_timeout_secs = secs;
        }

        if let Some(url) = non_empty("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(model) = non_empty("LLM_MODEL").or_else(|| non_empty("OPENAI_MODEL")) {
            self.llm_model = model;
        }

        if let Some(key) = non_empty("LLM_API_KEY").or_else(|| non_empty("OPENAI_API_KEY")) {
            self.llm_api_key = Some(key.trim().to_string());
        }

        if let Some(secs) = non_empty("LLM_TIMEOUT_SECS").and_then(|v| v.trim().parse().ok()) {
            self.llm_timeout_secs = secs;
        }

        if let Some(prompt) = non_empty("SYSTEM_PROMPT") {
            self.system_prompt = prompt;
        }

        if let Some(targets) = lookup("TARGET_IDS") {
            self.broadcast_targets = targets;
        }

        if let Some(message) = lookup("START_MESSAGE") {
            self.broadcast_start_message = message;
        }

        if let Some(enabled) = non_empty("COURIER_BROADCAST_ON_STARTUP") {
            self.broadcast_on_startup = parse_flag(&enabled);
        }

        if let Some(path) = non_empty("COURIER_DATABASE_PATH") {
            self.database_path = path;
        }

        if let Some(window) = non_empty("COURIER_HISTORY_WINDOW").and_then(|v| v.trim().parse().ok())
        {
            self.history_window = window;
        }

        if let Some(retention) =
            non_empty("COURIER_HISTORY_RETENTION").and_then(|v| v.trim().parse().ok())
        {
            self.history_retention = retention;
        }

        if let Some(secs) =
            non_empty("COURIER_DIALOGUE_IDLE_TTL_SECS").and_then(|v| v.trim().parse().ok())
        {
            self.dialogue_idle_ttl_secs = secs;
        }

        if let Some(max) = non_empty("COURIER_MAX_CONVERSATIONS").and_then(|v| v.trim().parse().ok())
        {
            self.max_conversations = max;
        }

        if let Some(bind) = non_empty("COURIER_ADMIN_BIND") {
            self.admin_bind = bind;
        }
    }

    /// Names of the mandatory credentials that are absent or blank.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if is_blank(self.telegram_bot_token.as_deref()) {
            missing.push("TELEGRAM_BOT_TOKEN");
        }
        if is_blank(self.llm_api_key.as_deref()) {
            missing.push("LLM_API_KEY");
        }
        missing
    }

    pub fn ensure_credentials(&self) -> Result<(), MissingCredentials> {
        let missing = self.missing_credentials();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MissingCredentials(missing))
        }
    }

    /// Retained turns per conversation; never below the window sent to the
    /// completion service.
    pub fn effective_history_retention(&self) -> usize {
        self.history_retention.max(self.history_window)
    }

    pub fn dialogue_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.dialogue_idle_ttl_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}
