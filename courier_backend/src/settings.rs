//! Resolution of the operator-editable settings.
//!
//! Every read goes to the configuration store and falls back to the static
//! defaults from [`CourierConfig`] when nothing is persisted or the store is
//! unreachable. Nothing is cached, so a saved change is visible to the very
//! next message or broadcast run.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CourierConfig;
use crate::database::ConfigStore;
use crate::error::StoreError;
use crate::types::{AgentSettings, BroadcastSettings, ConversationId};

/// Static fallbacks used when the store holds no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsDefaults {
    pub system_instructions: String,
    pub broadcast_targets: String,
    pub broadcast_start_message: String,
}

impl SettingsDefaults {
    pub fn from_config(config: &CourierConfig) -> Self {
        Self {
            system_instructions: config.system_prompt.clone(),
            broadcast_targets: config.broadcast_targets.clone(),
            broadcast_start_message: config.broadcast_start_message.clone(),
        }
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingSource {
    Persisted,
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsStatus {
    pub store_available: bool,
    pub instructions_source: SettingSource,
    pub broadcast_source: SettingSource,
    pub settings: AgentSettings,
}

/// Result of parsing a delimited target list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetList {
    pub ids: Vec<ConversationId>,
    /// Tokens that were not integer ids, in input order.
    pub rejected: Vec<String>,
}

/// Parse a comma, semicolon or newline separated list of conversation ids.
///
/// Blank tokens are skipped, malformed tokens are reported and dropped, and
/// duplicates keep their first position.
pub fn parse_target_list(raw: &str) -> TargetList {
    let mut list = TargetList::default();
    let mut seen = HashSet::new();

    for token in raw.split([',', ';', '\n']) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.parse::<ConversationId>() {
            Ok(id) => {
                if seen.insert(id) {
                    list.ids.push(id);
                }
            }
            Err(e) => {
                tracing::warn!("Ignoring malformed broadcast target {:?}: {}", token, e);
                list.rejected.push(token.to_string());
            }
        }
    }

    list
}

pub struct Settings {
    store: Option<Arc<dyn ConfigStore>>,
    defaults: SettingsDefaults,
}

impl Settings {
    pub fn new(store: Option<Arc<dyn ConfigStore>>, defaults: SettingsDefaults) -> Self {
        Self { store, defaults }
    }

    pub fn store_available(&self) -> bool {
        self.store.is_some()
    }

    pub fn get_system_instructions(&self) -> String {
        self.resolve_system_instructions().0
    }

    pub fn set_system_instructions(&self, text: &str) -> Result<(), StoreError> {
        let store = self.store.as_ref().ok_or(StoreError::Unavailable)?;
        store.save_system_instructions(text)?;
        tracing::info!("System instructions updated ({} chars)", text.chars().count());
        Ok(())
    }

    pub fn get_broadcast_settings(&self) -> BroadcastSettings {
        self.resolve_broadcast_settings().0
    }

    pub fn set_broadcast_settings(&self, settings: &BroadcastSettings) -> Result<(), StoreError> {
        let store = self.store.as_ref().ok_or(StoreError::Unavailable)?;
        store.save_broadcast_settings(&settings.targets_string(), &settings.start_message)?;
        tracing::info!(
            "Broadcast settings updated ({} target(s))",
            settings.targets.len()
        );
        Ok(())
    }

    /// Parse `raw_targets` and save the result. Malformed tokens do not block
    /// the save; they are returned so the caller can show them.
    pub fn set_broadcast_settings_from_raw(
        &self,
        raw_targets: &str,
        start_message: &str,
    ) -> Result<TargetList, StoreError> {
        let parsed = parse_target_list(raw_targets);
        self.set_broadcast_settings(&BroadcastSettings {
            targets: parsed.ids.clone(),
            start_message: start_message.to_string(),
        })?;
        Ok(parsed)
    }

    pub fn snapshot(&self) -> AgentSettings {
        AgentSettings {
            system_instructions: self.get_system_instructions(),
            broadcast: self.get_broadcast_settings(),
        }
    }

    pub fn status(&self) -> SettingsStatus {
        let (system_instructions, instructions_source) = self.resolve_system_instructions();
        let (broadcast, broadcast_source) = self.resolve_broadcast_settings();
        SettingsStatus {
            store_available: self.store_available(),
            instructions_source,
            broadcast_source,
            settings: AgentSettings {
                system_instructions,
                broadcast,
            },
        }
    }

    fn resolve_system_instructions(&self) -> (String, SettingSource) {
        let persisted = self.store.as_ref().and_then(|store| {
            store
                .load_system_instructions()
                .map_err(|e| tracing::warn!("Falling back to default system instructions: {:#}", e))
                .ok()
                .flatten()
        });

        match persisted {
            Some(stored) => (stored.text, SettingSource::Persisted),
            None => (
                self.defaults.system_instructions.clone(),
                SettingSource::Default,
            ),
        }
    }

    fn resolve_broadcast_settings(&self) -> (BroadcastSettings, SettingSource) {
        let persisted = self.store.as_ref().and_then(|store| {
            store
                .load_broadcast_settings()
                .map_err(|e| tracing::warn!("Falling back to default broadcast settings: {:#}", e))
                .ok()
                .flatten()
        });

        let (raw_targets, start_message, source) = match persisted {
            Some(stored) => (
                stored.target_ids,
                stored.start_message,
                SettingSource::Persisted,
            ),
            None => (
                self.defaults.broadcast_targets.clone(),
                self.defaults.broadcast_start_message.clone(),
                SettingSource::Default,
            ),
        };

        let settings = BroadcastSettings {
            targets: parse_target_list(&raw_targets).ids,
            start_message,
        };
        (settings, source)
    }
}
