//! Telegram Bot API gateway.
//!
//! Inbound messages arrive through `getUpdates` long polling. Every chat that
//! writes to the bot is remembered so operators can list it as a broadcast
//! target; the Bot API has no call that enumerates a bot's chats.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{InboundMessage, MessagingGateway};
use crate::config::CourierConfig;
use crate::http_client::build_http_client;
use crate::types::{ConversationId, ConversationInfo, TargetKind};

/// Telegram rejects `sendMessage` text longer than this many characters.
const MAX_MESSAGE_CHARS: usize = 4096;

const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct TelegramUser {
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    title: Option<String>,
    username: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
}

impl TelegramChat {
    fn info(&self) -> ConversationInfo {
        ConversationInfo {
            id: ConversationId::new(self.id),
            kind: chat_kind(&self.kind),
            display_name: self.display_name(),
        }
    }

    fn display_name(&self) -> String {
        if let Some(title) = non_blank(self.title.as_deref()) {
            return title.to_string();
        }

        let full_name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .filter_map(non_blank)
            .collect::<Vec<_>>()
            .join(" ");
        if !full_name.is_empty() {
            return full_name;
        }

        if let Some(username) = non_blank(self.username.as_deref()) {
            return format!("@{}", username);
        }

        self.id.to_string()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn chat_kind(raw: &str) -> TargetKind {
    match raw {
        "private" => TargetKind::User,
        "group" | "supergroup" => TargetKind::Group,
        "channel" => TargetKind::Channel,
        _ => TargetKind::Unknown,
    }
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

pub struct TelegramGateway {
    api_base: String,
    client: reqwest::Client,
    poll_timeout_secs: u64,
    known: Mutex<HashMap<ConversationId, ConversationInfo>>,
}

impl TelegramGateway {
    pub fn new(api_url: &str, token: &str, poll_timeout_secs: u64) -> Result<Self> {
        // The HTTP timeout has to outlive a full long-poll round.
        let client = build_http_client(Some(Duration::from_secs(poll_timeout_secs + 15)))?;
        Ok(Self {
            api_base: format!("{}/bot{}", api_url.trim_end_matches('/'), token.trim()),
            client,
            poll_timeout_secs,
            known: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &CourierConfig) -> Result<Self> {
        let token = config
            .telegram_bot_token
            .as_deref()
            .context("TELEGRAM_BOT_TOKEN is not set")?;
        Self::new(
            &config.telegram_api_url,
            token,
            config.telegram_poll_timeout_secs,
        )
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let url = format!("{}/{}", self.api_base, method);
        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .with_context(|| format!("Telegram {} request failed", method))?;

        let status = response.status();
        let body: TelegramResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Telegram {} returned unreadable body (HTTP {})", method, status))?;

        unwrap_response(method, body)
    }

    fn remember(&self, info: ConversationInfo) {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.insert(info.id, info);
    }

    async fn poll_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            serde_json::json!({
                "offset": offset,
                "timeout": self.poll_timeout_secs,
                "allowed_updates": ["message"]
            }),
        )
        .await
    }
}

fn unwrap_response<T>(method: &str, body: TelegramResponse<T>) -> Result<T> {
    if !body.ok {
        anyhow::bail!(
            "Telegram {} failed: {}",
            method,
            body.description.as_deref().unwrap_or("no description")
        );
    }
    body.result
        .with_context(|| format!("Telegram {} returned no result", method))
}

/// Turn one update into an inbound message, skipping non-message updates and
/// messages written by bots.
fn inbound_from_update(update: Update) -> Option<(ConversationInfo, InboundMessage)> {
    let message = update.message?;
    if message.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
        return None;
    }
    let info = message.chat.info();
    let inbound = InboundMessage::new(info.id, message.text.unwrap_or_default());
    Some((info, inbound))
}

/// Split `text` into chunks of at most `max_chars` characters. Always yields
/// at least one chunk.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(max_chars.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn send_message(&self, to: ConversationId, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let _: serde_json::Value = self
                .call(
                    "sendMessage",
                    serde_json::json!({ "chat_id": to.get(), "text": chunk }),
                )
                .await?;
        }
        tracing::debug!("Telegram: sent message to chat {}", to);
        Ok(())
    }

    async fn lookup(&self, id: ConversationId) -> Result<ConversationInfo> {
        let chat: TelegramChat = self
            .call("getChat", serde_json::json!({ "chat_id": id.get() }))
            .await?;
        let info = chat.info();
        self.remember(info.clone());
        Ok(info)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationInfo>> {
        let known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        let mut conversations: Vec<ConversationInfo> = known.values().cloned().collect();
        conversations.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then(a.id.get().cmp(&b.id.get()))
        });
        Ok(conversations)
    }

    async fn listen(&self, inbound: flume::Sender<InboundMessage>) -> Result<()> {
        tracing::info!("Telegram: long polling for updates");
        let mut offset: i64 = 0;

        loop {
            let updates = match self.poll_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    tracing::warn!("Telegram getUpdates error: {:#}", e);
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);

                let Some((info, message)) = inbound_from_update(update) else {
                    continue;
                };

                tracing::info!(
                    "Telegram [chat {}]: {} char(s)",
                    message.conversation,
                    message.text.chars().count()
                );
                self.remember(info);

                if inbound.send_async(message).await.is_err() {
                    tracing::info!("Telegram: inbound receiver closed, stopping listener");
                    return Ok(());
                }
            }
        }
    }
}
