//! Messaging platform boundary: inbound delivery plus outbound send/lookup.

pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, ConversationInfo};

pub use telegram::TelegramGateway;

/// A message received from a conversation. `text` is empty for
/// non-text messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub conversation: ConversationId,
    pub text: String,
}

impl InboundMessage {
    pub fn new(conversation: ConversationId, text: impl Into<String>) -> Self {
        Self {
            conversation,
            text: text.into(),
        }
    }
}

#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send_message(&self, to: ConversationId, text: &str) -> Result<()>;

    /// Kind and display name of a conversation.
    async fn lookup(&self, id: ConversationId) -> Result<ConversationInfo>;

    /// Conversations reachable from the account, for picking broadcast targets.
    async fn list_conversations(&self) -> Result<Vec<ConversationInfo>>;

    /// Forward inbound messages into `inbound` until the receiver is dropped.
    async fn listen(&self, inbound: flume::Sender<InboundMessage>) -> Result<()>;
}
