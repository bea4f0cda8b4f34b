use std::sync::Arc;

use crate::dialogue::DialogueStore;
use crate::gateway::{InboundMessage, MessagingGateway};
use crate::llm_client::CompletionService;
use crate::settings::Settings;
use crate::types::Turn;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Delivered,
    /// No reply was produced; history is unchanged.
    CompletionFailed(String),
    /// A reply was produced and recorded but could not be sent.
    DeliveryFailed(String),
}

/// Produces and delivers the reply for one inbound message.
pub struct ConversationHandler {
    settings: Arc<Settings>,
    dialogues: Arc<DialogueStore>,
    completion: Arc<dyn CompletionService>,
    gateway: Arc<dyn MessagingGateway>,
    history_window: usize,
}

impl ConversationHandler {
    pub fn new(
        settings: Arc<Settings>,
        dialogues: Arc<DialogueStore>,
        completion: Arc<dyn CompletionService>,
        gateway: Arc<dyn MessagingGateway>,
        history_window: usize,
    ) -> Self {
        Self {
            settings,
            dialogues,
            completion,
            gateway,
            history_window,
        }
    }

    pub async fn handle(&self, message: &InboundMessage) -> ReplyOutcome {
        let conversation = message.conversation;
        let instructions = self.settings.get_system_instructions();

        // Held until the reply is sent so turns and replies of one
        // conversation never interleave.
        let mut history = self.dialogues.lock(conversation).await;
        let prompt = build_prompt(
            &instructions,
            history.recent(self.history_window),
            &message.text,
        );

        let reply = match self.completion.complete(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Completion failed for chat {}: {:#}", conversation, e);
                return ReplyOutcome::CompletionFailed(format!("{:#}", e));
            }
        };

        history.push(Turn::user(message.text.clone()));
        history.push(Turn::assistant(reply.clone()));

        match self.gateway.send_message(conversation, &reply).await {
            Ok(()) => {
                tracing::info!("Reply sent to chat {}", conversation);
                ReplyOutcome::Delivered
            }
            Err(e) => {
                tracing::warn!(
                    "Reply to chat {} could not be delivered (kept in history): {:#}",
                    conversation,
                    e
                );
                ReplyOutcome::DeliveryFailed(format!("{:#}", e))
            }
        }
    }
}

/// System turn, then the history window, then the new user turn.
pub fn build_prompt(instructions: &str, window: Vec<Turn>, user_text: &str) -> Vec<Turn> {
    let mut prompt = Vec::with_capacity(window.len() + 2);
    prompt.push(Turn::system(instructions));
    prompt.extend(window);
    prompt.push(Turn::user(user_text));
    prompt
}
