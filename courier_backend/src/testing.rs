//! In-memory fakes for the external collaborators, shared by unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::database::{BroadcastLog, ConfigStore, StoredBroadcastSettings, StoredInstructions};
use crate::gateway::{InboundMessage, MessagingGateway};
use crate::llm_client::CompletionService;
use crate::types::{BroadcastAttempt, ConversationId, ConversationInfo, TargetKind, Turn};

/// A configuration store whose backend is always down.
pub struct FailingStore;

impl ConfigStore for FailingStore {
    fn load_system_instructions(&self) -> Result<Option<StoredInstructions>> {
        Err(anyhow!("store offline"))
    }

    fn save_system_instructions(&self, _text: &str) -> Result<()> {
        Err(anyhow!("store offline"))
    }

    fn load_broadcast_settings(&self) -> Result<Option<StoredBroadcastSettings>> {
        Err(anyhow!("store offline"))
    }

    fn save_broadcast_settings(&self, _target_ids: &str, _start_message: &str) -> Result<()> {
        Err(anyhow!("store offline"))
    }
}

/// A broadcast log that rejects every write.
pub struct FailingLog;

impl BroadcastLog for FailingLog {
    fn append(&self, _attempt: &BroadcastAttempt) -> Result<()> {
        Err(anyhow!("log offline"))
    }

    fn recent(&self, _limit: usize) -> Result<Vec<BroadcastAttempt>> {
        Err(anyhow!("log offline"))
    }
}

/// Completion service that records every request and answers from a script.
///
/// Scripted entries are consumed in order; once the script is exhausted it
/// echoes the last user turn back as `re: <text>`.
#[derive(Default)]
pub struct FakeCompletion {
    calls: Mutex<Vec<Vec<Turn>>>,
    script: Mutex<VecDeque<Result<String, String>>>,
    delay: Option<Duration>,
}

impl FakeCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push_reply(&self, reply: &str) {
        self.script.lock().unwrap().push_back(Ok(reply.to_string()));
    }

    pub fn push_failure(&self, error: &str) {
        self.script.lock().unwrap().push_back(Err(error.to_string()));
    }

    pub fn calls(&self) -> Vec<Vec<Turn>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for FakeCompletion {
    async fn complete(&self, turns: &[Turn]) -> Result<String> {
        self.calls.lock().unwrap().push(turns.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(error)) => Err(anyhow!(error)),
            None => {
                let last = turns.last().map(Turn::text).unwrap_or_default();
                Ok(format!("re: {}", last))
            }
        }
    }
}

/// Messaging gateway that records sends and fails for configured ids.
#[derive(Default)]
pub struct FakeGateway {
    sent: Mutex<Vec<(ConversationId, String)>>,
    failing_sends: Mutex<HashSet<ConversationId>>,
    failing_lookups: Mutex<HashSet<ConversationId>>,
    known: Mutex<Vec<ConversationInfo>>,
    inbound: Mutex<Vec<InboundMessage>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends_to(&self, id: ConversationId) {
        self.failing_sends.lock().unwrap().insert(id);
    }

    pub fn fail_lookups_for(&self, id: ConversationId) {
        self.failing_lookups.lock().unwrap().insert(id);
    }

    pub fn add_known(&self, info: ConversationInfo) {
        self.known.lock().unwrap().push(info);
    }

    /// Messages handed to the sender when `listen` is called.
    pub fn queue_inbound(&self, message: InboundMessage) {
        self.inbound.lock().unwrap().push(message);
    }

    pub fn sent(&self) -> Vec<(ConversationId, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingGateway for FakeGateway {
    async fn send_message(&self, to: ConversationId, text: &str) -> Result<()> {
        if self.failing_sends.lock().unwrap().contains(&to) {
            return Err(anyhow!("chat {} not found", to));
        }
        self.sent.lock().unwrap().push((to, text.to_string()));
        Ok(())
    }

    async fn lookup(&self, id: ConversationId) -> Result<ConversationInfo> {
        if self.failing_lookups.lock().unwrap().contains(&id) {
            return Err(anyhow!("lookup of {} failed", id));
        }
        let known = self.known.lock().unwrap();
        Ok(known
            .iter()
            .find(|info| info.id == id)
            .cloned()
            .unwrap_or_else(|| ConversationInfo {
                id,
                kind: TargetKind::User,
                display_name: format!("user {}", id),
            }))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationInfo>> {
        Ok(self.known.lock().unwrap().clone())
    }

    async fn listen(&self, inbound: flume::Sender<InboundMessage>) -> Result<()> {
        let queued: Vec<InboundMessage> = self.inbound.lock().unwrap().drain(..).collect();
        for message in queued {
            if inbound.send_async(message).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
