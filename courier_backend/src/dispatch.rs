//! Routes inbound messages to one worker task per conversation.
//!
//! A conversation's messages are handled strictly in arrival order by its
//! worker; different conversations are handled concurrently. Workers exit
//! after sitting idle and are respawned on the next message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use flume::{Receiver, Sender};

use crate::gateway::InboundMessage;
use crate::handler::{ConversationHandler, ReplyOutcome};
use crate::types::ConversationId;

struct Worker {
    tx: Sender<InboundMessage>,
    generation: u64,
}

type WorkerMap = Arc<Mutex<HashMap<ConversationId, Worker>>>;

pub struct InboundDispatcher {
    handler: Arc<ConversationHandler>,
    workers: WorkerMap,
    idle_timeout: Duration,
    next_generation: AtomicU64,
}

impl InboundDispatcher {
    pub fn new(handler: Arc<ConversationHandler>, idle_timeout: Duration) -> Self {
        Self {
            handler,
            workers: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Route every message from `inbound` until the channel closes.
    pub async fn run(&self, inbound: Receiver<InboundMessage>) {
        while let Ok(message) = inbound.recv_async().await {
            self.route(message);
        }
        tracing::info!("Inbound channel closed, dispatcher stopping");
    }

    pub fn route(&self, message: InboundMessage) {
        let conversation = message.conversation;
        let mut workers = lock_workers(&self.workers);

        let message = match workers.get(&conversation) {
            Some(worker) => match worker.tx.send(message) {
                Ok(()) => return,
                // The worker died without deregistering; replace it.
                Err(flume::SendError(message)) => message,
            },
            None => message,
        };

        let (tx, rx) = flume::unbounded();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        // The receiver is alive, so an unbounded send cannot fail.
        let _ = tx.send(message);
        workers.insert(conversation, Worker { tx, generation });
        drop(workers);

        tracing::debug!("Spawned worker for chat {}", conversation);
        tokio::spawn(run_worker(
            conversation,
            generation,
            rx,
            self.handler.clone(),
            self.workers.clone(),
            self.idle_timeout,
        ));
    }

    pub fn active_workers(&self) -> usize {
        lock_workers(&self.workers).len()
    }
}

fn lock_workers(workers: &WorkerMap) -> MutexGuard<'_, HashMap<ConversationId, Worker>> {
    workers.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run_worker(
    conversation: ConversationId,
    generation: u64,
    rx: Receiver<InboundMessage>,
    handler: Arc<ConversationHandler>,
    workers: WorkerMap,
    idle_timeout: Duration,
) {
    loop {
        match tokio::time::timeout(idle_timeout, rx.recv_async()).await {
            Ok(Ok(message)) => {
                if let ReplyOutcome::CompletionFailed(_) = handler.handle(&message).await {
                    tracing::debug!("Chat {}: message skipped after completion failure", conversation);
                }
            }
            Ok(Err(_)) => break,
            Err(_) => {
                // Deregister under the map lock so a concurrent route either
                // lands in our queue before we look, or spawns a new worker.
                let mut map = lock_workers(&workers);
                if !rx.is_empty() {
                    continue;
                }
                if map.get(&conversation).map(|w| w.generation) == Some(generation) {
                    map.remove(&conversation);
                }
                break;
            }
        }
    }
    tracing::debug!("Worker for chat {} exited", conversation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::{DialogueLimits, DialogueStore};
    use crate::gateway::MessagingGateway;
    use crate::settings::{Settings, SettingsDefaults};
    use crate::testing::{FakeCompletion, FakeGateway};

    fn setup(completion: FakeCompletion, idle: Duration) -> (Arc<InboundDispatcher>, Arc<FakeGateway>) {
        let settings = Settings::new(
            None,
            SettingsDefaults {
                system_instructions: "persona".to_string(),
                broadcast_targets: String::new(),
                broadcast_start_message: String::new(),
            },
        );
        let gateway = Arc::new(FakeGateway::new());
        let handler = Arc::new(ConversationHandler::new(
            Arc::new(settings),
            Arc::new(DialogueStore::new(DialogueLimits::default())),
            Arc::new(completion),
            gateway.clone(),
            10,
        ));
        (Arc::new(InboundDispatcher::new(handler, idle)), gateway)
    }

    async fn wait_for_sends(gateway: &FakeGateway, count: usize) -> Vec<(ConversationId, String)> {
        for _ in 0..200 {
            let sent = gateway.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} sends, got {:?}", count, gateway.sent());
    }

    #[tokio::test]
    async fn messages_of_one_conversation_are_answered_in_order() {
        let (dispatcher, gateway) = setup(
            FakeCompletion::with_delay(Duration::from_millis(5)),
            Duration::from_secs(5),
        );
        let a = ConversationId::new(1);
        let b = ConversationId::new(2);

        for n in 0..5 {
            dispatcher.route(InboundMessage::new(a, format!("a{}", n)));
            dispatcher.route(InboundMessage::new(b, format!("b{}", n)));
        }

        let sent = wait_for_sends(&gateway, 10).await;
        let replies_to = |id: ConversationId| -> Vec<String> {
            sent.iter()
                .filter(|(to, _)| *to == id)
                .map(|(_, text)| text.clone())
                .collect()
        };
        assert_eq!(
            replies_to(a),
            vec!["re: a0", "re: a1", "re: a2", "re: a3", "re: a4"]
        );
        assert_eq!(
            replies_to(b),
            vec!["re: b0", "re: b1", "re: b2", "re: b3", "re: b4"]
        );
        assert_eq!(dispatcher.active_workers(), 2);
    }

    #[tokio::test]
    async fn idle_workers_exit_and_are_respawned() {
        let (dispatcher, gateway) = setup(FakeCompletion::new(), Duration::from_millis(20));
        let chat = ConversationId::new(3);

        dispatcher.route(InboundMessage::new(chat, "first"));
        wait_for_sends(&gateway, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.active_workers(), 0);

        dispatcher.route(InboundMessage::new(chat, "second"));
        let sent = wait_for_sends(&gateway, 2).await;
        assert_eq!(sent[1], (chat, "re: second".to_string()));
    }

    #[tokio::test]
    async fn run_drains_the_inbound_channel() {
        let (dispatcher, gateway) = setup(FakeCompletion::new(), Duration::from_secs(5));
        let source = FakeGateway::new();
        source.queue_inbound(InboundMessage::new(ConversationId::new(9), "ping"));

        let (tx, rx) = flume::unbounded();
        source.listen(tx).await.unwrap();
        dispatcher.run(rx).await;

        let sent = wait_for_sends(&gateway, 1).await;
        assert_eq!(sent, vec![(ConversationId::new(9), "re: ping".to_string())]);
    }
}
