//! In-memory dialogue state, one bounded history per conversation.
//!
//! The outer map is behind a `std::sync::Mutex` that is only held for map
//! bookkeeping. Each history sits behind its own `tokio::sync::Mutex`, which
//! a caller holds for the whole read-complete-append cycle of one message.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::{ConversationId, Turn};

/// Ordered turns of one conversation, oldest first, capped at `retention`.
#[derive(Debug, Clone)]
pub struct DialogueHistory {
    turns: VecDeque<Turn>,
    retention: usize,
}

impl DialogueHistory {
    pub fn new(retention: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append at the end, dropping the oldest turns beyond retention.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.retention {
            self.turns.pop_front();
        }
    }

    /// The last `n` turns in original order; fewer if the history is shorter.
    pub fn recent(&self, n: usize) -> Vec<Turn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DialogueLimits {
    /// Turns kept per conversation.
    pub retention: usize,
    /// Conversations tracked at once; the least recently active one is
    /// dropped to make room.
    pub max_conversations: usize,
    /// Conversations idle longer than this are dropped by `evict_idle`.
    pub idle_ttl: Duration,
}

impl Default for DialogueLimits {
    fn default() -> Self {
        Self {
            retention: 40,
            max_conversations: 10_000,
            idle_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

struct Slot {
    history: Arc<AsyncMutex<DialogueHistory>>,
    last_active: Instant,
}

impl Slot {
    /// Nobody outside the store holds a handle to this history.
    fn is_unheld(&self) -> bool {
        Arc::strong_count(&self.history) == 1
    }
}

pub struct DialogueStore {
    slots: Mutex<HashMap<ConversationId, Slot>>,
    limits: DialogueLimits,
}

impl DialogueStore {
    pub fn new(limits: DialogueLimits) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            limits,
        }
    }

    pub fn limits(&self) -> DialogueLimits {
        self.limits
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationId, Slot>> {
        // A poisoned map only means a panic happened mid-bookkeeping; the map
        // itself is still structurally valid.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle to the conversation's history, created empty on first access.
    pub fn get_or_create(&self, id: ConversationId) -> Arc<AsyncMutex<DialogueHistory>> {
        let now = Instant::now();
        let mut slots = self.lock_slots();

        if let Some(slot) = slots.get_mut(&id) {
            slot.last_active = now;
            return slot.history.clone();
        }

        if slots.len() >= self.limits.max_conversations {
            evict_least_recent(&mut slots);
        }

        let history = Arc::new(AsyncMutex::new(DialogueHistory::new(self.limits.retention)));
        slots.insert(
            id,
            Slot {
                history: history.clone(),
                last_active: now,
            },
        );
        history
    }

    /// Exclusive access to one conversation's history. Other conversations
    /// are unaffected while the guard is held.
    pub async fn lock(&self, id: ConversationId) -> OwnedMutexGuard<DialogueHistory> {
        self.get_or_create(id).lock_owned().await
    }

    pub async fn append(&self, id: ConversationId, turn: Turn) {
        self.lock(id).await.push(turn);
    }

    /// The last `n` turns of a conversation; empty if it was never seen.
    pub async fn recent_window(&self, id: ConversationId, n: usize) -> Vec<Turn> {
        let history = {
            let slots = self.lock_slots();
            match slots.get(&id) {
                Some(slot) => slot.history.clone(),
                None => return Vec::new(),
            }
        };
        let guard = history.lock().await;
        guard.recent(n)
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.lock_slots().contains_key(&id)
    }

    pub fn conversation_count(&self) -> usize {
        self.lock_slots().len()
    }

    /// Drop conversations idle longer than the TTL. Returns how many went.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let ttl = self.limits.idle_ttl;
        let mut slots = self.lock_slots();
        let before = slots.len();
        slots.retain(|_, slot| {
            !(slot.is_unheld() && now.saturating_duration_since(slot.last_active) > ttl)
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} idle conversation(s)", evicted);
        }
        evicted
    }

    /// Periodically run `evict_idle` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.evict_idle();
                    }
                    None => break,
                }
            }
        })
    }
}

fn evict_least_recent(slots: &mut HashMap<ConversationId, Slot>) {
    let victim = slots
        .iter()
        .filter(|(_, slot)| slot.is_unheld())
        .min_by_key(|(_, slot)| slot.last_active)
        .map(|(id, _)| *id);

    match victim {
        Some(id) => {
            slots.remove(&id);
            tracing::debug!("Evicted least recently active conversation {}", id);
        }
        None => {
            tracing::warn!(
                "Dialogue store is full ({} conversations) and every history is in use",
                slots.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: i64) -> ConversationId {
        ConversationId::new(raw)
    }

    fn limits(retention: usize, max_conversations: usize, idle_secs: u64) -> DialogueLimits {
        DialogueLimits {
            retention,
            max_conversations,
            idle_ttl: Duration::from_secs(idle_secs),
        }
    }

    #[tokio::test]
    async fn window_is_empty_for_unknown_conversation() {
        let store = DialogueStore::new(DialogueLimits::default());
        assert!(store.recent_window(id(1), 10).await.is_empty());
        assert!(!store.contains(id(1)));
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_history() {
        let store = DialogueStore::new(DialogueLimits::default());
        let first = store.get_or_create(id(7));
        let second = store.get_or_create(id(7));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.conversation_count(), 1);
    }

    #[tokio::test]
    async fn window_holds_last_ten_of_many_turns_in_order() {
        let store = DialogueStore::new(limits(40, 10, 60));
        for cycle in 0..7 {
            store
                .append(id(1), Turn::user(format!("q{}", cycle)))
                .await;
            store
                .append(id(1), Turn::assistant(format!("a{}", cycle)))
                .await;
        }

        let window = store.recent_window(id(1), 10).await;
        let texts: Vec<&str> = window.iter().map(Turn::text).collect();
        assert_eq!(
            texts,
            vec!["q2", "a2", "q3", "a3", "q4", "a4", "q5", "a5", "q6", "a6"]
        );
    }

    #[tokio::test]
    async fn short_history_returns_everything() {
        let store = DialogueStore::new(DialogueLimits::default());
        store.append(id(2), Turn::user("only")).await;
        assert_eq!(store.recent_window(id(2), 10).await, vec![Turn::user("only")]);
    }

    #[test]
    fn retention_drops_oldest_turns() {
        let mut history = DialogueHistory::new(3);
        for n in 0..5 {
            history.push(Turn::user(n.to_string()));
        }
        assert_eq!(history.len(), 3);
        let texts: Vec<&str> = history.turns().map(Turn::text).collect();
        assert_eq!(texts, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn idle_conversations_are_evicted_after_ttl() {
        let store = DialogueStore::new(limits(10, 10, 60));
        store.append(id(1), Turn::user("hi")).await;

        assert_eq!(store.evict_idle_at(Instant::now()), 0);
        assert_eq!(
            store.evict_idle_at(Instant::now() + Duration::from_secs(61)),
            1
        );
        assert!(!store.contains(id(1)));
    }

    #[tokio::test]
    async fn held_conversations_survive_idle_eviction() {
        let store = DialogueStore::new(limits(10, 10, 60));
        let guard = store.lock(id(1)).await;
        assert_eq!(
            store.evict_idle_at(Instant::now() + Duration::from_secs(120)),
            0
        );
        drop(guard);
        assert_eq!(
            store.evict_idle_at(Instant::now() + Duration::from_secs(120)),
            1
        );
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_active() {
        let store = DialogueStore::new(limits(10, 2, 3600));
        store.append(id(1), Turn::user("one")).await;
        store.append(id(2), Turn::user("two")).await;
        // Touch 1 so 2 becomes the oldest.
        store.get_or_create(id(1));
        store.append(id(3), Turn::user("three")).await;

        assert_eq!(store.conversation_count(), 2);
        assert!(store.contains(id(1)));
        assert!(!store.contains(id(2)));
        assert!(store.contains(id(3)));
    }

    #[tokio::test]
    async fn lock_serializes_access_per_conversation() {
        let store = Arc::new(DialogueStore::new(DialogueLimits::default()));
        let guard = store.lock(id(9)).await;

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                store.append(id(9), Turn::user("second")).await;
            })
        };

        tokio::task::yield_now().await;
        let mut guard = guard;
        guard.push(Turn::user("first"));
        drop(guard);
        contender.await.expect("append task");

        let texts: Vec<String> = store
            .recent_window(id(9), 10)
            .await
            .iter()
            .map(|t| t.text().to_string())
            .collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }
}
