use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Maps chat ids to agent session ids.
///
/// The session id is a UUID v5 of the chat id, so the same chat always
/// resumes the same agent session, even across orchestrator restarts.
pub struct SessionMapper {
    last_active: DashMap<String, DateTime<Utc>>,
    ttl: Duration,
}

impl SessionMapper {
    pub fn new(ttl: Duration) -> Self {
        Self {
            last_active: DashMap::new(),
            ttl,
        }
    }

    /// Session id for `chat_id`; also marks the chat as active.
    pub fn session_for(&self, chat_id: &str) -> String {
        self.last_active.insert(chat_id.to_string(), Utc::now());
        session_id(chat_id)
    }

    /// Session id for a chat seen within the TTL, without touching it.
    pub fn get(&self, chat_id: &str) -> Option<String> {
        self.last_active
            .contains_key(chat_id)
            .then(|| session_id(chat_id))
    }

    pub fn remove(&self, chat_id: &str) -> bool {
        self.last_active.remove(chat_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.last_active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_active.is_empty()
    }

    /// Forget chats idle for longer than the TTL.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = self.ttl;
        let before = self.last_active.len();
        self.last_active.retain(|_, last| {
            (now - *last)
                .to_std()
                .map(|idle| idle <= ttl)
                .unwrap_or(true)
        });
        let removed = before.saturating_sub(self.last_active.len());
        if removed > 0 {
            tracing::debug!("expired {} idle chat session(s)", removed);
        }
        removed
    }
}

/// Deterministic session id for a chat.
pub fn session_id(chat_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("hookrelay:{}", chat_id).as_bytes()).to_string()
}
