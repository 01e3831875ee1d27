//! In-memory message store used to rebuild official-API conversation history
//!
//! The official API is stateless, so each turn's messages are kept here and
//! looked up again by `parentMessageId`. Bounded LRU; nothing is persisted.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use super::{Role, estimate_tokens};

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub parent_message_id: Option<String>,
}

pub struct MessageStore {
    messages: Mutex<LruCache<String, StoredMessage>>,
}

impl MessageStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            messages: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, id: &str) -> Option<StoredMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn insert(&self, message: StoredMessage) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(message.id.clone(), message);
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk the parent chain from `parent_id`, newest first, within a token budget
    ///
    /// Returns the messages oldest first together with the tokens they use.
    pub fn history(&self, parent_id: Option<&str>, budget: usize) -> (Vec<StoredMessage>, usize) {
        let mut history = Vec::new();
        let mut used = 0;
        let mut next = parent_id.map(str::to_string);

        while let Some(id) = next {
            let Some(message) = self.get(&id) else {
                break;
            };
            let cost = estimate_tokens(&message.text);
            if used + cost > budget {
                break;
            }
            used += cost;
            next = message.parent_message_id.clone();
            history.push(message);

            // Guard against a cycle in corrupted links.
            if history.len() > DEFAULT_CAPACITY {
                break;
            }
        }

        history.reverse();
        (history, used)
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, role: Role, text: &str, parent: Option<&str>) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            role,
            text: text.to_string(),
            parent_message_id: parent.map(str::to_string),
        }
    }

    fn conversation() -> MessageStore {
        let store = MessageStore::new(16);
        store.insert(message("u1", Role::User, "first question", None));
        store.insert(message("a1", Role::Assistant, "first answer", Some("u1")));
        store.insert(message("u2", Role::User, "second question", Some("a1")));
        store.insert(message("a2", Role::Assistant, "second answer", Some("u2")));
        store
    }

    #[test]
    fn test_history_oldest_first() {
        let store = conversation();
        let (history, used) = store.history(Some("a2"), 10_000);
        let ids: Vec<_> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "a1", "u2", "a2"]);
        assert!(used > 0);
    }

    #[test]
    fn test_history_respects_budget() {
        let store = conversation();
        // "second answer" and "second question" are 3 tokens each.
        let (history, used) = store.history(Some("a2"), 6);
        let ids: Vec<_> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["u2", "a2"]);
        assert_eq!(used, 6);
    }

    #[test]
    fn test_history_unknown_parent_is_empty() {
        let store = conversation();
        let (history, used) = store.history(Some("missing"), 10_000);
        assert!(history.is_empty());
        assert_eq!(used, 0);
        assert!(store.history(None, 10_000).0.is_empty());
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let store = MessageStore::new(2);
        store.insert(message("a", Role::User, "a", None));
        store.insert(message("b", Role::User, "b", None));
        store.insert(message("c", Role::User, "c", None));
        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_none());
        assert!(store.get("c").is_some());
    }
}
