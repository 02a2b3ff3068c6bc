//! Short-lived cache of collaborator replies keyed by request fingerprint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::core::role::AgentRole;
use crate::io::llm::{ChatMessage, ChatResponse};

/// Fingerprint of everything that determines a reply.
pub fn cache_key(role: AgentRole, messages: &[ChatMessage], model: &str, temperature: f32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(role.as_str().as_bytes());
    hasher.update([0]);
    for message in messages {
        hasher.update(format!("{:?}", message.role).as_bytes());
        hasher.update([0]);
        hasher.update(message.content.as_bytes());
        hasher.update([0]);
    }
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(temperature.to_bits().to_le_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
struct Entry {
    response: ChatResponse,
    stored_at: Instant,
}

/// In-process reply cache; entries expire after the configured TTL.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<ChatResponse> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.response.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a reply. Empty replies are never cached.
    pub fn put(&self, key: String, response: &ChatResponse) {
        if self.ttl.is_zero() || response.content.trim().is_empty() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
            entries.insert(
                key,
                Entry {
                    response: response.clone(),
                    stored_at: Instant::now(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> ChatResponse {
        ChatResponse {
            content: text.to_string(),
            usage: None,
        }
    }

    #[test]
    fn key_depends_on_every_input() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hello")];
        let base = cache_key(AgentRole::Dev, &messages, "m", 0.2);
        assert_eq!(base.len(), 64);
        assert_eq!(base, cache_key(AgentRole::Dev, &messages, "m", 0.2));
        assert_ne!(base, cache_key(AgentRole::Qa, &messages, "m", 0.2));
        assert_ne!(base, cache_key(AgentRole::Dev, &messages, "other", 0.2));
        assert_ne!(base, cache_key(AgentRole::Dev, &messages, "m", 0.3));
        let changed = vec![ChatMessage::system("sys"), ChatMessage::user("hello!")];
        assert_ne!(base, cache_key(AgentRole::Dev, &changed, "m", 0.2));
    }

    #[test]
    fn hit_within_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), &reply("answer"));
        assert_eq!(cache.get("k"), Some(reply("answer")));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn expired_and_empty_entries_miss() {
        let cache = ResponseCache::new(Duration::from_millis(1));
        cache.put("k".to_string(), &reply("answer"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);

        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), &reply("  "));
        assert_eq!(cache.get("k"), None);
    }
}
