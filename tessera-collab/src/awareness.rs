//! Ephemeral presence state.
//!
//! Awareness blobs (cursor, selection, user metadata) are opaque to the
//! server. The registry remembers the latest blob per `(document, user)`
//! so late joiners can be brought up to date, and forgets entries that
//! have not been refreshed within the timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Latest presence blob of one user on one document.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub document: String,
    pub user: String,
    pub payload: Vec<u8>,
    last_seen: Instant,
}

impl AwarenessEntry {
    pub fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }
}

/// Presence entries of every open document.
#[derive(Debug)]
pub struct AwarenessRegistry {
    entries: HashMap<(String, String), AwarenessEntry>,
    timeout: Duration,
}

impl AwarenessRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Record the newest blob from `user`.
    pub fn update(&mut self, document: &str, user: &str, payload: Vec<u8>, now: Instant) {
        let key = (document.to_string(), user.to_string());
        self.entries.insert(
            key,
            AwarenessEntry {
                document: document.to_string(),
                user: user.to_string(),
                payload,
                last_seen: now,
            },
        );
    }

    pub fn get(&self, document: &str, user: &str) -> Option<&AwarenessEntry> {
        self.entries.get(&(document.to_string(), user.to_string()))
    }

    pub fn remove(&mut self, document: &str, user: &str) -> Option<AwarenessEntry> {
        self.entries.remove(&(document.to_string(), user.to_string()))
    }

    /// Drop every entry of a closed document.
    pub fn remove_document(&mut self, document: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(doc, _), _| doc != document);
        before - self.entries.len()
    }

    /// Entries of one document, oldest first.
    pub fn entries_for(&self, document: &str) -> Vec<&AwarenessEntry> {
        let mut out: Vec<&AwarenessEntry> = self
            .entries
            .values()
            .filter(|e| e.document == document)
            .collect();
        out.sort_by_key(|e| e.last_seen);
        out
    }

    /// Remove entries idle past the timeout and return their keys.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<(String, String)> {
        let timeout = self.timeout;
        let expired: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_idle(timeout, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_replaces_previous_blob() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        let now = Instant::now();
        reg.update("doc", "alice", vec![1], now);
        reg.update("doc", "alice", vec![2], now);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("doc", "alice").unwrap().payload, vec![2]);
    }

    #[test]
    fn test_entries_are_scoped_per_document() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        let now = Instant::now();
        reg.update("a", "alice", vec![1], now);
        reg.update("b", "alice", vec![2], now);
        reg.update("a", "bob", vec![3], now + Duration::from_millis(1));
        let users: Vec<&str> = reg.entries_for("a").iter().map(|e| e.user.as_str()).collect();
        assert_eq!(users, vec!["alice", "bob"]);
        assert_eq!(reg.remove_document("a"), 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_idle_entries_expire() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        let start = Instant::now();
        reg.update("doc", "alice", vec![1], start);
        reg.update("doc", "bob", vec![1], start + Duration::from_secs(20));

        assert!(reg.evict_expired(start + Duration::from_secs(10)).is_empty());
        let expired = reg.evict_expired(start + Duration::from_secs(31));
        assert_eq!(expired, vec![("doc".to_string(), "alice".to_string())]);
        assert!(reg.get("doc", "bob").is_some());
    }

    #[test]
    fn test_remove_single_entry() {
        let mut reg = AwarenessRegistry::new(Duration::from_secs(30));
        reg.update("doc", "alice", vec![1], Instant::now());
        assert!(reg.remove("doc", "alice").is_some());
        assert!(reg.remove("doc", "alice").is_none());
        assert!(reg.is_empty());
    }
}
