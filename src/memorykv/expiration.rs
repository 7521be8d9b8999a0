//! # Expiration Queue
//!
//! Ordered `(key, expires_at)` pairs, earliest expiry first. Each key
//! appears at most once; re-adding a key repositions it.

/// A single scheduled expiry, in unix milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiration {
    pub key: String,
    pub expires_at: i64,
}

/// Expiration queue sorted ascending by `expires_at`
#[derive(Debug, Default, Clone)]
pub struct ExpirationQueue {
    entries: Vec<Expiration>,
}

impl ExpirationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` to expire at `expires_at`, replacing any previous schedule
    pub fn add(&mut self, key: &str, expires_at: i64) {
        self.remove(key);
        // Equal deadlines keep insertion order
        let idx = self.entries.partition_point(|e| e.expires_at <= expires_at);
        self.entries.insert(
            idx,
            Expiration {
                key: key.to_string(),
                expires_at,
            },
        );
    }

    /// Remove the schedule for `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.iter().position(|e| e.key == key) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// The earliest scheduled expiry
    pub fn peek(&self) -> Option<&Expiration> {
        self.entries.first()
    }

    /// Drain every entry due at or before `now`
    pub fn pop_expired(&mut self, now: i64) -> Vec<Expiration> {
        let due = self.entries.partition_point(|e| e.expires_at <= now);
        self.entries.drain(..due).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Expiration> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(queue: &ExpirationQueue) -> Vec<&str> {
        queue.iter().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn test_add_keeps_ascending_order() {
        let mut queue = ExpirationQueue::new();
        queue.add("c", 30);
        queue.add("a", 10);
        queue.add("b", 20);

        assert_eq!(keys(&queue), vec!["a", "b", "c"]);
        assert_eq!(queue.peek().unwrap().key, "a");
    }

    #[test]
    fn test_readd_repositions_key() {
        let mut queue = ExpirationQueue::new();
        queue.add("a", 10);
        queue.add("b", 20);
        queue.add("a", 30);

        assert_eq!(queue.len(), 2);
        assert_eq!(keys(&queue), vec!["b", "a"]);
    }

    #[test]
    fn test_pop_expired_only_drains_due_entries() {
        let mut queue = ExpirationQueue::new();
        queue.add("a", 10);
        queue.add("b", 20);
        queue.add("c", 30);

        let due = queue.pop_expired(20);
        assert_eq!(due.len(), 2);
        assert_eq!(keys(&queue), vec!["c"]);
    }

    #[test]
    fn test_remove_missing_key() {
        let mut queue = ExpirationQueue::new();
        assert!(!queue.remove("nope"));
        queue.add("a", 1);
        assert!(queue.remove("a"));
        assert!(queue.is_empty());
    }
}
