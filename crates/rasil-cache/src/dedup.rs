//! Bounded in-memory set of recently-processed message fingerprints.
//!
//! Only a present `channel_message_id` can mark a duplicate — two distinct
//! messages with identical bodies must both be processed.

use std::collections::HashSet;
use std::sync::Mutex;

const MAX_ENTRIES: usize = 1000;

#[derive(Default)]
pub struct DedupCache {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    seen: HashSet<String>,
    /// Insertion order, so overflow can discard the older half.
    order: Vec<String>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// MD5 fingerprint: the platform id when present, otherwise sender+body
    /// (the latter is never used as a duplicate signal, only as a stable key).
    pub fn fingerprint(
        body: &str,
        sender: Option<&str>,
        channel_message_id: Option<&str>,
    ) -> String {
        let content = match channel_message_id {
            Some(id) => format!("msg_id:{}", id),
            None => format!(
                "{}:{}",
                sender.unwrap_or("unknown"),
                body.trim().to_lowercase()
            ),
        };
        format!("{:x}", md5::compute(content.as_bytes()))
    }

    /// Returns true only when the exact same `channel_message_id` was seen
    /// recently. On a miss the fingerprint is recorded.
    pub fn is_duplicate(
        &self,
        body: &str,
        sender: Option<&str>,
        channel_message_id: Option<&str>,
    ) -> bool {
        let Some(id) = channel_message_id else {
            return false;
        };

        let hash = Self::fingerprint(body, sender, Some(id));
        let mut inner = self.inner.lock().unwrap();

        if inner.seen.contains(&hash) {
            return true;
        }

        inner.order.push(hash.clone());
        inner.seen.insert(hash);

        if inner.order.len() > MAX_ENTRIES {
            let drained: Vec<String> = inner.order.drain(..MAX_ENTRIES / 2).collect();
            for old in drained {
                inner.seen.remove(&old);
            }
        }

        false
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_delivery_of_same_id_is_duplicate() {
        let cache = DedupCache::new();
        assert!(!cache.is_duplicate("hi", Some("a"), Some("wamid.X")));
        assert!(cache.is_duplicate("hi", Some("a"), Some("wamid.X")));
    }

    #[test]
    fn same_body_without_id_is_never_duplicate() {
        let cache = DedupCache::new();
        assert!(!cache.is_duplicate("hello", Some("a"), None));
        assert!(!cache.is_duplicate("hello", Some("a"), None));
    }

    #[test]
    fn same_body_different_ids_both_pass() {
        let cache = DedupCache::new();
        assert!(!cache.is_duplicate("hello", Some("a"), Some("m1")));
        assert!(!cache.is_duplicate("hello", Some("a"), Some("m2")));
    }

    #[test]
    fn overflow_discards_older_half() {
        let cache = DedupCache::new();
        for i in 0..1001 {
            cache.is_duplicate("x", None, Some(&format!("id-{}", i)));
        }
        assert!(cache.len() <= 1000);
        // The oldest entries were evicted, so re-offering one is not a
        // duplicate anymore.
        assert!(!cache.is_duplicate("x", None, Some("id-0")));
        // The newest entries survived eviction.
        assert!(cache.is_duplicate("x", None, Some("id-1000")));
    }
}
