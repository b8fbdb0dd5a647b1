use std::collections::{HashMap, HashSet};

use mesh_wire::Alias;

/// Topic → subscriber-alias index, plus the reverse mapping needed to
/// remove a peer in O(topics-it-holds) instead of scanning every topic.
/// The bidirectional invariant `alias ∈ by_topic[t] iff t ∈ by_peer[alias]`
/// holds after every call here.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    by_topic: HashMap<String, HashSet<Alias>>,
    by_peer: HashMap<Alias, HashSet<String>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set-replace a peer's subscriptions: `new` becomes the peer's full
    /// topic set. Returns nothing — callers that need the add/remove
    /// deltas should compute them against `topics_of` before calling this.
    pub fn replace(&mut self, alias: Alias, new: HashSet<String>) {
        let old = self.by_peer.remove(&alias).unwrap_or_default();
        for topic in old.difference(&new) {
            if let Some(subscribers) = self.by_topic.get_mut(topic) {
                subscribers.remove(&alias);
                if subscribers.is_empty() {
                    self.by_topic.remove(topic);
                }
            }
        }
        for topic in &new {
            self.by_topic.entry(topic.clone()).or_default().insert(alias);
        }
        if !new.is_empty() {
            self.by_peer.insert(alias, new);
        }
    }

    /// Remove a peer entirely, e.g. on disconnect.
    pub fn remove_peer(&mut self, alias: Alias) {
        self.replace(alias, HashSet::new());
    }

    pub fn topics_of(&self, alias: Alias) -> HashSet<String> {
        self.by_peer.get(&alias).cloned().unwrap_or_default()
    }

    pub fn subscribers_of(&self, topic: &str) -> HashSet<Alias> {
        self.by_topic.get(topic).cloned().unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.by_peer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(topics: &[&str]) -> HashSet<String> {
        topics.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn replace_adds_and_indexes_topics() {
        let mut idx = SubscriptionIndex::new();
        idx.replace(1, set(&["a", "b"]));
        assert!(idx.subscribers_of("a").contains(&1));
        assert!(idx.subscribers_of("b").contains(&1));
        assert_eq!(idx.topics_of(1), set(&["a", "b"]));
    }

    #[test]
    fn replace_removes_dropped_topics() {
        let mut idx = SubscriptionIndex::new();
        idx.replace(1, set(&["a", "b"]));
        idx.replace(1, set(&["b", "c"]));
        assert!(!idx.subscribers_of("a").contains(&1));
        assert!(idx.subscribers_of("b").contains(&1));
        assert!(idx.subscribers_of("c").contains(&1));
        assert_eq!(idx.topics_of(1), set(&["b", "c"]));
    }

    #[test]
    fn empty_topic_set_no_longer_appears_in_by_topic() {
        let mut idx = SubscriptionIndex::new();
        idx.replace(1, set(&["a"]));
        idx.replace(2, set(&["a"]));
        idx.replace(1, HashSet::new());
        assert!(!idx.subscribers_of("a").contains(&1));
        assert!(idx.subscribers_of("a").contains(&2));
    }

    #[test]
    fn remove_peer_clears_all_its_topics() {
        let mut idx = SubscriptionIndex::new();
        idx.replace(1, set(&["a", "b"]));
        idx.remove_peer(1);
        assert!(idx.subscribers_of("a").is_empty());
        assert!(idx.subscribers_of("b").is_empty());
        assert!(idx.topics_of(1).is_empty());
        assert_eq!(idx.peer_count(), 0);
    }

    #[test]
    fn unrelated_peer_unaffected_by_replace() {
        let mut idx = SubscriptionIndex::new();
        idx.replace(1, set(&["a"]));
        idx.replace(2, set(&["a"]));
        idx.replace(1, set(&["b"]));
        assert!(idx.subscribers_of("a").contains(&2));
        assert_eq!(idx.subscribers_of("a").len(), 1);
    }
}
