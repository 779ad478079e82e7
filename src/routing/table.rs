#![forbid(unsafe_code)]

// Routing table - the pure (producer, subscriber) bookkeeping behind the
// audio routing core. Ids are the only edges; object lifecycles live in the
// media module and the registries.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ProducerEntry {
    pub owner: String,
    /// Channels this producer is currently registered into.
    pub channels: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub producer_id: String,
    pub subscriber: String,
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_producer(&mut self, producer_id: &str, owner: &str, channels: HashSet<String>) {
        self.producers.insert(
            producer_id.to_string(),
            ProducerEntry {
                owner: owner.to_string(),
                channels,
            },
        );
    }

    pub fn remove_producer(&mut self, producer_id: &str) -> Option<ProducerEntry> {
        self.producers.remove(producer_id)
    }

    pub fn producer(&self, producer_id: &str) -> Option<&ProducerEntry> {
        self.producers.get(producer_id)
    }

    pub fn set_producer_channels(&mut self, producer_id: &str, channels: HashSet<String>) {
        if let Some(entry) = self.producers.get_mut(producer_id) {
            entry.channels = channels;
        }
    }

    pub fn producers_of_owner(&self, owner: &str) -> Vec<String> {
        self.producers
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn producer_ids(&self) -> Vec<String> {
        self.producers.keys().cloned().collect()
    }

    /// Registers a consumer pairing. Rejects a duplicate (producer,
    /// subscriber) pair — one consumer materialises one pairing.
    pub fn insert_consumer(
        &mut self,
        consumer_id: &str,
        producer_id: &str,
        subscriber: &str,
    ) -> bool {
        if self.has_pair(producer_id, subscriber) {
            return false;
        }
        self.consumers.insert(
            consumer_id.to_string(),
            ConsumerEntry {
                producer_id: producer_id.to_string(),
                subscriber: subscriber.to_string(),
            },
        );
        true
    }

    pub fn remove_consumer(&mut self, consumer_id: &str) -> Option<ConsumerEntry> {
        self.consumers.remove(consumer_id)
    }

    pub fn has_pair(&self, producer_id: &str, subscriber: &str) -> bool {
        self.consumers
            .values()
            .any(|entry| entry.producer_id == producer_id && entry.subscriber == subscriber)
    }

    /// All (consumer_id, subscriber) pairs relaying the given producer.
    pub fn consumers_of_producer(&self, producer_id: &str) -> Vec<(String, String)> {
        self.consumers
            .iter()
            .filter(|(_, entry)| entry.producer_id == producer_id)
            .map(|(id, entry)| (id.clone(), entry.subscriber.clone()))
            .collect()
    }

    pub fn consumers_of_subscriber(&self, subscriber: &str) -> Vec<(String, String)> {
        self.consumers
            .iter()
            .filter(|(_, entry)| entry.subscriber == subscriber)
            .map(|(id, entry)| (id.clone(), entry.producer_id.clone()))
            .collect()
    }

    /// Snapshot of every consumer for reconciliation sweeps.
    pub fn consumer_entries(&self) -> Vec<(String, ConsumerEntry)> {
        self.consumers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub fn pair_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn duplicate_pairs_are_rejected() {
        let mut table = RoutingTable::new();
        table.insert_producer("p1", "alice", channels(&["main"]));
        assert!(table.insert_consumer("c1", "p1", "bob"));
        assert!(!table.insert_consumer("c2", "p1", "bob"));
        assert_eq!(table.pair_count(), 1);
    }

    #[test]
    fn same_producer_different_subscribers_is_fine() {
        let mut table = RoutingTable::new();
        table.insert_producer("p1", "alice", channels(&["main"]));
        assert!(table.insert_consumer("c1", "p1", "bob"));
        assert!(table.insert_consumer("c2", "p1", "carol"));
        assert_eq!(table.consumers_of_producer("p1").len(), 2);
    }

    #[test]
    fn removing_producer_leaves_consumer_lookup_to_caller() {
        let mut table = RoutingTable::new();
        table.insert_producer("p1", "alice", channels(&["main"]));
        table.insert_consumer("c1", "p1", "bob");

        // Close consumers before removing routing entries.
        let consumers = table.consumers_of_producer("p1");
        for (consumer_id, _) in &consumers {
            table.remove_consumer(consumer_id);
        }
        let entry = table.remove_producer("p1").unwrap();
        assert_eq!(entry.owner, "alice");
        assert_eq!(table.pair_count(), 0);
    }

    #[test]
    fn subscriber_view_matches_pairings() {
        let mut table = RoutingTable::new();
        table.insert_producer("p1", "alice", channels(&["main"]));
        table.insert_producer("p2", "carol", channels(&["main"]));
        table.insert_consumer("c1", "p1", "bob");
        table.insert_consumer("c2", "p2", "bob");

        let pairs = table.consumers_of_subscriber("bob");
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().any(|(_, p)| p == "p1"));
        assert!(pairs.iter().any(|(_, p)| p == "p2"));
    }

    #[test]
    fn producer_channels_can_be_rewritten() {
        let mut table = RoutingTable::new();
        table.insert_producer("p1", "alice", channels(&["main", "ops"]));
        table.set_producer_channels("p1", channels(&["ops"]));
        let entry = table.producer("p1").unwrap();
        assert!(!entry.channels.contains("main"));
        assert!(entry.channels.contains("ops"));
    }
}
