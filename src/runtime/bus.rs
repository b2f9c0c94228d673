//! Knowledge bus: in-process topic-based publish/subscribe.
//!
//! Delivery is best-effort over bounded channels: a subscriber whose
//! queue is full loses the entry (logged), and a slow or failing
//! subscriber never blocks the publisher or its peers. Entries published
//! by one thread arrive at each subscriber in publish order, which gives
//! the per-(topic, publisher) ordering the indexing pipeline relies on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::Timestamp;

/// Default per-subscriber queue depth.
const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Canonical topics used by the indexing and semantic pipelines.
pub mod topics {
    /// A file finished parsing; payload is a `ParseComplete` document.
    pub const PARSE_COMPLETE: &str = "parse:complete";
    /// A batch of files finished parsing.
    pub const PARSE_BATCH_COMPLETE: &str = "parse:batch:complete";
    /// A file's graph data was written; payload carries counts.
    pub const INDEX_COMPLETE: &str = "index:complete";
    /// Newly indexed entities awaiting embeddings.
    pub const SEMANTIC_NEW_ENTITIES: &str = "semantic:new_entities";
    /// An external query request.
    pub const QUERY_REQUEST: &str = "query:request";
    /// A query response.
    pub const QUERY_RESPONSE: &str = "query:response";
}

/// One message delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct KnowledgeEntry {
    /// Topic the entry was published on.
    pub topic: String,
    /// Payload document.
    pub data: Value,
    /// Publisher identity (component name).
    pub source: String,
    /// Publish time.
    pub timestamp: Timestamp,
}

struct Subscriber {
    id: u64,
    tx: Sender<KnowledgeEntry>,
}

/// A live subscription; receive entries from [`Subscription::receiver`].
///
/// Dropping the subscription disconnects it; the bus prunes dead
/// subscribers on the next publish to that topic.
#[derive(Debug)]
pub struct Subscription {
    /// Subscriber id (for explicit unsubscribe).
    pub id: u64,
    /// Topic subscribed to.
    pub topic: String,
    rx: Receiver<KnowledgeEntry>,
}

impl Subscription {
    /// The channel entries arrive on.
    pub fn receiver(&self) -> &Receiver<KnowledgeEntry> {
        &self.rx
    }
}

/// Topic-based publish/subscribe bus.
pub struct KnowledgeBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl Default for KnowledgeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KnowledgeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.subscribers.read().len();
        f.debug_struct("KnowledgeBus").field("topics", &topics).finish()
    }
}

impl KnowledgeBus {
    /// Creates a bus with the default queue depth.
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Creates a bus with a custom per-subscriber queue depth.
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Subscribes to a topic.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = bounded(self.queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(topic, id, "Subscriber registered");
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    /// Removes a subscriber explicitly.
    pub fn unsubscribe(&self, topic: &str, id: u64) {
        let mut map = self.subscribers.write();
        if let Some(subs) = map.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                map.remove(topic);
            }
        }
    }

    /// Publishes an entry to every live subscriber of `topic`.
    ///
    /// Returns the number of subscribers that received the entry. Full
    /// queues drop the entry for that subscriber (best-effort delivery);
    /// disconnected subscribers are pruned.
    pub fn publish(&self, topic: &str, data: Value, source: &str) -> usize {
        let entry = KnowledgeEntry {
            topic: topic.to_string(),
            data,
            source: source.to_string(),
            timestamp: Timestamp::now(),
        };

        let mut delivered = 0usize;
        let mut dead: Vec<u64> = Vec::new();
        {
            let map = self.subscribers.read();
            let Some(subs) = map.get(topic) else {
                return 0;
            };
            for sub in subs {
                match sub.tx.try_send(entry.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(topic, subscriber = sub.id, "Subscriber queue full; entry dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => dead.push(sub.id),
                }
            }
        }

        if !dead.is_empty() {
            let mut map = self.subscribers.write();
            if let Some(subs) = map.get_mut(topic) {
                subs.retain(|s| !dead.contains(&s.id));
            }
        }
        delivered
    }

    /// Number of live subscribers across all topics.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_reaches_subscriber() {
        let bus = KnowledgeBus::new();
        let sub = bus.subscribe(topics::PARSE_COMPLETE);
        let delivered = bus.publish(topics::PARSE_COMPLETE, json!({"filePath": "/a.ts"}), "parser");
        assert_eq!(delivered, 1);

        let entry = sub.receiver().recv().unwrap();
        assert_eq!(entry.topic, topics::PARSE_COMPLETE);
        assert_eq!(entry.source, "parser");
        assert_eq!(entry.data["filePath"], "/a.ts");
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = KnowledgeBus::new();
        assert_eq!(bus.publish("nobody:listens", json!(1), "test"), 0);
    }

    #[test]
    fn test_entries_ordered_per_publisher() {
        let bus = KnowledgeBus::new();
        let sub = bus.subscribe("t");
        for i in 0..10 {
            bus.publish("t", json!(i), "p");
        }
        for i in 0..10 {
            assert_eq!(sub.receiver().recv().unwrap().data, json!(i));
        }
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let bus = KnowledgeBus::with_queue_depth(2);
        let sub = bus.subscribe("t");
        assert_eq!(bus.publish("t", json!(1), "p"), 1);
        assert_eq!(bus.publish("t", json!(2), "p"), 1);
        // Queue full: dropped, not blocked.
        assert_eq!(bus.publish("t", json!(3), "p"), 0);
        assert_eq!(sub.receiver().recv().unwrap().data, json!(1));
    }

    #[test]
    fn test_one_slow_subscriber_does_not_block_others() {
        let bus = KnowledgeBus::with_queue_depth(1);
        let _slow = bus.subscribe("t"); // never drained
        let fast = bus.subscribe("t");
        bus.publish("t", json!(1), "p");
        bus.publish("t", json!(2), "p"); // slow is full now; fast still gets it
        assert_eq!(fast.receiver().recv().unwrap().data, json!(1));
        assert_eq!(fast.receiver().recv().unwrap().data, json!(2));
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = KnowledgeBus::new();
        let sub = bus.subscribe("t");
        drop(sub);
        bus.publish("t", json!(1), "p");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = KnowledgeBus::new();
        let sub = bus.subscribe("t");
        bus.unsubscribe("t", sub.id);
        assert_eq!(bus.publish("t", json!(1), "p"), 0);
    }
}
