//! Per-policy internal event bus
//!
//! String-topic broadcast scoped to a policy. Blocks and embedders use it
//! for loosely-coupled signalling that does not fit the typed link wiring
//! (timer ticks, external document arrival). Closed receivers are pruned
//! lazily on the next emit.

use dashmap::DashMap;
use policy_types::PolicyId;
use serde_json::Value;
use tokio::sync::mpsc;

type TopicMap = DashMap<String, Vec<mpsc::UnboundedSender<Value>>>;

/// Topic-keyed broadcast bus, partitioned by policy
#[derive(Default)]
pub struct InternalBus {
    topics: DashMap<String, TopicMap>,
}

impl InternalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic within one policy
    pub fn subscribe(&self, policy_id: &PolicyId, topic: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .entry(policy_id.to_string())
            .or_default()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver a payload to every live subscriber of the topic.
    /// Returns the number of receivers reached.
    pub fn emit(&self, policy_id: &PolicyId, topic: &str, payload: Value) -> usize {
        let Some(topics) = self.topics.get(&policy_id.to_string()) else {
            return 0;
        };
        let Some(mut senders) = topics.get_mut(topic) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in senders.iter() {
            if tx.send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop every subscription held for the policy
    pub fn remove_policy(&self, policy_id: &PolicyId) {
        self.topics.remove(&policy_id.to_string());
    }
}
