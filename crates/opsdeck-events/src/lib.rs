use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub mod topics;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// Broadcast bus for JSON-serializable progress events. The presentation
/// layer subscribes to observe guard, poll, reconfigure, and invocation
/// transitions; publishing never blocks and tolerates zero receivers.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let _ = self.tx.send(Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber_with_timestamp() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(topics::TOPIC_TARGET_STATE_CHANGED, &json!({"id": "srv1"}));
        let env = rx.recv().await.expect("event delivered");
        assert_eq!(env.kind, topics::TOPIC_TARGET_STATE_CHANGED);
        assert_eq!(env.payload["id"], "srv1");
        assert!(env.time.ends_with('Z'));
    }

    #[test]
    fn publish_without_receivers_is_a_noop() {
        let bus = Bus::new(8);
        bus.publish("orphan.event", &json!({}));
    }
}
