use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use opsdeck_events::{topics, Bus};
use opsdeck_protocol::TargetStatus;
use serde_json::json;
use tokio::sync::RwLock;

/// Last-known lifecycle state per target. Records are created on first
/// observation and updated on every poll; each applied status is published
/// on the bus for the presentation layer.
#[derive(Clone)]
pub struct TargetRegistry {
    state: Arc<RwLock<HashMap<String, TargetStatus>>>,
    bus: Bus,
}

impl TargetRegistry {
    pub fn new(bus: Bus) -> Self {
        Self {
            state: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    pub async fn apply_status(&self, mut status: TargetStatus) {
        status.updated_at = Utc::now();
        let payload = json!({
            "id": status.id,
            "state": status.state,
            "pid": status.pid,
            "uptime_seconds": status.uptime_seconds,
            "updated": status.updated_at.to_rfc3339(),
        });
        {
            let mut guard = self.state.write().await;
            guard.insert(status.id.clone(), status);
        }
        self.bus.publish(topics::TOPIC_TARGET_STATE_CHANGED, &payload);
    }

    pub async fn status(&self, target: &str) -> Option<TargetStatus> {
        self.state.read().await.get(target).cloned()
    }

    /// All known targets, sorted by id.
    pub async fn snapshot(&self) -> Vec<TargetStatus> {
        let guard = self.state.read().await;
        let mut targets: Vec<TargetStatus> = guard.values().cloned().collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        targets
    }
}
