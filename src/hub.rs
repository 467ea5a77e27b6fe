//! C8 — Event Hub: fans out daemon events to every connected observer
//! (the `/ws` control-plane clients). A slow observer is dropped from,
//! not allowed to stall, the broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

const OBSERVER_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum HubEvent {
    #[serde(rename = "status")]
    Status { registered: bool, firewall_enabled: bool },
    #[serde(rename = "call_incoming")]
    CallIncoming { call_id: String, remote_uri: String },
    #[serde(rename = "call_active")]
    CallActive { call_id: String, codec: String, rate: u32 },
    #[serde(rename = "call_ended")]
    CallEnded { call_id: String },
    #[serde(rename = "call_rejected")]
    CallRejected { remote_ip: String, reason: String },
    #[serde(rename = "transcript")]
    Transcript { call_id: String, speaker: String, text: String, r#final: bool },
    #[serde(rename = "order_update")]
    OrderUpdate { call_id: String, rendered: String },
    #[serde(rename = "debug_event")]
    DebugEvent { message: String },
    #[serde(rename = "expert_query_start")]
    ExpertQueryStart { call_id: String, question: String },
    #[serde(rename = "expert_query_done")]
    ExpertQueryDone { call_id: String, success: bool, confidence: f32 },
    #[serde(rename = "firewall_status")]
    FirewallStatus { enabled: bool, allowed_networks: Vec<String> },
}

pub struct EventHub {
    observers: Mutex<HashMap<u64, mpsc::Sender<HubEvent>>>,
    next_id: AtomicU64,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new observer, returning its id (for `unregister`) and the
    /// receiving half of its bounded queue.
    pub fn register(&self) -> (u64, mpsc::Receiver<HubEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OBSERVER_QUEUE_CAPACITY);
        self.observers.lock().insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        self.observers.lock().remove(&id);
    }

    /// Broadcast to every registered observer, over a snapshot of the
    /// registry so a slow or closed observer never blocks the others.
    pub fn broadcast(&self, event: HubEvent) {
        let observers: Vec<(u64, mpsc::Sender<HubEvent>)> =
            self.observers.lock().iter().map(|(id, tx)| (*id, tx.clone())).collect();
        for (id, tx) in observers {
            if let Err(err) = tx.try_send(event.clone()) {
                tracing::debug!(observer = id, error = %err, "dropping event for slow or closed observer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_observer_receives_broadcast() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.register();
        hub.broadcast(HubEvent::DebugEvent { message: "hi".to_string() });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, HubEvent::DebugEvent { .. }));
    }

    #[tokio::test]
    async fn unregistered_observer_is_not_sent_to() {
        let hub = EventHub::new();
        let (id, mut rx) = hub.register();
        hub.unregister(id);
        hub.broadcast(HubEvent::DebugEvent { message: "hi".to_string() });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_observer_does_not_block_broadcast() {
        let hub = EventHub::new();
        let (_id1, mut rx1) = hub.register();
        let (_id2, _rx2_never_drained) = hub.register();
        for i in 0..OBSERVER_QUEUE_CAPACITY + 5 {
            hub.broadcast(HubEvent::DebugEvent { message: format!("{i}") });
        }
        assert!(rx1.recv().await.is_some());
    }
}
