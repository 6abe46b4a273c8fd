//! Domain events emitted by terminal HA transitions. The global fan-out
//! reconfigures replication edges inline with the procedures that change
//! masters; this bus exists for external observers (failure detector,
//! operators tailing the daemon).

use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    ServerPromoted { group_id: String, master: Uuid },
    ServerDemoted { group_id: String, old_master: Uuid },
    ServerLost { group_id: String, uuid: Uuid },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn emit(&self, event: DomainEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
