//! Per-project event fan-out.
//!
//! Each project gets its own bounded broadcast channel.  Delivery is
//! best-effort and ordered per subscriber; a subscriber that falls behind
//! loses the oldest events.  Subscribers joining mid-stream see only future
//! events.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::events::ProjectEvent;

/// Backlog per subscriber.  Old events are dropped when a subscriber lags.
const BROADCAST_CAP: usize = 256;

#[derive(Debug, Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<ProjectEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, project_id: &str) -> broadcast::Receiver<ProjectEvent> {
        let mut channels = self.channels.lock().expect("bus lock");
        channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAP).0)
            .subscribe()
    }

    /// Emit to all current subscribers.  A project with no subscribers drops
    /// the event silently — delivery is best-effort by contract.
    pub fn emit(&self, project_id: &str, event: ProjectEvent) {
        let channels = self.channels.lock().expect("bus lock");
        if let Some(sender) = channels.get(project_id) {
            let delivered = sender.send(event).unwrap_or(0);
            debug!(project = %project_id, subscribers = delivered, "event emitted");
        }
    }

    pub fn remove_project(&self, project_id: &str) {
        self.channels.lock().expect("bus lock").remove(project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::EventBus;
    use crate::events::ProjectEvent;

    fn pruned(id: &str) -> ProjectEvent {
        ProjectEvent::PropositionPruned { id: id.to_string() }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("p");

        bus.emit("p", pruned("P001"));
        bus.emit("p", pruned("P002"));

        assert!(matches!(
            rx.recv().await.unwrap(),
            ProjectEvent::PropositionPruned { id } if id == "P001"
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ProjectEvent::PropositionPruned { id } if id == "P002"
        ));
    }

    #[tokio::test]
    async fn late_subscribers_see_only_future_events() {
        let bus = EventBus::new();
        let _early = bus.subscribe("p");
        bus.emit("p", pruned("P001"));

        let mut late = bus.subscribe("p");
        bus.emit("p", pruned("P002"));

        assert!(matches!(
            late.recv().await.unwrap(),
            ProjectEvent::PropositionPruned { id } if id == "P002"
        ));
    }

    #[tokio::test]
    async fn projects_are_isolated() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("a");
        let _rx_b = bus.subscribe("b");

        bus.emit("b", pruned("P001"));
        bus.emit("a", pruned("P002"));

        assert!(matches!(
            rx_a.recv().await.unwrap(),
            ProjectEvent::PropositionPruned { id } if id == "P002"
        ));
    }
}
