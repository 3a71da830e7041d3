//! Resource-change notifications
//!
//! Every persisted mutation is announced on a broadcast channel. Subscribers
//! that fall behind lose the oldest notifications; publishing never blocks
//! and never fails.

use sluice_core::dto::event::{ChangeAction, ResourceChange, ResourceKind};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResourceChange>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceChange> {
        self.sender.subscribe()
    }

    pub fn publish(&self, change: ResourceChange) {
        trace!("Publishing {}", change);
        // No subscribers is fine.
        let _ = self.sender.send(change);
    }

    pub fn pipeline_changed(&self, id: &str, action: ChangeAction) {
        self.publish(ResourceChange::new(ResourceKind::Pipeline, id, action));
    }

    pub fn activity_changed(&self, id: &str, action: ChangeAction) {
        self.publish(ResourceChange::new(ResourceKind::Activity, id, action));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.activity_changed("a1", ChangeAction::Create);
        bus.pipeline_changed("p1", ChangeAction::Update);

        assert_eq!(
            rx.recv().await.unwrap(),
            ResourceChange::new(ResourceKind::Activity, "a1", ChangeAction::Create)
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ResourceChange::new(ResourceKind::Pipeline, "p1", ChangeAction::Update)
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.activity_changed("a1", ChangeAction::Delete);
    }
}
