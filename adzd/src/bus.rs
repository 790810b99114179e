//! Shared event bus: unbounded-fan-out multicast of lifecycle and artifact
//! events. Delivery is best-effort; subscribers join at "now" and lagging
//! receivers simply lose frames.

use adz_core::BusEvent;
use tokio::sync::broadcast;
use tracing::debug;

const BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: BusEvent) {
        // Err just means nobody is listening right now.
        if self.tx.send(event).is_err() {
            debug!("bus event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adz_core::{Engine, LifecycleEvent, LifecycleKind};

    fn event(kind: LifecycleKind) -> BusEvent {
        BusEvent::Lifecycle(LifecycleEvent {
            kind,
            run_id: "r-1".into(),
            engine: Engine::Codex,
            workspace: "/srv/ws".into(),
            warm: false,
            timestamp: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(event(LifecycleKind::RunStarted));

        match rx.recv().await.unwrap() {
            BusEvent::Lifecycle(e) => assert_eq!(e.kind, LifecycleKind::RunStarted),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(event(LifecycleKind::RunExited));
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        bus.publish(event(LifecycleKind::RunStarted));
        let mut rx = bus.subscribe();
        bus.publish(event(LifecycleKind::RunExited));

        match rx.recv().await.unwrap() {
            BusEvent::Lifecycle(e) => assert_eq!(e.kind, LifecycleKind::RunExited),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
