use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::DomainEvent;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Fire-and-forget delivery of booking events. Errors are logged by the
/// caller and never undo the operation that produced the event.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, event: &DomainEvent) -> Result<(), NotifyError>;
}

/// In-process broadcast hub: one channel per studio plus a tenant-wide channel.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<DomainEvent>>,
    all: broadcast::Sender<DomainEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to events for one studio. Creates the channel if needed.
    pub fn subscribe(&self, studio_id: Ulid) -> broadcast::Receiver<DomainEvent> {
        let sender = self
            .channels
            .entry(studio_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<DomainEvent> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &DomainEvent) {
        if let Some(studio_id) = event.studio_id()
            && let Some(sender) = self.channels.get(&studio_id)
        {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        self.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn booked(studio_id: Ulid) -> DomainEvent {
        DomainEvent::SessionBooked {
            session: Session {
                id: Ulid::new(),
                tenant_id: "t".into(),
                studio_id,
                room_id: None,
                coach_id: None,
                client_id: Ulid::new(),
                package_id: Ulid::new(),
                span: Span::new(0, 1000),
                status: SessionStatus::Scheduled,
                cancellation_reason: None,
                created_at: 0,
            },
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        let mut rx = hub.subscribe(sid);
        let mut all = hub.subscribe_all();

        let event = booked(sid);
        hub.notify(&event).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), event);
        assert_eq!(all.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_studio_does_not_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.send(&booked(Ulid::new()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&booked(Ulid::new()));
    }
}
