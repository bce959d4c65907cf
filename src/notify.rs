use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-amenity broadcast of booking events, for mailers and other watchers.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
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
        }
    }

    /// Subscribe to events for an amenity. Creates the channel if needed.
    pub fn subscribe(&self, amenity_id: &str) -> broadcast::Receiver<Event> {
        self.channels
            .entry(amenity_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, amenity_id: &str, event: &Event) {
        if let Some(sender) = self.channels.get(amenity_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose receivers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("pool");

        let event = Event::BookingConfirmed {
            id: Ulid::new(),
            amenity_id: "pool".into(),
        };
        hub.send("pool", &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_amenity_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("pool");
        hub.send(
            "gym",
            &Event::BookingCancelled {
                id: Ulid::new(),
                amenity_id: "gym".into(),
            },
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(
            "pool",
            &Event::BookingDeleted {
                id: Ulid::new(),
                amenity_id: "pool".into(),
            },
        );
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe("pool");
        let _kept = hub.subscribe("gym");
        drop(rx);
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
    }
}
