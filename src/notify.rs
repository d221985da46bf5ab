use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;
const CHANNEL_PREFIX: &str = "asset_";

/// LISTEN channel name for an asset.
pub fn channel_name(asset_id: Ulid) -> String {
    format!("{CHANNEL_PREFIX}{asset_id}")
}

/// Inverse of [`channel_name`].
pub fn parse_channel(channel: &str) -> Option<Ulid> {
    channel
        .strip_prefix(CHANNEL_PREFIX)
        .and_then(|id| Ulid::from_string(id).ok())
}

/// Per-asset broadcast of committed events.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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

    /// Subscribe to an asset's events, creating its channel on first use.
    pub fn subscribe(&self, asset_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(asset_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, asset_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&asset_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the asset's channel; current receivers see it close.
    pub fn remove(&self, asset_id: &Ulid) {
        self.channels.remove(asset_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_asset_events() {
        let hub = NotifyHub::new();
        let asset = Ulid::new();
        let mut rx = hub.subscribe(asset);

        let event = Event::BookingCancelled { id: Ulid::new(), asset_id: asset };
        hub.send(asset, &event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn events_stay_on_their_asset() {
        let hub = NotifyHub::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut rx_a = hub.subscribe(a);
        let _rx_b = hub.subscribe(b);

        hub.send(b, &Event::AssetDeleted { id: b });
        assert!(matches!(rx_a.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let asset = Ulid::new();
        hub.send(asset, &Event::AssetDeleted { id: asset });
    }

    #[tokio::test]
    async fn remove_closes_channel() {
        let hub = NotifyHub::new();
        let asset = Ulid::new();
        let mut rx = hub.subscribe(asset);
        hub.remove(&asset);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }

    #[test]
    fn channel_names_round_trip() {
        let asset = Ulid::new();
        assert_eq!(parse_channel(&channel_name(asset)), Some(asset));
        assert_eq!(parse_channel("resource_x"), None);
        assert_eq!(parse_channel("asset_not-a-ulid"), None);
    }
}
