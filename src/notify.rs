use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

pub const AUDIT_TARGET: &str = "condobook::audit";

const CHANNEL_CAPACITY: usize = 256;

/// Per-area broadcast of applied events, plus the audit trail.
///
/// Every event that reaches `send` has already been written to the WAL and
/// applied. It is logged on the `condobook::audit` target as JSON whether or
/// not anybody is subscribed.
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

    /// Subscribe to an area's events. Creates the channel if needed.
    pub fn subscribe(&self, area_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(area_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fire-and-forget: never fails the operation that produced the event.
    pub fn send(&self, area_id: Ulid, event: &Event) {
        match serde_json::to_string(event) {
            Ok(payload) => tracing::info!(target: AUDIT_TARGET, %area_id, event = %payload),
            Err(e) => tracing::warn!(target: AUDIT_TARGET, %area_id, error = %e, "unserializable event"),
        }
        if let Some(sender) = self.channels.get(&area_id) {
            let _ = sender.send(event.clone());
        }
    }
}
