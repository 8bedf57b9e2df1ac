//! Typed event bus.
//!
//! The outer application subscribes to these four events; delivery is
//! best-effort, at-most-once (a slow subscriber loses the oldest events,
//! never blocks the engines).

use serde::Serialize;
use tokio::sync::broadcast;

use crate::protocol::ContactId;

#[derive(Clone, Debug, Serialize)]
pub enum Event {
    PingReceived {
        contact_id: ContactId,
        ping_id: String,
    },
    MessageStored {
        contact_id: ContactId,
        message_id: String,
    },
    DownloadFailed {
        contact_id: ContactId,
        ping_id: String,
        reason: String,
    },
    ProfileUpdated {
        contact_id: ContactId,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit to all subscribers; silently dropped when nobody listens.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
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
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(Event::PingReceived {
            contact_id: 1,
            ping_id: "abc".into(),
        });

        match rx.recv().await.unwrap() {
            Event::PingReceived { contact_id, ping_id } => {
                assert_eq!(contact_id, 1);
                assert_eq!(ping_id, "abc");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(Event::ProfileUpdated { contact_id: 9 });
    }
}
