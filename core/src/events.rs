//! Event-driven UI callback channel (`spec.md` §9 "Event-driven UI
//! callbacks"), grounded in the teacher's `UiEvent`/`broadcast::channel`
//! pattern in `cli/src/server.rs`. Engines hold a clone of `EventSink`
//! and publish best-effort; a dropped receiver is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PeerSeen { node_id: String },
    BlockAppended { hash: String, prev_hash: String },
    EnvelopeForwarded { msg_id: String, peer_count: usize },
    EnvelopeSeen { msg_id: String },
    OnionDelivered { msg_id: String },
    CommandBroadcast { msg_id: String, command: String },
}

#[derive(Clone)]
pub struct EventSink {
    sender: broadcast::Sender<Event>,
}

impl EventSink {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Best-effort publish. A channel with no subscribers (or a lagging
    /// one) is not treated as a failure.
    pub fn send(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let sink = EventSink::new();
        let mut receiver = sink.subscribe();
        sink.send(Event::PeerSeen { node_id: "aa".to_string() });
        let event = receiver.recv().await.unwrap();
        matches!(event, Event::PeerSeen { node_id } if node_id == "aa");
    }

    #[test]
    fn send_with_no_subscribers_does_not_panic() {
        let sink = EventSink::new();
        sink.send(Event::EnvelopeSeen { msg_id: "m1".to_string() });
    }
}
