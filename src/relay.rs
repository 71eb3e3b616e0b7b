use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

use crate::bus::{EventBus, WILDCARD};

/// Mirrors every bus event as a `{"event", "payload"}` JSON frame for UI clients.
/// The websocket transport subscribes here and forwards frames verbatim.
#[derive(Clone)]
pub struct Relay {
    tx: broadcast::Sender<String>,
}

impl Relay {
    /// Subscribe to the wildcard topic of `bus`; slow receivers lag past `capacity` frames
    pub fn attach(bus: &EventBus, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let sink = tx.clone();
        bus.subscribe(WILDCARD, move |event| {
            let frame = json!({"event": event.name, "payload": event.payload});
            match serde_json::to_string(&frame) {
                // no receivers is fine, nobody is watching
                Ok(frame) => {
                    let _ = sink.send(frame);
                }
                Err(err) => warn!("Could not encode {} for relay: {}", event.name, err),
            }
            Ok(())
        });
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
