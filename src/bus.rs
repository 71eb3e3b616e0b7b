use std::{
    collections::HashMap,
    error::Error,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Topic that receives every published event
pub const WILDCARD: &str = "*";

/// A published event, handlers always see the originating name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

pub type HandlerError = Box<dyn Error + Send + Sync>;
pub type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<Handler>>,
    wildcard: Vec<Handler>,
}

/// In-process publish/subscribe hub.
///
/// Cloning is cheap and every clone shares the same registry.  Handlers run
/// synchronously on the publishing task, exact-topic handlers first and then
/// wildcard handlers, each in subscription order.  The registry lock is only
/// held while the handler list is copied, so a handler may publish or
/// subscribe without deadlocking.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`, or for every event if `topic` is [`WILDCARD`]
    pub fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let mut registry = self.registry.write();
        if topic == WILDCARD {
            registry.wildcard.push(handler);
        } else {
            registry
                .exact
                .entry(topic.to_string())
                .or_default()
                .push(handler);
        }
    }

    /// Subscribe and receive matching events on a channel, for use inside a `select!` loop
    pub fn subscribe_channel(&self, topic: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(topic, move |event| {
            if tx.send(event.clone()).is_err() {
                trace!("Dropping {} for closed channel subscriber", event.name);
            }
            Ok(())
        });
        rx
    }

    /// Deliver `payload` to every handler registered for `topic` and to all wildcard handlers
    pub fn publish(&self, topic: &str, payload: Value) {
        let handlers: Vec<Handler> = {
            let registry = self.registry.read();
            registry
                .exact
                .get(topic)
                .into_iter()
                .flatten()
                .chain(registry.wildcard.iter())
                .cloned()
                .collect()
        };

        let event = Event {
            name: topic.to_string(),
            payload,
        };

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Bus handler for {} failed: {}", event.name, err),
                Err(_) => warn!("Bus handler for {} panicked", event.name),
            }
        }
    }

    /// Serialize `payload` and publish it, logging instead of failing if it cannot be encoded
    pub fn publish_serialized<T: Serialize>(&self, topic: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.publish(topic, value),
            Err(err) => warn!("Could not encode payload for {}: {}", topic, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    #[test]
    fn exact_handlers_run_before_wildcard() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["wild-1", "wild-2"] {
            let order = order.clone();
            bus.subscribe(WILDCARD, move |_| {
                order.lock().push(label);
                Ok(())
            });
        }
        for label in ["exact-1", "exact-2", "exact-3"] {
            let order = order.clone();
            bus.subscribe("network_update", move |_| {
                order.lock().push(label);
                Ok(())
            });
        }

        bus.publish("network_update", json!({}));

        assert_eq!(
            *order.lock(),
            vec!["exact-1", "exact-2", "exact-3", "wild-1", "wild-2"]
        );
    }

    #[test]
    fn other_topics_only_reach_wildcard() {
        let bus = EventBus::new();
        let exact = Arc::new(AtomicUsize::new(0));
        let wild = Arc::new(AtomicUsize::new(0));

        let counter = exact.clone();
        bus.subscribe("ota_status", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = wild.clone();
        bus.subscribe(WILDCARD, move |event| {
            assert_eq!(event.name, "gps_update");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish("gps_update", json!({"fix": true}));

        assert_eq!(exact.load(Ordering::SeqCst), 0);
        assert_eq!(wild.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_handlers_do_not_stop_delivery() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        bus.subscribe("modem_update", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe("modem_update", |_| Err("boom".into()));
        bus.subscribe("modem_update", |_| panic!("handler panic"));
        let counter = calls.clone();
        bus.subscribe("modem_update", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish("modem_update", json!({}));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handlers_can_publish_and_subscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let inner = bus.clone();
        bus.subscribe("first", move |_| {
            inner.publish("second", json!({}));
            inner.subscribe("third", |_| Ok(()));
            Ok(())
        });
        let counter = seen.clone();
        bus.subscribe("second", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish("first", json!({}));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_channel("modem_connect_request");

        bus.publish("modem_connect_request", json!({}));
        bus.publish("unrelated", json!({}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "modem_connect_request");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn concurrent_publish_and_subscribe() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let bus = bus.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        bus.subscribe("tick", move |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                    } else {
                        for _ in 0..100 {
                            bus.publish("tick", json!({}));
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let before = calls.load(Ordering::SeqCst);
        bus.publish("tick", json!({}));
        assert_eq!(calls.load(Ordering::SeqCst), before + 4);
    }
}
