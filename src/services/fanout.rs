//! Race event fan-out
//!
//! Every subscriber gets its own bounded queue. Delivery uses `try_send`, so
//! a slow consumer loses events (counted and logged) instead of stalling the
//! timing loop. Subscribers whose receiver is gone are dropped.

use crate::domain::race::RaceEvent;
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};

struct Subscriber {
    name: String,
    tx: mpsc::Sender<RaceEvent>,
    dropped: u64,
}

pub struct EventFanout {
    subscribers: Vec<Subscriber>,
    metrics: Arc<Metrics>,
}

impl EventFanout {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { subscribers: Vec::new(), metrics }
    }

    /// Register a consumer with a queue of `capacity` events
    pub fn subscribe(&mut self, name: &str, capacity: usize) -> mpsc::Receiver<RaceEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.push(Subscriber { name: name.to_string(), tx, dropped: 0 });
        rx
    }

    /// Deliver one event to every subscriber without blocking.
    /// Returns the number of subscribers that accepted it.
    pub fn publish(&mut self, event: &RaceEvent) -> usize {
        let mut delivered = 0;
        let metrics = &self.metrics;

        self.subscribers.retain_mut(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                sub.dropped += 1;
                metrics.record_event_dropped();
                // Log the first drop, then every hundredth
                if sub.dropped == 1 || sub.dropped % 100 == 0 {
                    warn!(
                        subscriber = %sub.name,
                        event = %event.kind(),
                        dropped = sub.dropped,
                        "event_dropped_queue_full"
                    );
                }
                true
            }
            Err(TrySendError::Closed(_)) => {
                info!(subscriber = %sub.name, "event_subscriber_closed");
                false
            }
        });

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
