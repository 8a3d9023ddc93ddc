//! Subscription fanout
//!
//! Each record keeps a set of live subscriptions. Publishing is a
//! non-blocking `try_send` per subscriber: a full buffer means the
//! subscriber has fallen behind, so it is dropped and its channel closed —
//! it must reconnect with its last seen event ID. One slow subscriber never
//! stalls ingestion or its peers.

use crate::event::Event;
use crate::metrics;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
pub(crate) struct SubscriberSet {
    subscribers: Vec<Subscriber>,
}

impl SubscriberSet {
    /// Register a new subscription and hand back its live channel.
    pub fn subscribe(&mut self, buffer: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(buffer);
        self.subscribers.push(Subscriber {
            id: Uuid::new_v4(),
            tx,
        });
        metrics::ACTIVE_SUBSCRIPTIONS.inc();
        rx
    }

    /// Deliver one event to every live subscription, pruning cancelled and
    /// lagging subscribers. Dropping a subscriber's sender closes its
    /// channel.
    pub fn publish(&mut self, event: &Event) {
        self.subscribers.retain(|sub| {
            if sub.tx.is_closed() {
                debug!(subscriber = %sub.id, "removing cancelled subscription");
                metrics::SUBSCRIBERS_DROPPED
                    .with_label_values(&["cancelled"])
                    .inc();
                metrics::ACTIVE_SUBSCRIPTIONS.dec();
                return false;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscriber = %sub.id,
                        stream_id = %event.stream_id(),
                        "subscriber fell behind, dropping subscription"
                    );
                    metrics::SUBSCRIBERS_DROPPED
                        .with_label_values(&["lagging"])
                        .inc();
                    metrics::ACTIVE_SUBSCRIPTIONS.dec();
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    metrics::SUBSCRIBERS_DROPPED
                        .with_label_values(&["cancelled"])
                        .inc();
                    metrics::ACTIVE_SUBSCRIPTIONS.dec();
                    false
                }
            }
        });
    }

    /// Drop every subscription, closing all channels.
    pub fn close_all(&mut self) {
        metrics::ACTIVE_SUBSCRIPTIONS.sub(self.subscribers.len() as i64);
        self.subscribers.clear();
    }
}
