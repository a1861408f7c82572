//! Update notifications
//!
//! Subscribers register a threshold and receive a one-shot notification
//! carrying the first announced commit time greater than it. Each
//! subscription fires at most once.

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct Subscriber {
    sender: oneshot::Sender<i64>,
    min_timestamp: i64,
}

#[derive(Default)]
pub struct UpdateNotifier {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl UpdateNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next announcement of a timestamp greater than `min_timestamp`
    pub fn subscribe(&self, min_timestamp: i64) -> oneshot::Receiver<i64> {
        let (sender, receiver) = oneshot::channel();
        self.subscribers.lock().push(Subscriber {
            sender,
            min_timestamp,
        });
        receiver
    }

    /// Deliver `timestamp` to every subscriber whose threshold it exceeds
    pub fn announce(&self, timestamp: i64) {
        let mut subscribers = self.subscribers.lock();
        let pending = std::mem::take(&mut *subscribers);
        for subscriber in pending {
            if subscriber.min_timestamp < timestamp {
                // Receiver may be gone already
                let _ = subscriber.sender.send(timestamp);
            } else if !subscriber.sender.is_closed() {
                subscribers.push(subscriber);
            }
        }
    }

    /// Number of subscriptions still waiting
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for UpdateNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
