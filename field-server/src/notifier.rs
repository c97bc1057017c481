//! One-to-many broadcast of arena state events.
//!
//! Every event kind gets its own bounded channel so a slow display only ever
//! loses its own payloads. Publishing never blocks the tick loop; a
//! subscriber that falls more than the buffer behind skips the oldest
//! payloads instead of stalling the arena.

use tokio::sync::broadcast;

/// Payloads buffered per subscriber before the oldest are dropped.
const NOTIFIER_BUFFER_SIZE: usize = 64;

/// A single-kind event broadcaster. Payloads are cloned to every subscriber
/// in FIFO order.
pub struct Notifier<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> Notifier<T> {
    pub fn new() -> Notifier<T> {
        let (sender, _) = broadcast::channel(NOTIFIER_BUFFER_SIZE);
        Notifier { sender }
    }

    /// Delivers the payload to every current subscriber. Having no
    /// subscribers is normal and not an error.
    pub fn notify(&self, payload: T) {
        let _ = self.sender.send(payload);
    }

    /// Opens a new stream of payloads. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn payloads_arrive_in_order() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        notifier.notify(1);
        notifier.notify(2);
        notifier.notify(3);
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Ok(3));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn notifying_without_subscribers_is_fine() {
        let notifier = Notifier::new();
        notifier.notify("nobody listens");
    }

    #[test]
    fn subscribers_only_see_later_payloads() {
        let notifier = Notifier::new();
        notifier.notify(1);
        let mut rx = notifier.subscribe();
        notifier.notify(2);
        assert_eq!(rx.try_recv(), Ok(2));
    }

    #[test]
    fn a_lagging_subscriber_loses_the_oldest() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        for i in 0..(NOTIFIER_BUFFER_SIZE + 5) {
            notifier.notify(i);
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(5))));
        assert_eq!(rx.try_recv(), Ok(5));
    }
}
