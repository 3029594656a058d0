//! Broadcast signals for change notifications.

use tokio::sync::broadcast;

pub const DEFAULT_SIGNAL_CAPACITY: usize = 256;

/// Single-writer, multi-reader notification channel.
///
/// Subscribing returns a receiver; dropping the receiver unsubscribes.
/// Emitting with no subscribers is not an error.
#[derive(Debug)]
pub struct Signal<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Signal<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SIGNAL_CAPACITY)
    }

    /// A receiver more than `capacity` values behind gets `Lagged`.
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn emit(&self, value: T) {
        let _ = self.tx.send(value);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}
