//! Bounded, non-blocking delivery to many subscribers.
//!
//! A [`Fanout`] owns a `tokio::sync::broadcast` channel. Publishing never
//! waits: every [`Subscription`] lags independently, and once it is
//! `capacity` items behind the oldest items are overwritten. The subscriber
//! learns how many it lost on its next receive, which adds them to
//! [`dropped`](Subscription::dropped) and logs a warning. A slow or absent
//! consumer therefore loses history but never stalls the publisher.

use std::sync::Mutex;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError as BroadcastTryRecvError};
use tracing::{debug, warn};

/// Queue capacity used when none is configured.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Publisher side. One per notification stream.
pub struct Fanout<T> {
    name: &'static str,
    capacity: usize,
    /// Replaced by a fresh channel on [`close`](Self::close).
    sender: Mutex<broadcast::Sender<T>>,
}

impl<T: Clone> Fanout<T> {
    /// Create a fan-out whose subscribers buffer at most `capacity` items.
    ///
    /// The channel rounds `capacity` up to a power of two; zero is treated
    /// as one.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name,
            capacity,
            sender: Mutex::new(sender),
        }
    }

    /// Register a new subscriber. It sees items published after this call.
    pub fn subscribe(&self) -> Subscription<T> {
        let sender = self.sender.lock().expect("fanout lock poisoned");
        debug!(
            stream = self.name,
            subscribers = sender.receiver_count() + 1,
            "subscriber registered"
        );
        Subscription {
            stream: self.name,
            rx: sender.subscribe(),
            dropped: 0,
        }
    }

    /// Deliver `item` to every live subscriber without blocking.
    ///
    /// Returns the number of subscribers the item was queued for.
    pub fn publish(&self, item: &T) -> usize {
        let sender = self.sender.lock().expect("fanout lock poisoned");
        // No receivers is not an error: nobody is listening yet.
        sender.send(item.clone()).unwrap_or(0)
    }

    /// Close every subscription. Buffered items remain readable; afterwards
    /// [`Subscription::recv`] returns `None`. New subscriptions may still be
    /// registered.
    pub fn close(&self) {
        let mut sender = self.sender.lock().expect("fanout lock poisoned");
        // Dropping the old sender ends its receivers once they drain.
        *sender = broadcast::channel(self.capacity).0;
        debug!(stream = self.name, "all subscriptions closed");
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .expect("fanout lock poisoned")
            .receiver_count()
    }

    /// Per-subscriber queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Why [`Subscription::try_recv`] returned nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    /// No item is buffered right now.
    #[error("no item buffered")]
    Empty,
    /// The stream was closed and the buffer is drained.
    #[error("subscription closed")]
    Closed,
}

/// Receiving side of a [`Fanout`].
///
/// Wraps a `tokio::sync::broadcast::Receiver<T>`.
pub struct Subscription<T> {
    stream: &'static str,
    rx: broadcast::Receiver<T>,
    dropped: u64,
}

impl<T: Clone> Subscription<T> {
    /// Wait for the next item. Returns `None` once the stream is closed and
    /// every buffered item has been taken. Skips over lost items with a
    /// warning.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(item) => return Some(item),
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered item without waiting.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        loop {
            match self.rx.try_recv() {
                Ok(item) => return Ok(item),
                Err(BroadcastTryRecvError::Lagged(n)) => self.lagged(n),
                Err(BroadcastTryRecvError::Empty) => return Err(TryRecvError::Empty),
                Err(BroadcastTryRecvError::Closed) => return Err(TryRecvError::Closed),
            }
        }
    }

    /// Items this subscriber has been told it lost by falling behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn lagged(&mut self, n: u64) {
        self.dropped += n;
        warn!(
            stream = self.stream,
            skipped = n,
            dropped = self.dropped,
            "subscriber lagged, oldest items dropped"
        );
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream", &self.stream)
            .field("dropped", &self.dropped)
            .finish()
    }
}
