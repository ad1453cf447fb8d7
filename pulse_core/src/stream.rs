//! Hot, multicast, replay-latest update streams.
//!
//! `ReplayBroadcast` wraps a bounded `tokio::sync::broadcast` channel and
//! remembers the last published value so a new subscriber sees the current
//! value first. Publishing never blocks: a subscriber that falls behind the
//! buffer loses the oldest items and keeps going.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

pub struct ReplayBroadcast<T> {
    tx: broadcast::Sender<T>,
    latest: Mutex<Option<T>>,
}

impl<T: Clone + Send + 'static> ReplayBroadcast<T> {
    /// Create a stream whose per-subscriber buffer holds `capacity` items
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: Mutex::new(None),
        }
    }

    fn latest(&self) -> MutexGuard<'_, Option<T>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a value to every current subscriber
    pub fn publish(&self, value: T) {
        let mut latest = self.latest();
        *latest = Some(value.clone());
        // No subscribers is fine
        let _ = self.tx.send(value);
    }

    /// Subscribe; the current value (if any) is delivered first
    pub fn subscribe(&self) -> Subscription<T> {
        // Hold the latest lock so no publish slips between the snapshot
        // and the receiver registration.
        let latest = self.latest();
        Subscription {
            replay: latest.clone(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> Option<T> {
        self.latest().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One observer's view of a `ReplayBroadcast`
pub struct Subscription<T> {
    replay: Option<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Wait for the next value. Returns `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(value) = self.replay.take() {
            return Some(value);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Update subscriber lagged, dropped {} oldest updates", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next value if one is already buffered
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(value) = self.replay.take() {
            return Some(value);
        }
        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Update subscriber lagged, dropped {} oldest updates", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
