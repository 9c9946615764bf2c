//! Best-effort change-notification fan-out
//!
//! The refresh task announces changed device keys to one subscriber per
//! advertised resource. Subscribers are long-lived streaming loops that may
//! be slow or wedged; a `try_send` over a bounded channel keeps the refresh
//! task from ever blocking on them. A subscriber that falls behind simply
//! misses a batch and re-reads full state on its next wakeup.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, warn};

/// Per-subscriber channel depth.
const SUBSCRIBER_BUFFER: usize = 16;

/// Fan-out of cloned updates to a set of bounded subscriber channels.
pub struct Broadcaster<T> {
    subscribers: Vec<Sender<T>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&mut self) -> Receiver<T> {
        let (tx, rx) = bounded(SUBSCRIBER_BUFFER);
        self.subscribers.push(tx);
        rx
    }

    /// Send `update` to every subscriber without blocking.
    ///
    /// A full channel drops the update for that subscriber; a closed one is
    /// pruned.
    pub fn broadcast(&mut self, update: T) {
        self.subscribers.retain(|tx| match tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("subscriber channel full; dropping update");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("pruning closed subscriber channel");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Close all subscriber channels, waking their receive loops for
    /// shutdown.
    pub fn close(&mut self) {
        for tx in self.subscribers.drain(..) {
            tx.close();
        }
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}
