//! Fan-out of server-pushed update events
//!
//! One [`UpdateHub`] exists per [`crate::Bridge`]. The socket controller
//! publishes every `{"event": "update"}` frame into it; UI state and the CLI
//! hold [`Subscription`]s. Each subscriber sees each published change exactly
//! once, and dropping a subscription unsubscribes it.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::constants::UPDATE_CHANNEL_CAPACITY;
use crate::protocol::{ChangeKind, UpdateChange};

/// Typed publish/subscribe channel for [`UpdateChange`]s
#[derive(Clone)]
pub struct UpdateHub {
    tx: broadcast::Sender<UpdateChange>,
}

impl Default for UpdateHub {
    fn default() -> Self {
        Self::new(UPDATE_CHANNEL_CAPACITY)
    }
}

impl UpdateHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a change; returns how many subscribers will see it
    pub fn publish(&self, change: UpdateChange) -> usize {
        tracing::debug!("Update {:?} -> {:?}", change.id, change.change.kind());
        // No subscribers is not an error
        self.tx.send(change).unwrap_or(0)
    }

    /// Subscribe to every change
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kinds: None,
        }
    }

    /// Subscribe to the given kinds of change only
    pub fn subscribe_kinds(&self, kinds: &[ChangeKind]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kinds: Some(kinds.to_vec()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving half handed to one consumer
pub struct Subscription {
    rx: broadcast::Receiver<UpdateChange>,
    kinds: Option<Vec<ChangeKind>>,
}

impl Subscription {
    fn wants(&self, change: &UpdateChange) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&change.change.kind()),
            None => true,
        }
    }

    /// Next matching change, or `None` once every hub handle is gone
    pub async fn recv(&mut self) -> Option<UpdateChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.wants(&change) => return Some(change),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Update subscriber lagged, {} changes skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching change if one is already queued
    pub fn try_recv(&mut self) -> Option<UpdateChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if self.wants(&change) => return Some(change),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Update subscriber lagged, {} changes skipped", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Explicit form of dropping the subscription
    pub fn unsubscribe(self) {}
}
