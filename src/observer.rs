// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Observers
//!
//! Dependents of the [`crate::broker::Broker`] implement [`ConnectionObserver`]
//! and are notified, in registration order, every time the transport becomes
//! usable or unusable. Registration hands back an opaque [`SubscriptionId`]
//! used to unregister.

use crate::{errors::AmqpError, transport::AmqpConnection};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A dependent of the broker connection.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// The connection became Ready. Failures are the observer's own business:
    /// they are logged and do not abort the broker's connect.
    async fn on_connect(&self, connection: Arc<dyn AmqpConnection>) -> Result<(), AmqpError>;

    /// The connection went away, or the broker is closing.
    async fn on_disconnect(&self) -> Result<(), AmqpError>;
}

/// Handle returned by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered registry of observers. Safe to mutate while a notification round
/// is in flight: rounds work on a snapshot.
#[derive(Default)]
pub(crate) struct Dependents {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Arc<dyn ConnectionObserver>)>>,
}

impl Dependents {
    pub(crate) fn subscribe(&self, observer: Arc<dyn ConnectionObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, observer));
        id
    }

    /// Unknown ids are ignored.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
        self.entries.lock().retain(|(entry, _)| *entry != id);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
