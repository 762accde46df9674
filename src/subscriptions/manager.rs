//! Subscription manager for live result sets.

use crate::error::{Result, StoreError};
use crate::types::Entity;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::types::{
    ChangeEvent, DropReason, LiveQuery, LiveResultSet, ResultSnapshot, SubscriptionId,
};

/// Default capacity of each subscriber's signal channel.
const DEFAULT_BUFFER_SIZE: usize = 16;

/// Internal subscription state.
struct Subscription {
    query: LiveQuery,
    sender: Sender<ChangeEvent>,
    current: Arc<RwLock<ResultSnapshot>>,
}

impl Subscription {
    /// Publish a new result set and signal it. Returns false if the
    /// subscriber is gone.
    ///
    /// A full buffer is fine: the subscriber already has a pending signal
    /// and will read the latest snapshot when it handles it.
    fn publish(&self, entities: Vec<Entity>) -> bool {
        let revision = {
            let mut current = self.current.write();
            current.revision += 1;
            current.entities = entities.into();
            current.revision
        };

        match self.sender.try_send(ChangeEvent::Changed { revision }) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn differs_from(&self, fresh: &[Entity]) -> bool {
        self.current.read().entities[..] != *fresh
    }
}

/// Owns every live result set and keeps them current.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    buffer_size: usize,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a manager whose subscribers buffer up to `buffer_size` signals.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Register a query with its initial results.
    ///
    /// The caller evaluates `initial` under the same lock that serializes
    /// mutations, so no change can slip between evaluation and registration.
    pub fn register(&self, query: LiveQuery, initial: Vec<Entity>) -> LiveResultSet {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.buffer_size);
        let current = Arc::new(RwLock::new(ResultSnapshot {
            revision: 0,
            entities: initial.into(),
        }));

        debug!(subscription = id.0, entity_type = %query.entity_type, "registered live query");

        self.subscriptions.write().insert(
            id,
            Subscription {
                query,
                sender,
                current: Arc::clone(&current),
            },
        );

        LiveResultSet {
            id,
            receiver,
            current,
        }
    }

    /// Swap the query of a subscription and publish its new results.
    pub fn replace_query(
        &self,
        id: SubscriptionId,
        query: LiveQuery,
        results: Vec<Entity>,
    ) -> Result<()> {
        let mut subs = self.subscriptions.write();
        let sub = subs.get_mut(&id).ok_or(StoreError::SubscriptionNotFound(id))?;
        sub.query = query;
        if !sub.publish(results) {
            subs.remove(&id);
            debug!(subscription = id.0, "pruned disconnected subscriber");
        }
        Ok(())
    }

    /// Unsubscribe. Unknown ids are ignored, so this is idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.write().remove(&id);
        match removed {
            Some(sub) => {
                // Best effort; the receiver may already be gone
                let _ = sub.sender.try_send(ChangeEvent::Dropped {
                    reason: DropReason::Unsubscribed,
                });
                debug!(subscription = id.0, "unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Query of a subscription.
    pub fn query(&self, id: SubscriptionId) -> Option<LiveQuery> {
        self.subscriptions.read().get(&id).map(|s| s.query.clone())
    }

    /// Re-evaluate every subscription and publish the ones whose results
    /// changed. Subscribers whose receiver is gone are removed.
    ///
    /// Returns the number of subscribers notified.
    pub fn refresh<F>(&self, evaluate: F) -> usize
    where
        F: Fn(&LiveQuery) -> Vec<Entity>,
    {
        let mut notified = 0;
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                let fresh = evaluate(&sub.query);
                if !sub.differs_from(&fresh) {
                    continue;
                }
                if sub.publish(fresh) {
                    notified += 1;
                } else {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if subs.remove(&id).is_some() {
                    debug!(subscription = id.0, reason = ?DropReason::Disconnected, "pruned subscriber");
                }
            }
        }

        notified
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
