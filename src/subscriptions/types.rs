//! Subscription types for live queries.

use crate::query::{FilterSpec, SortSpec};
use crate::types::Entity;
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// What a subscription selects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveQuery {
    pub entity_type: String,
    /// None = every entity of the type.
    pub filter: Option<FilterSpec>,
    pub sort: SortSpec,
}

impl LiveQuery {
    pub fn new(entity_type: impl Into<String>, filter: Option<FilterSpec>, sort: SortSpec) -> Self {
        Self {
            entity_type: entity_type.into(),
            filter,
            sort,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        entity.entity_type == self.entity_type
            && self.filter.as_ref().map_or(true, |f| f.matches(entity))
    }

    /// Filter and sort. Input order (id order from the store) breaks ties.
    pub fn evaluate<'a>(&self, entities: impl IntoIterator<Item = &'a Entity>) -> Vec<Entity> {
        let mut selected: Vec<Entity> = entities
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();
        self.sort.sort(&mut selected);
        selected
    }
}

/// Signals sent to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// The result set now holds `revision` (or a later one).
    Changed { revision: u64 },

    /// Subscription ended.
    Dropped { reason: DropReason },
}

/// Why a subscription ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// Receiver went away.
    Disconnected,
}

/// One published state of a live result set.
#[derive(Clone, Debug)]
pub struct ResultSnapshot {
    /// Bumped on every publish; 0 is the state at registration.
    pub revision: u64,
    pub entities: Arc<[Entity]>,
}

/// Subscriber side of a live query.
///
/// The result set itself is owned by the store; this handle reads the
/// latest published snapshot and receives change signals.
pub struct LiveResultSet {
    pub(crate) id: SubscriptionId,
    pub(crate) receiver: Receiver<ChangeEvent>,
    pub(crate) current: Arc<RwLock<ResultSnapshot>>,
}

impl LiveResultSet {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Latest snapshot. Cheap; holds no lock after returning.
    pub fn snapshot(&self) -> ResultSnapshot {
        self.current.read().clone()
    }

    pub fn entities(&self) -> Arc<[Entity]> {
        Arc::clone(&self.current.read().entities)
    }

    pub fn revision(&self) -> u64 {
        self.current.read().revision
    }

    pub fn len(&self) -> usize {
        self.current.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive the next signal (blocking).
    pub fn recv(&self) -> Result<ChangeEvent, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a signal (non-blocking).
    pub fn try_recv(&self) -> Result<ChangeEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ChangeEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Consume every queued signal. Returns true if any was a change.
    pub fn drain(&self) -> bool {
        let mut changed = false;
        while let Ok(event) = self.receiver.try_recv() {
            if matches!(event, ChangeEvent::Changed { .. }) {
                changed = true;
            }
        }
        changed
    }
}
