//! Error types for the entity store.

use crate::subscriptions::SubscriptionId;
use crate::types::EntityId;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An insert or update does not fit the declared schema.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// A save could not be committed to disk.
    #[error("Save failed: {0}")]
    Persist(String),

    /// Unsupported predicate kind, malformed filter or unknown filter/sort key.
    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    /// The store could not be opened. Callers must not continue with it.
    #[error("Failed to load store at {path}: {reason}")]
    StoreLoadFailure { path: PathBuf, reason: String },

    #[error("Unique constraint violated on {entity_type}.{field} = {value:?}")]
    UniqueConstraint {
        entity_type: String,
        field: String,
        value: String,
    },

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("Schema already registered with a different definition: {0}")]
    SchemaExists(String),

    #[error("Subscription not found: {0:?}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

impl StoreError {
    pub(crate) fn invalid_predicate(msg: impl Into<String>) -> Self {
        StoreError::InvalidPredicate(msg.into())
    }

    pub(crate) fn schema_violation(msg: impl Into<String>) -> Self {
        StoreError::SchemaViolation(msg.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
