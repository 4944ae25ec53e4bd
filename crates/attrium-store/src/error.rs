//! Error types for the attribute store.

use crate::AttributeId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The handle does not refer to a live node: it is stale, was purged, or
    /// the node is marked for deletion.
    #[error("invalid attribute handle {0}")]
    InvalidNode(AttributeId),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
