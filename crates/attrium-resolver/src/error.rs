//! Error types for the resolver crate.
//!
//! The resolver itself reports outcomes through status enums, never through
//! errors; only the injected transport has a genuine failure mode.

/// Failure reported by a frame transport. The resolver logs it and turns it
/// into [`crate::ExecuteStatus::NotReady`] for the caller.
#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);
