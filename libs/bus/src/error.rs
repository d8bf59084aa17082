//! Error types for bus operations.

use thiserror::Error;

/// Errors that can occur when talking to the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport is gone (all subscribers dropped, or shut down).
    #[error("bus connection closed")]
    Closed,

    /// A payload could not be encoded for the wire.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}
