//! Network-layer errors.
//!
//! Protocol errors are values: a malformed packet is dropped with a warning,
//! never a panic, and nothing crosses the message queues.

use thiserror::Error;

use skerry_types::comp::ComponentId;

/// Errors from packet handling and reconciliation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NetError {
    /// A pool carried an unknown component ordinal.
    #[error("unknown component index {index} on the wire")]
    UnknownComponentIndex {
        /// The offending ordinal.
        index: u16,
    },

    /// A pool's ordinal contradicted its payload kind.
    #[error("pool at index {index} actually carries {actual:?}")]
    PoolKindMismatch {
        /// The claimed ordinal.
        index: u16,
        /// The actual kind of the payload.
        actual: ComponentId,
    },

    /// A local-only component kind was offered for the wire.
    #[error("component {id:?} is not networked")]
    NotNetworked {
        /// The offending kind.
        id: ComponentId,
    },

    /// Serialization failed.
    #[error("codec error: {reason}")]
    Codec {
        /// Backend error description.
        reason: String,
    },
}
