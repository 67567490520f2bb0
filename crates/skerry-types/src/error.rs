//! Error types shared across the engine.

use thiserror::Error;

use crate::entity::Entity;

/// Errors surfaced by simulation-side operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    /// An entity handle did not resolve in the registry it was used with.
    #[error("unknown entity: {0}")]
    UnknownEntity(Entity),

    /// A constraint referenced a body without a graph node.
    #[error("constraint body {0} has no graph node")]
    MissingGraphNode(Entity),

    /// Invalid timestep.
    #[error("invalid timestep: {0} (must be positive and finite)")]
    InvalidTimestep(f64),

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// Worker shutdown did not complete within the allotted time.
    #[error("worker for island {island} did not terminate within {timeout_secs} s")]
    WorkerJoinTimeout {
        /// Island whose worker failed to stop.
        island: Entity,
        /// The timeout that elapsed.
        timeout_secs: f64,
    },
}

impl SimError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Check whether this is a configuration error.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SimError::UnknownEntity(Entity::from_parts(4, 1));
        assert!(err.to_string().contains("4v1"));

        let err = SimError::invalid_config("bad value");
        assert!(err.is_config_error());
        assert!(err.to_string().contains("bad value"));
    }
}
