use thiserror::Error;

/// Core error type for the courier route engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No exchange with the given id exists.
    #[error("Exchange '{0}' not found")]
    ExchangeNotFound(String),

    /// No approval request with the given id exists.
    #[error("Approval '{0}' not found")]
    ApprovalNotFound(String),

    /// No route registered under the given id.
    #[error("Route '{0}' not found")]
    RouteNotFound(String),

    /// An operation was attempted against an exchange or approval in a
    /// state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The caller supplied an unusable payload or query parameter.
    #[error("Bad input: {0}")]
    BadInput(String),

    /// A store-busy condition that survived the bounded retry.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// The operator rejected an approval the executing step was waiting on.
    #[error("Approval rejected: {0}")]
    ApprovalRejected(String),

    /// The approval wait expired before the operator decided.
    #[error("Approval timed out after {minutes} minute(s)")]
    ApprovalTimeout { minutes: f64 },

    /// The external LLM service failed.
    #[error("LLM request failed: {0}")]
    External(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the engine's redelivery policy applies to this error.
    ///
    /// Control-flow outcomes (approval decisions) and caller mistakes are
    /// deterministic; redelivering them cannot change the result.
    #[must_use]
    pub fn is_redeliverable(&self) -> bool {
        !matches!(
            self,
            Self::ApprovalRejected(_)
                | Self::ApprovalTimeout { .. }
                | Self::BadInput(_)
                | Self::InvalidState(_)
                | Self::ExchangeNotFound(_)
                | Self::ApprovalNotFound(_)
                | Self::RouteNotFound(_)
        )
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redeliverable_classification() {
        assert!(EngineError::External("boom".into()).is_redeliverable());
        assert!(EngineError::Transient("busy".into()).is_redeliverable());
        assert!(!EngineError::ApprovalRejected("no".into()).is_redeliverable());
        assert!(!EngineError::BadInput("empty".into()).is_redeliverable());
        assert!(!EngineError::InvalidState("terminal".into()).is_redeliverable());
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::ApprovalRejected("no budget".into());
        assert_eq!(err.to_string(), "Approval rejected: no budget");

        let err = EngineError::ApprovalTimeout { minutes: 60.0 };
        assert!(err.to_string().contains("timed out"));
    }
}
