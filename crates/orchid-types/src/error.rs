use thiserror::Error;

/// The orchestration error taxonomy.
///
/// Every module-level error in the engine (graph, conditions, emitter,
/// state store, dispatch) converts into one of these four categories via
/// `From`, so callers of the public API only ever see this type.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Malformed caller input: empty step list, unknown execution mode,
    /// dangling dependency reference, dependency cycle, duplicate condition
    /// name, overlapping completed/failed sets in a snapshot.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation attempted against state that is structurally impossible
    /// right now: missing workflow definition, engine shutting down,
    /// snapshot timestamp in the future beyond tolerance.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A runtime failure while dispatching a step or thunk to its executor,
    /// or an internal fault (task join failure) during execution.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// A step, thunk, or whole workflow exceeded its timeout budget.
    #[error("{scope} timed out after {timeout_ms}ms")]
    ExecutionTimeout { scope: String, timeout_ms: u64 },
}

impl OrchestrationError {
    /// True for runtime failures, including timeouts (timeouts are a subset
    /// of operation failures in the taxonomy).
    pub fn is_operation_failure(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed(_) | Self::ExecutionTimeout { .. }
        )
    }

    /// True for errors callers can fix by changing their submission.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
