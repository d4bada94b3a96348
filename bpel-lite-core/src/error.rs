use thiserror::Error;

/// Standard BPEL fault names surfaced to the process's own fault handlers.
pub const FAULT_SELECTION_FAILURE: &str = "selectionFailure";
pub const FAULT_CONFLICTING_RECEIVE: &str = "conflictingReceive";
pub const FAULT_MISSING_REQUEST: &str = "missingRequest";

/// Process-level faults raised by the routing core. These map to the
/// standard fault vocabulary and may be caught by the process's own fault
/// handlers; uncaught, the triggering message is rejected as malformed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProcessFault {
    /// Property extraction against a concrete message failed (bad location,
    /// absent node).
    #[error("{FAULT_SELECTION_FAILURE}: {0}")]
    SelectionFailure(String),

    /// A pick/receive armed two branches satisfiable by the same future
    /// reply. `index` is the first offending selector.
    #[error("{FAULT_CONFLICTING_RECEIVE}: selector {index} duplicates an outstanding request")]
    ConflictingReceive { index: usize },

    /// A reply was issued with no matching outstanding request.
    #[error("{FAULT_MISSING_REQUEST}: {0}")]
    MissingRequest(String),
}

impl ProcessFault {
    pub fn fault_name(&self) -> &'static str {
        match self {
            ProcessFault::SelectionFailure(_) => FAULT_SELECTION_FAILURE,
            ProcessFault::ConflictingReceive { .. } => FAULT_CONFLICTING_RECEIVE,
            ProcessFault::MissingRequest(_) => FAULT_MISSING_REQUEST,
        }
    }
}

/// Hard engine errors. `MissingPropertyAlias` is a configuration defect
/// (detectable at compile time, re-checked here); `Consistency` marks an
/// internal-invariant violation — a bug in the router or continuation
/// engine, never a caller error. Neither is retryable.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no alias for property `{property}` on message type `{message_type}`")]
    MissingPropertyAlias {
        property: String,
        message_type: String,
    },

    #[error("engine consistency violation: {0}")]
    Consistency(String),
}

/// Failure during correlation-key computation for one message.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CorrelationError {
    /// Configuration defect — missing alias for a declared property.
    #[error(transparent)]
    Config(EngineError),

    /// Data fault — the message itself cannot satisfy the alias.
    #[error(transparent)]
    Fault(ProcessFault),
}
