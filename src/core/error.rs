use thiserror::Error;

use crate::core::models::OperationMode;

/// Requests the orchestrator refuses outright. A rejected request changes no
/// state and produces no status events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("cannot start a new operation while {active} is in progress")]
    Busy { active: OperationMode },

    #[error("the programmer board is not connected")]
    NotConnected,

    #[error("cannot change the SIMM capacity while {active} is in progress")]
    CapacityChangeWhileBusy { active: OperationMode },

    #[error("the orchestrator is no longer running")]
    Stopped,
}
