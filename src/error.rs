//! Crate-wide error aggregate. Each module owns a narrow `thiserror` enum
//! (`ContractError`, `LedgerError`, `RunnerError`, ...); `EngineError`
//! folds them into the single `Result` the Job Manager and CLI deal in.

use crate::config::ConfigError;
use crate::contract::ContractError;
use crate::delegation::DelegationError;
use crate::evidence::EvidenceError;
use crate::gate::GateError;
use crate::git::GitError;
use crate::ledger::LedgerError;
use crate::runner::RunnerError;
use crate::session::SessionError;
use crate::state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Delegation(#[from] DelegationError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("contract validation failed: {0:?}")]
    InvalidContract(Vec<ContractError>),
    #[error("phase graph inconsistency: {0}")]
    PhaseGraph(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
