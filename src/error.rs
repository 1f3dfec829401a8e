//! Crate-wide error types.

use thiserror::Error;

/// Errors surfaced by the fleet subsystem.
///
/// Per-job failures never reach callers as errors — the worker converts them
/// into published run-error events. `NotFound` is thrown from supervisor-level
/// calls (`add_agent`, `agent_updated`) so the control-message handler can log
/// and move on instead of silently running an inconsistent fleet.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("spell execution error: {0}")]
    Execution(String),

    #[error("fabric error: {0}")]
    Fabric(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// True when the error means a record (agent or spell) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound(_))
    }
}
