//! Registrar error types.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
use flotilla_model::AgentId;

/// Errors surfaced by registry mutations and the registrar itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrarError {
    /// An `Admit` named an id that is already admitted.
    #[error("agent {0} is already admitted")]
    AlreadyAdmitted(AgentId),

    /// A `MarkUnreachable` or `Remove` named an id that is not admitted.
    #[error("agent {0} is not admitted")]
    NotAdmitted(AgentId),

    /// An operation carried an `AgentInfo` without an assigned id.
    #[error("agent info carries no id")]
    MissingAgentId,

    /// The registry cannot currently commit. The master treats sustained
    /// unavailability as fatal and abdicates leadership.
    #[error("registry unavailable")]
    Unavailable,
}

impl RegistrarError {
    /// True for precondition violations caused by a concurrent commit.
    ///
    /// The orchestrator treats a conflict on a retried operation as
    /// success: some earlier attempt already committed.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RegistrarError::AlreadyAdmitted(_) | RegistrarError::NotAdmitted(_)
        )
    }

    /// True if the master must stop acting as leader.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistrarError::Unavailable)
    }
}
