//! Master-level error types.

// Layer 1: Standard library
// (none)

// Layer 2: Third-party
use thiserror::Error;

// Layer 3: Internal
use flotilla_model::{AgentId, FrameworkId, OfferId, ResourceError, TaskId};
use flotilla_registrar::RegistrarError;

/// Errors surfaced by master call handling.
///
/// Validation and authorization errors leave state unchanged and are
/// reported to the caller; fatal errors make the master stop acting as
/// leader.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MasterError {
    /// A call referenced an offer the ledger does not hold (or one owned
    /// by a different framework).
    #[error("unknown offer: {0}")]
    UnknownOffer(OfferId),

    /// A call referenced an unknown or torn-down framework.
    #[error("unknown framework: {0}")]
    UnknownFramework(FrameworkId),

    /// A call referenced an unknown agent.
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// A call referenced an unknown task.
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// A structurally malformed request.
    #[error("invalid call: {0}")]
    InvalidCall(String),

    /// Resource arithmetic failed while validating or applying a call.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The authorizer said no. State unchanged.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The authorizer could not answer. The request is dropped without
    /// deactivating the caller; a retry may succeed.
    #[error("authorization failed: {0}")]
    AuthorizationFailure(String),

    /// The authenticator refused or could not identify the peer.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A principal exceeded its configured rate and queue capacity.
    #[error("rate limit exceeded for principal {0}")]
    RateLimitExceeded(String),

    /// A registry mutation hit a precondition violated by a concurrent
    /// commit. Handled per operation by the lifecycle orchestrator.
    #[error("registry conflict: {0}")]
    RegistryConflict(RegistrarError),

    /// The registry is unavailable past what the leadership invariant
    /// permits; the master abdicates rather than corrupting state.
    #[error("registry unavailable, abdicating leadership")]
    Abdicated,

    /// The master actor is gone (shut down or abdicated).
    #[error("master is not running")]
    NotRunning,
}

impl MasterError {
    /// True for errors a caller may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MasterError::AuthorizationFailure(_) | MasterError::RateLimitExceeded(_)
        )
    }

    /// True if the master must stop acting as leader.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MasterError::Abdicated)
    }
}

impl From<RegistrarError> for MasterError {
    fn from(error: RegistrarError) -> Self {
        if error.is_fatal() {
            MasterError::Abdicated
        } else {
            MasterError::RegistryConflict(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MasterError::AuthorizationFailure("timeout".into()).is_transient());
        assert!(MasterError::RateLimitExceeded("ops".into()).is_transient());
        assert!(!MasterError::AuthorizationDenied("no".into()).is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MasterError::Abdicated.is_fatal());
        assert!(!MasterError::UnknownOffer(OfferId::new("o1")).is_fatal());
    }

    #[test]
    fn test_registrar_unavailable_becomes_abdication() {
        let error: MasterError = RegistrarError::Unavailable.into();
        assert_eq!(error, MasterError::Abdicated);
    }

    #[test]
    fn test_registrar_conflict_is_preserved() {
        let error: MasterError = RegistrarError::NotAdmitted(AgentId::new("a1")).into();
        assert!(matches!(error, MasterError::RegistryConflict(_)));
    }
}
