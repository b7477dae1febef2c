//! Authentication and authorization seams.
//!
//! The master never blocks on either subsystem: it submits a request,
//! suspends the affected handler, and resumes when the completion event
//! arrives. Pending authentications are tracked per remote endpoint; a
//! newer attempt supersedes the in-flight one and stale completions are
//! discarded by generation.

// Layer 1: Standard library imports
use std::collections::HashMap;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use thiserror::Error;

// Layer 3: Internal module imports
use crate::event::Event;
use flotilla_model::{FrameworkId, PeerAddr, TaskId};

/// The authorization backend could not produce an answer.
///
/// Distinct from a denial: the request is dropped without deactivating the
/// caller, and a retry may succeed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("authorization backend failure: {0}")]
pub struct AuthorizationError(pub String);

/// The authentication backend failed outright.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("authentication backend failure: {0}")]
pub struct AuthenticationError(pub String);

/// An action a principal wants to perform, named by its object.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    RegisterFramework { roles: Vec<String> },
    TeardownFramework { framework_id: FrameworkId },
    RunTask { task_id: TaskId },
    Reserve { role: Option<String> },
    Unreserve { role: Option<String> },
    CreateVolume { role: Option<String> },
    DestroyVolume { role: Option<String> },
    GetQuota,
    SetQuota { role: String },
    RemoveQuota { role: String },
    UpdateWeights,
    UpdateMaintenance,
    MarkAgentGone,
    ViewState,
}

/// A full authorization request: who wants to do what.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationRequest {
    pub principal: Option<String>,
    pub action: Action,
}

impl AuthorizationRequest {
    /// Build a request.
    pub fn new(principal: Option<String>, action: Action) -> Self {
        Self { principal, action }
    }
}

/// The authorizer contract.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    /// Decide whether the request is allowed. `Err` signals a transient
    /// backend failure, not a denial.
    async fn authorize(&self, request: AuthorizationRequest) -> Result<bool, AuthorizationError>;
}

/// Authorizer that allows everything. Used when no ACLs are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveAuthorizer;

#[async_trait]
impl Authorizer for PermissiveAuthorizer {
    #[inline(always)]
    async fn authorize(&self, _request: AuthorizationRequest) -> Result<bool, AuthorizationError> {
        Ok(true)
    }
}

/// The authenticator contract.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticate a remote endpoint. `Ok(None)` means the peer could not
    /// prove any identity; whether that is acceptable depends on the
    /// master's `authentication_required` flag.
    async fn authenticate(&self, peer: &PeerAddr)
        -> Result<Option<String>, AuthenticationError>;
}

/// Authenticator backed by a static peer-to-principal table.
///
/// Stands in for real challenge-response modules, which are out of scope;
/// anything implementing [`Authenticator`] plugs in the same way.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    principals: HashMap<PeerAddr, String>,
}

impl StaticAuthenticator {
    /// An authenticator that identifies nobody.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a known peer.
    pub fn with_principal(mut self, peer: PeerAddr, principal: impl Into<String>) -> Self {
        self.principals.insert(peer, principal.into());
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        peer: &PeerAddr,
    ) -> Result<Option<String>, AuthenticationError> {
        Ok(self.principals.get(peer).cloned())
    }
}

/// One in-flight authentication attempt for a peer.
#[derive(Debug)]
struct PendingAuthentication {
    generation: u64,
    /// Calls that arrived while authentication was in flight; dispatched
    /// once the attempt completes.
    queued: Vec<Event>,
}

/// Tracks authenticated peers and in-flight authentication attempts.
///
/// All mutation happens from the master actor; the tracker itself is plain
/// data.
#[derive(Debug, Default)]
pub(crate) struct AuthTracker {
    authenticated: HashMap<PeerAddr, Option<String>>,
    pending: HashMap<PeerAddr, PendingAuthentication>,
    next_generation: u64,
}

impl AuthTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The cached principal for a peer, if authentication completed.
    pub(crate) fn principal(&self, peer: &PeerAddr) -> Option<&Option<String>> {
        self.authenticated.get(peer)
    }

    /// Start a new attempt for `peer`, superseding any in-flight one.
    ///
    /// Calls queued behind the superseded attempt stay queued; only the
    /// stale completion is discarded (by generation mismatch). Returns the
    /// generation to stamp on the completion event.
    pub(crate) fn begin(&mut self, peer: PeerAddr, first: Event) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let entry = self
            .pending
            .entry(peer)
            .or_insert_with(|| PendingAuthentication {
                generation,
                queued: Vec::new(),
            });
        entry.generation = generation;
        entry.queued.push(first);
        generation
    }

    /// Queue a call behind an in-flight attempt. Returns false (and leaves
    /// the event with the caller) if nothing is pending for the peer.
    pub(crate) fn enqueue(&mut self, peer: &PeerAddr, event: Event) -> Result<(), Event> {
        match self.pending.get_mut(peer) {
            Some(pending) => {
                pending.queued.push(event);
                Ok(())
            }
            None => Err(event),
        }
    }

    /// True if an attempt is in flight for `peer`.
    pub(crate) fn is_pending(&self, peer: &PeerAddr) -> bool {
        self.pending.contains_key(peer)
    }

    /// Complete an attempt. Returns the queued calls to dispatch, or
    /// `None` when the completion is stale (superseded or forgotten).
    pub(crate) fn complete(
        &mut self,
        peer: &PeerAddr,
        generation: u64,
        principal: Option<Option<String>>,
    ) -> Option<Vec<Event>> {
        let current = self.pending.get(peer)?.generation;
        if current != generation {
            return None;
        }
        let pending = self.pending.remove(peer)?;
        if let Some(principal) = principal {
            self.authenticated.insert(peer.clone(), principal);
        }
        Some(pending.queued)
    }

    /// Forget everything about a peer (transport closed).
    pub(crate) fn forget(&mut self, peer: &PeerAddr) {
        self.authenticated.remove(peer);
        self.pending.remove(peer);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Event;
    use flotilla_model::AgentId;

    fn event() -> Event {
        Event::AgentHealthCheckFailed {
            agent_id: AgentId::new("probe"),
        }
    }

    #[tokio::test]
    async fn test_permissive_authorizer() {
        let authorizer = PermissiveAuthorizer;
        let request = AuthorizationRequest::new(None, Action::UpdateWeights);
        assert_eq!(authorizer.authorize(request).await, Ok(true));
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let peer = PeerAddr::new("10.0.0.9:36000");
        let authenticator =
            StaticAuthenticator::new().with_principal(peer.clone(), "ops");

        assert_eq!(
            authenticator.authenticate(&peer).await,
            Ok(Some("ops".to_owned()))
        );
        assert_eq!(
            authenticator
                .authenticate(&PeerAddr::new("10.0.0.10:36000"))
                .await,
            Ok(None)
        );
    }

    #[test]
    fn test_tracker_complete_drains_queue() {
        let mut tracker = AuthTracker::new();
        let peer = PeerAddr::new("10.0.0.9:36000");

        let generation = tracker.begin(peer.clone(), event());
        tracker.enqueue(&peer, event()).unwrap();

        let drained = tracker
            .complete(&peer, generation, Some(Some("ops".to_owned())))
            .unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(
            tracker.principal(&peer),
            Some(&Some("ops".to_owned()))
        );
        assert!(!tracker.is_pending(&peer));
    }

    #[test]
    fn test_stale_completion_discarded() {
        let mut tracker = AuthTracker::new();
        let peer = PeerAddr::new("10.0.0.9:36000");

        let old = tracker.begin(peer.clone(), event());
        // A newer attempt supersedes the old one.
        let new = tracker.begin(peer.clone(), event());
        assert_ne!(old, new);

        assert!(tracker
            .complete(&peer, old, Some(Some("stale".to_owned())))
            .is_none());
        // The superseding attempt still completes and drains both calls.
        let drained = tracker.complete(&peer, new, Some(None)).unwrap();
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn test_enqueue_without_pending_returns_event() {
        let mut tracker = AuthTracker::new();
        let peer = PeerAddr::new("10.0.0.9:36000");
        assert!(tracker.enqueue(&peer, event()).is_err());
    }

    #[test]
    fn test_forget_clears_state() {
        let mut tracker = AuthTracker::new();
        let peer = PeerAddr::new("10.0.0.9:36000");
        let generation = tracker.begin(peer.clone(), event());
        tracker
            .complete(&peer, generation, Some(Some("ops".to_owned())))
            .unwrap();
        tracker.begin(peer.clone(), event());

        tracker.forget(&peer);
        assert!(tracker.principal(&peer).is_none());
        assert!(!tracker.is_pending(&peer));
    }
}
