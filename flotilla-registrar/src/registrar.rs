//! The registrar contract and the in-memory reference implementation.

// Layer 1: Standard library imports
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

// Layer 3: Internal module imports
use crate::error::RegistrarError;
use crate::operation::RegistryOperation;
use crate::registry::Registry;

/// Default bound on the unreachable list.
pub const DEFAULT_MAX_UNREACHABLE_AGENTS: usize = 1024;

/// The durable registry contract the master depends on.
///
/// Implementations must linearize `apply` calls: each operation observes
/// every previously committed operation, and the master observes its own
/// commits in submission order.
#[async_trait]
pub trait Registrar: Send + Sync + 'static {
    /// Commit one mutation. `Ok(true)` if the registry changed, `Ok(false)`
    /// for a no-op.
    async fn apply(&self, operation: RegistryOperation) -> Result<bool, RegistrarError>;

    /// Read the full registry. Called once at leader election.
    async fn recover(&self) -> Result<Registry, RegistrarError>;
}

/// In-memory registrar that linearizes commits behind one lock.
///
/// Used by tests and single-node deployments. The unreachable list is
/// bounded: when a `MarkUnreachable` commit pushes it past the configured
/// maximum, the oldest entries are evicted (their metadata is gone, which
/// `MarkReachable` tolerates by design of the protocol).
///
/// # Examples
///
/// ```rust
/// use flotilla_registrar::{InMemoryRegistrar, Registrar, RegistryOperation};
/// use flotilla_model::{AgentId, AgentInfo, PeerAddr, Resources};
///
/// # async fn example() -> Result<(), flotilla_registrar::RegistrarError> {
/// let registrar = InMemoryRegistrar::new(1024);
/// let info = AgentInfo::new("node", PeerAddr::new("10.0.0.1:5051"), Resources::cpus(4.0))
///     .with_id(AgentId::new("m-S0"));
///
/// assert!(registrar.apply(RegistryOperation::Admit(info)).await?);
/// assert_eq!(registrar.recover().await?.admitted_count(), 1);
/// # Ok(())
/// # }
/// ```
pub struct InMemoryRegistrar {
    state: Arc<Mutex<Registry>>,
    max_unreachable: usize,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryRegistrar {
    /// Create an empty registrar bounding the unreachable list.
    pub fn new(max_unreachable: usize) -> Self {
        Self::with_registry(Registry::new(), max_unreachable)
    }

    /// Create a registrar seeded with existing state (failover tests).
    pub fn with_registry(registry: Registry, max_unreachable: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(registry)),
            max_unreachable,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate registry unavailability. While set, every call returns
    /// [`RegistrarError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RegistrarError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistrarError::Unavailable);
        }
        Ok(())
    }

    /// Evict the oldest unreachable entries beyond the bound.
    fn enforce_unreachable_bound(&self, registry: &mut Registry) {
        while registry.unreachable.len() > self.max_unreachable {
            let oldest = registry
                .unreachable
                .iter()
                .min_by_key(|(_, when)| **when)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    debug!(agent_id = %id, "evicting oldest unreachable entry past bound");
                    registry.unreachable.remove(&id);
                }
                None => break,
            }
        }
    }
}

impl Default for InMemoryRegistrar {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNREACHABLE_AGENTS)
    }
}

impl Clone for InMemoryRegistrar {
    /// Cheap clone via Arc; all clones share the same registry.
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            max_unreachable: self.max_unreachable,
            unavailable: Arc::clone(&self.unavailable),
        }
    }
}

#[async_trait]
impl Registrar for InMemoryRegistrar {
    async fn apply(&self, operation: RegistryOperation) -> Result<bool, RegistrarError> {
        self.check_available()?;
        let mut registry = self.state.lock();
        let mutated = operation.apply(&mut registry)?;
        if mutated {
            self.enforce_unreachable_bound(&mut registry);
        }
        Ok(mutated)
    }

    async fn recover(&self) -> Result<Registry, RegistrarError> {
        self.check_available()?;
        Ok(self.state.lock().clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use flotilla_model::{AgentId, AgentInfo, PeerAddr, Resources};

    fn info(id: &str) -> AgentInfo {
        AgentInfo::new(id, PeerAddr::new(format!("{id}:5051")), Resources::cpus(1.0))
            .with_id(AgentId::new(id))
    }

    #[tokio::test]
    async fn test_apply_and_recover() {
        let registrar = InMemoryRegistrar::default();
        assert!(registrar
            .apply(RegistryOperation::Admit(info("a1")))
            .await
            .unwrap());

        let recovered = registrar.recover().await.unwrap();
        assert!(recovered.is_admitted(&AgentId::new("a1")));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let registrar = InMemoryRegistrar::default();
        registrar.set_unavailable(true);

        assert_eq!(
            registrar.apply(RegistryOperation::Admit(info("a1"))).await,
            Err(RegistrarError::Unavailable)
        );
        assert_eq!(registrar.recover().await, Err(RegistrarError::Unavailable));

        registrar.set_unavailable(false);
        assert!(registrar
            .apply(RegistryOperation::Admit(info("a1")))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_bound_evicts_oldest() {
        let registrar = InMemoryRegistrar::new(2);
        let base = Utc::now();

        for (i, name) in ["a1", "a2", "a3"].iter().enumerate() {
            registrar
                .apply(RegistryOperation::Admit(info(name)))
                .await
                .unwrap();
            let when = base + ChronoDuration::seconds(i as i64);
            registrar
                .apply(RegistryOperation::MarkUnreachable(info(name), when))
                .await
                .unwrap();
        }

        let registry = registrar.recover().await.unwrap();
        assert_eq!(registry.unreachable_count(), 2);
        // a1 was the oldest and got evicted.
        assert!(!registry.is_unreachable(&AgentId::new("a1")));
        assert!(registry.is_unreachable(&AgentId::new("a3")));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let registrar = InMemoryRegistrar::default();
        let clone = registrar.clone();

        registrar
            .apply(RegistryOperation::Admit(info("a1")))
            .await
            .unwrap();
        assert!(clone
            .recover()
            .await
            .unwrap()
            .is_admitted(&AgentId::new("a1")));
    }
}
