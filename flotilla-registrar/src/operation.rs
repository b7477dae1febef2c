//! The five serialized registry mutations.
//!
//! Each operation receives the current registry and returns `Ok(true)` if
//! it mutated, `Ok(false)` if it was a no-op, or an error if a
//! precondition failed. Re-applying an identical command never duplicates
//! state: an `Admit` retry after a committed prior attempt returns a
//! conflict error, which the orchestrator treats as success.

// Layer 1: Standard library imports
use std::collections::HashSet;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

// Layer 3: Internal module imports
use crate::error::RegistrarError;
use crate::registry::Registry;
use flotilla_model::{AgentId, AgentInfo};

/// A durable command against the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryOperation {
    /// Admit a new agent. Fails if the id is already admitted.
    Admit(AgentInfo),
    /// Move an admitted agent to the unreachable list with a timestamp.
    /// Fails if the id is not admitted.
    MarkUnreachable(AgentInfo, DateTime<Utc>),
    /// Move an unreachable agent back to the admitted list. No-op if the
    /// agent is already admitted; still admits (with a warning) if the
    /// registry garbage-collected its unreachable entry.
    MarkReachable(AgentInfo),
    /// Drop the listed ids from the unreachable list. Ids not present are
    /// silently skipped; they may have been concurrently removed.
    PruneUnreachable(HashSet<AgentId>),
    /// Remove an admitted agent entirely. Fails if the id is not admitted.
    Remove(AgentInfo),
}

impl RegistryOperation {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RegistryOperation::Admit(_) => "ADMIT",
            RegistryOperation::MarkUnreachable(..) => "MARK_UNREACHABLE",
            RegistryOperation::MarkReachable(_) => "MARK_REACHABLE",
            RegistryOperation::PruneUnreachable(_) => "PRUNE_UNREACHABLE",
            RegistryOperation::Remove(_) => "REMOVE",
        }
    }

    /// Apply this operation to `registry`.
    pub fn apply(&self, registry: &mut Registry) -> Result<bool, RegistrarError> {
        match self {
            RegistryOperation::Admit(info) => {
                let id = required_id(info)?;
                if registry.admitted.contains_key(&id) {
                    return Err(RegistrarError::AlreadyAdmitted(id));
                }
                registry.admitted.insert(id, info.clone());
                Ok(true)
            }
            RegistryOperation::MarkUnreachable(info, when) => {
                let id = required_id(info)?;
                if registry.admitted.remove(&id).is_none() {
                    return Err(RegistrarError::NotAdmitted(id));
                }
                registry.unreachable.insert(id, *when);
                Ok(true)
            }
            RegistryOperation::MarkReachable(info) => {
                let id = required_id(info)?;
                if registry.admitted.contains_key(&id) {
                    return Ok(false);
                }
                if registry.unreachable.remove(&id).is_none() {
                    // The unreachable entry may have been pruned by GC;
                    // admitting anyway keeps the agent usable.
                    warn!(agent_id = %id, "marking agent reachable without an unreachable entry");
                }
                registry.admitted.insert(id, info.clone());
                Ok(true)
            }
            RegistryOperation::PruneUnreachable(ids) => {
                let mut changed = false;
                for id in ids {
                    changed |= registry.unreachable.remove(id).is_some();
                }
                Ok(changed)
            }
            RegistryOperation::Remove(info) => {
                let id = required_id(info)?;
                if registry.admitted.remove(&id).is_none() {
                    return Err(RegistrarError::NotAdmitted(id));
                }
                Ok(true)
            }
        }
    }
}

fn required_id(info: &AgentInfo) -> Result<AgentId, RegistrarError> {
    info.id.clone().ok_or(RegistrarError::MissingAgentId)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flotilla_model::{PeerAddr, Resources};

    fn info(id: &str) -> AgentInfo {
        AgentInfo::new(id, PeerAddr::new(format!("{id}:5051")), Resources::cpus(4.0))
            .with_id(AgentId::new(id))
    }

    #[test]
    fn test_admit_then_admit_conflicts() {
        let mut registry = Registry::new();
        let op = RegistryOperation::Admit(info("a1"));

        assert_eq!(op.apply(&mut registry), Ok(true));
        let before = registry.clone();

        // Identical re-application: conflict error, registry unchanged.
        assert_eq!(
            op.apply(&mut registry),
            Err(RegistrarError::AlreadyAdmitted(AgentId::new("a1")))
        );
        assert_eq!(registry, before);
    }

    #[test]
    fn test_admit_requires_id() {
        let mut registry = Registry::new();
        let mut no_id = info("a1");
        no_id.id = None;
        assert_eq!(
            RegistryOperation::Admit(no_id).apply(&mut registry),
            Err(RegistrarError::MissingAgentId)
        );
    }

    #[test]
    fn test_mark_unreachable_moves_entry() {
        let mut registry = Registry::new();
        RegistryOperation::Admit(info("a1"))
            .apply(&mut registry)
            .unwrap();

        let when = Utc::now();
        assert_eq!(
            RegistryOperation::MarkUnreachable(info("a1"), when).apply(&mut registry),
            Ok(true)
        );
        assert!(!registry.is_admitted(&AgentId::new("a1")));
        assert!(registry.is_unreachable(&AgentId::new("a1")));
        assert!(registry.lists_are_disjoint());
    }

    #[test]
    fn test_mark_unreachable_requires_admission() {
        let mut registry = Registry::new();
        assert_eq!(
            RegistryOperation::MarkUnreachable(info("a1"), Utc::now()).apply(&mut registry),
            Err(RegistrarError::NotAdmitted(AgentId::new("a1")))
        );
    }

    #[test]
    fn test_unreachable_reachable_round_trip() {
        let mut registry = Registry::new();
        RegistryOperation::Admit(info("a1"))
            .apply(&mut registry)
            .unwrap();
        let before = registry.clone();

        RegistryOperation::MarkUnreachable(info("a1"), Utc::now())
            .apply(&mut registry)
            .unwrap();
        assert_eq!(
            RegistryOperation::MarkReachable(info("a1")).apply(&mut registry),
            Ok(true)
        );

        assert_eq!(registry, before);
    }

    #[test]
    fn test_mark_reachable_is_noop_when_admitted() {
        let mut registry = Registry::new();
        RegistryOperation::Admit(info("a1"))
            .apply(&mut registry)
            .unwrap();
        assert_eq!(
            RegistryOperation::MarkReachable(info("a1")).apply(&mut registry),
            Ok(false)
        );
    }

    #[test]
    fn test_mark_reachable_admits_pruned_agent() {
        // The agent is in neither list: GC pruned its metadata. The
        // operation still admits it.
        let mut registry = Registry::new();
        assert_eq!(
            RegistryOperation::MarkReachable(info("a1")).apply(&mut registry),
            Ok(true)
        );
        assert!(registry.is_admitted(&AgentId::new("a1")));
    }

    #[test]
    fn test_prune_skips_missing_ids() {
        let mut registry = Registry::new();
        RegistryOperation::Admit(info("a1"))
            .apply(&mut registry)
            .unwrap();
        RegistryOperation::MarkUnreachable(info("a1"), Utc::now())
            .apply(&mut registry)
            .unwrap();

        let ids: HashSet<AgentId> = [AgentId::new("a1"), AgentId::new("ghost")]
            .into_iter()
            .collect();
        assert_eq!(
            RegistryOperation::PruneUnreachable(ids).apply(&mut registry),
            Ok(true)
        );
        assert_eq!(registry.unreachable_count(), 0);

        // Pruning only absent ids is a no-op.
        let ghost: HashSet<AgentId> = [AgentId::new("ghost")].into_iter().collect();
        assert_eq!(
            RegistryOperation::PruneUnreachable(ghost).apply(&mut registry),
            Ok(false)
        );
    }

    #[test]
    fn test_remove() {
        let mut registry = Registry::new();
        RegistryOperation::Admit(info("a1"))
            .apply(&mut registry)
            .unwrap();

        assert_eq!(
            RegistryOperation::Remove(info("a1")).apply(&mut registry),
            Ok(true)
        );
        assert_eq!(
            RegistryOperation::Remove(info("a1")).apply(&mut registry),
            Err(RegistrarError::NotAdmitted(AgentId::new("a1")))
        );
    }
}
