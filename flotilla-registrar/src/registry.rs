//! The durable registry data model.

// Layer 1: Standard library imports
use std::collections::BTreeMap;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use flotilla_model::{AgentId, AgentInfo};

/// The registry: admitted agents and unreachable agents.
///
/// Invariant: no agent id appears in both lists. `BTreeMap` keeps
/// iteration deterministic, which matters for garbage collection tests
/// and for reproducible recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub(crate) admitted: BTreeMap<AgentId, AgentInfo>,
    pub(crate) unreachable: BTreeMap<AgentId, DateTime<Utc>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// All admitted agents.
    pub fn admitted(&self) -> impl Iterator<Item = &AgentInfo> {
        self.admitted.values()
    }

    /// All unreachable agents with the time they became unreachable.
    pub fn unreachable(&self) -> impl Iterator<Item = (&AgentId, &DateTime<Utc>)> {
        self.unreachable.iter()
    }

    /// True if `id` is in the admitted list.
    pub fn is_admitted(&self, id: &AgentId) -> bool {
        self.admitted.contains_key(id)
    }

    /// True if `id` is in the unreachable list.
    pub fn is_unreachable(&self, id: &AgentId) -> bool {
        self.unreachable.contains_key(id)
    }

    /// Number of admitted agents.
    pub fn admitted_count(&self) -> usize {
        self.admitted.len()
    }

    /// Number of unreachable agents.
    pub fn unreachable_count(&self) -> usize {
        self.unreachable.len()
    }

    /// Check the disjointness invariant. Used by tests.
    pub fn lists_are_disjoint(&self) -> bool {
        self.unreachable
            .keys()
            .all(|id| !self.admitted.contains_key(id))
    }
}
