//! Roles, weights, quotas, and the role whitelist.
//!
//! Quotas and weights attach at the role level but are stored here, in the
//! master; roles hold only back-references to their subscribed frameworks.

// Layer 1: Standard library imports
use std::collections::{HashMap, HashSet};

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
use flotilla_model::{FrameworkId, QuotaInfo, Resources, RoleSnapshot};

/// Weight applied to roles without an explicit entry.
pub(crate) const DEFAULT_WEIGHT: f64 = 1.0;

#[derive(Debug, Default)]
pub(crate) struct RoleTable {
    weights: HashMap<String, f64>,
    quotas: HashMap<String, Resources>,
    whitelist: Option<HashSet<String>>,
    frameworks: HashMap<String, HashSet<FrameworkId>>,
}

impl RoleTable {
    pub(crate) fn new(
        weights: HashMap<String, f64>,
        whitelist: Option<HashSet<String>>,
    ) -> Self {
        Self {
            weights,
            quotas: HashMap::new(),
            whitelist,
            frameworks: HashMap::new(),
        }
    }

    /// True if frameworks may subscribe under `role`.
    pub(crate) fn permitted(&self, role: &str) -> bool {
        self.whitelist
            .as_ref()
            .is_none_or(|allowed| allowed.contains(role))
    }

    /// Record a framework subscribing under `roles`. Returns the roles
    /// that did not exist before (the allocator learns about those).
    pub(crate) fn subscribe(&mut self, framework_id: &FrameworkId, roles: &[String]) -> Vec<String> {
        let mut created = Vec::new();
        for role in roles {
            let is_new = !self.frameworks.contains_key(role)
                && !self.weights.contains_key(role)
                && !self.quotas.contains_key(role);
            self.frameworks
                .entry(role.clone())
                .or_default()
                .insert(framework_id.clone());
            if is_new {
                created.push(role.clone());
            }
        }
        created
    }

    /// Record a framework leaving. Returns the roles that became entirely
    /// unknown (no frameworks, no weight, no quota).
    pub(crate) fn unsubscribe(
        &mut self,
        framework_id: &FrameworkId,
        roles: &[String],
    ) -> Vec<String> {
        let mut emptied = Vec::new();
        for role in roles {
            let now_empty = match self.frameworks.get_mut(role) {
                Some(members) => {
                    members.remove(framework_id);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.frameworks.remove(role);
                if !self.weights.contains_key(role) && !self.quotas.contains_key(role) {
                    emptied.push(role.clone());
                }
            }
        }
        emptied
    }

    pub(crate) fn weight(&self, role: &str) -> f64 {
        self.weights.get(role).copied().unwrap_or(DEFAULT_WEIGHT)
    }

    pub(crate) fn set_weight(&mut self, role: impl Into<String>, weight: f64) {
        self.weights.insert(role.into(), weight);
    }

    pub(crate) fn weights(&self) -> Vec<(String, f64)> {
        let mut out: Vec<_> = self
            .weights
            .iter()
            .map(|(role, weight)| (role.clone(), *weight))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub(crate) fn quota(&self, role: &str) -> Option<&Resources> {
        self.quotas.get(role)
    }

    pub(crate) fn set_quota(&mut self, role: impl Into<String>, guarantee: Resources) {
        self.quotas.insert(role.into(), guarantee);
    }

    pub(crate) fn remove_quota(&mut self, role: &str) -> Option<Resources> {
        self.quotas.remove(role)
    }

    pub(crate) fn quotas(&self) -> Vec<QuotaInfo> {
        let mut out: Vec<_> = self
            .quotas
            .iter()
            .map(|(role, guarantee)| QuotaInfo {
                role: role.clone(),
                guarantee: guarantee.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.role.cmp(&b.role));
        out
    }

    /// Operator view of every known role.
    pub(crate) fn snapshot(&self) -> Vec<RoleSnapshot> {
        let mut names: HashSet<&String> = self.frameworks.keys().collect();
        names.extend(self.weights.keys());
        names.extend(self.quotas.keys());

        let mut out: Vec<RoleSnapshot> = names
            .into_iter()
            .map(|name| {
                let mut frameworks: Vec<FrameworkId> = self
                    .frameworks
                    .get(name)
                    .map(|members| members.iter().cloned().collect())
                    .unwrap_or_default();
                frameworks.sort();
                RoleSnapshot {
                    name: name.clone(),
                    weight: self.weight(name),
                    quota: self.quotas.get(name).cloned(),
                    frameworks,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
