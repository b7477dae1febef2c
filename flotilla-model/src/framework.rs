//! Framework descriptor.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
// (none)

/// Framework description, supplied with every subscribe call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub name: String,
    /// Authenticated identity used for authorization and rate limiting.
    pub principal: Option<String>,
    /// Roles the framework subscribes under; offers are made per role.
    pub roles: Vec<String>,
    /// How long the master keeps the framework's tasks alive after its
    /// transport closes. `None` falls back to the master's configured
    /// default.
    pub failover_timeout: Option<Duration>,
}

impl FrameworkInfo {
    /// Create a framework description subscribed under a single role.
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            principal: None,
            roles: vec![role.into()],
            failover_timeout: None,
        }
    }

    /// Set the authenticated principal.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Set the failover timeout.
    pub fn with_failover_timeout(mut self, timeout: Duration) -> Self {
        self.failover_timeout = Some(timeout);
        self
    }

    /// Subscribe under an additional role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let info = FrameworkInfo::new("batch", "analytics")
            .with_principal("ops")
            .with_role("backup")
            .with_failover_timeout(Duration::from_secs(300));

        assert_eq!(info.roles, vec!["analytics", "backup"]);
        assert_eq!(info.principal.as_deref(), Some("ops"));
        assert_eq!(info.failover_timeout, Some(Duration::from_secs(300)));
    }
}
