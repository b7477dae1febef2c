//! Agent descriptor and capabilities.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::ids::{AgentId, MachineId, PeerAddr};
use crate::resources::Resources;

/// Optional agent features advertised at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentCapability {
    /// The agent can run tasks for frameworks subscribed under several roles.
    MultiRole,
    /// The agent tolerates being marked unreachable and re-admitted without
    /// losing its checkpointed resources.
    PartitionAware,
}

/// Agent description, as registered and as persisted in the registry.
///
/// `id` is `None` on a first registration attempt; the master assigns the
/// id before the agent is admitted, and every persisted `AgentInfo` carries
/// one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: Option<AgentId>,
    pub hostname: String,
    pub address: PeerAddr,
    /// Static resources declared by the agent at startup.
    pub resources: Resources,
    pub capabilities: Vec<AgentCapability>,
}

impl AgentInfo {
    /// Create a descriptor for an agent that has not been admitted yet.
    pub fn new(hostname: impl Into<String>, address: PeerAddr, resources: Resources) -> Self {
        Self {
            id: None,
            hostname: hostname.into(),
            address,
            resources,
            capabilities: Vec::new(),
        }
    }

    /// The same descriptor with a master-assigned id.
    pub fn with_id(mut self, id: AgentId) -> Self {
        self.id = Some(id);
        self
    }

    /// Advertise a capability.
    pub fn with_capability(mut self, capability: AgentCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// The machine this agent runs on, derived from hostname and address.
    pub fn machine_id(&self) -> MachineId {
        MachineId::new(self.hostname.clone(), self.address.host())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_id_uses_address_host() {
        let info = AgentInfo::new("node-1", PeerAddr::new("10.0.0.5:5051"), Resources::cpus(4.0));
        assert_eq!(info.machine_id(), MachineId::new("node-1", "10.0.0.5"));
    }

    #[test]
    fn test_with_id() {
        let info = AgentInfo::new("node-1", PeerAddr::new("10.0.0.5:5051"), Resources::empty())
            .with_id(AgentId::new("m-S0"));
        assert_eq!(info.id, Some(AgentId::new("m-S0")));
    }
}
