//! Stable identifiers for cluster entities.
//!
//! Master-issued ids (`AgentId`, `FrameworkId`, `OfferId`, `InverseOfferId`)
//! embed the issuing master's uuid plus a monotone sequence number, so ids
//! survive master failover without cluster-wide collisions. Framework-chosen
//! ids (`TaskId`, `ExecutorId`) are opaque strings.

// Layer 1: Standard library imports
use std::fmt::{self, Display};

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Layer 3: Internal module imports
// (none)

/// Identity of one master incarnation.
///
/// A fresh `MasterId` is generated every time a master is elected leader;
/// it prefixes every id the master issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterId(Uuid);

impl MasterId {
    /// Generate a new random MasterId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a MasterId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MasterId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing id value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }
    };
}

string_id! {
    /// Stable agent identity, assigned by the master on first admission.
    AgentId
}

string_id! {
    /// Stable framework identity, issued by the master at first registration.
    FrameworkId
}

string_id! {
    /// Identity of one outstanding offer.
    OfferId
}

string_id! {
    /// Identity of one outstanding inverse offer.
    InverseOfferId
}

string_id! {
    /// Framework-chosen task identity, unique within the framework.
    TaskId
}

string_id! {
    /// Framework-chosen executor identity, unique within the framework.
    ExecutorId
}

impl AgentId {
    /// Generate the id for a newly admitted agent: `<master>-S<seq>`.
    pub fn generate(master: &MasterId, seq: u64) -> Self {
        Self(format!("{master}-S{seq}"))
    }
}

impl FrameworkId {
    /// Generate the id for a newly registered framework: `<master>-F<seq>`.
    pub fn generate(master: &MasterId, seq: u64) -> Self {
        Self(format!("{master}-F{seq}"))
    }
}

impl OfferId {
    /// Generate the id for a fresh offer: `<master>-O<seq>`.
    pub fn generate(master: &MasterId, seq: u64) -> Self {
        Self(format!("{master}-O{seq}"))
    }
}

impl InverseOfferId {
    /// Generate the id for a fresh inverse offer: `<master>-I<seq>`.
    pub fn generate(master: &MasterId, seq: u64) -> Self {
        Self(format!("{master}-I{seq}"))
    }
}

/// Identity of one operator event stream subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a new random StreamId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// UUID attached to a status update, echoed back by acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusUuid(Uuid);

impl StatusUuid {
    /// Generate a new random status uuid.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for StatusUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StatusUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-level address of a remote peer (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddr(String);

impl PeerAddr {
    /// Wrap an address string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host portion of the address, without the port.
    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map_or(self.0.as_str(), |(h, _)| h)
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerAddr {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identity of a physical or logical host: hostname plus IP.
///
/// Both fields participate in equality; two machines with the same hostname
/// behind different IPs are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId {
    pub hostname: String,
    pub ip: String,
}

impl MachineId {
    /// Create a machine id from hostname and IP.
    pub fn new(hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ip: ip.into(),
        }
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.hostname, self.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_id_uniqueness() {
        let id1 = MasterId::new();
        let id2 = MasterId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_agent_id_generation_is_prefixed() {
        let master = MasterId::new();
        let id = AgentId::generate(&master, 7);
        assert!(id.as_str().starts_with(&master.to_string()));
        assert!(id.as_str().ends_with("-S7"));
    }

    #[test]
    fn test_generated_ids_are_distinct_per_sequence() {
        let master = MasterId::new();
        assert_ne!(
            FrameworkId::generate(&master, 0),
            FrameworkId::generate(&master, 1)
        );
        assert_ne!(OfferId::generate(&master, 0), OfferId::generate(&master, 1));
    }

    #[test]
    fn test_peer_addr_host() {
        let addr = PeerAddr::new("agent-1.example.com:5051");
        assert_eq!(addr.host(), "agent-1.example.com");

        let bare = PeerAddr::new("agent-2");
        assert_eq!(bare.host(), "agent-2");
    }

    #[test]
    fn test_machine_id_equality_includes_ip() {
        let a = MachineId::new("host", "10.0.0.1");
        let b = MachineId::new("host", "10.0.0.2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_string_id_display_roundtrip() {
        let id = TaskId::new("task-42");
        assert_eq!(format!("{id}"), "task-42");
        assert_eq!(id.as_str(), "task-42");
    }
}
