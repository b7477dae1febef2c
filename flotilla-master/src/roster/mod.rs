//! In-memory rosters owned by the master actor.
//!
//! Everything here is mutated only from the actor; no locks, no sharing.
//! Cross-entity bookkeeping (an offer leaving the ledger and both offer
//! sets, a task charging an agent's used counter) goes through helpers on
//! the master so the invariants hold at every quiescent point.

pub(crate) mod agents;
pub(crate) mod frameworks;
pub(crate) mod machines;
pub(crate) mod offers;
pub(crate) mod roles;

pub(crate) use agents::{Agent, AgentRoster, Task};
pub(crate) use frameworks::{CompletedTask, Framework, FrameworkRoster, FrameworkTransport};
pub(crate) use machines::MachineRoster;
pub(crate) use offers::OfferLedger;
pub(crate) use roles::RoleTable;
