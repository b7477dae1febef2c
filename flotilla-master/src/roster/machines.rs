//! Machine roster: maintenance modes and unavailability windows.

// Layer 1: Standard library imports
use std::collections::{HashMap, HashSet};

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};

// Layer 3: Internal module imports
use flotilla_model::{
    AgentId, FrameworkId, InverseOfferState, InverseOfferStatus, MachineId, MachineMode,
    MachineStatus, Unavailability,
};

/// One machine's maintenance state plus the agents it hosts.
#[derive(Debug, Default)]
pub(crate) struct MachineEntry {
    pub mode: MachineMode,
    pub unavailability: Option<Unavailability>,
    pub agents: HashSet<AgentId>,
    /// Framework answers to inverse offers for this machine's drain.
    pub inverse_offer_statuses: HashMap<FrameworkId, (InverseOfferState, DateTime<Utc>)>,
}

/// All machines the master has heard of, through agents or schedules.
#[derive(Debug, Default)]
pub(crate) struct MachineRoster {
    machines: HashMap<MachineId, MachineEntry>,
}

impl MachineRoster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: &MachineId) -> Option<&MachineEntry> {
        self.machines.get(id)
    }

    pub(crate) fn entry(&mut self, id: &MachineId) -> &mut MachineEntry {
        self.machines.entry(id.clone()).or_default()
    }

    /// The machine's mode; machines never heard of are up.
    pub(crate) fn mode(&self, id: &MachineId) -> MachineMode {
        self.machines.get(id).map_or(MachineMode::Up, |m| m.mode)
    }

    pub(crate) fn track_agent(&mut self, machine: &MachineId, agent_id: AgentId) {
        self.entry(machine).agents.insert(agent_id);
    }

    pub(crate) fn untrack_agent(&mut self, machine: &MachineId, agent_id: &AgentId) {
        if let Some(entry) = self.machines.get_mut(machine) {
            entry.agents.remove(agent_id);
            // Machines with no state worth keeping are dropped entirely.
            if entry.agents.is_empty()
                && entry.mode == MachineMode::Up
                && entry.unavailability.is_none()
            {
                self.machines.remove(machine);
            }
        }
    }

    /// Record a framework's answer to an inverse offer for a machine.
    pub(crate) fn record_inverse_offer_answer(
        &mut self,
        machine: &MachineId,
        framework_id: FrameworkId,
        state: InverseOfferState,
    ) {
        self.entry(machine)
            .inverse_offer_statuses
            .insert(framework_id, (state, Utc::now()));
    }

    /// Operator view of every machine with maintenance state.
    pub(crate) fn statuses(&self) -> Vec<MachineStatus> {
        let mut out: Vec<MachineStatus> = self
            .machines
            .iter()
            .map(|(id, entry)| {
                let mut inverse_offer_statuses: Vec<InverseOfferStatus> = entry
                    .inverse_offer_statuses
                    .iter()
                    .map(|(framework_id, (state, updated_at))| InverseOfferStatus {
                        framework_id: framework_id.clone(),
                        state: *state,
                        updated_at: *updated_at,
                    })
                    .collect();
                inverse_offer_statuses.sort_by(|a, b| a.framework_id.cmp(&b.framework_id));
                MachineStatus {
                    machine: id.clone(),
                    mode: entry.mode,
                    unavailability: entry.unavailability,
                    inverse_offer_statuses,
                }
            })
            .collect();
        out.sort_by(|a, b| a.machine.cmp(&b.machine));
        out
    }

    /// Agents hosted on `machine`, sorted for deterministic iteration.
    pub(crate) fn agents_on(&self, machine: &MachineId) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self
            .machines
            .get(machine)
            .map(|entry| entry.agents.iter().cloned().collect())
            .unwrap_or_default();
        agents.sort();
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(name: &str) -> MachineId {
        MachineId::new(name, format!("10.0.0.{}", name.len()))
    }

    #[test]
    fn test_unknown_machine_is_up() {
        let roster = MachineRoster::new();
        assert_eq!(roster.mode(&machine("ghost")), MachineMode::Up);
    }

    #[test]
    fn test_untrack_drops_stateless_machines() {
        let mut roster = MachineRoster::new();
        let id = machine("node");
        roster.track_agent(&id, AgentId::new("a1"));
        roster.untrack_agent(&id, &AgentId::new("a1"));
        assert!(roster.get(&id).is_none());
    }

    #[test]
    fn test_untrack_keeps_draining_machines() {
        let mut roster = MachineRoster::new();
        let id = machine("node");
        roster.entry(&id).mode = MachineMode::Draining;
        roster.track_agent(&id, AgentId::new("a1"));
        roster.untrack_agent(&id, &AgentId::new("a1"));
        assert_eq!(roster.mode(&id), MachineMode::Draining);
    }

    #[test]
    fn test_statuses_sorted() {
        let mut roster = MachineRoster::new();
        roster.entry(&machine("bb")).mode = MachineMode::Down;
        roster.entry(&machine("a")).mode = MachineMode::Draining;

        let statuses = roster.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].machine.hostname, "a");
    }
}
