//! Machine maintenance primitives.
//!
//! Machines move `Up -> Draining -> Down` during scheduled maintenance.
//! A draining machine keeps its agents but its frameworks receive inverse
//! offers asking them to vacate; a down machine refuses agent registration
//! entirely.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::ids::MachineId;

/// Maintenance mode of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineMode {
    /// Normal operation.
    Up,
    /// Scheduled for maintenance; frameworks are asked to vacate.
    Draining,
    /// Under maintenance; agents on this machine are refused.
    Down,
}

impl Default for MachineMode {
    fn default() -> Self {
        Self::Up
    }
}

/// A window during which a machine is expected to be unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Unavailability {
    pub start: DateTime<Utc>,
    /// `None` means unavailable indefinitely from `start`.
    pub duration: Option<Duration>,
}

impl Unavailability {
    /// An unavailability window starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start,
            duration: None,
        }
    }

    /// Bound the window to a duration.
    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// One maintenance window: a set of machines sharing an unavailability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub machine_ids: Vec<MachineId>,
    pub unavailability: Unavailability,
}

/// The full maintenance schedule submitted by an operator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MaintenanceSchedule {
    pub windows: Vec<MaintenanceWindow>,
}

impl MaintenanceSchedule {
    /// All machines named anywhere in the schedule.
    pub fn machines(&self) -> impl Iterator<Item = &MachineId> {
        self.windows.iter().flat_map(|w| w.machine_ids.iter())
    }

    /// The unavailability scheduled for `machine`, if any.
    pub fn unavailability_for(&self, machine: &MachineId) -> Option<Unavailability> {
        self.windows
            .iter()
            .find(|w| w.machine_ids.contains(machine))
            .map(|w| w.unavailability)
    }
}
