//! Offer operations and their pure application.
//!
//! [`Resources::apply`] is the single transformation both halves of the
//! master use: the accept pipeline applies operations to the offered
//! bundle, and agent bookkeeping applies the same operations to
//! total/checkpointed resources. No I/O, no side effects; an error leaves
//! the input untouched.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::resources::{ResourceError, Resources};
use crate::task::{ExecutorInfo, TaskInfo};

/// An operation a framework applies to offered resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Dynamically reserve unreserved resources for a role. The carried
    /// resources are already role-tagged; the unreserved flavor must be
    /// covered by the bundle the operation is applied to.
    Reserve { resources: Resources },
    /// Release a dynamic reservation back to the unreserved pool.
    Unreserve { resources: Resources },
    /// Turn reserved disk into persistent volumes. The carried resources
    /// are role-tagged disk with volume annotations.
    Create { volumes: Resources },
    /// Destroy persistent volumes, leaving the reserved disk behind.
    Destroy { volumes: Resources },
    /// Launch tasks, consuming their resources (and their dedicated
    /// executors' resources) from the bundle.
    Launch { tasks: Vec<TaskInfo> },
    /// Launch a group of tasks sharing one executor, atomically.
    LaunchGroup {
        executor: ExecutorInfo,
        tasks: Vec<TaskInfo>,
    },
}

/// Discriminant of [`Operation`], used for authorization requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Reserve,
    Unreserve,
    Create,
    Destroy,
    Launch,
    LaunchGroup,
}

impl Operation {
    /// The operation's kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Reserve { .. } => OperationKind::Reserve,
            Operation::Unreserve { .. } => OperationKind::Unreserve,
            Operation::Create { .. } => OperationKind::Create,
            Operation::Destroy { .. } => OperationKind::Destroy,
            Operation::Launch { .. } => OperationKind::Launch,
            Operation::LaunchGroup { .. } => OperationKind::LaunchGroup,
        }
    }

    /// Structural validation, independent of any resource bundle.
    pub fn validate(&self) -> Result<(), ResourceError> {
        match self {
            Operation::Reserve { resources } => {
                if resources.is_empty() {
                    return Err(ResourceError::EmptyOperation);
                }
                if resources.iter().any(|r| r.role.is_none()) {
                    return Err(ResourceError::InvalidReservation(
                        "reserve requires role-tagged resources".to_owned(),
                    ));
                }
                if resources.iter().any(|r| r.volume.is_some()) {
                    return Err(ResourceError::InvalidReservation(
                        "reserve cannot carry volumes".to_owned(),
                    ));
                }
                Ok(())
            }
            Operation::Unreserve { resources } => {
                if resources.is_empty() {
                    return Err(ResourceError::EmptyOperation);
                }
                if resources.iter().any(|r| r.role.is_none()) {
                    return Err(ResourceError::InvalidReservation(
                        "unreserve requires role-tagged resources".to_owned(),
                    ));
                }
                if resources.iter().any(|r| r.volume.is_some()) {
                    return Err(ResourceError::InvalidReservation(
                        "destroy volumes before unreserving".to_owned(),
                    ));
                }
                Ok(())
            }
            Operation::Create { volumes } | Operation::Destroy { volumes } => {
                if volumes.is_empty() {
                    return Err(ResourceError::EmptyOperation);
                }
                if volumes
                    .iter()
                    .any(|r| r.volume.is_none() || r.role.is_none())
                {
                    return Err(ResourceError::InvalidVolume(
                        "volumes must be role-tagged disk with a volume annotation".to_owned(),
                    ));
                }
                Ok(())
            }
            Operation::Launch { tasks } => {
                if tasks.is_empty() {
                    return Err(ResourceError::EmptyOperation);
                }
                Ok(())
            }
            Operation::LaunchGroup { tasks, .. } => {
                if tasks.is_empty() {
                    return Err(ResourceError::EmptyOperation);
                }
                Ok(())
            }
        }
    }

    /// The resources a launch operation consumes, including dedicated
    /// executors. Zero for non-launch operations (they transform rather
    /// than consume).
    pub fn consumed(&self) -> Resources {
        match self {
            Operation::Launch { tasks } => tasks.iter().fold(Resources::empty(), |acc, t| {
                let mut total = acc + t.resources.clone();
                if let Some(executor) = &t.executor {
                    total += executor.resources.clone();
                }
                total
            }),
            Operation::LaunchGroup { executor, tasks } => tasks
                .iter()
                .fold(executor.resources.clone(), |acc, t| acc + t.resources.clone()),
            _ => Resources::empty(),
        }
    }
}

impl Resources {
    /// Apply `operation` to this bundle, returning the transformed bundle.
    ///
    /// Reserve/unreserve and create/destroy are swaps: the source flavor is
    /// subtracted and the target flavor added, so the total quantity is
    /// conserved. Launches subtract what they consume.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation is structurally invalid or the
    /// bundle does not cover it; the bundle is unchanged in that case.
    pub fn apply(&self, operation: &Operation) -> Result<Resources, ResourceError> {
        operation.validate()?;
        match operation {
            Operation::Reserve { resources } => {
                let freed = self.checked_sub(&resources.as_unreserved())?;
                Ok(freed + resources.clone())
            }
            Operation::Unreserve { resources } => {
                let freed = self.checked_sub(resources)?;
                Ok(freed + resources.as_unreserved())
            }
            Operation::Create { volumes } => {
                let freed = self.checked_sub(&volumes.without_volumes())?;
                Ok(freed + volumes.clone())
            }
            Operation::Destroy { volumes } => {
                let freed = self.checked_sub(volumes)?;
                Ok(freed + volumes.without_volumes())
            }
            Operation::Launch { .. } | Operation::LaunchGroup { .. } => {
                self.checked_sub(&operation.consumed())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ids::{AgentId, ExecutorId, TaskId};
    use crate::resources::{Resource, Volume, CPUS, DISK};

    fn reserved_cpus(role: &str, value: f64) -> Resources {
        Resources::from_entries(vec![Resource::scalar(CPUS, value).with_role(role)])
    }

    fn volume(role: &str, value: f64, id: &str) -> Resources {
        Resources::from_entries(vec![Resource::scalar(DISK, value)
            .with_role(role)
            .with_volume(Volume::new(id, "/data"))])
    }

    #[test]
    fn test_reserve_swaps_flavors() {
        let offered = Resources::cpus(4.0);
        let after = offered
            .apply(&Operation::Reserve {
                resources: reserved_cpus("web", 1.5),
            })
            .unwrap();

        assert_eq!(after.scalar("cpus"), 4.0);
        assert_eq!(after.reserved("web"), reserved_cpus("web", 1.5));
        assert_eq!(after.unreserved(), Resources::cpus(2.5));
    }

    #[test]
    fn test_unreserve_restores() {
        let offered = Resources::cpus(4.0);
        let reserve = Operation::Reserve {
            resources: reserved_cpus("web", 1.5),
        };
        let unreserve = Operation::Unreserve {
            resources: reserved_cpus("web", 1.5),
        };

        let round_trip = offered.apply(&reserve).unwrap().apply(&unreserve).unwrap();
        assert_eq!(round_trip, offered);
    }

    #[test]
    fn test_reserve_needs_unreserved_coverage() {
        let offered = Resources::cpus(1.0);
        let result = offered.apply(&Operation::Reserve {
            resources: reserved_cpus("web", 2.0),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_reserve_rejects_untagged_resources() {
        let offered = Resources::cpus(4.0);
        let result = offered.apply(&Operation::Reserve {
            resources: Resources::cpus(1.0),
        });
        assert!(matches!(
            result,
            Err(ResourceError::InvalidReservation(_))
        ));
    }

    #[test]
    fn test_create_and_destroy_round_trip() {
        let offered = Resources::from_entries(vec![Resource::scalar(DISK, 100.0).with_role("db")]);
        let create = Operation::Create {
            volumes: volume("db", 40.0, "v1"),
        };
        let destroy = Operation::Destroy {
            volumes: volume("db", 40.0, "v1"),
        };

        let with_volume = offered.apply(&create).unwrap();
        assert_eq!(with_volume.volumes(), volume("db", 40.0, "v1"));

        let back = with_volume.apply(&destroy).unwrap();
        assert_eq!(back, offered);
    }

    #[test]
    fn test_create_requires_reserved_disk() {
        let offered = Resources::disk(100.0);
        let result = offered.apply(&Operation::Create {
            volumes: volume("db", 40.0, "v1"),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_launch_subtracts_task_and_executor() {
        let offered = Resources::cpus(4.0) + Resources::mem(8192.0);
        let task = TaskInfo::new(
            TaskId::new("t1"),
            "web",
            AgentId::new("a1"),
            Resources::cpus(1.0) + Resources::mem(2048.0),
        )
        .with_executor(ExecutorInfo::new(
            ExecutorId::new("e1"),
            Resources::cpus(0.5) + Resources::mem(512.0),
        ));

        let after = offered.apply(&Operation::Launch { tasks: vec![task] }).unwrap();
        assert_eq!(after.scalar("cpus"), 2.5);
        assert_eq!(after.scalar("mem"), 5632.0);
    }

    #[test]
    fn test_launch_not_covered() {
        let offered = Resources::cpus(1.0);
        let task = TaskInfo::new(
            TaskId::new("t1"),
            "web",
            AgentId::new("a1"),
            Resources::cpus(2.0),
        );
        assert!(offered
            .apply(&Operation::Launch { tasks: vec![task] })
            .is_err());
    }

    #[test]
    fn test_launch_against_reserved_resources() {
        // Scenario: reserve then launch with the reserved flavor in one
        // accept; the second operation observes the first one's effect.
        let offered = Resources::cpus(2.0);
        let reserved = reserved_cpus("web", 2.0);
        let after_reserve = offered
            .apply(&Operation::Reserve {
                resources: reserved.clone(),
            })
            .unwrap();

        let task = TaskInfo::new(TaskId::new("t2"), "job", AgentId::new("a1"), reserved);
        let after_launch = after_reserve
            .apply(&Operation::Launch { tasks: vec![task] })
            .unwrap();
        assert!(after_launch.is_empty());
    }

    #[test]
    fn test_empty_operation_rejected() {
        let offered = Resources::cpus(1.0);
        assert_eq!(
            offered.apply(&Operation::Launch { tasks: vec![] }),
            Err(ResourceError::EmptyOperation)
        );
    }
}
