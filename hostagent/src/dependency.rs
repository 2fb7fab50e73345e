//! Container dependency resolution.
//!
//! Pure functions over a task's containers. Nothing here blocks or polls;
//! the task loop re-evaluates after every change.

use crate::model::{Container, DependencyCondition};
use crate::status::{ContainerStatus, HealthStatus};
use std::collections::HashMap;
use thiserror::Error;

/// Configuration errors in a task's dependency declarations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("container {container} depends on unknown container {dependency}")]
    UnknownContainer {
        container: String,
        dependency: String,
    },

    #[error("container {0} depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle involving container {0}")]
    Cycle(String),

    #[error("duplicate container name {0}")]
    DuplicateName(String),
}

/// Outcome of evaluating a container's dependencies for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyCheck {
    Satisfied,
    /// Not yet, but may become satisfied later.
    Waiting,
    /// Can never be satisfied; carries a human-readable reason.
    Unresolvable(String),
}

impl DependencyCheck {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, DependencyCheck::Satisfied)
    }
}

/// Whether `container` may take the step towards `target` right now.
pub fn can_transition(container: &Container, target: ContainerStatus, containers: &[Container]) -> bool {
    check_transition(container, target, containers).is_satisfied()
}

/// Evaluate every dependency gating `container`'s step towards `target`.
pub fn check_transition(
    container: &Container,
    target: ContainerStatus,
    containers: &[Container],
) -> DependencyCheck {
    if target <= ContainerStatus::ManifestPulled {
        return DependencyCheck::Satisfied;
    }
    if target == ContainerStatus::Stopped {
        return check_stop(container, containers);
    }

    if !container.is_internal() && target >= ContainerStatus::Created {
        if let Some(pause) = containers.iter().find(|c| c.is_internal()) {
            let check = check_pause(pause);
            if !check.is_satisfied() {
                return check;
            }
        }
    }

    for dep in &container.depends_on {
        let Some(dependency) = containers.iter().find(|c| c.name == dep.container_name) else {
            return DependencyCheck::Unresolvable(format!(
                "dependency container {} does not exist",
                dep.container_name
            ));
        };
        let check = check_condition(dependency, dep.condition, target);
        if !check.is_satisfied() {
            return check;
        }
    }
    DependencyCheck::Satisfied
}

fn check_pause(pause: &Container) -> DependencyCheck {
    match pause.known_status() {
        ContainerStatus::ResourcesProvisioned => DependencyCheck::Satisfied,
        ContainerStatus::Stopped => DependencyCheck::Unresolvable(format!(
            "network container {} stopped before resources were provisioned",
            pause.name
        )),
        _ => DependencyCheck::Waiting,
    }
}

fn check_condition(
    dependency: &Container,
    condition: DependencyCondition,
    target: ContainerStatus,
) -> DependencyCheck {
    let known = dependency.known_status();
    let stopping = dependency.desired_status() == ContainerStatus::Stopped;
    let name = &dependency.name;

    match condition {
        DependencyCondition::Start => {
            let required = if target >= ContainerStatus::Running {
                ContainerStatus::Running
            } else {
                ContainerStatus::Created
            };
            if known >= required {
                DependencyCheck::Satisfied
            } else if stopping {
                DependencyCheck::Unresolvable(format!("dependency {name} will never start"))
            } else {
                DependencyCheck::Waiting
            }
        }
        DependencyCondition::Complete => {
            if known == ContainerStatus::Stopped {
                DependencyCheck::Satisfied
            } else {
                DependencyCheck::Waiting
            }
        }
        DependencyCondition::Success => match (known, dependency.exit_code()) {
            (ContainerStatus::Stopped, Some(0)) => DependencyCheck::Satisfied,
            (ContainerStatus::Stopped, code) => DependencyCheck::Unresolvable(format!(
                "dependency {name} exited with {}, expected success",
                code.map_or_else(|| "unknown exit code".to_string(), |c| c.to_string())
            )),
            _ => DependencyCheck::Waiting,
        },
        DependencyCondition::Healthy => {
            if dependency.health() == HealthStatus::Healthy && known < ContainerStatus::Stopped {
                DependencyCheck::Satisfied
            } else if known == ContainerStatus::Stopped || stopping {
                DependencyCheck::Unresolvable(format!("dependency {name} will never be healthy"))
            } else {
                DependencyCheck::Waiting
            }
        }
    }
}

/// A container may stop once every container started after it is stopped.
/// Containers that never made it into the runtime hold nothing up.
///
/// Only START and HEALTHY dependents hold a dependency up; COMPLETE and
/// SUCCESS dependents wait for it to exit. The network container stops last.
fn check_stop(container: &Container, containers: &[Container]) -> DependencyCheck {
    let blocked = containers.iter().any(|other| {
        other.name != container.name
            && other.known_status() != ContainerStatus::Stopped
            && other.runtime_id().is_some()
            && ((container.is_internal() && !other.is_internal())
                || other.depends_on.iter().any(|d| {
                    d.container_name == container.name
                        && matches!(
                            d.condition,
                            DependencyCondition::Start | DependencyCondition::Healthy
                        )
                }))
    });
    if blocked {
        DependencyCheck::Waiting
    } else {
        DependencyCheck::Satisfied
    }
}

/// Reject unknown targets, self-dependencies, duplicate names and cycles.
pub fn validate(containers: &[Container]) -> Result<(), DependencyError> {
    let mut index = HashMap::new();
    for (i, c) in containers.iter().enumerate() {
        if index.insert(c.name.as_str(), i).is_some() {
            return Err(DependencyError::DuplicateName(c.name.clone()));
        }
    }

    for c in containers {
        for dep in &c.depends_on {
            if dep.container_name == c.name {
                return Err(DependencyError::SelfDependency(c.name.clone()));
            }
            if !index.contains_key(dep.container_name.as_str()) {
                return Err(DependencyError::UnknownContainer {
                    container: c.name.clone(),
                    dependency: dep.container_name.clone(),
                });
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Visiting,
        Done,
    }

    fn visit(
        i: usize,
        containers: &[Container],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
    ) -> Result<(), DependencyError> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Visiting => return Err(DependencyError::Cycle(containers[i].name.clone())),
            Mark::New => {}
        }
        marks[i] = Mark::Visiting;
        for dep in &containers[i].depends_on {
            if let Some(&j) = index.get(dep.container_name.as_str()) {
                visit(j, containers, index, marks)?;
            }
        }
        marks[i] = Mark::Done;
        Ok(())
    }

    let mut marks = vec![Mark::New; containers.len()];
    for i in 0..containers.len() {
        visit(i, containers, &index, &mut marks)?;
    }
    Ok(())
}
