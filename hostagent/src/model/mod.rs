//! Task and container data model.

mod container;
mod task;

pub use container::{
    Container, ContainerKind, DependencyCondition, DependsOn, ManagedAgent, PortBinding,
    PortMapping, Protocol,
};
pub use task::{Attachment, LaunchType, ResourceKind, Task, TaskResource};
