//! Host resource ledger.
//!
//! Tracks how much of the host's CPU, memory and static ports each admitted
//! task consumes. All bookkeeping happens inside one critical section, held
//! only for the duration of the check/update.

use crate::config::HostResources;
use crate::model::Task;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

/// What a task needs from the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_units: u64,
    pub memory_mb: u64,
    #[serde(default)]
    pub ports_tcp: Vec<u16>,
    #[serde(default)]
    pub ports_udp: Vec<u16>,
}

impl ResourceRequirements {
    /// Requirements of `task`, or a reason when its container totals
    /// overflow.
    pub fn for_task(task: &Task) -> Result<Self, String> {
        let cpu_units = task
            .cpu_units()
            .ok_or_else(|| "task CPU units overflow".to_string())?;
        let memory_mb = task
            .memory()
            .ok_or_else(|| "task memory overflows".to_string())?;
        let (ports_tcp, ports_udp) = task.host_ports();
        Ok(Self {
            cpu_units,
            memory_mb,
            ports_tcp,
            ports_udp,
        })
    }
}

#[derive(Debug, Default)]
struct Ledger {
    consumed: BTreeMap<String, ResourceRequirements>,
    cpu_used: u64,
    memory_used: u64,
    ports_tcp: HashSet<u16>,
    ports_udp: HashSet<u16>,
}

impl Ledger {
    fn record(&mut self, arn: &str, req: ResourceRequirements) {
        self.cpu_used = self.cpu_used.saturating_add(req.cpu_units);
        self.memory_used = self.memory_used.saturating_add(req.memory_mb);
        self.ports_tcp.extend(req.ports_tcp.iter().copied());
        self.ports_udp.extend(req.ports_udp.iter().copied());
        self.consumed.insert(arn.to_string(), req);
    }
}

/// Admission controller for host capacity.
#[derive(Debug)]
pub struct HostResourceManager {
    capacity: HostResources,
    ledger: Mutex<Ledger>,
}

impl HostResourceManager {
    pub fn new(capacity: HostResources) -> Self {
        Self {
            capacity,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> &HostResources {
        &self.capacity
    }

    /// Check whether `req` could fit on an otherwise empty host.
    ///
    /// Returns a human-readable reason when it never can.
    pub fn check_fits_host(&self, req: &ResourceRequirements) -> Result<(), String> {
        if req.cpu_units > self.capacity.cpu_units {
            return Err(format!(
                "task requires {} CPU units, host has {}",
                req.cpu_units, self.capacity.cpu_units
            ));
        }
        if req.memory_mb > self.capacity.memory_mb {
            return Err(format!(
                "task requires {} MB memory, host has {}",
                req.memory_mb, self.capacity.memory_mb
            ));
        }
        if let Some(port) = first_conflict(&req.ports_tcp, &self.capacity.reserved_ports_tcp) {
            return Err(format!("host port {port}/tcp is reserved"));
        }
        if let Some(port) = first_conflict(&req.ports_udp, &self.capacity.reserved_ports_udp) {
            return Err(format!("host port {port}/udp is reserved"));
        }
        if let Some(port) = first_duplicate(&req.ports_tcp).or_else(|| first_duplicate(&req.ports_udp)) {
            return Err(format!("host port {port} is mapped more than once"));
        }
        Ok(())
    }

    /// Admit `task` if it fits the remaining capacity.
    ///
    /// Tasks with an exempt launch type always succeed and are not recorded.
    /// A task that is already consuming succeeds again without being counted
    /// twice.
    pub fn try_consume(&self, task: &Task) -> bool {
        if !task.launch_type.is_accounted() {
            debug!(
                "Task {} uses launch type {}, skipping resource accounting",
                task.arn, task.launch_type
            );
            return true;
        }
        match ResourceRequirements::for_task(task) {
            Ok(req) => self.try_consume_requirements(&task.arn, req),
            Err(reason) => {
                warn!("Task {} cannot be admitted: {}", task.arn, reason);
                false
            }
        }
    }

    pub fn try_consume_requirements(&self, arn: &str, req: ResourceRequirements) -> bool {
        let mut ledger = self.lock();
        if ledger.consumed.contains_key(arn) {
            debug!("Task {} is already consuming resources", arn);
            return true;
        }

        let cpu_fits = ledger
            .cpu_used
            .checked_add(req.cpu_units)
            .is_some_and(|total| total <= self.capacity.cpu_units);
        let memory_fits = ledger
            .memory_used
            .checked_add(req.memory_mb)
            .is_some_and(|total| total <= self.capacity.memory_mb);
        let tcp_free = req.ports_tcp.iter().all(|p| {
            !ledger.ports_tcp.contains(p) && !self.capacity.reserved_ports_tcp.contains(p)
        });
        let udp_free = req.ports_udp.iter().all(|p| {
            !ledger.ports_udp.contains(p) && !self.capacity.reserved_ports_udp.contains(p)
        });

        if !(cpu_fits && memory_fits && tcp_free && udp_free) {
            debug!(
                "Task {} does not fit: cpu {}/{} (+{}), memory {}/{} (+{})",
                arn,
                ledger.cpu_used,
                self.capacity.cpu_units,
                req.cpu_units,
                ledger.memory_used,
                self.capacity.memory_mb,
                req.memory_mb
            );
            return false;
        }

        debug!(
            "Task {} consumed {} CPU units, {} MB memory",
            arn, req.cpu_units, req.memory_mb
        );
        ledger.record(arn, req);
        true
    }

    /// Return the task's resources to the pool. Unknown tasks are a no-op.
    pub fn release(&self, arn: &str) {
        let mut ledger = self.lock();
        let Some(req) = ledger.consumed.remove(arn) else {
            return;
        };

        match (
            ledger.cpu_used.checked_sub(req.cpu_units),
            ledger.memory_used.checked_sub(req.memory_mb),
        ) {
            (Some(cpu), Some(memory)) => {
                ledger.cpu_used = cpu;
                ledger.memory_used = memory;
            }
            _ => {
                error!("Resource ledger underflow releasing task {}", arn);
                ledger.cpu_used = ledger.cpu_used.saturating_sub(req.cpu_units);
                ledger.memory_used = ledger.memory_used.saturating_sub(req.memory_mb);
            }
        }
        for port in &req.ports_tcp {
            ledger.ports_tcp.remove(port);
        }
        for port in &req.ports_udp {
            ledger.ports_udp.remove(port);
        }
        debug!("Task {} released its resources", arn);
    }

    pub fn is_consuming(&self, arn: &str) -> bool {
        self.lock().consumed.contains_key(arn)
    }

    /// CPU units and memory currently consumed.
    pub fn used(&self) -> (u64, u64) {
        let ledger = self.lock();
        (ledger.cpu_used, ledger.memory_used)
    }

    /// Per-task consumption, for persistence.
    pub fn snapshot(&self) -> BTreeMap<String, ResourceRequirements> {
        self.lock().consumed.clone()
    }

    /// Replace the ledger with a persisted snapshot.
    pub fn restore(&self, consumed: BTreeMap<String, ResourceRequirements>) {
        let mut ledger = self.lock();
        *ledger = Ledger::default();
        for (arn, req) in consumed {
            ledger.record(&arn, req);
        }
    }
}

fn first_conflict(requested: &[u16], reserved: &[u16]) -> Option<u16> {
    requested.iter().copied().find(|p| reserved.contains(p))
}

fn first_duplicate(ports: &[u16]) -> Option<u16> {
    let mut seen = HashSet::new();
    ports.iter().copied().find(|p| !seen.insert(*p))
}
