//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Ports the agent and the container daemon listen on.
pub const DEFAULT_RESERVED_PORTS: &[u16] = &[22, 2375, 2376, 51678, 51679];

/// Host capacity available to tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResources {
    pub cpu_units: u64,
    pub memory_mb: u64,
    pub reserved_ports_tcp: Vec<u16>,
    pub reserved_ports_udp: Vec<u16>,
}

impl Default for HostResources {
    fn default() -> Self {
        Self {
            cpu_units: 1024,
            memory_mb: 2048,
            reserved_ports_tcp: DEFAULT_RESERVED_PORTS.to_vec(),
            reserved_ports_udp: Vec::new(),
        }
    }
}

/// Tunables of the task engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: HostResources,

    pub manifest_pull_timeout: Duration,
    pub image_pull_timeout: Duration,
    pub create_timeout: Duration,
    pub start_timeout: Duration,
    pub inspect_timeout: Duration,
    pub remove_timeout: Duration,
    /// Bound on each provisioner call (resources and network).
    pub provision_timeout: Duration,

    /// Grace period between stop and kill unless a container overrides it.
    pub default_stop_timeout: Duration,
    /// Extra time granted to the runtime's stop call on top of the grace period.
    pub stop_timeout_buffer: Duration,

    pub steady_state_poll_interval: Duration,
    /// How long a stopped task is kept before its containers are removed.
    pub task_cleanup_wait: Duration,

    pub max_transition_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,

    pub state_file: Option<PathBuf>,
    pub checkpoint_interval: Duration,
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: HostResources::default(),
            manifest_pull_timeout: Duration::from_secs(60),
            image_pull_timeout: Duration::from_secs(600),
            create_timeout: Duration::from_secs(240),
            start_timeout: Duration::from_secs(180),
            inspect_timeout: Duration::from_secs(30),
            remove_timeout: Duration::from_secs(60),
            provision_timeout: Duration::from_secs(120),
            default_stop_timeout: Duration::from_secs(30),
            stop_timeout_buffer: Duration::from_secs(30),
            steady_state_poll_interval: Duration::from_secs(10),
            task_cleanup_wait: Duration::from_secs(3 * 60 * 60),
            max_transition_retries: 3,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(30),
            state_file: None,
            checkpoint_interval: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

impl Config {
    /// Backoff before retry number `attempt` (1-based), doubling up to the max.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff_base
            .saturating_mul(factor)
            .min(self.retry_backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let cfg = Config::default();
        assert_eq!(cfg.retry_backoff(1), Duration::from_secs(1));
        assert_eq!(cfg.retry_backoff(2), Duration::from_secs(2));
        assert_eq!(cfg.retry_backoff(3), Duration::from_secs(4));
        assert_eq!(cfg.retry_backoff(10), Duration::from_secs(30));
        assert_eq!(cfg.retry_backoff(64), Duration::from_secs(30));
    }

    #[test]
    fn test_default_reserved_ports() {
        let host = HostResources::default();
        assert!(host.reserved_ports_tcp.contains(&22));
        assert!(host.reserved_ports_tcp.contains(&51678));
    }
}
