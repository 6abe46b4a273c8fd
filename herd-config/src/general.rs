use serde::{Deserialize, Serialize};
use std::time::Duration;

/// General settings: executor sizing, timeouts and pool limits that apply
/// to every backend the control plane manages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct General {
    /// Number of procedure executor workers.
    #[serde(default = "General::workers")]
    pub workers: usize,

    /// Maximum number of open connections kept per backend.
    #[serde(default = "General::pool_size")]
    pub pool_size: usize,

    /// How long a connection checkout may wait before failing (ms).
    #[serde(default = "General::checkout_timeout")]
    pub checkout_timeout: u64,

    /// Timeout for opening a connection to a backend (ms).
    #[serde(default = "General::connect_timeout")]
    pub connect_timeout: u64,

    /// How long a slave is given to catch up with a master during
    /// promote/demote/move/split (ms).
    #[serde(default = "General::replication_timeout")]
    pub replication_timeout: u64,

    /// How long a failover candidate is given to apply its relay-log
    /// backlog (ms).
    #[serde(default = "General::backlog_timeout")]
    pub backlog_timeout: u64,

    /// A step holding locks for longer than this emits a heartbeat warning
    /// and marks the procedure degraded (ms).
    #[serde(default = "General::lock_heartbeat")]
    pub lock_heartbeat: u64,
}

impl General {
    fn workers() -> usize {
        2
    }

    fn pool_size() -> usize {
        5
    }

    fn checkout_timeout() -> u64 {
        5_000
    }

    fn connect_timeout() -> u64 {
        5_000
    }

    fn replication_timeout() -> u64 {
        30_000
    }

    fn backlog_timeout() -> u64 {
        30_000
    }

    fn lock_heartbeat() -> u64 {
        60_000
    }

    pub fn checkout_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout)
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn replication_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.replication_timeout)
    }

    pub fn backlog_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.backlog_timeout)
    }

    pub fn lock_heartbeat_duration(&self) -> Duration {
        Duration::from_millis(self.lock_heartbeat)
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            workers: Self::workers(),
            pool_size: Self::pool_size(),
            checkout_timeout: Self::checkout_timeout(),
            connect_timeout: Self::connect_timeout(),
            replication_timeout: Self::replication_timeout(),
            backlog_timeout: Self::backlog_timeout(),
            lock_heartbeat: Self::lock_heartbeat(),
        }
    }
}
