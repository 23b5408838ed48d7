//! Worker configuration.

use std::time::Duration;

use hivesync_core::{CapabilitySet, WorkerId};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker ID.
    pub worker_id: WorkerId,

    /// Capability tags advertised at registration.
    pub capabilities: CapabilitySet,

    /// Maximum tasks this worker runs at once.
    pub max_concurrent_tasks: u32,

    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// How often to look for new work and read the mailbox (milliseconds).
    pub poll_interval_ms: u64,

    /// Delay before re-registering after losing the store (seconds).
    pub reconnect_delay_secs: u64,

    /// Run a reconciler in this process as well.
    pub reconcile: bool,

    /// Emit JSON lines on stdout.
    pub json_output: bool,
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            capabilities: CapabilitySet::new(),
            max_concurrent_tasks: 1,
            heartbeat_interval_secs: 15,
            poll_interval_ms: 1_000,
            reconnect_delay_secs: 5,
            reconcile: false,
            json_output: false,
        }
    }
}
