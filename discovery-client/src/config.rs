use std::time::Duration;
use serde::Deserialize;
use shared::protocol::DEFAULT_ROOT;

/// Connect string selecting the in-process coordination store
pub const MEMORY_CONNECT: &str = "memory";

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Discovery is off unless explicitly enabled
    #[serde(default)]
    pub enabled: bool,
    /// Read/write clients only announce when this is set
    #[serde(default = "default_announce_enabled")]
    pub announce_enabled: bool,
    #[serde(default = "default_connect")]
    pub connect: String,
    #[serde(default = "default_root")]
    pub root: String,
    /// Maximum time between two full scans of the directory
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
    /// Interval at which the coordination loops check for work
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Timeout for a round of coordination store reads
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// How long a node with unreadable data is ignored
    #[serde(default = "default_penalty_time")]
    pub penalty_time_ms: u64,
    /// Upper bound for callers waiting on the first world state
    #[serde(default = "default_world_change_timeout")]
    pub world_change_timeout_ms: u64,
    /// How long `start` waits for the first world state
    #[serde(default = "default_startup_wait")]
    pub startup_wait_ms: u64,
}

fn default_announce_enabled() -> bool {
    true
}

fn default_connect() -> String {
    MEMORY_CONNECT.to_string()
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}

fn default_scan_interval() -> u64 {
    120_000
}

fn default_tick_interval() -> u64 {
    100
}

fn default_rpc_timeout() -> u64 {
    500
}

fn default_session_timeout() -> u64 {
    3_000
}

fn default_penalty_time() -> u64 {
    600_000
}

fn default_world_change_timeout() -> u64 {
    10_000
}

fn default_startup_wait() -> u64 {
    1_000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            announce_enabled: default_announce_enabled(),
            connect: default_connect(),
            root: default_root(),
            scan_interval_ms: default_scan_interval(),
            tick_interval_ms: default_tick_interval(),
            rpc_timeout_ms: default_rpc_timeout(),
            session_timeout_ms: default_session_timeout(),
            penalty_time_ms: default_penalty_time(),
            world_change_timeout_ms: default_world_change_timeout(),
            startup_wait_ms: default_startup_wait(),
        }
    }
}

impl DiscoveryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn penalty_time(&self) -> Duration {
        Duration::from_millis(self.penalty_time_ms)
    }

    pub fn world_change_timeout(&self) -> Duration {
        Duration::from_millis(self.world_change_timeout_ms)
    }

    pub fn startup_wait(&self) -> Duration {
        Duration::from_millis(self.startup_wait_ms)
    }

    /// Number of ticks between two unconditional scans
    pub fn scan_ticks(&self) -> u64 {
        (self.scan_interval_ms / self.tick_interval_ms.max(1)).max(1)
    }
}
