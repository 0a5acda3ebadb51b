use serde::{Deserialize, Serialize};

/// Stream options shared by save and load. Both ends must agree on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveVmConfig {
    /// Write (and require on load) a configuration section naming the machine type.
    pub send_configuration: bool,
    /// Follow every section with a footer carrying its section id.
    pub section_footers: bool,
    pub machine_name: String,
}

impl Default for SaveVmConfig {
    fn default() -> Self {
        Self {
            send_configuration: false,
            section_footers: false,
            machine_name: "ferry".to_string(),
        }
    }
}

pub const DEFAULT_MAX_BANDWIDTH: u64 = 32 << 20;
pub const DEFAULT_DOWNTIME_LIMIT_MS: u64 = 300;
pub const DEFAULT_BUFFER_DELAY_MS: u64 = 100;

/// Tuning of the live migration driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationParams {
    /// Bytes per second.
    pub max_bandwidth: u64,
    /// Longest acceptable guest pause, in milliseconds.
    pub downtime_limit: u64,
    /// Pacing interval for the rate limit, in milliseconds.
    pub buffer_delay: u64,
    /// Force completion after this many iterations even if the guest keeps dirtying memory.
    pub max_iterations: Option<u64>,
}

impl Default for MigrationParams {
    fn default() -> Self {
        Self {
            max_bandwidth: DEFAULT_MAX_BANDWIDTH,
            downtime_limit: DEFAULT_DOWNTIME_LIMIT_MS,
            buffer_delay: DEFAULT_BUFFER_DELAY_MS,
            max_iterations: None,
        }
    }
}

impl MigrationParams {
    /// Bytes that may be sent per `buffer_delay` tick.
    pub fn bytes_per_tick(&self) -> u64 {
        self.max_bandwidth.saturating_mul(self.buffer_delay) / 1000
    }

    /// Largest remaining amount that can be sent within the downtime limit.
    pub fn max_downtime_bytes(&self) -> u64 {
        self.max_bandwidth.saturating_mul(self.downtime_limit) / 1000
    }
}
