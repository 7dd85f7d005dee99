//! Worker pool settings.

use crate::config::PoolConfig;
use crate::error::{Result, ShmRpcError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Scaling bounds, thresholds and timeouts of a [`super::WorkerPoolManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_proc_num: usize,
    pub max_proc_num: usize,
    /// Remove a worker when the pool's resident memory exceeds this.
    pub max_proc_mem_bytes: Option<u64>,
    /// CPU fraction (0..1) of one core per worker that triggers scaling.
    pub new_proc_cpu_pc: f64,
    pub new_proc_avg_over_secs: u64,
    pub kill_proc_avg_over_secs: u64,
    pub monitor_interval_secs: u64,
    pub sigint_timeout_secs: u64,
    pub sigterm_timeout_secs: u64,
    /// Per-connection wait when draining calls before a removal.
    pub client_lock_timeout_secs: u64,
    pub start_timeout_secs: u64,
    /// Block `start` until the initial workers registered themselves.
    pub wait_until_started: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            min_proc_num: 1,
            max_proc_num: cpus,
            max_proc_mem_bytes: None,
            new_proc_cpu_pc: 0.3,
            new_proc_avg_over_secs: 20,
            kill_proc_avg_over_secs: 240,
            monitor_interval_secs: PoolConfig::MONITOR_INTERVAL_SECS,
            sigint_timeout_secs: PoolConfig::SIGINT_TIMEOUT_SECS,
            sigterm_timeout_secs: PoolConfig::SIGTERM_TIMEOUT_SECS,
            client_lock_timeout_secs: PoolConfig::CLIENT_LOCK_TIMEOUT_SECS,
            start_timeout_secs: PoolConfig::START_TIMEOUT_SECS,
            wait_until_started: true,
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ShmRpcError {
    ShmRpcError::Config {
        field: field.to_string(),
        message: message.into(),
    }
}

impl PoolSettings {
    /// Load settings from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ShmRpcError::Io {
            message: format!("Failed to read pool settings {}: {}", path.display(), e),
            source: Some(e),
        })?;
        let settings: Self = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.new_proc_cpu_pc > 0.0 && self.new_proc_cpu_pc < 1.0) {
            return Err(invalid(
                "new_proc_cpu_pc",
                format!("must be between 0 and 1 exclusive, got {}", self.new_proc_cpu_pc),
            ));
        }
        if self.min_proc_num < 1 {
            return Err(invalid("min_proc_num", "must be at least 1"));
        }
        if self.min_proc_num > self.max_proc_num {
            return Err(invalid(
                "max_proc_num",
                format!(
                    "must be >= min_proc_num ({} < {})",
                    self.max_proc_num, self.min_proc_num
                ),
            ));
        }
        for (field, value) in [
            ("new_proc_avg_over_secs", self.new_proc_avg_over_secs),
            ("kill_proc_avg_over_secs", self.kill_proc_avg_over_secs),
            ("monitor_interval_secs", self.monitor_interval_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be positive"));
            }
        }
        if self.max_proc_mem_bytes == Some(0) {
            return Err(invalid("max_proc_mem_bytes", "must be positive when set"));
        }
        Ok(())
    }

    /// CPU threshold as a percentage of one core.
    pub fn cpu_threshold_percent(&self) -> f64 {
        self.new_proc_cpu_pc * 100.0
    }

    pub fn new_proc_window(&self) -> Duration {
        Duration::from_secs(self.new_proc_avg_over_secs)
    }

    pub fn kill_proc_window(&self) -> Duration {
        Duration::from_secs(self.kill_proc_avg_over_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn sigint_timeout(&self) -> Duration {
        Duration::from_secs(self.sigint_timeout_secs)
    }

    pub fn sigterm_timeout(&self) -> Duration {
        Duration::from_secs(self.sigterm_timeout_secs)
    }

    pub fn client_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.client_lock_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}
