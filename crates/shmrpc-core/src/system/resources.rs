//! Worker load sampling.
//!
//! Provides:
//! - Per-tick CPU, memory and disk usage summed over a set of worker PIDs
//! - A bounded time series of those samples with windowed averages

use crate::config::PoolConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// A worker process started by the pool manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: u32,
    pub spawn_time: Instant,
}

impl WorkerProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            spawn_time: Instant::now(),
        }
    }
}

/// Combined usage of all sampled workers at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub at: Instant,
    /// Workers that contributed to this sample.
    pub num_processes: usize,
    /// Sum of per-process CPU usage (100 = one full core).
    pub cpu_percent: f64,
    /// Resident memory in bytes.
    pub physical_mem: u64,
    pub virtual_mem: u64,
    /// Bytes read/written since the previous sample.
    pub disk_read: u64,
    pub disk_written: u64,
}

/// Mean of the samples in a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverage {
    pub samples: usize,
    pub num_processes: f64,
    pub cpu_percent: f64,
    pub physical_mem: f64,
    pub virtual_mem: f64,
}

impl LoadAverage {
    /// Average CPU usage of one worker.
    pub fn cpu_percent_per_process(&self) -> f64 {
        if self.num_processes > 0.0 {
            self.cpu_percent / self.num_processes
        } else {
            0.0
        }
    }
}

/// Source of load samples for a set of PIDs.
pub trait LoadSampler: Send {
    /// Measure `pids` now. `None` if none of them could be measured.
    fn sample(&mut self, pids: &[u32]) -> Option<LoadSample>;

    /// Drop any per-process state kept for `pid`.
    fn forget(&mut self, pid: u32);
}

/// [`LoadSampler`] backed by the OS process table.
pub struct ProcessSampler {
    system: System,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for ProcessSampler {
    fn sample(&mut self, pids: &[u32]) -> Option<LoadSample> {
        if pids.is_empty() {
            return None;
        }
        let sys_pids: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&sys_pids),
            true,
            ProcessRefreshKind::new()
                .with_cpu()
                .with_memory()
                .with_disk_usage(),
        );

        let mut sample = LoadSample {
            at: Instant::now(),
            num_processes: 0,
            cpu_percent: 0.0,
            physical_mem: 0,
            virtual_mem: 0,
            disk_read: 0,
            disk_written: 0,
        };
        for pid in &sys_pids {
            if let Some(process) = self.system.process(*pid) {
                let disk = process.disk_usage();
                sample.num_processes += 1;
                sample.cpu_percent += f64::from(process.cpu_usage());
                sample.physical_mem += process.memory();
                sample.virtual_mem += process.virtual_memory();
                sample.disk_read += disk.read_bytes;
                sample.disk_written += disk.written_bytes;
            }
        }

        (sample.num_processes > 0).then_some(sample)
    }

    fn forget(&mut self, pid: u32) {
        // Re-refreshing a vanished PID with removal enabled drops its entry
        let sys_pid = [Pid::from_u32(pid)];
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&sys_pid),
            true,
            ProcessRefreshKind::new(),
        );
    }
}

/// Bounded FIFO of load samples.
#[derive(Debug, Clone)]
pub struct LoadHistory {
    samples: VecDeque<LoadSample>,
    capacity: usize,
}

impl LoadHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: LoadSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&LoadSample> {
        self.samples.back()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Average of the samples taken within `window` before `now`.
    pub fn average_over(&self, window: Duration, now: Instant) -> Option<LoadAverage> {
        let start = now.checked_sub(window);
        let in_window: Vec<&LoadSample> = self
            .samples
            .iter()
            .filter(|s| s.at <= now && start.map_or(true, |start| s.at >= start))
            .collect();
        if in_window.is_empty() {
            return None;
        }

        let n = in_window.len() as f64;
        let sum = |f: fn(&LoadSample) -> f64| in_window.iter().map(|s| f(s)).sum::<f64>() / n;
        Some(LoadAverage {
            samples: in_window.len(),
            num_processes: sum(|s| s.num_processes as f64),
            cpu_percent: sum(|s| s.cpu_percent),
            physical_mem: sum(|s| s.physical_mem as f64),
            virtual_mem: sum(|s| s.virtual_mem as f64),
        })
    }
}

impl Default for LoadHistory {
    fn default() -> Self {
        Self::new(PoolConfig::HISTORY_LEN)
    }
}
