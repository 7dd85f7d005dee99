//! Scaling decisions of the pool control loop.
//!
//! Kept free of side effects so thresholds can be checked against synthetic
//! load histories.

use super::settings::PoolSettings;
use crate::system::LoadHistory;
use std::fmt;
use std::time::{Duration, Instant};

/// What the control loop should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Hold,
    SpawnBelowMinimum,
    SpawnForLoad,
    RemoveForMemory,
    RemoveForIdle,
}

impl ScalingDecision {
    pub fn spawns(self) -> bool {
        matches!(
            self,
            ScalingDecision::SpawnBelowMinimum | ScalingDecision::SpawnForLoad
        )
    }

    pub fn removes(self) -> bool {
        matches!(
            self,
            ScalingDecision::RemoveForMemory | ScalingDecision::RemoveForIdle
        )
    }
}

impl fmt::Display for ScalingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ScalingDecision::Hold => "hold",
            ScalingDecision::SpawnBelowMinimum => "spawn (below minimum)",
            ScalingDecision::SpawnForLoad => "spawn (cpu load)",
            ScalingDecision::RemoveForMemory => "remove (memory limit)",
            ScalingDecision::RemoveForIdle => "remove (idle)",
        };
        f.write_str(text)
    }
}

/// Everything a decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct ScalingInput<'a> {
    pub live_workers: usize,
    pub history: &'a LoadHistory,
    /// Time of the last spawn or removal, if any.
    pub last_scaling_op: Option<Instant>,
    pub now: Instant,
}

impl ScalingInput<'_> {
    fn since_last_op(&self) -> Duration {
        match self.last_scaling_op {
            Some(at) => self.now.saturating_duration_since(at),
            None => Duration::MAX,
        }
    }
}

/// Decide one step. Checks run in order: minimum, memory, load, idle.
pub fn decide(input: &ScalingInput<'_>, settings: &PoolSettings) -> ScalingDecision {
    if input.live_workers < settings.min_proc_num {
        return ScalingDecision::SpawnBelowMinimum;
    }

    if let (Some(limit), Some(latest)) = (settings.max_proc_mem_bytes, input.history.latest()) {
        if latest.physical_mem > limit && input.live_workers > 0 {
            return ScalingDecision::RemoveForMemory;
        }
    }

    let threshold = settings.cpu_threshold_percent();
    let since_last_op = input.since_last_op();

    if let Some(recent) = input.history.average_over(settings.new_proc_window(), input.now) {
        if since_last_op > settings.new_proc_window()
            && recent.cpu_percent_per_process() > threshold
            && input.live_workers < settings.max_proc_num
        {
            return ScalingDecision::SpawnForLoad;
        }
    }

    if let Some(long) = input.history.average_over(settings.kill_proc_window(), input.now) {
        if since_last_op > settings.kill_proc_window()
            && long.cpu_percent < threshold
            && input.live_workers > settings.min_proc_num
        {
            return ScalingDecision::RemoveForIdle;
        }
    }

    ScalingDecision::Hold
}
