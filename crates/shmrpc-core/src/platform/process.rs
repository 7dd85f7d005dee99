//! Process liveness, process trees and graceful termination.
//!
//! Liveness treats zombies as dead: a worker that has exited but not yet been
//! reaped must not keep a connection or a pool slot alive.

use crate::config::PoolConfig;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::thread::sleep;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// Uses `kill(pid, 0)`; on Linux a zombie (exited, unreaped) counts as dead.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        // Exists but belongs to another user
        Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn read_stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    Some(rest.split_whitespace().map(str::to_string).collect())
}

fn is_zombie(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        read_stat_fields(pid)
            .and_then(|fields| fields.first().cloned())
            .map(|state| state == "Z" || state == "X")
            .unwrap_or(false)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        false
    }
}

/// Start time of a process in clock ticks since boot.
///
/// Paired with the PID it identifies one process incarnation, which guards
/// ownership checks against PID reuse. `None` where unavailable.
pub fn process_start_time(pid: u32) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        // Field 22 of /proc/<pid>/stat; the split starts at field 3.
        read_stat_fields(pid)?.get(19)?.parse().ok()
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

/// All transitive children of `pid`, nearest first.
pub fn descendant_pids(pid: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());

    let root = sysinfo::Pid::from_u32(pid);
    let mut seen = HashSet::new();
    let mut children = Vec::new();
    let mut to_check = vec![root];

    while let Some(check_pid) = to_check.pop() {
        for (child_pid, process) in system.processes() {
            if process.parent() == Some(check_pid) && *child_pid != root && seen.insert(*child_pid) {
                children.push(child_pid.as_u32());
                to_check.push(*child_pid);
            }
        }
    }

    children
}

/// Send a signal, returning `false` if the process no longer exists.
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("Failed to send {} to {}: {}", signal, pid, e);
            false
        }
    }
}

/// Collect the exit status of a child without blocking.
///
/// Not being the parent (`ECHILD`) is fine: init reaps those.
pub fn reap(pid: u32) -> Option<WaitStatus> {
    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(status) => {
            debug!("Reaped process {}: {:?}", pid, status);
            Some(status)
        }
        Err(Errno::ECHILD) => None,
        Err(e) => {
            debug!("waitpid({}) failed: {}", pid, e);
            None
        }
    }
}

/// Wait until `pid` has exited, reaping it if it is our child.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    wait_for_all(&[pid], timeout)
}

fn wait_for_all(pids: &[u32], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        for pid in pids {
            reap(*pid);
        }
        if !pids.iter().any(|pid| is_process_alive(*pid)) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(PoolConfig::EXIT_POLL_INTERVAL.min(deadline - now));
    }
}

/// A signal sent during graceful termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl TerminationSignal {
    fn as_signal(self) -> Signal {
        match self {
            TerminationSignal::Interrupt => Signal::SIGINT,
            TerminationSignal::Terminate => Signal::SIGTERM,
            TerminationSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// What `terminate_gracefully` had to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    pub pid: u32,
    /// Signals sent, in order. Empty if the process was already gone.
    pub signals_sent: Vec<TerminationSignal>,
    /// The process (and all its descendants) are gone.
    pub exited: bool,
}

impl TerminationReport {
    pub fn escalated(&self) -> bool {
        self.signals_sent.len() > 1
    }
}

/// Stop a process tree: SIGINT, then SIGTERM, then SIGKILL.
///
/// Each stage signals the process and every descendant still alive, then
/// waits for its timeout; escalation only happens if something survived.
/// Everything is reaped at the end. Never fails: problems are logged.
pub fn terminate_gracefully(
    pid: u32,
    sigint_timeout: Duration,
    sigterm_timeout: Duration,
) -> TerminationReport {
    let mut report = TerminationReport {
        pid,
        signals_sent: Vec::new(),
        exited: false,
    };

    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        reap(pid);
        report.exited = true;
        return report;
    }

    let mut targets = vec![pid];
    targets.extend(descendant_pids(pid));

    let stages = [
        (TerminationSignal::Interrupt, sigint_timeout),
        (TerminationSignal::Terminate, sigterm_timeout),
        (TerminationSignal::Kill, PoolConfig::KILL_REAP_TIMEOUT),
    ];

    for (stage, timeout) in stages {
        let alive: Vec<u32> = targets
            .iter()
            .copied()
            .filter(|p| is_process_alive(*p))
            .collect();
        if alive.is_empty() {
            break;
        }

        debug!("Sending {:?} to {:?}", stage.as_signal(), alive);
        for target in &alive {
            send_signal(*target, stage.as_signal());
        }
        report.signals_sent.push(stage);

        if wait_for_all(&alive, timeout) {
            break;
        }
    }

    for target in &targets {
        reap(*target);
    }
    report.exited = !targets.iter().any(|p| is_process_alive(*p));
    if !report.exited {
        warn!("Process tree of {} survived SIGKILL", pid);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(999_999_999));
        assert!(!is_process_alive(4_000_000_000));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_zombie_counts_as_dead() {
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Exited but not reaped yet
        sleep(Duration::from_millis(300));
        assert!(!is_process_alive(pid));
        assert!(reap(pid).is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_start_time_stable() {
        let pid = std::process::id();
        let first = process_start_time(pid);
        assert!(first.is_some());
        assert_eq!(first, process_start_time(pid));
        assert_eq!(process_start_time(999_999_999), None);
    }

    #[test]
    fn test_terminate_nonexistent() {
        let report = terminate_gracefully(999_999_999, Duration::ZERO, Duration::ZERO);
        assert!(report.exited);
        assert!(report.signals_sent.is_empty());
    }

    #[test]
    fn test_prompt_sigint_exit_never_sees_sigterm() {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();

        let report = terminate_gracefully(pid, Duration::from_secs(5), Duration::from_secs(5));
        assert!(report.exited);
        assert_eq!(report.signals_sent, vec![TerminationSignal::Interrupt]);
        assert!(!report.escalated());
    }

    #[test]
    fn test_sigint_ignoring_process_escalates() {
        let child = Command::new("sh")
            .args(["-c", "trap '' INT; exec sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id();
        // Let the shell install its trap before signalling
        sleep(Duration::from_millis(300));

        let report =
            terminate_gracefully(pid, Duration::from_millis(300), Duration::from_secs(5));
        assert!(report.exited);
        assert_eq!(
            report.signals_sent,
            vec![TerminationSignal::Interrupt, TerminationSignal::Terminate]
        );
    }

    #[test]
    fn test_descendants_are_found() {
        let child = Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        let pid = child.id();
        sleep(Duration::from_millis(300));

        let descendants = descendant_pids(pid);
        assert!(!descendants.is_empty());

        let report = terminate_gracefully(pid, Duration::from_secs(2), Duration::from_secs(2));
        assert!(report.exited);
        for descendant in descendants {
            assert!(!is_process_alive(descendant));
        }
    }
}
