//! Worker process pool for one service port.

use super::scaling::{decide, ScalingDecision, ScalingInput};
use super::settings::PoolSettings;
use super::spawn::{WorkerSpawner, WorkerSpec};
use crate::config::{EndpointOptions, PoolConfig};
use crate::error::{Result, ShmRpcError};
use crate::platform::process::reap;
use crate::platform::{is_process_alive, terminate_gracefully, TerminationReport};
use crate::registry::ResourceRegistry;
use crate::system::{LoadHistory, LoadSample, LoadSampler, ProcessSampler, WorkerProcess};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PoolStatus::Starting => "starting",
            PoolStatus::Started => "started",
            PoolStatus::Stopping => "stopping",
            PoolStatus::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub port: u16,
    pub name: String,
    pub status: PoolStatus,
    /// Live worker PIDs, oldest first.
    pub workers: Vec<u32>,
    pub last_decision: Option<ScalingDecision>,
    pub last_sample: Option<LoadSample>,
    /// Workers spawned since the manager was created.
    pub spawned_total: u64,
}

struct PoolState {
    status: PoolStatus,
    /// Live workers in spawn order.
    workers: Vec<WorkerProcess>,
    history: LoadHistory,
    last_scaling_op: Option<Instant>,
    last_decision: Option<ScalingDecision>,
    generation: u64,
}

struct PoolInner {
    name: String,
    settings: PoolSettings,
    options: EndpointOptions,
    registry: Arc<ResourceRegistry>,
    spawner: Box<dyn WorkerSpawner>,
    sampler: Mutex<Box<dyn LoadSampler>>,
    state: Mutex<PoolState>,
    stop_flag: AtomicBool,
}

/// Keeps between `min_proc_num` and `max_proc_num` workers serving a port,
/// scaling on CPU load and memory, and replacing crashed workers.
pub struct WorkerPoolManager {
    inner: Arc<PoolInner>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPoolManager {
    /// Create a stopped pool. Settings are validated here.
    pub fn new(
        registry: Arc<ResourceRegistry>,
        name: impl Into<String>,
        settings: PoolSettings,
        spawner: impl WorkerSpawner + 'static,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                settings,
                options: EndpointOptions::default(),
                registry,
                spawner: Box::new(spawner),
                sampler: Mutex::new(Box::new(ProcessSampler::new())),
                state: Mutex::new(PoolState {
                    status: PoolStatus::Stopped,
                    workers: Vec::new(),
                    history: LoadHistory::default(),
                    last_scaling_op: None,
                    last_decision: None,
                    generation: 0,
                }),
                stop_flag: AtomicBool::new(false),
            }),
            control: Mutex::new(None),
        })
    }

    /// Replace the load sampler. Only possible before the pool is shared.
    pub fn with_sampler(mut self, sampler: impl LoadSampler + 'static) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.sampler = Mutex::new(Box::new(sampler));
        }
        self
    }

    /// Endpoint options handed to every worker.
    pub fn with_endpoint_options(mut self, options: EndpointOptions) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.options = options;
        }
        self
    }

    pub fn port(&self) -> u16 {
        self.inner.registry.port()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn status(&self) -> PoolStatus {
        self.inner
            .lock_state()
            .map(|s| s.status)
            .unwrap_or(PoolStatus::Stopped)
    }

    pub fn worker_pids(&self) -> Vec<u32> {
        self.inner
            .lock_state()
            .map(|s| s.workers.iter().map(|w| w.pid).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Result<PoolSnapshot> {
        let state = self.inner.lock_state()?;
        Ok(PoolSnapshot {
            port: self.port(),
            name: self.inner.name.clone(),
            status: state.status,
            workers: state.workers.iter().map(|w| w.pid).collect(),
            last_decision: state.last_decision,
            last_sample: state.history.latest().copied(),
            spawned_total: state.generation,
        })
    }

    /// Clean up after a previous generation, start the minimum number of
    /// workers and run the control loop.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state()?;
            if state.status != PoolStatus::Stopped {
                return Err(ShmRpcError::Other(format!(
                    "cannot start pool {} while {}",
                    self.inner.name, state.status
                )));
            }
            state.status = PoolStatus::Starting;
            state.history.clear();
        }
        self.inner.stop_flag.store(false, Ordering::Release);

        if let Err(e) = self.inner.reset_previous_generation() {
            self.inner.set_status(PoolStatus::Stopped);
            return Err(e);
        }

        for _ in 0..self.inner.settings.min_proc_num {
            if let Err(e) = self.inner.spawn_worker(Instant::now()) {
                error!("Pool {} failed to start: {}", self.inner.name, e);
                self.inner.remove_all_workers();
                self.inner.set_status(PoolStatus::Stopped);
                return Err(e);
            }
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("shmrpc-pool-{}", self.port()))
            .spawn(move || control_loop(inner))?;
        *self
            .control
            .lock()
            .map_err(|_| ShmRpcError::Other("pool control mutex poisoned".into()))? = Some(handle);

        self.inner.set_status(PoolStatus::Started);
        info!(
            "Pool {} started on port {} with {} workers",
            self.inner.name,
            self.port(),
            self.inner.settings.min_proc_num
        );
        Ok(())
    }

    /// Stop the control loop and remove every worker.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state()?;
            match state.status {
                PoolStatus::Stopped | PoolStatus::Stopping => return Ok(()),
                _ => state.status = PoolStatus::Stopping,
            }
        }
        self.inner.stop_flag.store(true, Ordering::Release);

        let handle = self
            .control
            .lock()
            .map_err(|_| ShmRpcError::Other("pool control mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Control loop of pool {} panicked", self.inner.name);
            }
        }

        self.inner.remove_all_workers();
        self.inner.set_status(PoolStatus::Stopped);
        info!("Pool {} stopped", self.inner.name);
        Ok(())
    }

    pub fn restart(&self) -> Result<()> {
        self.stop()?;
        self.start()
    }

    /// Run one control step now.
    pub fn tick(&self) -> Result<ScalingDecision> {
        self.inner.tick_at(Instant::now())
    }

    /// Run one control step as if the clock read `now`.
    pub fn tick_at(&self, now: Instant) -> Result<ScalingDecision> {
        self.inner.tick_at(now)
    }
}

impl Drop for WorkerPoolManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error stopping pool {}: {}", self.inner.name, e);
        }
    }
}

fn control_loop(inner: Arc<PoolInner>) {
    let interval = inner.settings.monitor_interval();
    debug!("Control loop of pool {} running", inner.name);
    loop {
        let wake = Instant::now() + interval;
        while Instant::now() < wake {
            if inner.stop_flag.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(PoolConfig::START_POLL_INTERVAL.min(wake.saturating_duration_since(Instant::now())));
        }
        if let Err(e) = inner.tick_at(Instant::now()) {
            warn!("Control step of pool {} failed: {}", inner.name, e);
        }
    }
}

impl PoolInner {
    fn lock_state(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|_| ShmRpcError::Other("pool state mutex poisoned".into()))
    }

    fn set_status(&self, status: PoolStatus) {
        if let Ok(mut state) = self.lock_state() {
            state.status = status;
        }
    }

    fn port(&self) -> u16 {
        self.registry.port()
    }

    /// Drop dead clients and stop servers left registered by an earlier run.
    fn reset_previous_generation(&self) -> Result<()> {
        let report = self.registry.reap_stale()?;
        if !report.removed_clients.is_empty() {
            info!("Reaped {} stale clients", report.removed_clients.len());
        }

        let own_pid = std::process::id();
        for pid in self.registry.reset_server_pids()? {
            if pid == own_pid || !is_process_alive(pid) {
                continue;
            }
            warn!("Stopping leftover server {} on port {}", pid, self.port());
            terminate_gracefully(
                pid,
                self.settings.sigint_timeout(),
                self.settings.sigterm_timeout(),
            );
        }
        Ok(())
    }

    fn tick_at(&self, now: Instant) -> Result<ScalingDecision> {
        self.remove_crashed_workers();

        let pids: Vec<u32> = self.lock_state()?.workers.iter().map(|w| w.pid).collect();
        let sample = self
            .sampler
            .lock()
            .map_err(|_| ShmRpcError::Other("pool sampler mutex poisoned".into()))?
            .sample(&pids);

        let decision = {
            let mut state = self.lock_state()?;
            if let Some(mut sample) = sample {
                sample.at = now;
                state.history.push(sample);
            }
            let input = ScalingInput {
                live_workers: state.workers.len(),
                history: &state.history,
                last_scaling_op: state.last_scaling_op,
                now,
            };
            let decision = decide(&input, &self.settings);
            state.last_decision = Some(decision);
            decision
        };

        if decision != ScalingDecision::Hold {
            info!("Pool {}: {}", self.name, decision);
        }
        if decision.spawns() {
            if let Err(e) = self.spawn_worker(now) {
                error!("Pool {} could not add a worker: {}", self.name, e);
            }
        } else if decision.removes() {
            if let Some(pid) = self.newest_worker() {
                self.remove_worker(pid);
                if let Ok(mut state) = self.lock_state() {
                    state.last_scaling_op = Some(now);
                }
            }
        }
        Ok(decision)
    }

    /// Forget workers that died on their own.
    fn remove_crashed_workers(&self) {
        let pids: Vec<u32> = match self.lock_state() {
            Ok(state) => state.workers.iter().map(|w| w.pid).collect(),
            Err(_) => return,
        };
        for pid in pids {
            reap(pid);
            if is_process_alive(pid) {
                continue;
            }
            warn!("Worker {} of pool {} exited unexpectedly", pid, self.name);
            if let Err(e) = self.registry.deregister_server(pid) {
                warn!("Could not deregister crashed worker {}: {}", pid, e);
            }
            self.forget_worker(pid);
        }
    }

    fn newest_worker(&self) -> Option<u32> {
        let state = self.lock_state().ok()?;
        state
            .workers
            .iter()
            .max_by_key(|w| w.spawn_time)
            .map(|w| w.pid)
    }

    fn spawn_worker(&self, now: Instant) -> Result<u32> {
        let generation = {
            let mut state = self.lock_state()?;
            state.generation += 1;
            state.generation
        };
        let spec = WorkerSpec {
            port: self.port(),
            name: self.name.clone(),
            generation,
            options: self.options.clone(),
        };
        let pid = self.spawner.spawn(&spec)?;

        {
            let mut state = self.lock_state()?;
            state.workers.push(WorkerProcess::new(pid));
            state.last_scaling_op = Some(now);
        }

        if self.settings.wait_until_started {
            if let Err(e) = self.wait_until_registered(pid) {
                self.remove_worker(pid);
                return Err(e);
            }
        }
        Ok(pid)
    }

    /// Poll the registry until `pid` lists itself as a server.
    fn wait_until_registered(&self, pid: u32) -> Result<()> {
        let deadline = Instant::now() + self.settings.start_timeout();
        loop {
            if self.registry.list_server_pids()?.contains(&pid) {
                debug!("Worker {} reported started", pid);
                return Ok(());
            }
            reap(pid);
            if !is_process_alive(pid) {
                return Err(ShmRpcError::WorkerStart {
                    pid,
                    message: "exited during start-up".to_string(),
                });
            }
            if Instant::now() >= deadline {
                return Err(ShmRpcError::WorkerStart {
                    pid,
                    message: format!(
                        "did not register within {:?}",
                        self.settings.start_timeout()
                    ),
                });
            }
            thread::sleep(PoolConfig::START_POLL_INTERVAL);
        }
    }

    /// Take a worker out of service without interrupting calls.
    ///
    /// Order: hold every connection lock, signal the worker tree, release the
    /// locks, deregister. Each step is best-effort.
    fn remove_worker(&self, pid: u32) -> TerminationReport {
        let held = match self
            .registry
            .acquire_all_client_locks(self.settings.client_lock_timeout())
        {
            Ok(held) => Some(held),
            Err(e) => {
                warn!("Could not drain connections before removing {}: {}", pid, e);
                None
            }
        };

        let report = terminate_gracefully(
            pid,
            self.settings.sigint_timeout(),
            self.settings.sigterm_timeout(),
        );
        if report.escalated() {
            warn!("Worker {} needed {:?}", pid, report.signals_sent);
        }

        if let Some(held) = held {
            let released = self.registry.release_all(held);
            debug!("Released {} connection locks", released);
        }
        if let Err(e) = self.registry.deregister_server(pid) {
            warn!("Could not deregister worker {}: {}", pid, e);
        }
        self.forget_worker(pid);
        info!("Removed worker {} from pool {}", pid, self.name);
        report
    }

    fn forget_worker(&self, pid: u32) {
        if let Ok(mut state) = self.lock_state() {
            state.workers.retain(|w| w.pid != pid);
        }
        if let Ok(mut sampler) = self.sampler.lock() {
            sampler.forget(pid);
        }
    }

    fn remove_all_workers(&self) {
        while let Some(pid) = self.newest_worker() {
            self.remove_worker(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::process::send_signal;
    use crate::test_support::unique_port;
    use nix::sys::signal::Signal;
    use std::process::{Command, Stdio};
    use std::time::Duration;

    /// Starts `sleep` and registers it as a server on its behalf.
    struct SleepSpawner {
        registry: Arc<ResourceRegistry>,
    }

    impl WorkerSpawner for SleepSpawner {
        fn spawn(&self, _spec: &WorkerSpec) -> Result<u32> {
            let child = Command::new("sleep")
                .arg("30")
                .stdout(Stdio::null())
                .spawn()?;
            self.registry.register_server(child.id())?;
            Ok(child.id())
        }
    }

    /// Reports a fixed per-worker CPU load and memory.
    struct FixedSampler {
        cpu_per_process: f64,
        physical_mem: u64,
    }

    impl LoadSampler for FixedSampler {
        fn sample(&mut self, pids: &[u32]) -> Option<LoadSample> {
            Some(LoadSample {
                at: Instant::now(),
                num_processes: pids.len(),
                cpu_percent: self.cpu_per_process * pids.len() as f64,
                physical_mem: self.physical_mem,
                virtual_mem: self.physical_mem,
                disk_read: 0,
                disk_written: 0,
            })
        }

        fn forget(&mut self, _pid: u32) {}
    }

    fn quiet_settings(min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            min_proc_num: min,
            max_proc_num: max,
            // Keep the background loop out of the way; tests tick by hand
            monitor_interval_secs: 3600,
            sigint_timeout_secs: 2,
            sigterm_timeout_secs: 2,
            client_lock_timeout_secs: 1,
            start_timeout_secs: 5,
            ..PoolSettings::default()
        }
    }

    fn pool(min: usize, max: usize, sampler: FixedSampler) -> (WorkerPoolManager, Arc<ResourceRegistry>) {
        let registry = Arc::new(ResourceRegistry::open(unique_port()).unwrap());
        let spawner = SleepSpawner {
            registry: Arc::clone(&registry),
        };
        let pool = WorkerPoolManager::new(Arc::clone(&registry), "test", quiet_settings(min, max), spawner)
            .unwrap()
            .with_sampler(sampler);
        (pool, registry)
    }

    #[test]
    fn test_start_and_stop() {
        let (pool, registry) = pool(2, 4, FixedSampler { cpu_per_process: 0.0, physical_mem: 0 });
        assert_eq!(pool.status(), PoolStatus::Stopped);

        pool.start().unwrap();
        assert_eq!(pool.status(), PoolStatus::Started);
        let pids = pool.worker_pids();
        assert_eq!(pids.len(), 2);
        let mut registered = registry.list_server_pids().unwrap();
        registered.sort();
        let mut expected = pids.clone();
        expected.sort();
        assert_eq!(registered, expected);

        assert!(pool.start().is_err());

        pool.stop().unwrap();
        assert_eq!(pool.status(), PoolStatus::Stopped);
        assert!(pool.worker_pids().is_empty());
        assert!(registry.list_server_pids().unwrap().is_empty());
        for pid in pids {
            assert!(!is_process_alive(pid));
        }
        ResourceRegistry::unlink(registry.port()).unwrap();
    }

    #[test]
    fn test_crashed_worker_is_replaced() {
        let (pool, registry) = pool(1, 2, FixedSampler { cpu_per_process: 0.0, physical_mem: 0 });
        pool.start().unwrap();
        let old = pool.worker_pids()[0];

        send_signal(old, Signal::SIGKILL);
        crate::platform::wait_for_exit(old, Duration::from_secs(2));

        let decision = pool.tick().unwrap();
        assert_eq!(decision, ScalingDecision::SpawnBelowMinimum);
        let now_live = pool.worker_pids();
        assert_eq!(now_live.len(), 1);
        assert_ne!(now_live[0], old);
        assert!(!registry.list_server_pids().unwrap().contains(&old));

        pool.stop().unwrap();
        ResourceRegistry::unlink(registry.port()).unwrap();
    }

    #[test]
    fn test_sustained_load_adds_one_worker() {
        let (pool, registry) = pool(1, 4, FixedSampler { cpu_per_process: 45.0, physical_mem: 0 });
        pool.start().unwrap();
        let base = Instant::now();

        let mut spawns = 0;
        for step in 1..=6u64 {
            let decision = pool.tick_at(base + Duration::from_secs(step * 5)).unwrap();
            if decision.spawns() {
                spawns += 1;
            }
        }
        assert_eq!(spawns, 1);
        assert_eq!(pool.worker_pids().len(), 2);
        assert_eq!(pool.snapshot().unwrap().spawned_total, 2);

        pool.stop().unwrap();
        ResourceRegistry::unlink(registry.port()).unwrap();
    }

    #[test]
    fn test_memory_limit_removes_newest_worker() {
        let registry = Arc::new(ResourceRegistry::open(unique_port()).unwrap());
        let spawner = SleepSpawner {
            registry: Arc::clone(&registry),
        };
        let settings = PoolSettings {
            max_proc_mem_bytes: Some(1_000),
            ..quiet_settings(2, 3)
        };
        let pool = WorkerPoolManager::new(Arc::clone(&registry), "mem", settings, spawner)
            .unwrap()
            .with_sampler(FixedSampler {
                cpu_per_process: 0.0,
                physical_mem: 5_000,
            });
        pool.start().unwrap();
        let pids = pool.worker_pids();

        let decision = pool.tick().unwrap();
        assert_eq!(decision, ScalingDecision::RemoveForMemory);
        assert_eq!(pool.worker_pids(), vec![pids[0]]);
        assert!(!is_process_alive(pids[1]));

        let snapshot = pool.snapshot().unwrap();
        assert_eq!(snapshot.last_decision, Some(ScalingDecision::RemoveForMemory));
        assert_eq!(snapshot.last_sample.unwrap().physical_mem, 5_000);

        pool.stop().unwrap();
        ResourceRegistry::unlink(registry.port()).unwrap();
    }

    #[test]
    fn test_start_resets_leftover_servers() {
        let (pool, registry) = pool(1, 1, FixedSampler { cpu_per_process: 0.0, physical_mem: 0 });
        let leftover = Command::new("sleep").arg("30").spawn().unwrap();
        registry.register_server(leftover.id()).unwrap();

        pool.start().unwrap();
        let servers = registry.list_server_pids().unwrap();
        assert!(!servers.contains(&leftover.id()));
        assert_eq!(servers, pool.worker_pids());
        assert!(!is_process_alive(leftover.id()));

        pool.stop().unwrap();
        ResourceRegistry::unlink(registry.port()).unwrap();
    }

    #[test]
    fn test_restart() {
        let (pool, registry) = pool(1, 1, FixedSampler { cpu_per_process: 0.0, physical_mem: 0 });
        pool.start().unwrap();
        let first = pool.worker_pids();
        pool.restart().unwrap();
        assert_eq!(pool.status(), PoolStatus::Started);
        let second = pool.worker_pids();
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
        pool.stop().unwrap();
        ResourceRegistry::unlink(registry.port()).unwrap();
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let registry = Arc::new(ResourceRegistry::open(unique_port()).unwrap());
        let spawner = SleepSpawner {
            registry: Arc::clone(&registry),
        };
        let settings = PoolSettings {
            min_proc_num: 0,
            ..PoolSettings::default()
        };
        assert!(WorkerPoolManager::new(Arc::clone(&registry), "bad", settings, spawner).is_err());
        ResourceRegistry::unlink(registry.port()).unwrap();
    }
}
