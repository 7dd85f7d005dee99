//! Cross-process tests for shmrpc-svc.
//!
//! These drive the real binary: workers started through the JSON spec
//! contract, idle clients killed mid-connection, and full pools.

use shmrpc_core::platform::{is_process_alive, terminate_gracefully, TerminationSignal};
use shmrpc_core::registry::{channel_name, client_lock_name};
use shmrpc_core::{
    Channel, ClientId, CodecKind, CommandSpawner, EndpointOptions, HybridLock, MethodSignature,
    PoolSettings, RemoteErrorKind, ResourceRegistry, ServiceContext, WorkerPoolManager,
    WorkerSpec,
};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

const ADD: MethodSignature = MethodSignature::new("add", CodecKind::Json, CodecKind::Json);
const PID: MethodSignature = MethodSignature::new("pid", CodecKind::Json, CodecKind::Json);
const SLEEP_MS: MethodSignature = MethodSignature::new("sleep_ms", CodecKind::Json, CodecKind::Json);

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_shmrpc-svc")
}

fn unique_port() -> u16 {
    static NEXT: OnceLock<AtomicU16> = OnceLock::new();
    let next = NEXT.get_or_init(|| AtomicU16::new(50_000 + rand::random::<u16>() % 10_000));
    next.fetch_add(1, Ordering::Relaxed)
}

fn fast_options() -> EndpointOptions {
    EndpointOptions {
        server_lock_timeout: Duration::from_millis(200),
        monitor_interval: Duration::from_millis(20),
        reap_interval: Duration::from_millis(500),
        ..EndpointOptions::default()
    }
}

/// Poll `check` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// Kills the child if a test fails before cleaning up.
struct ChildGuard(Child);

impl ChildGuard {
    fn pid(&self) -> u32 {
        self.0.id()
    }

    fn read_line(&mut self) -> String {
        let stdout = self.0.stdout.take().expect("stdout was not piped");
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if is_process_alive(self.0.id()) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }
}

fn spawn_worker(port: u16, name: &str) -> ChildGuard {
    let spec = WorkerSpec {
        port,
        name: name.to_string(),
        generation: 1,
        options: fast_options(),
    };
    let child = Command::new(bin())
        .arg("worker")
        .arg(spec.to_json().unwrap())
        .stdin(Stdio::null())
        .spawn()
        .expect("failed to start worker");
    ChildGuard(child)
}

fn wait_registered(registry: &ResourceRegistry, pid: u32) {
    assert!(
        wait_until(Duration::from_secs(10), || registry
            .list_server_pids()
            .unwrap()
            .contains(&pid)),
        "worker {} never registered",
        pid
    );
}

#[test]
fn test_worker_spawn_contract() {
    let port = unique_port();
    let registry = ResourceRegistry::open(port).unwrap();
    let worker = spawn_worker(port, "demo");
    wait_registered(&registry, worker.pid());

    let ctx = ServiceContext::with_options(fast_options());
    let client = ctx.client(port, "demo").unwrap();
    let sum: i64 = client.call(&ADD, &(20, 22)).unwrap();
    assert_eq!(sum, 42);
    assert_eq!(client.send_raw("reverse", b"abc").unwrap(), b"cba");
    let served_by: u32 = client.call(&PID, &()).unwrap();
    assert_eq!(served_by, worker.pid());
    client.close().unwrap();

    // A worker exits promptly on SIGINT and deregisters itself
    let report = terminate_gracefully(worker.pid(), Duration::from_secs(5), Duration::from_secs(5));
    assert!(report.exited);
    assert_eq!(report.signals_sent, vec![TerminationSignal::Interrupt]);
    assert!(!registry.list_server_pids().unwrap().contains(&worker.pid()));

    ResourceRegistry::unlink(port).unwrap();
}

#[test]
fn test_remote_errors_cross_process() {
    let port = unique_port();
    let registry = ResourceRegistry::open(port).unwrap();
    let worker = spawn_worker(port, "demo");
    wait_registered(&registry, worker.pid());

    let ctx = ServiceContext::with_options(fast_options());
    let client = ctx.client(port, "demo").unwrap();
    let err = client.send_raw("fail", b"no good").unwrap_err();
    let remote = err.as_remote().expect("expected a remote error");
    assert_eq!(remote.kind, RemoteErrorKind::InvalidArgument);
    assert_eq!(remote.message, "no good");

    let err = client.send_raw("missing", b"").unwrap_err();
    assert_eq!(err.as_remote().unwrap().kind, RemoteErrorKind::MethodNotFound);

    // Large payloads grow the channel on both sides
    let payload = vec![7u8; 1 << 20];
    assert_eq!(client.send_raw("echo", &payload).unwrap(), payload);
    client.close().unwrap();

    terminate_gracefully(worker.pid(), Duration::from_secs(5), Duration::from_secs(5));
    ResourceRegistry::unlink(port).unwrap();
}

#[test]
fn test_killed_client_is_reaped() {
    let port = unique_port();
    let registry = ResourceRegistry::open(port).unwrap();

    let child = Command::new(bin())
        .args(["connect", "--port", &port.to_string(), "--hold-secs", "30"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut client = ChildGuard(child);
    let line = client.read_line();
    assert!(line.starts_with("SHMRPC_CONNECTED"), "unexpected output: {line}");

    let id = ClientId::new(client.pid(), 0);
    assert_eq!(registry.list_clients().unwrap(), vec![id]);
    assert!(HybridLock::exists(&client_lock_name(port, id)));
    assert!(Channel::exists(&channel_name(port, id)));

    client.0.kill().unwrap();
    client.0.wait().unwrap();

    let report = registry.reap_stale().unwrap();
    assert_eq!(report.removed_clients, vec![id]);
    assert!(registry.list_clients().unwrap().is_empty());
    assert!(!HybridLock::exists(&client_lock_name(port, id)));
    assert!(!Channel::exists(&channel_name(port, id)));

    ResourceRegistry::unlink(port).unwrap();
}

#[test]
fn test_killed_server_is_kept_until_deregistered() {
    let port = unique_port();
    let registry = ResourceRegistry::open(port).unwrap();
    let mut worker = spawn_worker(port, "demo");
    let pid = worker.pid();
    wait_registered(&registry, pid);

    worker.0.kill().unwrap();
    worker.0.wait().unwrap();

    let report = registry.reap_stale().unwrap();
    assert_eq!(report.dead_servers, vec![pid]);
    assert!(registry.list_server_pids().unwrap().contains(&pid));

    assert!(registry.deregister_server(pid).unwrap());
    assert!(registry.list_server_pids().unwrap().is_empty());
    ResourceRegistry::unlink(port).unwrap();
}

fn demo_pool(port: u16, workers: usize) -> WorkerPoolManager {
    let registry = Arc::new(ResourceRegistry::open(port).unwrap());
    let settings = PoolSettings {
        min_proc_num: workers,
        max_proc_num: workers,
        monitor_interval_secs: 3600,
        sigint_timeout_secs: 5,
        sigterm_timeout_secs: 2,
        client_lock_timeout_secs: 5,
        start_timeout_secs: 15,
        ..PoolSettings::default()
    };
    WorkerPoolManager::new(registry, "demo", settings, CommandSpawner::new(bin()).arg("worker"))
        .unwrap()
        .with_endpoint_options(fast_options())
}

#[test]
fn test_pool_serves_and_stops() {
    let port = unique_port();
    let pool = demo_pool(port, 2);
    pool.start().unwrap();
    let workers = pool.worker_pids();
    assert_eq!(workers.len(), 2);

    let ctx = ServiceContext::with_options(fast_options());
    let client = ctx.client(port, "demo").unwrap();
    for i in 0..20i64 {
        let sum: i64 = client.call(&ADD, &(i, i)).unwrap();
        assert_eq!(sum, 2 * i);
        let served_by: u32 = client.call(&PID, &()).unwrap();
        assert!(workers.contains(&served_by));
    }
    client.close().unwrap();

    pool.stop().unwrap();
    let registry = ResourceRegistry::open(port).unwrap();
    assert!(registry.list_server_pids().unwrap().is_empty());
    for pid in workers {
        assert!(!is_process_alive(pid));
    }
    ResourceRegistry::unlink(port).unwrap();
}

#[test]
fn test_stopping_pool_lets_in_flight_call_finish() {
    let port = unique_port();
    let pool = demo_pool(port, 1);
    pool.start().unwrap();

    let ctx = ServiceContext::with_options(fast_options());
    let client = ctx.client(port, "demo").unwrap();
    client.heartbeat(b"ready").unwrap();

    let caller = thread::spawn(move || {
        let slept: u64 = client.call(&SLEEP_MS, &800u64).unwrap();
        slept
    });
    thread::sleep(Duration::from_millis(200));
    pool.stop().unwrap();

    assert_eq!(caller.join().unwrap(), 800);
    ResourceRegistry::unlink(port).unwrap();
}

#[test]
fn test_serve_and_call_cli() {
    let port = unique_port();
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(
        config,
        r#"{{"min_proc_num": 1, "max_proc_num": 1, "monitor_interval_secs": 3600}}"#
    )
    .unwrap();

    let child = Command::new(bin())
        .args(["serve", "--port", &port.to_string(), "--name", "cli"])
        .arg("--config")
        .arg(config.path())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut server = ChildGuard(child);
    let line = server.read_line();
    assert!(line.starts_with("SHMRPC_READY"), "unexpected output: {line}");

    let output = Command::new(bin())
        .args(["call", "--port", &port.to_string(), "--method", "add", "--data", "[1,2]"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "3");

    let output = Command::new(bin())
        .args(["bench", "--port", &port.to_string(), "--iterations", "50", "--size", "128"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report = terminate_gracefully(server.pid(), Duration::from_secs(20), Duration::from_secs(5));
    assert!(report.exited);
    let registry = ResourceRegistry::open(port).unwrap();
    assert!(registry.list_server_pids().unwrap().is_empty());
    ResourceRegistry::unlink(port).unwrap();
}
