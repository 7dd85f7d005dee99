//! shmrpc-svc - demo service, worker entry point and client tools.
//!
//! `serve` runs the demo service under a worker pool; the pool re-launches
//! this binary with `worker <spec-json>` for every worker process.

mod service;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shmrpc_core::{
    CommandSpawner, PoolSettings, ResourceRegistry, ServiceContext, WorkerPoolManager,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shmrpc-svc")]
#[command(about = "Shared-memory RPC demo service")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the demo service under a worker pool until Ctrl-C
    Serve {
        #[arg(short, long)]
        port: u16,

        #[arg(short, long, default_value = "demo")]
        name: String,

        /// Pool settings as JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the minimum number of workers
        #[arg(long)]
        min: Option<usize>,

        /// Override the maximum number of workers
        #[arg(long)]
        max: Option<usize>,
    },

    /// Serve as one pool worker (started by `serve`)
    Worker {
        /// JSON worker spec
        spec: String,
    },

    /// Make one call and print the result
    Call {
        #[arg(short, long)]
        port: u16,

        #[arg(short, long)]
        method: String,

        /// Argument bytes; JSON text for JSON methods
        #[arg(long, default_value = "")]
        data: String,
    },

    /// Measure round-trip latency of the echo method
    Bench {
        #[arg(short, long)]
        port: u16,

        #[arg(short, long, default_value = "10000")]
        iterations: usize,

        /// Payload size in bytes
        #[arg(short, long, default_value = "64")]
        size: usize,
    },

    /// Open a connection and keep it idle
    Connect {
        #[arg(short, long)]
        port: u16,

        #[arg(long, default_value = "60")]
        hold_secs: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            port,
            name,
            config,
            min,
            max,
        } => serve(port, &name, config, min, max, args.debug),
        Command::Worker { spec } => {
            shmrpc_core::run_worker(&spec, |_| service::build_table())?;
            Ok(())
        }
        Command::Call { port, method, data } => call(port, &method, &data),
        Command::Bench {
            port,
            iterations,
            size,
        } => bench(port, iterations, size),
        Command::Connect { port, hold_secs } => connect(port, hold_secs),
    }
}

fn serve(
    port: u16,
    name: &str,
    config: Option<PathBuf>,
    min: Option<usize>,
    max: Option<usize>,
    debug: bool,
) -> Result<()> {
    let mut settings = match config {
        Some(path) => PoolSettings::from_json_file(&path)
            .with_context(|| format!("loading pool settings from {}", path.display()))?,
        None => PoolSettings::default(),
    };
    if let Some(min) = min {
        settings.min_proc_num = min;
        settings.max_proc_num = settings.max_proc_num.max(min);
    }
    if let Some(max) = max {
        settings.max_proc_num = max;
    }

    let mut spawner = CommandSpawner::current_exe()?;
    if debug {
        spawner = spawner.arg("--debug");
    }
    let spawner = spawner.arg("worker");

    let registry = Arc::new(ResourceRegistry::open(port)?);
    let pool = WorkerPoolManager::new(registry, name, settings, spawner)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::Release))
        .context("installing signal handler")?;

    pool.start()?;
    info!("Serving {} on port {}", name, port);
    // Readiness line for scripts and tests (intentional stdout)
    println!("SHMRPC_READY port={} workers={:?}", port, pool.worker_pids());

    while running.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(200));
    }
    info!("Shutdown signal received, stopping pool");
    pool.stop()?;
    Ok(())
}

fn call(port: u16, method: &str, data: &str) -> Result<()> {
    let ctx = ServiceContext::new();
    let client = ctx.client(port, "cli")?;
    let reply = client
        .send_raw(method, data.as_bytes())
        .with_context(|| format!("calling {} on port {}", method, port))?;
    println!("{}", String::from_utf8_lossy(&reply));
    client.close()?;
    Ok(())
}

fn bench(port: u16, iterations: usize, size: usize) -> Result<()> {
    let ctx = ServiceContext::new();
    let client = ctx.client(port, "bench")?;
    let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();

    // Warm up so the first call does not include connection pickup
    client.heartbeat(b"")?;

    let mut latencies = Vec::with_capacity(iterations);
    let started = Instant::now();
    for _ in 0..iterations {
        let t = Instant::now();
        let reply = client.send_raw(service::ECHO.name, &payload)?;
        latencies.push(t.elapsed());
        anyhow::ensure!(reply == payload, "echo returned different bytes");
    }
    let total = started.elapsed();
    client.close()?;

    if latencies.is_empty() {
        return Ok(());
    }
    latencies.sort();
    let pct = |p: f64| latencies[((latencies.len() - 1) as f64 * p) as usize];
    println!(
        "{} calls of {} bytes in {:.3?}: {:.0} calls/s, p50 {:?}, p99 {:?}, max {:?}",
        iterations,
        size,
        total,
        iterations as f64 / total.as_secs_f64(),
        pct(0.5),
        pct(0.99),
        pct(1.0)
    );
    Ok(())
}

fn connect(port: u16, hold_secs: u64) -> Result<()> {
    let ctx = ServiceContext::new();
    let client = ctx.client(port, "idle")?;
    let id = client.id();
    println!("SHMRPC_CONNECTED pid={} qid={}", id.pid, id.qid);
    thread::sleep(Duration::from_secs(hold_secs));
    client.close()?;
    Ok(())
}
