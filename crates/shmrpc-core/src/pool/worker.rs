//! Entry point of a worker process started by a [`super::CommandSpawner`].

use super::spawn::WorkerSpec;
use crate::endpoint::{MethodTable, Server};
use crate::error::{Result, ShmRpcError};
use crate::registry::ResourceRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::info;

/// Serve the method table described by `spec_json` until SIGINT or SIGTERM.
///
/// Registers this process as a server (which is what the pool manager waits
/// for), then stops its threads and deregisters on the signal.
pub fn run_worker<F>(spec_json: &str, build_table: F) -> Result<()>
where
    F: FnOnce(&WorkerSpec) -> Result<MethodTable>,
{
    let spec = WorkerSpec::from_json(spec_json)?;
    let table = build_table(&spec)?;
    let registry = Arc::new(ResourceRegistry::open(spec.port)?);

    // Installed before registering so an early signal still deregisters
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || flag.store(true, Ordering::Release))
        .map_err(|e| ShmRpcError::os("install signal handler", e))?;

    let mut server = Server::start(registry, spec.name.clone(), table, spec.options.clone())?;
    info!(
        "Worker {} (generation {}) serving {} on port {}",
        std::process::id(),
        spec.generation,
        spec.name,
        spec.port
    );

    while !stop.load(Ordering::Acquire) {
        thread::sleep(spec.options.monitor_interval);
    }
    server.stop()?;
    info!("Worker {} shut down", std::process::id());
    Ok(())
}
