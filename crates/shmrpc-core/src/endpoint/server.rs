//! Server side: one monitor thread plus one worker thread per connection.
//!
//! The monitor polls the registry for new and departed clients and reaps
//! dead ones. Each worker waits on its connection lock, answers requests
//! found in the server's turn, and exits when the connection is torn down.

use super::methods::MethodTable;
use crate::channel::{Channel, ChannelState, Request, Response};
use crate::config::{ChannelConfig, EndpointOptions};
use crate::error::{Result, ShmRpcError};
use crate::lock::HybridLock;
use crate::registry::{channel_name, client_lock_name, ClientId, ResourceRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

struct ServerShared {
    port: u16,
    name: String,
    registry: Arc<ResourceRegistry>,
    table: MethodTable,
    options: EndpointOptions,
    shutdown: AtomicBool,
    served: AtomicU64,
    connections: AtomicUsize,
}

impl ServerShared {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

struct WorkerSlot {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<()>>,
}

/// A running server for one service port.
pub struct Server {
    pid: u32,
    shared: Arc<ServerShared>,
    monitor: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.shared.port)
            .field("name", &self.shared.name)
            .field("pid", &self.pid)
            .finish()
    }
}

impl Server {
    /// Register this process as a server and start serving connections.
    pub fn start(
        registry: Arc<ResourceRegistry>,
        name: impl Into<String>,
        table: MethodTable,
        options: EndpointOptions,
    ) -> Result<Self> {
        let pid = std::process::id();
        let port = registry.port();
        let shared = Arc::new(ServerShared {
            port,
            name: name.into(),
            registry,
            table,
            options,
            shutdown: AtomicBool::new(false),
            served: AtomicU64::new(0),
            connections: AtomicUsize::new(0),
        });

        shared.registry.register_server(pid)?;

        let monitor_shared = Arc::clone(&shared);
        let monitor = thread::Builder::new()
            .name(format!("shmrpc-{}-monitor", port))
            .spawn(move || monitor_loop(monitor_shared))?;

        info!(
            "Server {} ({}) serving port {} with {} methods",
            shared.name,
            pid,
            port,
            shared.table.len()
        );
        Ok(Self {
            pid,
            shared,
            monitor: Some(monitor),
        })
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.monitor.is_some() && !self.shared.stopping()
    }

    /// Requests answered so far (including error responses).
    pub fn requests_served(&self) -> u64 {
        self.shared.served.load(Ordering::Relaxed)
    }

    /// Connections currently served by a worker thread.
    pub fn active_connections(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Stop all threads and deregister this process.
    ///
    /// Worker threads notice within one server lock timeout.
    pub fn stop(&mut self) -> Result<()> {
        let Some(monitor) = self.monitor.take() else {
            return Ok(());
        };
        self.shared.shutdown.store(true, Ordering::Release);
        if monitor.join().is_err() {
            error!("Monitor thread of port {} panicked", self.shared.port);
        }
        self.shared.registry.deregister_server(self.pid)?;
        info!("Server {} on port {} stopped", self.shared.name, self.shared.port);
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error stopping server on port {}: {}", self.shared.port, e);
        }
    }
}

fn monitor_loop(shared: Arc<ServerShared>) {
    let mut workers: HashMap<ClientId, WorkerSlot> = HashMap::new();
    let mut retired: Vec<WorkerSlot> = Vec::new();
    let mut last_reap: Option<Instant> = None;

    while !shared.stopping() {
        if last_reap.map_or(true, |at| at.elapsed() >= shared.options.reap_interval) {
            match shared.registry.reap_stale() {
                Ok(report) if !report.removed_clients.is_empty() => {
                    debug!("Reaped {} dead clients", report.removed_clients.len())
                }
                Ok(_) => {}
                Err(e) => warn!("Reaping port {} failed: {}", shared.port, e),
            }
            last_reap = Some(Instant::now());
        }

        let known: HashSet<ClientId> = workers.keys().copied().collect();
        match shared.registry.diff_client_pids(&known) {
            Ok((created, exited)) => {
                for client in exited {
                    if let Some(slot) = workers.remove(&client) {
                        slot.stop.store(true, Ordering::Release);
                        retired.push(slot);
                    }
                }
                for client in created {
                    match spawn_worker(&shared, client) {
                        Ok(slot) => {
                            workers.insert(client, slot);
                        }
                        // Not fully set up yet, or already gone; retried next tick
                        Err(e) => debug!("Not serving client {} yet: {}", client, e),
                    }
                }
            }
            Err(e) => warn!("Listing clients of port {} failed: {}", shared.port, e),
        }
        shared.connections.store(workers.len(), Ordering::Relaxed);

        retired.retain(|slot| !slot.handle.is_finished());
        thread::sleep(shared.options.monitor_interval);
    }

    for slot in workers.values() {
        slot.stop.store(true, Ordering::Release);
    }
    for slot in workers.into_values().chain(retired) {
        if slot.handle.join().is_err() {
            error!("A worker thread of port {} panicked", shared.port);
        }
    }
    shared.connections.store(0, Ordering::Relaxed);
}

fn spawn_worker(shared: &Arc<ServerShared>, client: ClientId) -> Result<WorkerSlot> {
    let lock = HybridLock::connect(&client_lock_name(shared.port, client))?;
    let channel = Channel::connect(&channel_name(shared.port, client))?;
    let stop = Arc::new(AtomicBool::new(false));

    let worker_shared = Arc::clone(shared);
    let worker_stop = Arc::clone(&stop);
    let handle = thread::Builder::new()
        .name(format!("shmrpc-{}-{}-{}", shared.port, client.pid, client.qid))
        .spawn(move || {
            let result = worker_loop(&worker_shared, client, lock, channel, &worker_stop);
            if let Err(e) = &result {
                error!("Worker for client {} terminated: {}", client, e);
            }
            result
        })?;

    debug!("Serving client {} on port {}", client, shared.port);
    Ok(WorkerSlot { stop, handle })
}

enum Turn {
    Served,
    Idle,
}

fn worker_loop(
    shared: &ServerShared,
    client: ClientId,
    lock: HybridLock,
    mut channel: Channel,
    stop: &AtomicBool,
) -> Result<()> {
    let mut spin = shared.options.use_spinlock;

    while !stop.load(Ordering::Acquire) && !shared.stopping() {
        match lock.lock(Some(shared.options.server_lock_timeout), spin) {
            Ok(()) => spin = shared.options.use_spinlock,
            Err(e) if e.is_retryable() => {
                // Idle client; stop burning CPU on it until it talks again
                spin = false;
                continue;
            }
            Err(e) if e.is_connection_lost() => {
                debug!("Connection {} closed", client);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let outcome = serve_once(shared, &mut channel);
        lock.unlock();

        match outcome {
            Ok(Turn::Served) => {
                shared.served.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Turn::Idle) => thread::yield_now(),
            Err(e) if e.is_connection_lost() => {
                debug!("Connection {} closed", client);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Handle the channel while holding its lock.
fn serve_once(shared: &ServerShared, channel: &mut Channel) -> Result<Turn> {
    if channel.state()? == ChannelState::Invalid {
        channel.reconnect()?;
    }
    match channel.state()? {
        ChannelState::ServerTurn => {}
        ChannelState::ClientTurn => return Ok(Turn::Idle),
        ChannelState::Invalid => {
            return Err(ShmRpcError::protocol(format!(
                "channel {} still invalid after reconnect",
                channel.name()
            )))
        }
    }

    let reply = {
        let request = Request::decode(channel.payload())?;
        shared.table.dispatch(request.method, request.args)
    };

    let error_text;
    let response = match &reply {
        Ok(body) => Response::ok(body),
        Err(err) => {
            debug!("Handler error: {}", err);
            error_text = err.to_wire();
            Response::err(&error_text)
        }
    };

    let frame_len = response.encoded_len();
    if !channel.fits(frame_len) {
        channel.resize(ChannelConfig::PAYLOAD_OFFSET + frame_len)?;
    }
    response.encode_into(channel.payload_mut())?;
    channel.set_state(ChannelState::ClientTurn);
    Ok(Turn::Served)
}
