//! Crash-safe registry of the processes attached to one service port.
//!
//! The registry is itself a small channel plus a lock:
//!
//! ```text
//! state byte | u32 json_len (BE) | JSON [[server_pid, ...], [[client_pid, qid], ...]]
//! ```
//!
//! Every read or write happens with the registry lock held, and a client's
//! channel and lock are destroyed under it too, together with its entry.
//! Connection locks are never taken while the registry lock is held.

use super::names::{
    channel_name, client_lock_name, registry_channel_name, registry_lock_name, ClientId,
};
use crate::channel::{Channel, ChannelState};
use crate::config::RegistryConfig;
use crate::error::{Result, ShmRpcError};
use crate::lock::{HybridLock, HybridLockGuard, LockMode};
use crate::platform::is_process_alive;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LEN_PREFIX: usize = 4;

/// The two registry lists, serialized as a two-element JSON array.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RegistryLists(Vec<u32>, Vec<(u32, u64)>);

impl RegistryLists {
    fn servers(&mut self) -> &mut Vec<u32> {
        &mut self.0
    }

    fn clients(&mut self) -> &mut Vec<(u32, u64)> {
        &mut self.1
    }

    fn client_ids(&self) -> Vec<ClientId> {
        self.1
            .iter()
            .map(|(pid, qid)| ClientId::new(*pid, *qid))
            .collect()
    }
}

/// Outcome of [`ResourceRegistry::reap_stale`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Dead clients that were dropped and whose channel/lock were destroyed.
    pub removed_clients: Vec<ClientId>,
    /// Dead server PIDs, left in place for a successor to adopt.
    pub dead_servers: Vec<u32>,
}

/// Registry of live server PIDs and client connections for one port.
#[derive(Debug)]
pub struct ResourceRegistry {
    port: u16,
    lock: HybridLock,
    channel: Mutex<Channel>,
}

impl ResourceRegistry {
    /// Attach to the registry of `port`, creating it if this is the first user.
    pub fn open(port: u16) -> Result<Self> {
        let lock = HybridLock::open(&registry_lock_name(port), LockMode::ConnectOrCreate)?;
        let channel = {
            let _guard = acquire_registry_lock(&lock)?;
            let (mut channel, created) = Channel::connect_or_create(
                &registry_channel_name(port),
                RegistryConfig::INITIAL_CAPACITY,
            )?;
            if created {
                write_lists(&mut channel, &RegistryLists::default())?;
                info!("Created registry for port {}", port);
            }
            channel
        };

        Ok(Self {
            port,
            lock,
            channel: Mutex::new(channel),
        })
    }

    /// Remove the registry's shared memory objects.
    ///
    /// Handles that are still open keep working on an orphaned copy, so this
    /// is only for services that are gone for good.
    pub fn unlink(port: u16) -> Result<()> {
        Channel::remove(&registry_channel_name(port))?;
        if let Ok(lock) = HybridLock::connect(&registry_lock_name(port)) {
            lock.destroy()?;
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn with_lists<R>(&self, f: impl FnOnce(&mut RegistryLists) -> R) -> Result<R> {
        let _guard = acquire_registry_lock(&self.lock)?;
        let mut channel = self
            .channel
            .lock()
            .map_err(|_| ShmRpcError::Other("registry channel mutex poisoned".into()))?;

        if channel.state()? == ChannelState::Invalid {
            channel.reconnect()?;
        }

        let mut lists = read_lists(&channel)?;
        let before = lists.clone();
        let out = f(&mut lists);
        if lists != before {
            write_lists(&mut channel, &lists)?;
        }
        Ok(out)
    }

    pub fn register_server(&self, pid: u32) -> Result<()> {
        self.with_lists(|lists| {
            if !lists.servers().contains(&pid) {
                lists.servers().push(pid);
            }
        })?;
        debug!("Registered server {} on port {}", pid, self.port);
        Ok(())
    }

    /// Returns whether the PID was registered.
    pub fn deregister_server(&self, pid: u32) -> Result<bool> {
        let removed = self.with_lists(|lists| {
            let before = lists.servers().len();
            lists.servers().retain(|p| *p != pid);
            lists.servers().len() != before
        })?;
        debug!("Deregistered server {} on port {}", pid, self.port);
        Ok(removed)
    }

    /// Clear the server list, returning the PIDs that were on it.
    pub fn reset_server_pids(&self) -> Result<Vec<u32>> {
        self.with_lists(|lists| std::mem::take(lists.servers()))
    }

    /// Register a connection. Registering the same pair twice is a no-op.
    pub fn register_client(&self, pid: u32, qid: u64) -> Result<()> {
        self.with_lists(|lists| {
            if !lists.clients().contains(&(pid, qid)) {
                lists.clients().push((pid, qid));
            }
        })?;
        debug!("Registered client ({}, {}) on port {}", pid, qid, self.port);
        Ok(())
    }

    /// Drop a connection and destroy its channel and lock.
    pub fn deregister_client(&self, pid: u32, qid: u64) -> Result<()> {
        let port = self.port;
        self.with_lists(|lists| {
            lists.clients().retain(|c| *c != (pid, qid));
            destroy_client_resources(port, ClientId::new(pid, qid));
        })?;
        debug!("Deregistered client ({}, {}) on port {}", pid, qid, self.port);
        Ok(())
    }

    pub fn list_server_pids(&self) -> Result<Vec<u32>> {
        self.with_lists(|lists| lists.servers().clone())
    }

    pub fn list_clients(&self) -> Result<Vec<ClientId>> {
        self.with_lists(|lists| lists.client_ids())
    }

    /// Compare live registered clients against the ones a server already serves.
    ///
    /// Returns `(created, exited)`: live clients missing from `known`, and
    /// entries of `known` that are no longer registered or whose process died.
    pub fn diff_client_pids(
        &self,
        known: &HashSet<ClientId>,
    ) -> Result<(Vec<ClientId>, Vec<ClientId>)> {
        let live: HashSet<ClientId> = self
            .list_clients()?
            .into_iter()
            .filter(|client| is_process_alive(client.pid))
            .collect();

        let mut created: Vec<ClientId> = live.difference(known).copied().collect();
        let mut exited: Vec<ClientId> = known.difference(&live).copied().collect();
        created.sort();
        exited.sort();
        Ok((created, exited))
    }

    /// Prune clients whose process is gone and destroy their resources.
    ///
    /// Dead server PIDs are reported but kept: a replacement worker may adopt
    /// the slot, and only `deregister_server` removes them.
    pub fn reap_stale(&self) -> Result<ReapReport> {
        let port = self.port;
        let report = self.with_lists(|lists| {
            let dead_servers: Vec<u32> = lists
                .servers()
                .iter()
                .copied()
                .filter(|pid| !is_process_alive(*pid))
                .collect();

            let removed_clients: Vec<ClientId> = lists
                .client_ids()
                .into_iter()
                .filter(|client| !is_process_alive(client.pid))
                .collect();
            lists
                .clients()
                .retain(|(pid, _)| is_process_alive(*pid));
            for client in &removed_clients {
                destroy_client_resources(port, *client);
            }

            ReapReport {
                removed_clients,
                dead_servers,
            }
        })?;

        for client in &report.removed_clients {
            info!("Reaped dead client {} on port {}", client, self.port);
        }
        Ok(report)
    }

    /// Take every registered connection lock so no call is mid-flight.
    ///
    /// Locks held by dead processes are force-unlocked first. A lock held by
    /// its own (idle) client is only tried once; other busy locks get up to
    /// `timeout`. Locks that cannot be taken are skipped.
    pub fn acquire_all_client_locks(&self, timeout: Duration) -> Result<HeldClientLocks> {
        let clients = self.list_clients()?;
        let mut held = HeldClientLocks::default();

        for client in clients {
            let name = client_lock_name(self.port, client);
            let lock = match HybridLock::connect(&name) {
                Ok(lock) => lock,
                Err(e) => {
                    debug!("Skipping lock {}: {}", name, e);
                    continue;
                }
            };

            if let Some((pid, start)) = lock.dead_owner() {
                lock.force_unlock(pid, start);
            }

            let wait = if lock.get_owner_pid() == Some(client.pid) {
                Duration::ZERO
            } else {
                timeout
            };
            match lock.lock(Some(wait), false) {
                Ok(()) => held.locks.push((client, lock)),
                Err(e) => debug!("Skipping lock {}: {}", name, e),
            }
        }

        debug!(
            "Acquired {} client locks on port {}",
            held.locks.len(),
            self.port
        );
        Ok(held)
    }

    /// Release locks taken by [`ResourceRegistry::acquire_all_client_locks`].
    pub fn release_all(&self, held: HeldClientLocks) -> usize {
        held.release_all()
    }
}

/// Connection locks held by this process; released on drop.
#[derive(Debug, Default)]
pub struct HeldClientLocks {
    locks: Vec<(ClientId, HybridLock)>,
}

impl HeldClientLocks {
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn clients(&self) -> Vec<ClientId> {
        self.locks.iter().map(|(client, _)| *client).collect()
    }

    pub fn release_all(mut self) -> usize {
        self.release()
    }

    fn release(&mut self) -> usize {
        let count = self.locks.len();
        for (_, lock) in self.locks.drain(..) {
            lock.unlock();
        }
        count
    }
}

impl Drop for HeldClientLocks {
    fn drop(&mut self) {
        self.release();
    }
}

/// Destroy the lock and channel of a connection. Missing objects are fine.
pub fn destroy_client_resources(port: u16, client: ClientId) {
    if let Ok(lock) = HybridLock::connect(&client_lock_name(port, client)) {
        if let Err(e) = lock.destroy() {
            warn!("Failed to destroy lock of client {}: {}", client, e);
        }
    }
    if let Err(e) = Channel::remove(&channel_name(port, client)) {
        warn!("Failed to remove channel of client {}: {}", client, e);
    }
}

/// Take the registry lock in slices, breaking locks left by dead holders.
fn acquire_registry_lock(lock: &HybridLock) -> Result<HybridLockGuard<'_>> {
    let deadline = Instant::now() + RegistryConfig::LOCK_TIMEOUT;
    loop {
        match lock.guard(Some(RegistryConfig::LOCK_SLICE), true) {
            Ok(guard) => return Ok(guard),
            Err(ShmRpcError::LockTimeout { .. }) => {
                if let Some((pid, start)) = lock.dead_owner() {
                    warn!("Registry lock {} held by a dead process", lock.name());
                    lock.force_unlock(pid, start);
                } else if Instant::now() >= deadline {
                    return Err(ShmRpcError::Registry {
                        message: format!(
                            "timed out after {:?} waiting for {}",
                            RegistryConfig::LOCK_TIMEOUT,
                            lock.name()
                        ),
                    });
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn read_lists(channel: &Channel) -> Result<RegistryLists> {
    let payload = channel.payload();
    if payload.len() < LEN_PREFIX {
        return Err(ShmRpcError::Registry {
            message: "registry segment too small".into(),
        });
    }
    let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if len == 0 {
        // Creator died before the first write
        return Ok(RegistryLists::default());
    }
    let json = payload
        .get(LEN_PREFIX..LEN_PREFIX + len)
        .ok_or_else(|| ShmRpcError::Registry {
            message: format!("registry claims {} bytes of JSON", len),
        })?;
    Ok(serde_json::from_slice(json)?)
}

fn write_lists(channel: &mut Channel, lists: &RegistryLists) -> Result<()> {
    let json = serde_json::to_vec(lists)?;
    let frame_len = LEN_PREFIX + json.len();
    if !channel.fits(frame_len) {
        channel.resize(frame_len + 1)?;
    }
    let payload = channel.payload_mut();
    payload[..LEN_PREFIX].copy_from_slice(&(json.len() as u32).to_be_bytes());
    payload[LEN_PREFIX..frame_len].copy_from_slice(&json);
    Ok(())
}
