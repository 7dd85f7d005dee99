//! Client side of a connection.
//!
//! The client holds the connection lock whenever it is idle. A call writes
//! the request, flips the state byte to the server's turn and releases the
//! lock; a server worker takes it, answers, flips the state back and
//! releases. The client then re-acquires the lock and reads the response.

use super::methods::{MethodSignature, HEARTBEAT};
use super::remote_error::RemoteError;
use crate::channel::{Channel, ChannelState, Request, Response, Status};
use crate::config::{ChannelConfig, EndpointConfig, EndpointOptions};
use crate::error::{Result, ShmRpcError};
use crate::lock::{HybridLock, LockMode};
use crate::registry::{
    channel_name, client_lock_name, destroy_client_resources, ClientId, ResourceRegistry,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct Connection {
    lock: HybridLock,
    channel: Channel,
    holding: bool,
}

impl Connection {
    /// Take the connection lock unless we already hold it.
    ///
    /// Waits in slices so a holder that died can be detected and broken.
    fn acquire(&mut self, deadline: Option<(Instant, Duration)>, spin: bool) -> Result<()> {
        if self.holding {
            return Ok(());
        }
        let mut spin = spin;
        loop {
            let slice = match deadline {
                None => EndpointConfig::CLIENT_WAIT_SLICE,
                Some((at, timeout)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(ShmRpcError::LockTimeout {
                            name: self.lock.name().to_string(),
                            timeout,
                        });
                    }
                    (at - now).min(EndpointConfig::CLIENT_WAIT_SLICE)
                }
            };

            match self.lock.lock(Some(slice), spin) {
                Ok(()) => {
                    self.holding = true;
                    return Ok(());
                }
                Err(ShmRpcError::LockTimeout { .. }) => {
                    spin = false;
                    if let Some((pid, start)) = self.lock.dead_owner() {
                        warn!("Holder of {} died mid-call", self.lock.name());
                        self.lock.force_unlock(pid, start);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn release(&mut self) {
        if self.holding {
            self.lock.unlock();
            self.holding = false;
        }
    }
}

/// A connection to a service, usable from many threads.
///
/// Calls on one client are strictly sequential; open more clients (each gets
/// its own qid) for concurrency.
pub struct Client {
    port: u16,
    id: ClientId,
    registry: Arc<ResourceRegistry>,
    options: EndpointOptions,
    connection: Mutex<Connection>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("port", &self.port)
            .field("id", &self.id)
            .finish()
    }
}

impl Client {
    /// Open connection `qid` of this process to the service on the registry's port.
    ///
    /// Creates the connection lock (held from the start) and channel, then
    /// registers the connection so servers pick it up.
    pub fn connect(registry: Arc<ResourceRegistry>, qid: u64, options: EndpointOptions) -> Result<Self> {
        let port = registry.port();
        let id = ClientId::new(std::process::id(), qid);

        let lock = HybridLock::open(&client_lock_name(port, id), LockMode::CreateNewOverwrite)?;
        lock.lock(Some(Duration::ZERO), false)?;
        let channel = Channel::create(&channel_name(port, id), options.initial_capacity)?;

        if let Err(e) = registry.register_client(id.pid, id.qid) {
            destroy_client_resources(port, id);
            return Err(e);
        }
        info!("Client {} connected to port {}", id, port);

        Ok(Self {
            port,
            id,
            registry,
            options,
            connection: Mutex::new(Connection {
                lock,
                channel,
                holding: true,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Current channel size in bytes.
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.lock_connection()?.channel.capacity())
    }

    fn lock_connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| ShmRpcError::Other("client connection mutex poisoned".into()))
    }

    /// Call a method with raw bytes and return its raw result.
    pub fn send_raw(&self, method: &str, args: &[u8]) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ShmRpcError::LockDestroyed {
                name: client_lock_name(self.port, self.id),
            });
        }
        let request = Request::new(method, args)?;
        let mut conn = self.lock_connection()?;
        let deadline = self
            .options
            .call_timeout
            .map(|timeout| (Instant::now() + timeout, timeout));

        // After a timed-out call the lock may have been given up; whatever
        // is in the channel then is stale and gets overwritten.
        conn.acquire(deadline, self.options.use_spinlock)?;
        if conn.channel.state()? == ChannelState::Invalid {
            conn.channel.reconnect()?;
        }

        let frame_len = request.encoded_len();
        if !conn.channel.fits(frame_len) {
            conn.channel
                .resize(ChannelConfig::PAYLOAD_OFFSET + frame_len)?;
        }
        request.encode_into(conn.channel.payload_mut())?;
        conn.channel.set_state(ChannelState::ServerTurn);
        conn.release();

        let mut resends = 0u32;
        let mut spin = self.options.use_spinlock;
        loop {
            conn.acquire(deadline, spin)?;
            spin = false;

            loop {
                match conn.channel.state()? {
                    ChannelState::ClientTurn => return read_response(&conn.channel),
                    ChannelState::Invalid => conn.channel.reconnect()?,
                    ChannelState::ServerTurn => break,
                }
            }

            resends += 1;
            if resends > self.options.resend_budget {
                // Withdraw the request; we keep the lock as when idle.
                conn.channel.set_state(ChannelState::ClientTurn);
                return Err(ShmRpcError::Resend {
                    pid: self.id.pid,
                    qid: self.id.qid,
                    attempts: resends - 1,
                });
            }
            conn.release();
            resend_backoff(resends);
        }
    }

    /// Call a method described by a shared signature.
    pub fn call<A, R>(&self, signature: &MethodSignature, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let bytes = signature.params.dumps(args)?;
        let reply = self.send_raw(signature.name, &bytes)?;
        signature.returns.loads(&reply)
    }

    /// Echo `payload` through the built-in heartbeat method.
    pub fn heartbeat(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send_raw(HEARTBEAT.name, payload)
    }

    /// Deregister and destroy the connection's channel and lock.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Ok(mut conn) = self.connection.lock() {
            conn.release();
        }
        self.registry.deregister_client(self.id.pid, self.id.qid)?;
        debug!("Client {} closed", self.id);
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Failed to deregister client {}: {}", self.id, e);
        }
    }
}

fn read_response(channel: &Channel) -> Result<Vec<u8>> {
    let response = Response::decode(channel.payload())?;
    match response.status {
        Status::Ok => Ok(response.body.to_vec()),
        Status::Err => Err(ShmRpcError::Remote(RemoteError::parse(
            &String::from_utf8_lossy(response.body),
        ))),
    }
}

/// Yield for the first few resends, then sleep with a capped exponential backoff.
fn resend_backoff(resends: u32) {
    const YIELDS: u32 = 16;
    if resends <= YIELDS {
        std::thread::yield_now();
    } else {
        let exp = (resends - YIELDS).min(10);
        let delay = Duration::from_micros(1u64 << exp).min(EndpointConfig::RESEND_BACKOFF_MAX);
        std::thread::sleep(delay);
    }
}
