//! Shared memory object names.
//!
//! These must match byte for byte across every implementation that talks to
//! the same service.

use std::fmt;

/// One client connection: the client process and its per-process sub-id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId {
    pub pid: u32,
    pub qid: u64,
}

impl ClientId {
    pub fn new(pid: u32, qid: u64) -> Self {
        Self { pid, qid }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.pid, self.qid)
    }
}

/// Channel carrying requests for one connection.
pub fn channel_name(port: u16, client: ClientId) -> String {
    format!("service_{}_{}_{}", port, client.pid, client.qid)
}

/// Lock guarding one connection's channel.
pub fn client_lock_name(port: u16, client: ClientId) -> String {
    format!("client_{}_pid_{}_{}", port, client.pid, client.qid)
}

/// Channel holding the registry lists of a service.
pub fn registry_channel_name(port: u16) -> String {
    format!("mmap_{}_pids", port)
}

/// Lock guarding the registry of a service.
pub fn registry_lock_name(port: u16) -> String {
    format!("sem_{}_pids", port)
}
