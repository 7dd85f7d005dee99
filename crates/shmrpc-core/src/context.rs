//! Per-process entry point for building endpoints.
//!
//! A [`ServiceContext`] belongs to the process that created it. It hands out
//! connection ids (qids) per port and shares one registry handle per port
//! between all endpoints of the process. A forked child must build its own
//! context; every method checks the PID and refuses otherwise.

use crate::config::EndpointOptions;
use crate::endpoint::{Client, MethodTable, Server};
use crate::error::{Result, ShmRpcError};
use crate::registry::ResourceRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct ContextState {
    next_qids: HashMap<u16, u64>,
    registries: HashMap<u16, Arc<ResourceRegistry>>,
}

/// Owner of this process's qids and registry handles.
#[derive(Debug)]
pub struct ServiceContext {
    pid: u32,
    options: EndpointOptions,
    state: Mutex<ContextState>,
}

impl ServiceContext {
    pub fn new() -> Self {
        Self::with_options(EndpointOptions::default())
    }

    pub fn with_options(options: EndpointOptions) -> Self {
        Self {
            pid: std::process::id(),
            options,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// PID of the process that created the context.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }

    /// Fail if called from a different process than the creator.
    pub fn check_pid(&self) -> Result<()> {
        let actual = std::process::id();
        if actual != self.pid {
            return Err(ShmRpcError::ForkedProcess {
                expected: self.pid,
                actual,
            });
        }
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, ContextState>> {
        self.check_pid()?;
        self.state
            .lock()
            .map_err(|_| ShmRpcError::Other("service context mutex poisoned".into()))
    }

    /// Next connection id for `port`; starts at 0 and never repeats.
    pub fn next_qid(&self, port: u16) -> Result<u64> {
        let mut state = self.state()?;
        let next = state.next_qids.entry(port).or_insert(0);
        let qid = *next;
        *next += 1;
        Ok(qid)
    }

    /// Shared registry handle for `port`, opened on first use.
    pub fn registry(&self, port: u16) -> Result<Arc<ResourceRegistry>> {
        let mut state = self.state()?;
        if let Some(registry) = state.registries.get(&port) {
            return Ok(Arc::clone(registry));
        }
        let registry = Arc::new(ResourceRegistry::open(port)?);
        state.registries.insert(port, Arc::clone(&registry));
        Ok(registry)
    }

    /// Open a new connection to the service `name` on `port`.
    pub fn client(&self, port: u16, name: &str) -> Result<Client> {
        let registry = self.registry(port)?;
        let qid = self.next_qid(port)?;
        debug!("Connecting to {} on port {} as qid {}", name, port, qid);
        Client::connect(registry, qid, self.options.clone())
    }

    /// Start serving `table` on `port` from this process.
    pub fn serve(&self, port: u16, name: &str, table: MethodTable) -> Result<Server> {
        let registry = self.registry(port)?;
        Server::start(registry, name, table, self.options.clone())
    }
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self::new()
    }
}
