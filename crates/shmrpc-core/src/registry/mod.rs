//! Per-port registry of server processes and client connections.
//!
//! Servers discover new connections through it, clients announce themselves
//! in it, and the worker pool drains connection locks through it before
//! killing a worker.

pub mod names;
mod resource_registry;

pub use names::{
    channel_name, client_lock_name, registry_channel_name, registry_lock_name, ClientId,
};
pub use resource_registry::{
    destroy_client_resources, HeldClientLocks, ReapReport, ResourceRegistry,
};
