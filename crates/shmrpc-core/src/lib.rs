//! shmrpc core - RPC between processes on one machine over POSIX shared memory.
//!
//! Layers, bottom up:
//! - [`lock::HybridLock`]: a cross-process mutex living in a named segment
//! - [`channel::Channel`]: a resizable message segment with a turn byte
//! - [`registry::ResourceRegistry`]: the servers and connections of a port
//! - [`endpoint`]: blocking clients and multi-threaded servers
//! - [`pool::WorkerPoolManager`]: an auto-scaling set of server processes
//!
//! # Example
//!
//! ```rust,no_run
//! use shmrpc_core::{CodecKind, MethodSignature, MethodTable, ServiceContext};
//!
//! const ADD: MethodSignature = MethodSignature::new("add", CodecKind::Json, CodecKind::Json);
//!
//! fn main() -> shmrpc_core::Result<()> {
//!     let ctx = ServiceContext::new();
//!     let table = MethodTable::builder()
//!         .method(&ADD, |(a, b): (i64, i64)| Ok(a + b))
//!         .build()?;
//!     let _server = ctx.serve(5555, "calc", table)?;
//!
//!     let client = ctx.client(5555, "calc")?;
//!     let sum: i64 = client.call(&ADD, &(2, 3))?;
//!     assert_eq!(sum, 5);
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("shmrpc-core requires a Unix platform (POSIX shared memory and signals)");

pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod lock;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod system;

// Re-export commonly used types
pub use channel::{Channel, ChannelState};
pub use codec::{BincodeCodec, Codec, CodecKind, JsonCodec, MsgPackCodec, RawCodec};
pub use config::EndpointOptions;
pub use context::ServiceContext;
pub use endpoint::{
    Client, HandlerError, HandlerResult, MethodSignature, MethodTable, RemoteError,
    RemoteErrorKind, Server, HEARTBEAT,
};
pub use error::{Result, ShmRpcError};
pub use lock::{HybridLock, LockMode};
pub use pool::{
    run_worker, CommandSpawner, PoolSettings, PoolStatus, WorkerPoolManager, WorkerSpec,
};
pub use registry::{ClientId, ResourceRegistry};
