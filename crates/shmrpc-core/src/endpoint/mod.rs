//! RPC endpoints built on the lock, channel and registry layers.

mod client;
mod methods;
mod remote_error;
mod server;

pub use client::Client;
pub use methods::{
    HandlerResult, MethodInfo, MethodSignature, MethodTable, MethodTableBuilder, HEARTBEAT,
};
pub use remote_error::{HandlerError, RemoteError, RemoteErrorKind};
pub use server::Server;
