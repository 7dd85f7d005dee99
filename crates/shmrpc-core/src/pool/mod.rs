//! Auto-scaling pool of server worker processes.
//!
//! The manager samples the load of its workers every monitor interval and
//! decides whether to add one (sustained CPU load, too few workers) or remove
//! one (idle, over the memory limit). Removal first holds every connection
//! lock of the port so no call is cut off mid-flight.

mod manager;
mod scaling;
mod settings;
mod spawn;
pub mod worker;

pub use manager::{PoolSnapshot, PoolStatus, WorkerPoolManager};
pub use scaling::{decide, ScalingDecision, ScalingInput};
pub use settings::PoolSettings;
pub use spawn::{CommandSpawner, WorkerSpawner, WorkerSpec};
pub use worker::run_worker;
