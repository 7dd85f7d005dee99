//! Platform abstraction layer.
//!
//! All OS-specific code lives here so the transport modules stay free of
//! `#[cfg]` blocks:
//! - `process` - liveness checks, process trees, signal escalation
//! - `shm` - POSIX shared memory segments
//! - `futex` - cross-process wait/wake on a shared 32-bit word
//!
//! Linux is fully supported. Other POSIX systems work with a sleeping
//! fallback in place of the futex and without zombie/start-time detection.

pub mod futex;
pub mod process;
pub mod shm;

pub use process::{
    descendant_pids, is_process_alive, process_start_time, terminate_gracefully, wait_for_exit,
    TerminationReport, TerminationSignal,
};
pub use shm::{page_size, ShmSegment};
