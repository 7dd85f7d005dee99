//! Cross-process locking.
//!
//! A [`HybridLock`] is the only blocking primitive in the transport: the
//! per-connection ping-pong, the registry guard and the pre-kill drain in
//! the worker pool all go through it.

mod hybrid;

pub use hybrid::{HybridLock, HybridLockGuard};

/// How [`HybridLock::open`] treats an existing lock of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Attach if it exists, otherwise create it.
    ConnectOrCreate,
    /// Attach; fail with `NoSuchLock` if absent.
    ConnectToExisting,
    /// Destroy any existing lock (its handles see `LockDestroyed`) and create a new one.
    CreateNewOverwrite,
    /// Create; fail with `LockExists` if the name is taken.
    CreateNewExclusive,
}
