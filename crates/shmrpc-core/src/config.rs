//! Centralized configuration for shmrpc.
//!
//! Protocol constants live on unit structs; runtime tunables for endpoints
//! live on [`EndpointOptions`]. Worker pool settings are in
//! [`crate::pool::PoolSettings`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hybrid lock tuning.
pub struct LockConfig;

impl LockConfig {
    /// Marker written once a lock segment is fully initialized.
    pub const MAGIC: u32 = 0x4C4B_5348; // "HSKL"
    /// User-space spin iterations before falling back to the kernel.
    pub const SPIN_LIMIT: u32 = 2_000;
    /// Longest single kernel wait; destroy/ownership are re-checked between slices.
    pub const WAIT_SLICE: Duration = Duration::from_millis(250);
    /// How long `connect` waits for a concurrent creator to finish initializing.
    pub const INIT_WAIT: Duration = Duration::from_secs(1);
}

/// Shared memory channel layout.
pub struct ChannelConfig;

impl ChannelConfig {
    pub const STATE_CLIENT_TURN: u8 = b'C';
    pub const STATE_SERVER_TURN: u8 = b'S';
    pub const STATE_INVALID: u8 = b'I';
    /// Payload starts after the state byte.
    pub const PAYLOAD_OFFSET: usize = 1;
    pub const INITIAL_CAPACITY: usize = 4096;
    /// Resized segments hold at least `needed * GROWTH_NUMERATOR / GROWTH_DENOMINATOR` bytes.
    pub const GROWTH_NUMERATOR: usize = 3;
    pub const GROWTH_DENOMINATOR: usize = 2;
}

/// Client/server endpoint timings.
pub struct EndpointConfig;

impl EndpointConfig {
    pub const SERVER_LOCK_TIMEOUT: Duration = Duration::from_secs(4);
    pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
    pub const REAP_INTERVAL: Duration = Duration::from_secs(5);
    pub const RESEND_BUDGET: u32 = 10_000;
    pub const RESEND_BACKOFF_MAX: Duration = Duration::from_millis(1);
    /// Client waits are split into slices so a dead lock holder can be noticed.
    pub const CLIENT_WAIT_SLICE: Duration = Duration::from_secs(1);
    pub const HEARTBEAT_METHOD: &'static str = "heartbeat";
}

/// Registry segment settings.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const LOCK_SLICE: Duration = Duration::from_secs(1);
    pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
    pub const INITIAL_CAPACITY: usize = 4096;
}

/// Worker pool defaults.
pub struct PoolConfig;

impl PoolConfig {
    pub const MONITOR_INTERVAL_SECS: u64 = 5;
    pub const SIGINT_TIMEOUT_SECS: u64 = 5;
    pub const SIGTERM_TIMEOUT_SECS: u64 = 5;
    pub const CLIENT_LOCK_TIMEOUT_SECS: u64 = 2;
    pub const START_TIMEOUT_SECS: u64 = 30;
    pub const START_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Samples kept per pool; at a 5 s interval this covers 25 minutes.
    pub const HISTORY_LEN: usize = 300;
    pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
    /// Wait after SIGKILL before giving up on reaping.
    pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);
}

/// Runtime tunables shared by clients and servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOptions {
    /// Spin in user space before blocking on the lock.
    pub use_spinlock: bool,
    /// Initial channel capacity for new connections.
    pub initial_capacity: usize,
    /// Times a client may find its request still unclaimed before giving up.
    pub resend_budget: u32,
    /// Upper bound on one client call; `None` waits as long as the handler runs.
    pub call_timeout: Option<Duration>,
    /// Per-attempt lock wait of a server worker thread.
    pub server_lock_timeout: Duration,
    /// How often a server looks for new or departed clients.
    pub monitor_interval: Duration,
    /// How often a server prunes dead clients from the registry.
    pub reap_interval: Duration,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            use_spinlock: true,
            initial_capacity: ChannelConfig::INITIAL_CAPACITY,
            resend_budget: EndpointConfig::RESEND_BUDGET,
            call_timeout: None,
            server_lock_timeout: EndpointConfig::SERVER_LOCK_TIMEOUT,
            monitor_interval: EndpointConfig::MONITOR_INTERVAL,
            reap_interval: EndpointConfig::REAP_INTERVAL,
        }
    }
}
