//! Named cross-process mutex that spins before blocking.
//!
//! The lock word lives in its own shared memory segment:
//!
//! ```text
//! magic | state | destroyed | owner_pid | owner_start_time
//! ```
//!
//! `state` follows the classic three-state futex mutex: 0 unlocked,
//! 1 locked, 2 locked with (possible) waiters. Unlocking from 2 wakes one
//! waiter. The owner fields are advisory: they are written after the lock is
//! taken and may be stale, so they are only used to ask whether a holder has
//! died.

#![allow(unsafe_code)]

use super::LockMode;
use crate::config::LockConfig;
use crate::error::{Result, ShmRpcError};
use crate::platform::futex::{futex_wait, futex_wake};
use crate::platform::{is_process_alive, page_size, process_start_time, ShmSegment};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

#[repr(C)]
struct LockWord {
    magic: AtomicU32,
    state: AtomicU32,
    destroyed: AtomicU32,
    owner_pid: AtomicU32,
    owner_start_time: AtomicU64,
}

/// Handle to a named hybrid lock.
///
/// Every handle to the same name shares one logical lock, whichever process
/// holds it. Dropping a handle does not release or destroy the lock.
#[derive(Debug)]
pub struct HybridLock {
    name: String,
    segment: ShmSegment,
}

impl HybridLock {
    /// Open a lock according to `mode`.
    pub fn open(name: &str, mode: LockMode) -> Result<Self> {
        match mode {
            LockMode::ConnectToExisting => Self::connect(name),
            LockMode::CreateNewExclusive => Self::create_segment(name, true),
            LockMode::CreateNewOverwrite => {
                if let Ok(previous) = Self::connect(name) {
                    previous.mark_destroyed();
                }
                Self::create_segment(name, false)
            }
            LockMode::ConnectOrCreate => match Self::create_segment(name, true) {
                Err(ShmRpcError::LockExists { .. }) => Self::connect(name),
                other => other,
            },
        }
    }

    /// Create a lock, or connect to a live one unless `exclusive` is set.
    pub fn create(name: &str, exclusive: bool) -> Result<Self> {
        let mode = if exclusive {
            LockMode::CreateNewExclusive
        } else {
            LockMode::ConnectOrCreate
        };
        Self::open(name, mode)
    }

    /// Attach to an existing lock.
    pub fn connect(name: &str) -> Result<Self> {
        let segment = ShmSegment::open(name).map_err(|e| match e {
            ShmRpcError::NoSuchChannel { name } => ShmRpcError::NoSuchLock { name },
            other => other,
        })?;
        if segment.len() < std::mem::size_of::<LockWord>() {
            return Err(ShmRpcError::protocol(format!(
                "lock segment {} is too small ({} bytes)",
                name,
                segment.len()
            )));
        }

        let lock = Self {
            name: name.to_string(),
            segment,
        };

        let deadline = Instant::now() + LockConfig::INIT_WAIT;
        while lock.word().magic.load(Ordering::Acquire) != LockConfig::MAGIC {
            if Instant::now() >= deadline {
                return Err(ShmRpcError::protocol(format!(
                    "lock segment {} was never initialized",
                    name
                )));
            }
            std::thread::yield_now();
        }
        lock.check_destroyed()?;
        Ok(lock)
    }

    fn create_segment(name: &str, exclusive: bool) -> Result<Self> {
        let segment = ShmSegment::create(name, page_size(), exclusive).map_err(|e| match e {
            ShmRpcError::ChannelExists { name } => ShmRpcError::LockExists { name },
            other => other,
        })?;
        let lock = Self {
            name: name.to_string(),
            segment,
        };
        // Fresh segments are zero-filled; publishing the magic makes the lock usable.
        lock.word().magic.store(LockConfig::MAGIC, Ordering::Release);
        debug!("Created lock {}", name);
        Ok(lock)
    }

    /// Whether a lock of this name currently exists.
    pub fn exists(name: &str) -> bool {
        ShmSegment::exists(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn word(&self) -> &LockWord {
        // SAFETY: the segment is page-aligned and at least one page long
        // (checked on connect, guaranteed on create), LockWord is repr(C)
        // and made only of atomics, which are valid for any bit pattern.
        // The reference cannot outlive the mapping owned by `self`.
        unsafe { &*(self.segment.as_ptr() as *const LockWord) }
    }

    fn check_destroyed(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(ShmRpcError::LockDestroyed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn acquired(&self) -> Result<()> {
        if self.is_destroyed() {
            self.release();
            return Err(ShmRpcError::LockDestroyed {
                name: self.name.clone(),
            });
        }
        let word = self.word();
        let pid = std::process::id();
        word.owner_start_time
            .store(process_start_time(pid).unwrap_or(0), Ordering::Release);
        word.owner_pid.store(pid, Ordering::Release);
        Ok(())
    }

    /// Acquire the lock.
    ///
    /// With `spin`, busy-waits in user space for a bounded number of
    /// iterations before blocking in the kernel. `timeout` of zero is a
    /// try-lock, `None` waits indefinitely.
    pub fn lock(&self, timeout: Option<Duration>, spin: bool) -> Result<()> {
        self.check_destroyed()?;
        let state = &self.word().state;

        if state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return self.acquired();
        }

        if spin && timeout != Some(Duration::ZERO) {
            for i in 0..LockConfig::SPIN_LIMIT {
                if state.load(Ordering::Relaxed) == UNLOCKED
                    && state
                        .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    return self.acquired();
                }
                if i % 64 == 63 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return self.acquired();
            }
            self.check_destroyed()?;

            let slice = match deadline {
                None => LockConfig::WAIT_SLICE,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ShmRpcError::LockTimeout {
                            name: self.name.clone(),
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                    (deadline - now).min(LockConfig::WAIT_SLICE)
                }
            };
            futex_wait(state, CONTENDED, slice);
        }
    }

    /// Non-blocking acquire. `Ok(false)` if someone else holds it.
    pub fn try_lock(&self) -> Result<bool> {
        match self.lock(Some(Duration::ZERO), false) {
            Ok(()) => Ok(true),
            Err(ShmRpcError::LockTimeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Acquire and release automatically when the guard drops.
    pub fn guard(&self, timeout: Option<Duration>, spin: bool) -> Result<HybridLockGuard<'_>> {
        self.lock(timeout, spin)?;
        Ok(HybridLockGuard { lock: self })
    }

    fn release(&self) -> bool {
        let word = self.word();
        word.owner_pid.store(0, Ordering::Release);
        word.owner_start_time.store(0, Ordering::Release);
        match word.state.swap(UNLOCKED, Ordering::Release) {
            UNLOCKED => false,
            CONTENDED => {
                futex_wake(&word.state, 1);
                true
            }
            _ => true,
        }
    }

    /// Release the lock. Unlocking an unlocked lock is a no-op.
    ///
    /// Returns whether the lock was held.
    pub fn unlock(&self) -> bool {
        let was_locked = self.release();
        if !was_locked {
            debug!("Unlock of already unlocked lock {}", self.name);
        }
        was_locked
    }

    /// Release a lock held by the dead owner `expected_pid`/`expected_start`.
    ///
    /// The owner is claimed with a compare-and-swap first, so of several
    /// parties that saw the same dead owner only one releases the lock, and
    /// none of them can release it after a live process has taken it over.
    /// Returns whether this call released the lock.
    pub fn force_unlock(&self, expected_pid: u32, expected_start: u64) -> bool {
        let word = self.word();
        if expected_pid == 0
            || word
                .owner_pid
                .compare_exchange(expected_pid, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }
        if word.owner_start_time.load(Ordering::Acquire) != expected_start {
            // Same PID, different incarnation: it is a live holder, give it back
            let _ = word.owner_pid.compare_exchange(
                0,
                expected_pid,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            return false;
        }
        let released = self.release();
        if released {
            warn!("Force-unlocked {} (dead owner {})", self.name, expected_pid);
        }
        released
    }

    pub fn is_locked(&self) -> bool {
        self.word().state.load(Ordering::Acquire) != UNLOCKED
    }

    /// PID recorded by the last acquirer. Advisory: may be stale.
    pub fn get_owner_pid(&self) -> Option<u32> {
        match self.word().owner_pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// `(pid, start_time)` of the holder when the lock is held by a process
    /// that no longer exists.
    ///
    /// A recorded start time that differs from the live process with the
    /// same PID means the PID was reused, so the holder is dead too. Pass
    /// the result to [`HybridLock::force_unlock`].
    pub fn dead_owner(&self) -> Option<(u32, u64)> {
        if !self.is_locked() {
            return None;
        }
        let word = self.word();
        let pid = word.owner_pid.load(Ordering::Acquire);
        if pid == 0 {
            return None;
        }
        let recorded = word.owner_start_time.load(Ordering::Acquire);
        if !is_process_alive(pid) {
            return Some((pid, recorded));
        }
        match process_start_time(pid) {
            Some(current) if recorded != 0 && current != recorded => Some((pid, recorded)),
            _ => None,
        }
    }

    fn mark_destroyed(&self) {
        let word = self.word();
        word.destroyed.store(1, Ordering::Release);
        futex_wake(&word.state, i32::MAX);
    }

    /// Remove the lock. Every other handle observes `LockDestroyed` from now on.
    pub fn destroy(&self) -> Result<()> {
        self.mark_destroyed();
        ShmSegment::unlink(&self.name)?;
        debug!("Destroyed lock {}", self.name);
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.word().destroyed.load(Ordering::Acquire) != 0
    }

    #[cfg(test)]
    pub(crate) fn set_owner_for_test(&self, pid: u32, start_time: u64) {
        let word = self.word();
        word.owner_start_time.store(start_time, Ordering::Release);
        word.owner_pid.store(pid, Ordering::Release);
    }
}

/// Releases its lock on drop.
#[derive(Debug)]
pub struct HybridLockGuard<'a> {
    lock: &'a HybridLock,
}

impl Drop for HybridLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_name;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_create_and_connect_share_state() {
        let name = unique_name("lock");
        let a = HybridLock::create(&name, true).unwrap();
        let b = HybridLock::connect(&name).unwrap();

        a.lock(Some(Duration::from_secs(1)), true).unwrap();
        assert!(b.is_locked());
        assert!(!b.try_lock().unwrap());

        assert!(a.unlock());
        assert!(b.try_lock().unwrap());
        b.unlock();
        a.destroy().unwrap();
    }

    #[test]
    fn test_connect_missing_is_no_such_lock() {
        let err = HybridLock::connect(&unique_name("missing")).unwrap_err();
        assert!(matches!(err, ShmRpcError::NoSuchLock { .. }));
    }

    #[test]
    fn test_exclusive_create_conflict() {
        let name = unique_name("excl");
        let first = HybridLock::create(&name, true).unwrap();
        let err = HybridLock::create(&name, true).unwrap_err();
        assert!(matches!(err, ShmRpcError::LockExists { .. }));

        // Non-exclusive create connects instead
        let second = HybridLock::create(&name, false).unwrap();
        first.lock(Some(Duration::ZERO), false).unwrap();
        assert!(second.is_locked());
        first.destroy().unwrap();
    }

    #[test]
    fn test_timeout_is_distinct_error() {
        let name = unique_name("timeout");
        let a = HybridLock::create(&name, true).unwrap();
        let b = HybridLock::connect(&name).unwrap();
        a.lock(None, false).unwrap();

        let start = Instant::now();
        let err = b.lock(Some(Duration::from_millis(100)), true).unwrap_err();
        assert!(matches!(err, ShmRpcError::LockTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(100));
        a.destroy().unwrap();
    }

    #[test]
    fn test_destroy_is_observed_by_other_handles() {
        let name = unique_name("destroy");
        let a = HybridLock::create(&name, true).unwrap();
        let b = HybridLock::connect(&name).unwrap();

        a.destroy().unwrap();
        assert!(b.is_destroyed());
        let err = b.lock(Some(Duration::from_millis(10)), false).unwrap_err();
        assert!(matches!(err, ShmRpcError::LockDestroyed { .. }));

        let err = HybridLock::connect(&name).unwrap_err();
        assert!(matches!(err, ShmRpcError::NoSuchLock { .. }));
    }

    #[test]
    fn test_destroy_wakes_blocked_waiter() {
        let name = unique_name("wake");
        let holder = HybridLock::create(&name, true).unwrap();
        holder.lock(None, false).unwrap();

        let waiter_name = name.clone();
        let waiter = thread::spawn(move || {
            let lock = HybridLock::connect(&waiter_name).unwrap();
            lock.lock(Some(Duration::from_secs(30)), false)
        });

        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        holder.destroy().unwrap();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ShmRpcError::LockDestroyed { .. })));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_overwrite_destroys_previous() {
        let name = unique_name("overwrite");
        let old = HybridLock::create(&name, true).unwrap();
        let new = HybridLock::open(&name, LockMode::CreateNewOverwrite).unwrap();

        assert!(old.is_destroyed());
        assert!(!new.is_destroyed());
        assert!(new.try_lock().unwrap());
        new.destroy().unwrap();
    }

    #[test]
    fn test_owner_pid_tracking() {
        let name = unique_name("owner");
        let lock = HybridLock::create(&name, true).unwrap();
        assert_eq!(lock.get_owner_pid(), None);

        lock.lock(None, true).unwrap();
        assert_eq!(lock.get_owner_pid(), Some(std::process::id()));
        assert_eq!(lock.dead_owner(), None);

        lock.unlock();
        assert_eq!(lock.get_owner_pid(), None);
        lock.destroy().unwrap();
    }

    #[test]
    fn test_dead_owner_can_be_force_unlocked() {
        let name = unique_name("dead");
        let lock = HybridLock::create(&name, true).unwrap();
        lock.lock(None, false).unwrap();
        lock.set_owner_for_test(999_999_999, 0);

        assert_eq!(lock.dead_owner(), Some((999_999_999, 0)));
        assert!(!lock.force_unlock(999_999_999, 7));
        assert!(lock.is_locked());
        assert!(lock.force_unlock(999_999_999, 0));
        assert!(!lock.is_locked());
        lock.destroy().unwrap();
    }

    #[test]
    fn test_late_force_unlock_spares_new_holder() {
        let name = unique_name("late_reaper");
        let creator = HybridLock::create(&name, true).unwrap();
        let reaper_a = HybridLock::connect(&name).unwrap();
        let reaper_b = HybridLock::connect(&name).unwrap();
        let worker = HybridLock::connect(&name).unwrap();
        let intruder = HybridLock::connect(&name).unwrap();

        creator.lock(None, false).unwrap();
        creator.set_owner_for_test(999_999_999, 0);
        let seen_a = reaper_a.dead_owner().unwrap();
        let seen_b = reaper_b.dead_owner().unwrap();
        assert_eq!(seen_a, seen_b);

        assert!(reaper_a.force_unlock(seen_a.0, seen_a.1));
        worker.lock(None, false).unwrap();
        assert!(!reaper_b.force_unlock(seen_b.0, seen_b.1));

        assert!(worker.is_locked());
        assert_eq!(worker.get_owner_pid(), Some(std::process::id()));
        assert!(!intruder.try_lock().unwrap());

        worker.unlock();
        creator.destroy().unwrap();
    }

    #[test]
    fn test_reused_pid_counts_as_dead_owner() {
        let name = unique_name("reuse");
        let lock = HybridLock::create(&name, true).unwrap();
        lock.lock(None, false).unwrap();
        // Our own (live) PID, but a start time from another incarnation
        if process_start_time(std::process::id()).is_some() {
            lock.set_owner_for_test(std::process::id(), 1);
            assert!(lock.dead_owner().is_some());
        }
        lock.destroy().unwrap();
    }

    #[test]
    fn test_unlock_when_unlocked_is_tolerated() {
        let name = unique_name("tolerant");
        let lock = HybridLock::create(&name, true).unwrap();
        assert!(!lock.unlock());
        {
            let _guard = lock.guard(None, true).unwrap();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        lock.destroy().unwrap();
    }

    #[test]
    fn test_mutual_exclusion_across_handles() {
        let name = unique_name("mutex");
        let creator = HybridLock::create(&name, true).unwrap();
        let inside = Arc::new(AtomicU32::new(0));
        let total = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let name = name.clone();
                let inside = Arc::clone(&inside);
                let total = Arc::clone(&total);
                thread::spawn(move || {
                    let lock = HybridLock::connect(&name).unwrap();
                    for _ in 0..200 {
                        lock.lock(Some(Duration::from_secs(10)), i % 2 == 0).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::SeqCst);
                        std::hint::spin_loop();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 800);
        creator.destroy().unwrap();
    }
}
