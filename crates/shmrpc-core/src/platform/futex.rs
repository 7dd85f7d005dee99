//! Cross-process wait/wake on a 32-bit word in shared memory.
//!
//! Linux uses the non-private futex operations so waiters in different
//! processes mapping the same segment are matched. Elsewhere waiting
//! degrades to a short sleep and waking is a no-op; callers re-check the
//! word after every return either way.

#![allow(unsafe_code)]

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Block while `*word == expected`, for at most `timeout`.
///
/// Returns early on wake, signal, or if the value already differs.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // SAFETY: `word` points into a live shared mapping for the duration of
    // the call, and `ts` outlives it. EAGAIN, EINTR and ETIMEDOUT are all
    // handled by the caller re-reading the word.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake up to `count` waiters blocked on `word`.
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: i32) {
    // SAFETY: `word` points into a live shared mapping; FUTEX_WAKE only
    // uses the address as a key.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    use std::sync::atomic::Ordering;

    if word.load(Ordering::Acquire) == expected {
        std::thread::sleep(timeout.min(Duration::from_micros(500)));
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_wait_returns_when_value_differs() {
        let word = AtomicU32::new(1);
        let start = Instant::now();
        futex_wait(&word, 0, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out() {
        let word = AtomicU32::new(0);
        futex_wait(&word, 0, Duration::from_millis(20));
        assert_eq!(word.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    futex_wait(&word, 0, Duration::from_millis(500));
                }
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        futex_wake(&word, i32::MAX);
        waiter.join().unwrap();
    }
}
