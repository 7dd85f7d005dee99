//! Demo service served by `shmrpc-svc serve`.

use shmrpc_core::{CodecKind, HandlerError, MethodSignature, MethodTable};
use std::thread;
use std::time::Duration;

pub const ECHO: MethodSignature = MethodSignature::raw("echo");
pub const REVERSE: MethodSignature = MethodSignature::raw("reverse");
pub const FAIL: MethodSignature = MethodSignature::raw("fail");
pub const ADD: MethodSignature = MethodSignature::new("add", CodecKind::Json, CodecKind::Json);
pub const SLEEP_MS: MethodSignature =
    MethodSignature::new("sleep_ms", CodecKind::Json, CodecKind::Json);
/// PID of the worker that answered.
pub const PID: MethodSignature = MethodSignature::new("pid", CodecKind::Json, CodecKind::Json);

/// Longest sleep a caller may ask for.
const MAX_SLEEP_MS: u64 = 60_000;

pub fn build_table() -> shmrpc_core::Result<MethodTable> {
    MethodTable::builder()
        .raw(ECHO.name, |bytes| Ok(bytes.to_vec()))
        .raw(REVERSE.name, |bytes| Ok(bytes.iter().rev().copied().collect()))
        .raw(FAIL.name, |bytes| {
            Err(HandlerError::invalid_argument(
                String::from_utf8_lossy(bytes).into_owned(),
            ))
        })
        .method(&ADD, |(a, b): (i64, i64)| {
            a.checked_add(b)
                .ok_or_else(|| HandlerError::invalid_argument("integer overflow"))
        })
        .method(&SLEEP_MS, |ms: u64| {
            if ms > MAX_SLEEP_MS {
                return Err(HandlerError::invalid_argument(format!(
                    "refusing to sleep longer than {} ms",
                    MAX_SLEEP_MS
                )));
            }
            thread::sleep(Duration::from_millis(ms));
            Ok(ms)
        })
        .method(&PID, |_: ()| Ok(std::process::id()))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmrpc_core::RemoteErrorKind;

    #[test]
    fn test_demo_methods() {
        let table = build_table().unwrap();
        assert_eq!(table.dispatch("echo", b"abc").unwrap(), b"abc");
        assert_eq!(table.dispatch("reverse", b"abc").unwrap(), b"cba");
        assert_eq!(table.dispatch("add", b"[2,40]").unwrap(), b"42");
        assert_eq!(table.dispatch("sleep_ms", b"1").unwrap(), b"1");
        assert_eq!(
            table.dispatch("pid", b"null").unwrap(),
            std::process::id().to_string().into_bytes()
        );
        assert!(table.contains("heartbeat"));
    }

    #[test]
    fn test_demo_errors() {
        let table = build_table().unwrap();
        let err = table.dispatch("fail", b"bad input").unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::InvalidArgument);
        assert_eq!(err.message(), "bad input");

        let err = table
            .dispatch("add", format!("[{}, 1]", i64::MAX).as_bytes())
            .unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::InvalidArgument);

        let err = table.dispatch("sleep_ms", b"600000").unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::InvalidArgument);
    }
}
