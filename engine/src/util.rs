//! Small helpers shared across the engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// The current time as `(seconds, nanoseconds)` since the Unix epoch, the
/// width the log-record header's `req_sec`/`req_nsec` fields use.
pub fn now_unix() -> (u64, u32) {
    let d = SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch");
    (d.as_secs(), d.subsec_nanos())
}
