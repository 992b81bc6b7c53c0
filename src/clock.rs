//! Wall-clock access and local-time formatting.
//!
//! History cursoring compares `SystemTime` values directly; only the
//! rendered `[HH:MM:SS]` prefix needs a calendar conversion, and that one
//! goes through `localtime_r` so the configured timezone is honored.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time.
pub fn now() -> SystemTime {
    SystemTime::now()
}

/// Local-time hour/minute/second components of `at`.
///
/// Returns `None` when the timestamp predates the epoch, does not fit the
/// platform `time_t`, or the calendar conversion itself fails.
pub fn local_hms(at: SystemTime) -> Option<(u32, u32, u32)> {
    let secs = at.duration_since(UNIX_EPOCH).ok()?.as_secs();
    let secs = libc::time_t::try_from(secs).ok()?;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    // localtime_r fills the caller-provided tm and returns NULL on failure.
    let res = unsafe { libc::localtime_r(&secs, &mut tm) };
    if res.is_null() {
        return None;
    }
    Some((tm.tm_hour as u32, tm.tm_min as u32, tm.tm_sec as u32))
}
