use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::fs::entry::DEFAULT_TIMESTAMP;

/// Days from the Unix epoch to a proleptic Gregorian date
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let m = if month <= 2 { month + 9 } else { month - 3 };
    let c = y / 100;
    let ya = y - 100 * c;
    (146097 * c) / 4 + (1461 * ya) / 4 + (153 * m + 2) / 5 + day - 719469
}

/// Convert a broken-down calendar time (as stored by zip and rar) to SystemTime.
/// Returns None for dates before the epoch.
pub fn civil_to_system_time(
    year: i64,
    month: i64,
    day: i64,
    hour: i64,
    minute: i64,
    second: i64,
) -> Option<SystemTime> {
    let secs = days_from_civil(year, month, day) * 86400 + hour * 3600 + minute * 60 + second;
    if secs >= 0 {
        SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(secs as u64))
    } else {
        None
    }
}

/// Convert a packed DOS date/time (date in the high 16 bits) to SystemTime
pub fn dos_time_to_system_time(packed: u32) -> Option<SystemTime> {
    if packed == 0 {
        return None;
    }
    let time_part = packed & 0xFFFF;
    let date_part = (packed >> 16) & 0xFFFF;
    let second = ((time_part & 0x1F) * 2) as i64;
    let minute = ((time_part >> 5) & 0x3F) as i64;
    let hour = ((time_part >> 11) & 0x1F) as i64;
    let day = (date_part & 0x1F) as i64;
    let month = ((date_part >> 5) & 0x0F) as i64;
    let year = (((date_part >> 9) & 0x7F) + 1980) as i64;
    civil_to_system_time(year, month, day, hour, minute, second)
}

/// Milliseconds since the epoch, or `DEFAULT_TIMESTAMP` when unknown
pub fn system_time_to_millis(time: Option<SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(DEFAULT_TIMESTAMP)
}

pub fn millis_to_system_time(millis: i64) -> Option<SystemTime> {
    if millis < 0 {
        return None;
    }
    SystemTime::UNIX_EPOCH.checked_add(Duration::from_millis(millis as u64))
}

/// Lowercase hex encoding
pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

/// Acquire a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_recovering<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("{} mutex was poisoned, recovering", what);
        poisoned.into_inner()
    })
}
