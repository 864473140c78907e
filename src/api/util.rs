//! Identifier and timestamp helpers.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Durations are never reported below this, so a finalized event is distinguishable from an
/// unfinished one even when both clock reads land on the same tick.
pub const MIN_DURATION_SECS: f64 = 1e-6;

pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time, in seconds since the unix epoch.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Seconds elapsed between `start` (as returned by [`now`]) and now, floored at
/// [`MIN_DURATION_SECS`].
pub fn elapsed_since(start: f64) -> f64 {
    (now() - start).max(MIN_DURATION_SECS)
}
