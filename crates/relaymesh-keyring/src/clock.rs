//! Wall-clock seam.
//!
//! Every timestamp in the keyring (key validity windows, `ts_added_ms` store
//! tags) is Unix milliseconds. Production code uses [`SystemClock`]; tests pin
//! time with a fixed clock so validity-window assertions are exact.

use chrono::Utc;

/// Source of the current Unix time in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
