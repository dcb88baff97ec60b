// Timekeeping helpers for the logging infrastructure

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, used to stamp log lines.
pub fn get_current_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is before the unix epoch")
        .as_millis()
}
