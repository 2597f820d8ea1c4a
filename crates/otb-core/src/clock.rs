//! Wall-clock and identity helpers

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as UTC nanoseconds since the epoch
pub fn wall_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Current wall-clock time as UTC milliseconds since the epoch
pub fn wall_ms() -> i64 {
    wall_ns() / 1_000_000
}

/// Short process identity, stable for the lifetime of the process.
///
/// The first eight hex characters of a UUID generated at first use; shows up
/// in log lines and the spool lock file so operators can tell instances apart.
pub fn process_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_is_stable_and_short() {
        let a = process_id();
        let b = process_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn wall_clock_advances() {
        let a = wall_ns();
        let b = wall_ns();
        assert!(b >= a);
    }
}
