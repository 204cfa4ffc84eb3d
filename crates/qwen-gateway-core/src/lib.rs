//! Foundational low-level utilities shared across the gateway crates.
//!
//! Provides unix time helpers and request-id generation used by session
//! expiry calculations, upstream envelope timestamps, and request tracing.

pub mod time_utils;

pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix};

use std::sync::atomic::{AtomicU64, Ordering};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns a process-unique id for correlating gateway log lines with
/// upstream calls.
pub fn new_gateway_request_id() -> String {
    let millis = current_unix_timestamp_ms();
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("qgw-{millis}-{count}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_utils_round_trip_bounds() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn is_expired_unix_respects_none_and_bounds() {
        let now = current_unix_timestamp();
        assert!(!is_expired_unix(None, now));
        assert!(is_expired_unix(Some(now), now));
        assert!(is_expired_unix(Some(now.saturating_sub(1)), now));
        assert!(!is_expired_unix(Some(now.saturating_add(1)), now));
    }

    #[test]
    fn gateway_request_ids_are_unique() {
        let a = new_gateway_request_id();
        let b = new_gateway_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("qgw-"));
    }
}
