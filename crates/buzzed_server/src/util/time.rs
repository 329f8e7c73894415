#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; record timestamps use this.
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

/// Seconds since the Unix epoch; token expiry uses this.
pub fn unix_secs_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}
