//! This module implements utility functions.

use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Returns the current timestamp since the Unix epoch.
pub fn get_timestamp() -> Duration {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("System clock panic!")
}

/// Returns the current timestamp as whole seconds, as stored in inodes.
pub fn unix_seconds() -> i64 {
	get_timestamp().as_secs() as i64
}
