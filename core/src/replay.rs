//! Rotating-pool anti-replay filter (spec §4.A).
//!
//! Two pools of opaque keys are kept; every `interval` the older pool is
//! dropped and the newer one takes its place. A key is "fresh" iff it is in
//! neither pool, in which case it is remembered for the current window.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Inner {
	pool_a: HashSet<Vec<u8>>,
	pool_b: HashSet<Vec<u8>>,
	last_clean: Instant,
}

/// Rotating two-pool replay filter, process-wide lifetime, single mutex.
pub struct ReplayFilter {
	interval: Duration,
	inner: Mutex<Inner>,
}

impl ReplayFilter {
	pub fn new(interval: Duration) -> Self {
		Self {
			interval,
			inner: Mutex::new(Inner {
				pool_a: HashSet::new(),
				pool_b: HashSet::new(),
				last_clean: Instant::now(),
			}),
		}
	}

	/// Returns `true` iff `key` had not been seen within the current rotating
	/// window, and remembers it for next time. Returns `false` on replay.
	pub fn check(&self, key: &[u8]) -> bool {
		let mut inner = self.inner.lock().unwrap();
		if inner.last_clean.elapsed() >= self.interval {
			inner.pool_b = std::mem::take(&mut inner.pool_a);
			inner.last_clean = Instant::now();
		}
		if inner.pool_a.contains(key) || inner.pool_b.contains(key) {
			return false;
		}
		inner.pool_a.insert(key.to_vec());
		true
	}
}

impl Default for ReplayFilter {
	fn default() -> Self {
		// Matches the server-side default UDP/Shadowsocks IV replay window.
		Self::new(Duration::from_secs(120))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fresh_key_accepted_once() {
		let filter = ReplayFilter::new(Duration::from_secs(120));
		let key = [1u8, 2, 3, 4];
		assert!(filter.check(&key));
		assert!(!filter.check(&key));
		let mut other = key;
		other[0] += 1;
		assert!(filter.check(&other));
	}

	#[test]
	fn rotation_forgets_keys_after_two_intervals() {
		let filter = ReplayFilter::new(Duration::from_millis(10));
		let key = [9u8; 16];
		assert!(filter.check(&key));
		std::thread::sleep(Duration::from_millis(15));
		// still remembered: rotated into pool_b
		assert!(!filter.check(&key));
		std::thread::sleep(Duration::from_millis(15));
		// now rotated out of both pools
		assert!(filter.check(&key));
	}
}
