//! Per-user uplink/downlink rate limiter (spec §3 "Server spec / memory
//! user"). A classic token bucket; burst size is rate/4, an open question
//! in §9 preserved verbatim for behavioral parity even though the original
//! gives no rationale for the constant.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// `None` means unlimited (the common "no rate limit configured" case).
pub struct RateLimiter {
	inner: Option<Mutex<Bucket>>,
}

struct Bucket {
	rate_bytes_per_sec: f64,
	burst: f64,
	tokens: f64,
	last_refill: Instant,
}

impl RateLimiter {
	pub fn unlimited() -> Self {
		Self { inner: None }
	}

	pub fn new(rate_bytes_per_sec: u64) -> Self {
		if rate_bytes_per_sec == 0 {
			return Self::unlimited();
		}
		let rate = rate_bytes_per_sec as f64;
		let burst = rate / 4.0;
		Self {
			inner: Some(Mutex::new(Bucket {
				rate_bytes_per_sec: rate,
				burst,
				tokens: burst,
				last_refill: Instant::now(),
			})),
		}
	}

	/// Consumes `n` bytes worth of tokens, returning the duration the caller
	/// should wait before the transfer may proceed (zero if no wait needed).
	pub fn acquire(&self, n: u64) -> Duration {
		let Some(inner) = &self.inner else {
			return Duration::ZERO;
		};
		let mut bucket = inner.lock().unwrap();
		bucket.refill();
		let need = n as f64;
		if bucket.tokens >= need {
			bucket.tokens -= need;
			return Duration::ZERO;
		}
		let deficit = need - bucket.tokens;
		bucket.tokens = 0.0;
		Duration::from_secs_f64(deficit / bucket.rate_bytes_per_sec)
	}
}

impl Bucket {
	fn refill(&mut self) {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.last_refill = now;
		self.tokens = (self.tokens + elapsed * self.rate_bytes_per_sec).min(self.burst);
	}
}

/// Uplink/downlink pair attached to a `MemoryUser` (spec §3).
pub struct RateLimiterPair {
	pub uplink: RateLimiter,
	pub downlink: RateLimiter,
}

impl RateLimiterPair {
	pub fn new(uplink_bytes_per_sec: u64, downlink_bytes_per_sec: u64) -> Self {
		Self {
			uplink: RateLimiter::new(uplink_bytes_per_sec),
			downlink: RateLimiter::new(downlink_bytes_per_sec),
		}
	}

	pub fn unlimited() -> Self {
		Self {
			uplink: RateLimiter::unlimited(),
			downlink: RateLimiter::unlimited(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unlimited_never_waits() {
		let limiter = RateLimiter::unlimited();
		assert_eq!(limiter.acquire(1_000_000), Duration::ZERO);
	}

	#[test]
	fn burst_is_one_quarter_of_rate() {
		let limiter = RateLimiter::new(1000);
		// Burst allows up to rate/4 = 250 bytes with no wait.
		assert_eq!(limiter.acquire(250), Duration::ZERO);
		// The 251st byte this instant must wait.
		assert!(limiter.acquire(1) > Duration::ZERO);
	}
}
