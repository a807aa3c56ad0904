//! In-memory per-user account table (spec §3 "Server spec / memory user"):
//! one [`RateLimiterPair`] per authenticated `auth_id`, created lazily the
//! first time that user opens a stream and shared by every stream after.
//!
//! The config surface (spec §6) has no per-user rate knobs yet, so every
//! account is built from the same configured uplink/downlink rate; the
//! table exists so a future per-user config can plug in without touching
//! the stream-handling call sites.

use std::collections::HashMap;
use std::sync::Arc;

use protocol::limiter::RateLimiterPair;
use tokio::sync::Mutex;

pub struct AccountTable {
	up_bytes_per_sec: u64,
	down_bytes_per_sec: u64,
	accounts: Mutex<HashMap<String, Arc<RateLimiterPair>>>,
}

impl AccountTable {
	pub fn new(up_bytes_per_sec: u64, down_bytes_per_sec: u64) -> Self {
		Self {
			up_bytes_per_sec,
			down_bytes_per_sec,
			accounts: Mutex::new(HashMap::new()),
		}
	}

	pub async fn limiter_for(&self, auth_id: &str) -> Arc<RateLimiterPair> {
		let mut accounts = self.accounts.lock().await;
		if let Some(limiter) = accounts.get(auth_id) {
			return limiter.clone();
		}
		let limiter = Arc::new(RateLimiterPair::new(self.up_bytes_per_sec, self.down_bytes_per_sec));
		accounts.insert(auth_id.to_string(), limiter.clone());
		limiter
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn same_user_reuses_the_same_limiter() {
		let table = AccountTable::new(1000, 1000);
		let a = table.limiter_for("alice").await;
		let b = table.limiter_for("alice").await;
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[tokio::test]
	async fn unconfigured_rate_is_unlimited() {
		let table = AccountTable::new(0, 0);
		let limiter = table.limiter_for("alice").await;
		assert_eq!(limiter.uplink.acquire(1_000_000_000), std::time::Duration::ZERO);
	}
}
