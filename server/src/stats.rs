//! Per-stream stats (spec §3 "Hysteria2 stream stats (server)"). Counters
//! and last-active time are atomics, no lock, per spec §5; the rarely
//! updated address fields (set once or twice per stream lifetime, never on
//! the data-plane hot path) use a plain mutex instead.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use protocol::address::Address;
use proxy_core::session::CanSpliceCopy;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
	Initial = 0,
	Hooking = 1,
	Connecting = 2,
	Established = 3,
	Closed = 4,
}

impl State {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => State::Initial,
			1 => State::Hooking,
			2 => State::Connecting,
			3 => State::Established,
			_ => State::Closed,
		}
	}
}

pub struct StreamStats {
	started_at: Instant,
	state: AtomicU8,
	pub auth_id: String,
	pub conn_id: u64,
	req_addr: Mutex<Option<Address>>,
	hooked_addr: Mutex<Option<Address>>,
	tx_bytes: AtomicU64,
	rx_bytes: AtomicU64,
	last_active_nanos: AtomicU64,
	splice_eligibility: AtomicU8,
}

impl StreamStats {
	pub fn new(auth_id: String, conn_id: u64) -> Self {
		Self {
			started_at: Instant::now(),
			state: AtomicU8::new(State::Initial as u8),
			auth_id,
			conn_id,
			req_addr: Mutex::new(None),
			hooked_addr: Mutex::new(None),
			tx_bytes: AtomicU64::new(0),
			rx_bytes: AtomicU64::new(0),
			last_active_nanos: AtomicU64::new(0),
			splice_eligibility: AtomicU8::new(CanSpliceCopy::RAW.level()),
		}
	}

	pub fn state(&self) -> State {
		State::from_u8(self.state.load(Ordering::Acquire))
	}

	pub fn set_state(&self, state: State) {
		self.state.store(state as u8, Ordering::Release);
	}

	pub fn set_req_addr(&self, addr: Address) {
		*self.req_addr.lock().unwrap() = Some(addr);
	}

	pub fn req_addr(&self) -> Option<Address> {
		self.req_addr.lock().unwrap().clone()
	}

	pub fn set_hooked_addr(&self, addr: Address) {
		*self.hooked_addr.lock().unwrap() = Some(addr);
	}

	pub fn hooked_addr(&self) -> Option<Address> {
		self.hooked_addr.lock().unwrap().clone()
	}

	pub fn add_tx(&self, n: u64) {
		self.tx_bytes.fetch_add(n, Ordering::Relaxed);
		self.touch();
	}

	pub fn add_rx(&self, n: u64) {
		self.rx_bytes.fetch_add(n, Ordering::Relaxed);
		self.touch();
	}

	pub fn tx_bytes(&self) -> u64 {
		self.tx_bytes.load(Ordering::Relaxed)
	}

	pub fn rx_bytes(&self) -> u64 {
		self.rx_bytes.load(Ordering::Relaxed)
	}

	fn touch(&self) {
		self
			.last_active_nanos
			.store(self.started_at.elapsed().as_nanos() as u64, Ordering::Relaxed);
	}

	pub fn last_active(&self) -> Instant {
		self.started_at + std::time::Duration::from_nanos(self.last_active_nanos.load(Ordering::Relaxed))
	}

	/// Records the splice eligibility the copy loop computed for this stream
	/// (spec §4.I `CanSpliceCopy`). Informational only: no copier in this
	/// engine currently branches on it.
	pub fn set_splice_eligibility(&self, hint: CanSpliceCopy) {
		self.splice_eligibility.store(hint.level(), Ordering::Relaxed);
	}

	pub fn splice_eligibility(&self) -> u8 {
		self.splice_eligibility.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn transitions_and_counters() {
		let stats = StreamStats::new("user".to_string(), 42);
		assert_eq!(stats.state(), State::Initial);
		stats.set_state(State::Connecting);
		stats.add_tx(10);
		stats.add_rx(20);
		assert_eq!(stats.state(), State::Connecting);
		assert_eq!(stats.tx_bytes(), 10);
		assert_eq!(stats.rx_bytes(), 20);
	}
}
