//! Congestion control selection (spec §4.G, §4.L): BBR for bandwidth
//! probing, Brutal for a fixed-rate pacer, chosen per connection from the
//! negotiated `actual_tx`.
//!
//! Both sides implement `quinn_proto::congestion::Controller`, the seam
//! quinn exposes for swapping the congestion algorithm per connection —
//! this is the "reimplement as pacing filters" alternative spec.md §4.G
//! explicitly allows instead of hand-rolling loss recovery.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use quinn_proto::RttEstimator;
use quinn_proto::congestion::{BbrConfig, Controller, ControllerFactory};

/// Paces at a fixed configured rate rather than probing for bandwidth,
/// matching the "Brutal" algorithm named in spec §4.G/§4.L.
#[derive(Debug, Clone)]
pub struct BrutalController {
	rate_bytes_per_sec: u64,
	window: u64,
}

impl BrutalController {
	fn window_for_rate(rate_bytes_per_sec: u64) -> u64 {
		// One RTT's worth of data at the target rate, floored at a sane
		// minimum so the connection isn't immediately stalled by rounding.
		(rate_bytes_per_sec / 5).max(1500 * 4)
	}
}

impl Controller for BrutalController {
	fn on_sent(&mut self, _now: Instant, _bytes: u64, _last_packet_number: u64) {}

	fn on_ack(&mut self, _now: Instant, _sent: Instant, _bytes: u64, _app_limited: bool, _rtt: &RttEstimator) {}

	fn on_end_acks(
		&mut self,
		_now: Instant,
		_in_flight: u64,
		_app_limited: Option<u64>,
		_largest_packet_num_acked: Option<u64>,
	) {
	}

	fn on_congestion_event(&mut self, _now: Instant, _sent: Instant, _is_persistent_congestion: bool, _lost_bytes: u64) {
		// Brutal paces at a fixed rate regardless of loss signals; this is
		// the whole point of the algorithm (it assumes loss is noise, not
		// a congestion signal, on a pre-provisioned link).
	}

	fn on_mtu_update(&mut self, _new_mtu: u16) {}

	fn window(&self) -> u64 {
		self.window
	}

	fn clone_box(&self) -> Box<dyn Controller> {
		Box::new(self.clone())
	}

	fn initial_window(&self) -> u64 {
		self.window
	}

	fn into_any(self: Box<Self>) -> Box<dyn Any> {
		self
	}
}

pub struct BrutalConfig {
	pub rate_bytes_per_sec: u64,
}

impl ControllerFactory for BrutalConfig {
	fn build(self: Arc<Self>, _now: Instant, _current_mtu: u16) -> Box<dyn Controller> {
		Box::new(BrutalController {
			rate_bytes_per_sec: self.rate_bytes_per_sec,
			window: BrutalController::window_for_rate(self.rate_bytes_per_sec),
		})
	}
}

/// Delegates to BBR while `rate` is zero, and switches to Brutal's
/// fixed-rate window the moment `rate` is set — live, without rebuilding the
/// connection. quinn fixes a connection's `TransportConfig` (and therefore
/// its `congestion_controller_factory`) at accept time, before the
/// application-level auth exchange that reveals `actual_tx` ever runs, so
/// the factory installed per connection must be able to change algorithm
/// after the fact. This is that switch.
struct AdaptiveController {
	rate: Arc<AtomicU64>,
	bbr: Box<dyn Controller>,
}

impl Controller for AdaptiveController {
	fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {
		self.bbr.on_sent(now, bytes, last_packet_number);
	}

	fn on_ack(&mut self, now: Instant, sent: Instant, bytes: u64, app_limited: bool, rtt: &RttEstimator) {
		self.bbr.on_ack(now, sent, bytes, app_limited, rtt);
	}

	fn on_end_acks(&mut self, now: Instant, in_flight: u64, app_limited: Option<u64>, largest_packet_num_acked: Option<u64>) {
		self.bbr.on_end_acks(now, in_flight, app_limited, largest_packet_num_acked);
	}

	fn on_congestion_event(&mut self, now: Instant, sent: Instant, is_persistent_congestion: bool, lost_bytes: u64) {
		// Brutal ignores loss entirely; only forward the signal to the BBR
		// state machine while it's the one actually driving the window.
		if self.rate.load(Ordering::Relaxed) == 0 {
			self.bbr.on_congestion_event(now, sent, is_persistent_congestion, lost_bytes);
		}
	}

	fn on_mtu_update(&mut self, new_mtu: u16) {
		self.bbr.on_mtu_update(new_mtu);
	}

	fn window(&self) -> u64 {
		match self.rate.load(Ordering::Relaxed) {
			0 => self.bbr.window(),
			rate => BrutalController::window_for_rate(rate),
		}
	}

	fn clone_box(&self) -> Box<dyn Controller> {
		Box::new(AdaptiveController {
			rate: self.rate.clone(),
			bbr: self.bbr.clone_box(),
		})
	}

	fn initial_window(&self) -> u64 {
		self.bbr.initial_window()
	}

	fn into_any(self: Box<Self>) -> Box<dyn Any> {
		self
	}
}

struct AdaptiveFactory {
	rate: Arc<AtomicU64>,
}

impl ControllerFactory for AdaptiveFactory {
	fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
		Box::new(AdaptiveController {
			rate: self.rate.clone(),
			bbr: Arc::new(BbrConfig::default()).build(now, current_mtu),
		})
	}
}

/// One per connection. Installed into that connection's `TransportConfig`
/// at accept time (always starting in BBR mode); once the auth exchange on
/// the hijacked stream negotiates `actual_tx`, `set_actual_tx` flips it over
/// to Brutal without needing to touch the already-established connection.
pub struct ConnectionCongestion {
	rate: Arc<AtomicU64>,
}

impl ConnectionCongestion {
	pub fn new() -> Self {
		Self {
			rate: Arc::new(AtomicU64::new(0)),
		}
	}

	pub fn factory(&self) -> Arc<dyn ControllerFactory + Send + Sync> {
		Arc::new(AdaptiveFactory { rate: self.rate.clone() })
	}

	/// `0` keeps (or reverts to) BBR; anything else switches to Brutal paced
	/// at that rate, per spec §4.G's bandwidth-negotiation rule.
	pub fn set_actual_tx(&self, actual_tx: u64) {
		self.rate.store(actual_tx, Ordering::Relaxed);
	}
}

impl Default for ConnectionCongestion {
	fn default() -> Self {
		Self::new()
	}
}

/// Negotiates the actual transmit rate per spec §4.G: ignoring the client's
/// advertised bandwidth forces BBR (actual_tx = 0); otherwise it's the
/// smaller of the server's configured cap and the client's advertised rate.
pub fn negotiate_actual_tx(ignore_client_bandwidth: bool, server_max_tx: u64, client_tx: u64) -> u64 {
	if ignore_client_bandwidth {
		0
	} else {
		server_max_tx.min(client_tx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ignoring_client_bandwidth_forces_bbr_selection() {
		assert_eq!(negotiate_actual_tx(true, 1_000_000, 500_000), 0);
	}

	#[test]
	fn otherwise_takes_the_minimum() {
		assert_eq!(negotiate_actual_tx(false, 1_000_000, 500_000), 500_000);
		assert_eq!(negotiate_actual_tx(false, 200_000, 500_000), 200_000);
	}

	#[test]
	fn adaptive_controller_switches_window_once_rate_is_set() {
		let cc = ConnectionCongestion::new();
		let factory = cc.factory();
		let mut controller = factory.build(Instant::now(), 1200);
		let bbr_window = controller.window();

		cc.set_actual_tx(1_000_000);
		assert_eq!(controller.window(), BrutalController::window_for_rate(1_000_000));
		assert_ne!(controller.window(), bbr_window);

		cc.set_actual_tx(0);
		assert_eq!(controller.window(), bbr_window);
	}
}
