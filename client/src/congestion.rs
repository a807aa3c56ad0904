//! Congestion control selection, client side (spec §4.H, §4.L): mirrors the
//! server's BBR/Brutal switch, but driven by the `Hysteria-CC-RX` value the
//! server hands back in the auth response rather than one computed locally.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use quinn_proto::RttEstimator;
use quinn_proto::congestion::{BbrConfig, Controller, ControllerFactory};

#[derive(Debug, Clone)]
struct BrutalController {
	window: u64,
}

impl BrutalController {
	fn window_for_rate(rate_bytes_per_sec: u64) -> u64 {
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

	fn on_congestion_event(&mut self, _now: Instant, _sent: Instant, _is_persistent_congestion: bool, _lost_bytes: u64) {}

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

/// One per dialed connection. Starts in BBR mode; [`set_actual_tx`] flips it
/// to Brutal once the auth response reveals the rate the server wants this
/// client to pace its uploads at.
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

	pub fn set_actual_tx(&self, actual_tx: u64) {
		self.rate.store(actual_tx, Ordering::Relaxed);
	}
}

impl Default for ConnectionCongestion {
	fn default() -> Self {
		Self::new()
	}
}

/// Parses the `Hysteria-CC-RX` response header: `"auto"` keeps BBR (`0`),
/// anything else is the Brutal pacing rate in bytes/sec.
pub fn parse_actual_tx(header: Option<&str>) -> u64 {
	match header {
		Some("auto") | None => 0,
		Some(value) => value.parse().unwrap_or(0),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn auto_keeps_bbr() {
		assert_eq!(parse_actual_tx(Some("auto")), 0);
		assert_eq!(parse_actual_tx(None), 0);
	}

	#[test]
	fn numeric_value_is_the_brutal_rate() {
		assert_eq!(parse_actual_tx(Some("1000000")), 1_000_000);
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
	}
}
