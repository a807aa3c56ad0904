//! Session glue applying the activity timer and bounded task runner to a
//! request/response copy pair (spec §4.I). Every long-lived proxy session —
//! Shadowsocks, Trojan, Hysteria2 stream, HTTP CONNECT — is structured this
//! way.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTimer;
use crate::taskrunner::{BoxFuture, Closable, RunError, close_of, on_success, run};

/// Zero-copy splice eligibility hint (spec §4.I). Starts at [`Self::RAW`]
/// for a direct fd-to-fd relay and is degraded by one with each
/// [`wrapped`](Self::wrapped) call a caller makes for a userspace-visible
/// layer a `splice(2)` syscall couldn't see through (byte counting, rate
/// limiting, TLS/AEAD framing, ...). Floored at 1: no caller in this engine
/// currently acts on the hint to choose a splice path, but the level is
/// computed and recorded so a future splice-capable copier has it ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CanSpliceCopy(u8);

impl CanSpliceCopy {
	pub const RAW: Self = Self(3);

	pub fn wrapped(self) -> Self {
		Self(self.0.saturating_sub(1).max(1))
	}

	pub fn level(self) -> u8 {
		self.0
	}

	pub fn is_splice_eligible(self) -> bool {
		self.0 == Self::RAW.0
	}
}

/// The three named timeouts a session's activity timer is reset between, as
/// each copy direction finishes.
#[derive(Clone, Copy, Debug)]
pub struct SessionTimeouts {
	pub connection_idle: Duration,
	pub downlink_only: Duration,
	pub uplink_only: Duration,
}

impl SessionTimeouts {
	pub fn uniform(d: Duration) -> Self {
		Self {
			connection_idle: d,
			downlink_only: d,
			uplink_only: d,
		}
	}
}

/// Runs `request_copy` and `response_copy` under an inactivity timer that
/// cancels `cancel` on timeout, closing `response_writer` once
/// `response_copy` finishes successfully. Returns the first error from
/// either half or from cancellation.
pub async fn run_session<W: Closable + 'static>(
	timeouts: SessionTimeouts,
	cancel: CancellationToken,
	request_copy: BoxFuture,
	response_copy: BoxFuture,
	response_writer: W,
) -> Result<(), RunError> {
	let on_timeout_cancel = cancel.clone();
	let timer = std::sync::Arc::new(ActivityTimer::new(timeouts.connection_idle, move || {
		on_timeout_cancel.cancel();
	}));

	let t1 = timer.clone();
	let downlink_only = timeouts.downlink_only;
	let request_task: BoxFuture = Box::pin(async move {
		let res = request_copy.await;
		t1.set_timeout(downlink_only);
		res
	});

	let t2 = timer.clone();
	let uplink_only = timeouts.uplink_only;
	let response_task: BoxFuture = Box::pin(async move {
		let res = response_copy.await;
		t2.set_timeout(uplink_only);
		res
	});
	let response_then_close = on_success(response_task, close_of(response_writer));

	run(vec![request_task, response_then_close], cancel).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn splice_hint_degrades_monotonically_and_floors_at_one() {
		let raw = CanSpliceCopy::RAW;
		assert!(raw.is_splice_eligible());
		let once = raw.wrapped();
		let twice = once.wrapped();
		let thrice = twice.wrapped();
		assert!(raw > once && once > twice);
		assert_eq!(twice, thrice);
		assert_eq!(thrice.level(), 1);
		assert!(!once.is_splice_eligible());
	}
}
