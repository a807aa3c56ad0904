//! Inactivity watchdog with coalescing update pings (spec §4.B, second half).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Current {
	tx: mpsc::Sender<()>,
	handle: JoinHandle<()>,
}

struct State {
	consumed: AtomicBool,
	on_timeout: Mutex<Option<Box<dyn FnOnce() + Send>>>,
	current: Mutex<Option<Current>>,
}

impl State {
	fn finish(self: &Arc<Self>) {
		if self.consumed.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(f) = self.on_timeout.lock().unwrap().take() {
			f();
		}
	}
}

/// Fires `on_timeout` at most once if `update()` is not called for `timeout`.
pub struct ActivityTimer {
	state: Arc<State>,
}

impl ActivityTimer {
	pub fn new(timeout: Duration, on_timeout: impl FnOnce() + Send + 'static) -> Self {
		let state = Arc::new(State {
			consumed: AtomicBool::new(false),
			on_timeout: Mutex::new(Some(Box::new(on_timeout))),
			current: Mutex::new(None),
		});
		let current = spawn_loop(state.clone(), timeout);
		*state.current.lock().unwrap() = Some(current);
		Self { state }
	}

	/// Non-blocking, coalescing: dropped if a pending update is already queued.
	pub fn update(&self) {
		if let Some(cur) = self.state.current.lock().unwrap().as_ref() {
			let _ = cur.tx.try_send(());
		}
	}

	/// Replaces the inner task's interval. `d == 0` triggers immediate
	/// timeout. Once the timer has fired, this is a no-op (double-checked
	/// around the zero-duration fast path to avoid a re-arm racing a
	/// concurrent `finish`).
	pub fn set_timeout(&self, d: Duration) {
		if self.state.consumed.load(Ordering::SeqCst) {
			return;
		}
		if d.is_zero() {
			self.state.finish();
			return;
		}
		if self.state.consumed.load(Ordering::SeqCst) {
			return;
		}
		let mut guard = self.state.current.lock().unwrap();
		if self.state.consumed.load(Ordering::SeqCst) {
			return;
		}
		if let Some(old) = guard.take() {
			old.handle.abort();
		}
		let new_cur = spawn_loop(self.state.clone(), d);
		let _ = new_cur.tx.try_send(());
		*guard = Some(new_cur);
	}

	pub fn is_consumed(&self) -> bool {
		self.state.consumed.load(Ordering::SeqCst)
	}
}

fn spawn_loop(state: Arc<State>, timeout: Duration) -> Current {
	let (tx, mut rx) = mpsc::channel::<()>(1);
	let handle = tokio::spawn(async move {
		loop {
			tokio::time::sleep(timeout).await;
			if rx.try_recv().is_ok() {
				continue;
			}
			state.finish();
			break;
		}
	});
	Current { tx, handle }
}

impl Drop for ActivityTimer {
	fn drop(&mut self) {
		if let Some(cur) = self.state.current.lock().unwrap().take() {
			cur.handle.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	#[tokio::test(start_paused = true)]
	async fn fires_once_after_inactivity() {
		let fired = Arc::new(AtomicUsize::new(0));
		let f = fired.clone();
		let timer = ActivityTimer::new(Duration::from_secs(10), move || {
			f.fetch_add(1, Ordering::SeqCst);
		});

		tokio::time::advance(Duration::from_secs(5)).await;
		timer.update();
		tokio::time::advance(Duration::from_secs(9)).await;
		tokio::task::yield_now().await;
		assert_eq!(fired.load(Ordering::SeqCst), 0);

		tokio::time::advance(Duration::from_secs(2)).await;
		tokio::task::yield_now().await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);
		assert!(timer.is_consumed());

		// A further update after firing must not re-arm or re-fire.
		timer.update();
		timer.set_timeout(Duration::from_secs(1));
		tokio::time::advance(Duration::from_secs(5)).await;
		tokio::task::yield_now().await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn zero_timeout_fires_immediately() {
		let fired = Arc::new(AtomicUsize::new(0));
		let f = fired.clone();
		let timer = ActivityTimer::new(Duration::from_secs(60), move || {
			f.fetch_add(1, Ordering::SeqCst);
		});
		timer.set_timeout(Duration::ZERO);
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}
}
