//! Single-shot rescheduling periodic task (spec §4.B, first half).

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

type BoxFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

/// Runs `execute` every `interval` while started, with exactly one pending
/// fire at any time. Panics inside `execute` are recovered and logged, never
/// propagated to the caller.
pub struct PeriodicTask {
	interval: Duration,
	execute: Arc<dyn Fn() -> BoxFuture + Send + Sync>,
	running: Arc<AtomicBool>,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
	pub fn new<F, Fut>(interval: Duration, execute: F) -> Self
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
	{
		Self {
			interval,
			execute: Arc::new(move || Box::pin(execute())),
			running: Arc::new(AtomicBool::new(false)),
			handle: Mutex::new(None),
		}
	}

	/// Idempotent: a no-op if already running.
	pub fn start(&self) {
		if self.running.swap(true, Ordering::SeqCst) {
			return;
		}
		let running = self.running.clone();
		let execute = self.execute.clone();
		let interval = self.interval;
		let handle = tokio::spawn(async move {
			loop {
				if !running.load(Ordering::SeqCst) {
					break;
				}
				// Run the fallible action in its own task so a panic is
				// caught by the JoinHandle instead of unwinding this loop.
				match tokio::spawn((execute)()).await {
					Ok(Ok(())) => {},
					Ok(Err(e)) => warn!(error = %e, "periodic task execution failed"),
					Err(join_err) => warn!(error = %join_err, "periodic task execution panicked"),
				}
				if !running.load(Ordering::SeqCst) {
					break;
				}
				tokio::time::sleep(interval).await;
			}
		});
		*self.handle.lock().unwrap() = Some(handle);
	}

	/// Idempotent: cancels any pending fire.
	pub fn close(&self) {
		self.running.store(false, Ordering::SeqCst);
		if let Some(handle) = self.handle.lock().unwrap().take() {
			handle.abort();
		}
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}
}

impl Drop for PeriodicTask {
	fn drop(&mut self) {
		self.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicI64;

	#[tokio::test(start_paused = true)]
	async fn fires_on_interval_and_stops_on_close() {
		let counter = Arc::new(AtomicI64::new(0));
		let c = counter.clone();
		let task = PeriodicTask::new(Duration::from_secs(2), move || {
			let c = c.clone();
			async move {
				c.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		});

		task.start();
		tokio::task::yield_now().await;
		tokio::time::advance(Duration::from_secs(5)).await;
		tokio::task::yield_now().await;
		assert_eq!(counter.load(Ordering::SeqCst), 3);

		task.close();
		tokio::time::advance(Duration::from_secs(4)).await;
		tokio::task::yield_now().await;
		assert_eq!(counter.load(Ordering::SeqCst), 3);

		task.start();
		tokio::task::yield_now().await;
		tokio::time::advance(Duration::from_secs(3)).await;
		tokio::task::yield_now().await;
		assert_eq!(counter.load(Ordering::SeqCst), 5);
	}

	#[tokio::test]
	async fn start_is_idempotent() {
		let task = PeriodicTask::new(Duration::from_secs(60), || async { Ok(()) });
		task.start();
		assert!(task.is_running());
		task.start();
		assert!(task.is_running());
	}
}
