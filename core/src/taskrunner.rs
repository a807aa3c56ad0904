//! Bounded parallel task runner (spec §4.C).
//!
//! `run` executes all tasks concurrently and returns the first error, the
//! cancellation error if the caller's token fires, or `Ok` once every task
//! has succeeded. `on_success`/`close_of` are the combinators every proxy
//! session uses to pair a request-copy task with a response-copy-then-close
//! task (spec §4.I).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

pub type BoxFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
	#[error("task failed: {0}")]
	Task(#[from] anyhow::Error),
	#[error("cancelled")]
	Cancelled,
}

/// Runs all `tasks` concurrently. Returns the first error observed (from any
/// task, or from `cancel` firing). Tasks that complete after an early return
/// are orphaned; their results are dropped.
pub async fn run(tasks: Vec<BoxFuture>, cancel: CancellationToken) -> Result<(), RunError> {
	let total = tasks.len();
	let sem = Arc::new(Semaphore::new(0));
	let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1);
	// Keep one sender alive for the lifetime of the coordinator so `recv`
	// only ever resolves on a real error, never spuriously on channel close.
	let _err_tx_guard = err_tx.clone();

	for task in tasks {
		let sem = sem.clone();
		let err_tx = err_tx.clone();
		tokio::spawn(async move {
			match task.await {
				Ok(()) => sem.add_permits(1),
				Err(e) => {
					// 1-slot channel: further errors from other tasks are dropped.
					let _ = err_tx.try_send(e);
				},
			}
		});
	}

	let mut completed = 0usize;
	while completed < total {
		tokio::select! {
			_ = cancel.cancelled() => return Err(RunError::Cancelled),
			maybe_err = err_rx.recv() => {
				if let Some(e) = maybe_err {
					return Err(RunError::Task(e));
				}
			}
			acquired = sem.acquire() => {
				if let Ok(permit) = acquired {
					permit.forget();
					completed += 1;
				}
			}
		}
	}
	Ok(())
}

/// Runs `g` only if `f` completed successfully.
pub fn on_success(f: BoxFuture, g: BoxFuture) -> BoxFuture {
	Box::pin(async move {
		let r = f.await;
		if r.is_ok() { g.await } else { r }
	})
}

/// Capability trait collapsing the teacher's runtime `Interrupt`/`Must`
/// type-assertion idiom into a single seam every writer half implements.
pub trait Closable: Send {
	fn close(self) -> impl Future<Output = Result<(), anyhow::Error>> + Send;
}

impl<W: AsyncWrite + Unpin + Send> Closable for W {
	async fn close(mut self) -> Result<(), anyhow::Error> {
		self.shutdown().await.map_err(Into::into)
	}
}

/// Returns a thunk closing `x`, for use as the second half of `on_success`.
pub fn close_of<W: Closable + 'static>(x: W) -> BoxFuture {
	Box::pin(async move { x.close().await })
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn ok_after(ms: u64) -> BoxFuture {
		Box::pin(async move {
			tokio::time::sleep(Duration::from_millis(ms)).await;
			Ok(())
		})
	}

	fn err_after(ms: u64, msg: &'static str) -> BoxFuture {
		Box::pin(async move {
			tokio::time::sleep(Duration::from_millis(ms)).await;
			Err(anyhow::anyhow!(msg))
		})
	}

	#[tokio::test]
	async fn returns_first_error() {
		let tasks = vec![err_after(10, "boom"), ok_after(50), ok_after(50)];
		let err = run(tasks, CancellationToken::new()).await.unwrap_err();
		assert!(matches!(err, RunError::Task(_)));
	}

	#[tokio::test]
	async fn all_success_returns_ok() {
		let tasks = vec![ok_after(1), ok_after(2), ok_after(3)];
		run(tasks, CancellationToken::new()).await.unwrap();
	}

	#[tokio::test]
	async fn cancelled_context_returns_cancelled() {
		let cancel = CancellationToken::new();
		cancel.cancel();
		let tasks = vec![ok_after(100)];
		let err = run(tasks, cancel).await.unwrap_err();
		assert!(matches!(err, RunError::Cancelled));
	}
}
