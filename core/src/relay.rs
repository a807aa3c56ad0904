//! UDP dispatcher / routing bridge (spec §4.D).
//!
//! Bridges a single UDP socket to an external routing dispatcher, lazily
//! establishing one logical "ray" per destination and tearing it down after
//! `idle_timeout` of inactivity. The routing dispatcher itself (upstream
//! selection policy) is an out-of-scope external collaborator; only the
//! seam it must implement lives here.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTimer;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A single bidirectional flow opened by the routing dispatcher toward one
/// destination.
pub trait Ray: Send + Sync {
	fn send(&self, payload: Bytes) -> BoxFuture<anyhow::Result<()>>;
	/// Reads the next reply. The returned address, if present, overrides the
	/// ray's initial destination (symmetric-NAT reply-from-elsewhere).
	fn recv(&self) -> BoxFuture<anyhow::Result<Option<(Bytes, Option<SocketAddr>)>>>;
}

/// The external routing dispatcher contract: given a destination, open a ray.
pub trait RoutingDispatcher: Send + Sync {
	fn open(&self, dest: SocketAddr) -> BoxFuture<anyhow::Result<Box<dyn Ray>>>;
}

pub type ResponseCallback = Arc<dyn Fn(Bytes, SocketAddr) + Send + Sync>;

struct RayEntry {
	ray: Box<dyn Ray>,
	timer: ActivityTimer,
	initial_target: SocketAddr,
}

/// Bridges a UDP socket to a `RoutingDispatcher`, one ray per destination.
pub struct UdpDispatchBridge<D> {
	dispatcher: Arc<D>,
	callback: ResponseCallback,
	idle_timeout: Duration,
	rays: Arc<Mutex<HashMap<SocketAddr, Arc<RayEntry>>>>,
}

impl<D: RoutingDispatcher + 'static> UdpDispatchBridge<D> {
	pub fn new(dispatcher: Arc<D>, callback: ResponseCallback, idle_timeout: Duration) -> Self {
		Self {
			dispatcher,
			callback,
			idle_timeout,
			rays: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Dispatches `payload` toward `dest`, reusing an existing ray if one is
	/// active.
	pub async fn dispatch(&self, dest: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
		let entry = self.get_or_create_ray(dest).await?;
		entry.timer.update();
		entry.ray.send(payload).await
	}

	/// Explicitly tears down the ray toward `dest`, if any.
	pub async fn remove_ray(&self, dest: SocketAddr) {
		self.rays.lock().await.remove(&dest);
	}

	async fn get_or_create_ray(&self, dest: SocketAddr) -> anyhow::Result<Arc<RayEntry>> {
		let mut guard = self.rays.lock().await;
		if let Some(entry) = guard.get(&dest) {
			return Ok(entry.clone());
		}
		let ray = self.dispatcher.open(dest).await?;
		let rays = self.rays.clone();
		let timer = ActivityTimer::new(self.idle_timeout, move || {
			let rays = rays.clone();
			tokio::spawn(async move {
				rays.lock().await.remove(&dest);
			});
		});
		let entry = Arc::new(RayEntry {
			ray,
			timer,
			initial_target: dest,
		});
		guard.insert(dest, entry.clone());
		self.spawn_input_pump(dest, entry.clone());
		Ok(entry)
	}

	fn spawn_input_pump(&self, dest: SocketAddr, entry: Arc<RayEntry>) {
		let callback = self.callback.clone();
		let rays = self.rays.clone();
		tokio::spawn(async move {
			loop {
				match entry.ray.recv().await {
					Ok(Some((buf, override_addr))) => {
						entry.timer.update();
						let target = override_addr.unwrap_or(entry.initial_target);
						(callback)(buf, target);
					},
					Ok(None) => break,
					Err(e) => {
						tracing::debug!(error = %e, dest = %dest, "udp ray read failed");
						break;
					},
				}
			}
			rays.lock().await.remove(&dest);
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::mpsc;

	struct EchoRay {
		tx: mpsc::UnboundedSender<Bytes>,
		rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
	}

	impl Ray for EchoRay {
		fn send(&self, payload: Bytes) -> BoxFuture<anyhow::Result<()>> {
			let tx = self.tx.clone();
			Box::pin(async move {
				tx.send(payload)?;
				Ok(())
			})
		}
		fn recv(&self) -> BoxFuture<anyhow::Result<Option<(Bytes, Option<SocketAddr>)>>> {
			Box::pin(async move {
				let mut rx = self.rx.lock().await;
				Ok(rx.recv().await.map(|b| (b, None)))
			})
		}
	}

	struct EchoDispatcher;

	impl RoutingDispatcher for EchoDispatcher {
		fn open(&self, _dest: SocketAddr) -> BoxFuture<anyhow::Result<Box<dyn Ray>>> {
			Box::pin(async move {
				let (tx, rx) = mpsc::unbounded_channel();
				Ok(Box::new(EchoRay {
					tx,
					rx: Mutex::new(rx),
				}) as Box<dyn Ray>)
			})
		}
	}

	#[tokio::test]
	async fn dispatch_reuses_ray_and_invokes_callback() {
		let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();
		let callback: ResponseCallback = Arc::new(move |buf, addr| {
			let _ = cb_tx.send((buf, addr));
		});
		let bridge = UdpDispatchBridge::new(
			Arc::new(EchoDispatcher),
			callback,
			Duration::from_secs(60),
		);
		let dest: SocketAddr = "127.0.0.1:9999".parse().unwrap();
		bridge
			.dispatch(dest, Bytes::from_static(b"hello"))
			.await
			.unwrap();
		let (buf, addr) = cb_rx.recv().await.unwrap();
		assert_eq!(buf, Bytes::from_static(b"hello"));
		assert_eq!(addr, dest);
	}
}
