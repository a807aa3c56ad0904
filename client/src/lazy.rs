//! Lazy reconnecting client (spec §4.H): wraps a [`ClientTransport`], deferring
//! the first dial (and therefore DNS resolution of the server address) until
//! the first `tcp`/`udp` call, and re-dialing transparently whenever the
//! underlying connection has gone away.
//!
//! Grounded in the guarded-lazy-cache idiom `server::connection` already
//! uses for its per-connection session table (`Arc<Mutex<Option<T>>>`,
//! checked and populated under the lock on first use) — this crate has no
//! connection-pooling file to imitate directly, so the wrapper reuses that
//! same shape rather than the teacher's HTTP/2 connection pool, which
//! multiplexes many live connections concurrently instead of lazily holding
//! one at a time.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use crate::config::{ClientConfig, ClientTlsConfig};
use crate::connect::{self, ClientTransport, ClientUdpHandle};
use crate::error::ClientError;

/// Produces a fresh [`ClientConfig`] for each dial attempt, deferring
/// things like DNS resolution of `server` until the dial actually happens.
pub type ConfigFunc = Arc<dyn Fn() -> Result<ClientConfig, ClientError> + Send + Sync>;

/// Invoked once per successful (re)connect, e.g. for logging.
pub type ConnectedFunc = Arc<dyn Fn() + Send + Sync>;

/// A `tcp`/`udp`-calling client that dials on first use and transparently
/// re-dials after the underlying connection closes, until [`close`](Self::close)
/// latches it permanently shut.
pub struct LazyClient {
	config_func: ConfigFunc,
	connected_func: Option<ConnectedFunc>,
	inner: Mutex<Option<Arc<ClientTransport>>>,
	closed: Mutex<bool>,
}

impl LazyClient {
	pub fn new(config_func: ConfigFunc, connected_func: Option<ConnectedFunc>) -> Arc<Self> {
		Arc::new(Self {
			config_func,
			connected_func,
			inner: Mutex::new(None),
			closed: Mutex::new(false),
		})
	}

	async fn ensure_connected(&self) -> Result<Arc<ClientTransport>, ClientError> {
		if *self.closed.lock().await {
			return Err(ClientError::Core(proxy_core::Error::closed(None)));
		}
		let mut guard = self.inner.lock().await;
		if let Some(transport) = guard.as_ref() {
			return Ok(transport.clone());
		}
		let transport = Arc::new(dial_from_config(&self.config_func).await?);
		*guard = Some(transport.clone());
		drop(guard);
		if let Some(f) = &self.connected_func {
			f();
		}
		Ok(transport)
	}

	/// Drops the cached transport so the next call re-dials. Called when a
	/// `tcp`/`udp` operation reports the connection is closed.
	async fn forget(&self) {
		*self.inner.lock().await = None;
	}

	pub async fn tcp(&self, addr: &str) -> Result<(Box<dyn AsyncRead + Unpin + Send>, Box<dyn AsyncWrite + Unpin + Send>), ClientError> {
		loop {
			let transport = self.ensure_connected().await?;
			match transport.tcp(addr).await {
				Ok(streams) => return Ok(streams),
				Err(e) if e.is_closed() => {
					self.forget().await;
					continue;
				},
				Err(e) => return Err(e),
			}
		}
	}

	pub async fn udp(&self) -> Result<ClientUdpHandle, ClientError> {
		loop {
			let transport = self.ensure_connected().await?;
			match transport.udp().await {
				Some(conn) => return Ok(conn),
				None => return Err(ClientError::Dial("server did not advertise udp support".to_string())),
			}
		}
	}

	/// Permanently closes this client. Every subsequent `tcp`/`udp` call
	/// returns [`proxy_core::Error::closed`] without attempting to reconnect
	/// (spec §4.H).
	pub async fn close(&self) {
		*self.closed.lock().await = true;
		if let Some(transport) = self.inner.lock().await.take() {
			transport.close();
		}
	}
}

async fn dial_from_config(config_func: &ConfigFunc) -> Result<ClientTransport, ClientError> {
	let config: ClientConfig = config_func()?;
	config.obfs.validate()?;
	let server_addr = resolve_server(&config.server).await?;
	let server_name = server_name_for(&config.server, &config.tls);
	connect::dial(server_addr, &server_name, &config.quic, &config.tls, &config.auth, &config.bandwidth).await
}

async fn resolve_server(server: &str) -> Result<std::net::SocketAddr, ClientError> {
	tokio::net::lookup_host(server)
		.await?
		.next()
		.ok_or_else(|| ClientError::Config(format!("could not resolve {server}")))
}

fn server_name_for(server: &str, tls: &ClientTlsConfig) -> String {
	if let Some(sni) = &tls.sni {
		return sni.clone();
	}
	server.rsplit_once(':').map(|(host, _)| host.to_string()).unwrap_or_else(|| server.to_string())
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn close_latches_and_refuses_reconnect() {
		let attempts = Arc::new(AtomicUsize::new(0));
		let attempts_clone = attempts.clone();
		let config_func: ConfigFunc = Arc::new(move || {
			attempts_clone.fetch_add(1, Ordering::SeqCst);
			Err(ClientError::Config("no server in this test".to_string()))
		});
		let client = LazyClient::new(config_func, None);

		let first = client.tcp("example.com:80").await;
		assert!(first.is_err());
		assert_eq!(attempts.load(Ordering::SeqCst), 1);

		client.close().await;
		let after_close = client.tcp("example.com:80").await;
		assert!(matches!(after_close, Err(ClientError::Core(e)) if e.is_closed()));
		// closed short-circuits before ever calling config_func again.
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}
}
