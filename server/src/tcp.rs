//! TCP request handling (spec §4.G "TCP request handling"): the per-stream
//! state machine run once per hijacked QUIC bidirectional stream carrying
//! `FRAME_TYPE_TCP_REQUEST`.
//!
//! State transitions: `Initial -> Connecting -> (Hooking?) -> Established ->
//! Closed`, matching [`crate::stats::State`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use protocol::address::Address;
use protocol::hysteria::tcp::{read_tcp_request_async, write_tcp_response_async};
use protocol::limiter::{RateLimiter, RateLimiterPair};
use proxy_core::session::{CanSpliceCopy, SessionTimeouts, run_session};
use proxy_core::taskrunner::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::hook::RequestHook;
use crate::stats::{State, StreamStats};

/// A duplex byte stream to an outbound target — the dialed upstream
/// connection, boxed so the handler doesn't need to be generic over every
/// `Outbound` implementation a deployment might plug in.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

pub(crate) type BoxDial<'a> = Pin<Box<dyn Future<Output = io::Result<Box<dyn Duplex>>> + Send + 'a>>;

/// The outbound dial seam (spec glossary "Outbound"). Out of scope: the
/// routing/selection policy behind it, only the dial contract lives here.
pub trait Dialer: Send + Sync {
	fn dial_tcp<'a>(&'a self, addr: &'a Address) -> BoxDial<'a>;
}

/// Optional per-connection traffic accounting hook. Returning `false`
/// requests the whole QUIC connection be torn down with
/// [`crate::CLOSE_TRAFFIC_LIMIT`] (spec §4.G step 6).
pub trait TrafficLogger: Send + Sync {
	fn log_traffic(&self, auth_id: &str, tx: u64, rx: u64) -> bool;
}

/// Close-code hint the connection handler folds into its own QUIC close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
	Closed,
	TrafficLimitExceeded,
}

/// Runs the full per-stream state machine described in spec §4.G. `cancel`
/// is this stream's own cancellation token — canceling it from the outside
/// aborts both halves of the copy immediately.
#[allow(clippy::too_many_arguments)]
pub async fn handle_tcp_request(
	mut quic_recv: Box<dyn AsyncRead + Unpin + Send>,
	mut quic_send: Box<dyn AsyncWrite + Unpin + Send>,
	stats: Arc<StreamStats>,
	hook: Arc<dyn RequestHook>,
	dialer: Arc<dyn Dialer>,
	traffic_logger: Option<Arc<dyn TrafficLogger>>,
	limiter: Arc<RateLimiterPair>,
	session_idle_timeout: Duration,
	cancel: CancellationToken,
) -> StreamOutcome {
	// Step 1: read the request, record req_addr.
	let req_addr = match read_tcp_request_async(&mut quic_recv).await {
		Ok(raw) => raw,
		Err(_) => {
			stats.set_state(State::Closed);
			return StreamOutcome::Closed;
		},
	};
	let mut addr = match parse_host_port(&req_addr) {
		Some(a) => a,
		None => {
			stats.set_state(State::Closed);
			return StreamOutcome::Closed;
		},
	};
	stats.set_req_addr(addr.clone());

	// Step 2: optional RequestHook, with fast-open success response.
	let mut putback = Vec::new();
	let mut hooked = false;
	if hook.accepts_tcp(&addr) {
		stats.set_state(State::Hooking);
		let _ = write_tcp_response_async(&mut quic_send, true, "RequestHook enabled").await;
		match hook.refine_tcp(addr.clone(), &mut *quic_recv).await {
			Ok(decision) => {
				addr = decision.addr;
				putback = decision.putback;
				stats.set_hooked_addr(addr.clone());
				hooked = true;
			},
			Err(_) => {
				stats.set_state(State::Closed);
				return StreamOutcome::Closed;
			},
		}
	}

	// Step 3: dial the (possibly hook-rewritten) outbound.
	stats.set_state(State::Connecting);
	let outbound = match dialer.dial_tcp(&addr).await {
		Ok(conn) => conn,
		Err(e) => {
			if !hooked {
				let _ = write_tcp_response_async(&mut quic_send, false, &e.to_string()).await;
			}
			stats.set_state(State::Closed);
			tracing::debug!(error = %e, addr = %addr, "tcp dial failed");
			return StreamOutcome::Closed;
		},
	};

	// Step 4: success response, Established.
	if !hooked {
		if write_tcp_response_async(&mut quic_send, true, "Connected").await.is_err() {
			stats.set_state(State::Closed);
			return StreamOutcome::Closed;
		}
	}
	stats.set_state(State::Established);

	let (mut outbound_read, mut outbound_write) = tokio::io::split(outbound);

	// Step 5: putback bytes the hook already consumed from the client.
	if !putback.is_empty() {
		if outbound_write.write_all(&putback).await.is_err() {
			stats.set_state(State::Closed);
			return StreamOutcome::Closed;
		}
		stats.add_tx(putback.len() as u64);
	}

	// Step 6: two-way copy under the session glue (spec §4.I), with traffic
	// accounting and per-user rate limiting (spec §3) per direction. Every
	// stream here is wrapped by byte counting and the rate limiter, so the
	// splice hint degrades from raw twice no matter what: recorded for
	// visibility, not yet acted on by a splice-capable copier.
	stats.set_splice_eligibility(CanSpliceCopy::RAW.wrapped().wrapped());
	let auth_id = stats.auth_id.clone();
	let logger = traffic_logger.clone();
	let stats_tx = stats.clone();
	let uplink = limiter.clone();
	let request_copy: BoxFuture = Box::pin(async move {
		let n = copy_rate_limited(&mut quic_recv, &mut outbound_write, &uplink.uplink, |n| stats_tx.add_tx(n)).await?;
		if let Some(logger) = &logger {
			if !logger.log_traffic(&auth_id, n, 0) {
				anyhow::bail!("traffic limit exceeded");
			}
		}
		outbound_write.shutdown().await?;
		Ok(())
	});

	let logger = traffic_logger.clone();
	let auth_id = stats.auth_id.clone();
	let stats_rx = stats.clone();
	let downlink = limiter;
	let response_copy: BoxFuture = Box::pin(async move {
		let n = copy_rate_limited(&mut outbound_read, &mut quic_send, &downlink.downlink, |n| stats_rx.add_rx(n)).await?;
		if let Some(logger) = &logger {
			if !logger.log_traffic(&auth_id, 0, n) {
				anyhow::bail!("traffic limit exceeded");
			}
		}
		quic_send.shutdown().await?;
		Ok(())
	});

	let timeouts = SessionTimeouts::uniform(session_idle_timeout);
	let result = run_session(timeouts, cancel, request_copy, response_copy, NoopClosable).await;
	stats.set_state(State::Closed);

	match result {
		Ok(()) => StreamOutcome::Closed,
		Err(e) => {
			let msg = e.to_string();
			if msg.contains("traffic limit exceeded") {
				StreamOutcome::TrafficLimitExceeded
			} else {
				StreamOutcome::Closed
			}
		},
	}
}

/// `quic_send`'s shutdown is driven by the response copy itself (the write
/// half has already been moved into the response-copy future), so the
/// session glue's "close the response writer on success" step has nothing
/// left to do.
struct NoopClosable;

impl proxy_core::taskrunner::Closable for NoopClosable {
	async fn close(self) -> Result<(), anyhow::Error> {
		Ok(())
	}
}

/// Copies `reader` to `writer` one chunk at a time, calling `on_write` with
/// the byte count of each chunk (feeding [`StreamStats`]) and, before
/// writing it, sleeping for whatever [`RateLimiter::acquire`] says the
/// chunk's tokens are worth (spec §3 "Server spec / memory user"). Returns
/// the total bytes copied, mirroring `tokio::io::copy`'s return value.
async fn copy_rate_limited<R, W>(reader: &mut R, writer: &mut W, limiter: &RateLimiter, mut on_write: impl FnMut(u64)) -> io::Result<u64>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = [0u8; 16 * 1024];
	let mut total = 0u64;
	loop {
		let n = reader.read(&mut buf).await?;
		if n == 0 {
			return Ok(total);
		}
		let wait = limiter.acquire(n as u64);
		if wait > Duration::ZERO {
			tokio::time::sleep(wait).await;
		}
		writer.write_all(&buf[..n]).await?;
		on_write(n as u64);
		total += n as u64;
	}
}

fn parse_host_port(raw: &str) -> Option<Address> {
	let (host, port) = raw.rsplit_once(':')?;
	let port: u16 = port.parse().ok()?;
	if let Ok(ip) = host.parse::<std::net::IpAddr>() {
		Some(Address::Ip(std::net::SocketAddr::new(ip, port)))
	} else {
		Some(Address::Domain(host.to_string(), port))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use protocol::hysteria::tcp::write_tcp_request_async;

	struct EchoDialer;

	impl Dialer for EchoDialer {
		fn dial_tcp<'a>(&'a self, _addr: &'a Address) -> BoxDial<'a> {
			Box::pin(async move {
				let (a, b) = tokio::io::duplex(4096);
				tokio::spawn(async move {
					let (mut r, mut w) = tokio::io::split(a);
					let _ = tokio::io::copy(&mut r, &mut w).await;
				});
				Ok(Box::new(b) as Box<dyn Duplex>)
			})
		}
	}

	#[tokio::test]
	async fn successful_roundtrip_echoes_payload() {
		let (mut client_send, server_recv) = tokio::io::duplex(4096);
		let (server_send, mut client_recv) = tokio::io::duplex(4096);

		write_tcp_request_async(&mut client_send, "example.com:80").await.unwrap();
		client_send.write_all(b"ping").await.unwrap();

		let stats = Arc::new(StreamStats::new("user".to_string(), 1));
		let handle = tokio::spawn(handle_tcp_request(
			Box::new(server_recv),
			Box::new(server_send),
			stats.clone(),
			Arc::new(crate::hook::NoopHook),
			Arc::new(EchoDialer),
			None,
			Arc::new(RateLimiterPair::unlimited()),
			Duration::from_secs(5),
			CancellationToken::new(),
		));

		let (ok, message) = protocol::hysteria::tcp::read_tcp_response_async(&mut client_recv).await.unwrap();
		assert!(ok);
		assert_eq!(message, "Connected");

		let mut echoed = [0u8; 4];
		client_recv.read_exact(&mut echoed).await.unwrap();
		assert_eq!(&echoed, b"ping");

		drop(client_send);
		let outcome = handle.await.unwrap();
		assert_eq!(outcome, StreamOutcome::Closed);
		assert_eq!(stats.state(), State::Closed);
		assert!(stats.tx_bytes() >= 4);
		assert_eq!(stats.splice_eligibility(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn copy_rate_limited_waits_for_tokens_before_writing() {
		let limiter = RateLimiter::new(100);
		let (mut a, mut b) = tokio::io::duplex(4096);
		let payload = vec![0u8; 1000];
		let write_side = tokio::spawn(async move {
			a.write_all(&payload).await.unwrap();
			a.shutdown().await.unwrap();
		});

		let mut written = 0u64;
		copy_rate_limited(&mut b, &mut tokio::io::sink(), &limiter, |n| written += n).await.unwrap();
		write_side.await.unwrap();
		assert_eq!(written, 1000);
	}
}
