//! Per-connection handler (spec §4.G): mounts the HTTP/3-lite auth exchange
//! and a stream hijacker over one accepted QUIC connection.
//!
//! The first bidirectional stream a connection ever opens is treated as the
//! auth exchange (the client never opens a proxy stream before it has seen
//! the 233 response); every stream after that is handed to the hijacker,
//! and anything racing the auth stream before it resolves is declined.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use protocol::hysteria::auth::{
	AuthRequest, AuthResponse, HEADER_AUTH, HEADER_CC_RX, HEADER_PADDING, HEADER_UDP, HeaderList, STATUS_AUTH_OK,
	read_auth_request_async, write_auth_response_async,
};
use protocol::hysteria::tcp::{AUTH_PADDING_RANGE, FRAME_TYPE_TCP_REQUEST, random_padding};
use protocol::hysteria::{CLOSE_NO_ERROR, CLOSE_TRAFFIC_LIMIT};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::account::AccountTable;
use crate::auth::Authenticator;
use crate::congestion::{ConnectionCongestion, negotiate_actual_tx};
use crate::hook::RequestHook;
use crate::masquerade::MasqueradeHandler;
use crate::stats::StreamStats;
use crate::tcp::{Dialer, StreamOutcome, TrafficLogger, handle_tcp_request};
use crate::udp::{DatagramChannel, DatagramSendError, SessionTable, UdpOutbound};

/// Shared across every connection the listener accepts.
pub struct ConnectionDeps<O> {
	pub authenticator: Arc<dyn Authenticator>,
	pub masquerade: Arc<dyn MasqueradeHandler>,
	pub hook: Arc<dyn RequestHook>,
	pub dialer: Arc<dyn Dialer>,
	pub udp_outbound: Arc<O>,
	pub traffic_logger: Option<Arc<dyn TrafficLogger>>,
	pub accounts: Arc<AccountTable>,
	pub server_max_tx: u64,
	pub ignore_client_bandwidth: bool,
	pub disable_udp: bool,
	pub udp_idle_timeout: Duration,
	pub session_idle_timeout: Duration,
}

struct QuicDatagramChannel {
	conn: quinn::Connection,
}

impl DatagramChannel for QuicDatagramChannel {
	fn send(&self, data: Bytes) -> Result<(), DatagramSendError> {
		self.conn.send_datagram(data).map_err(|e| match e {
			quinn::SendDatagramError::TooLarge => DatagramSendError::TooLarge,
			other => DatagramSendError::Other(anyhow::anyhow!("{other}")),
		})
	}

	fn max_datagram_payload_size(&self) -> usize {
		self.conn.max_datagram_size().unwrap_or(0)
	}
}

/// Runs until the connection closes or `cancel` fires; then closes the QUIC
/// connection with [`CLOSE_TRAFFIC_LIMIT`] if any stream reported excessive
/// load, otherwise [`CLOSE_NO_ERROR`] (spec §4.G step 6).
pub async fn handle_connection<O: UdpOutbound + 'static>(
	conn: quinn::Connection,
	congestion: Arc<ConnectionCongestion>,
	deps: Arc<ConnectionDeps<O>>,
	conn_id: u64,
	cancel: CancellationToken,
) {
	let remote = conn.remote_address();
	let authenticated: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
	let auth_claimed = Arc::new(AtomicBool::new(false));
	let traffic_limit_exceeded = Arc::new(AtomicBool::new(false));
	let session_table: Arc<Mutex<Option<Arc<SessionTable<O>>>>> = Arc::new(Mutex::new(None));

	let datagram_task = tokio::spawn({
		let conn = conn.clone();
		let cancel = cancel.clone();
		let session_table = session_table.clone();
		async move {
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					datagram = conn.read_datagram() => {
						match datagram {
							Ok(bytes) => {
								let table = session_table.lock().await.clone();
								if let Some(table) = table {
									table.on_datagram(bytes).await;
								}
							},
							Err(_) => break,
						}
					}
				}
			}
		}
	});

	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			accepted = conn.accept_bi() => {
				let (send, recv) = match accepted {
					Ok(streams) => streams,
					Err(_) => break,
				};
				let current_auth = authenticated.lock().await.clone();
				if let Some(auth_id) = current_auth {
					spawn_proxy_stream(send, recv, auth_id, deps.clone(), conn_id, traffic_limit_exceeded.clone(), cancel.child_token());
				} else if !auth_claimed.swap(true, Ordering::SeqCst) {
					tokio::spawn(run_auth_stream(
						send,
						recv,
						remote,
						deps.clone(),
						congestion.clone(),
						authenticated.clone(),
						session_table.clone(),
						conn.clone(),
					));
				}
				// Racing streams arriving before auth resolves are declined:
				// both halves drop here, resetting the stream.
			}
		}
	}

	datagram_task.abort();
	let close_code = if traffic_limit_exceeded.load(Ordering::Relaxed) {
		CLOSE_TRAFFIC_LIMIT
	} else {
		CLOSE_NO_ERROR
	};
	conn.close(quinn::VarInt::from_u32(close_code), b"");
}

#[allow(clippy::too_many_arguments)]
async fn run_auth_stream<O: UdpOutbound + 'static>(
	mut send: quinn::SendStream,
	mut recv: quinn::RecvStream,
	remote: SocketAddr,
	deps: Arc<ConnectionDeps<O>>,
	congestion: Arc<ConnectionCongestion>,
	authenticated: Arc<Mutex<Option<String>>>,
	session_table: Arc<Mutex<Option<Arc<SessionTable<O>>>>>,
	conn: quinn::Connection,
) {
	let request = match read_auth_request_async(&mut recv).await {
		Ok(r) => r,
		Err(_) => return,
	};
	if !request.is_auth_post() {
		let resp = masquerade_response(&deps.masquerade, &request);
		let _ = write_auth_response_async(&mut send, &resp).await;
		let _ = send.finish();
		return;
	}

	let auth_token = request.headers.get(HEADER_AUTH).unwrap_or_default().to_string();
	let client_tx: u64 = request.headers.get(HEADER_CC_RX).and_then(|v| v.parse().ok()).unwrap_or(0);

	match deps.authenticator.authenticate(remote, &auth_token, client_tx) {
		Some(auth_id) => {
			let actual_tx = negotiate_actual_tx(deps.ignore_client_bandwidth, deps.server_max_tx, client_tx);
			congestion.set_actual_tx(actual_tx);

			let mut headers = HeaderList::new();
			headers.push(HEADER_UDP, (!deps.disable_udp).to_string());
			headers.push(
				HEADER_CC_RX,
				if deps.ignore_client_bandwidth {
					"auto".to_string()
				} else {
					actual_tx.to_string()
				},
			);
			headers.push(HEADER_PADDING, random_padding(AUTH_PADDING_RANGE));
			let resp = AuthResponse {
				status: STATUS_AUTH_OK,
				headers,
				body: Vec::new(),
			};
			if write_auth_response_async(&mut send, &resp).await.is_err() {
				return;
			}
			let _ = send.finish();

			tracing::info!(auth_id = %auth_id, %remote, "Connect");
			*authenticated.lock().await = Some(auth_id);

			if !deps.disable_udp {
				let table = SessionTable::new(
					deps.udp_outbound.clone(),
					deps.hook.clone(),
					Arc::new(QuicDatagramChannel { conn }) as Arc<dyn DatagramChannel>,
					deps.udp_idle_timeout,
				);
				*session_table.lock().await = Some(table);
			}
		},
		None => {
			let resp = masquerade_response(&deps.masquerade, &request);
			let _ = write_auth_response_async(&mut send, &resp).await;
			let _ = send.finish();
		},
	}
}

fn masquerade_response(handler: &Arc<dyn MasqueradeHandler>, request: &AuthRequest) -> AuthResponse {
	let resp = handler.handle(&request.method, &request.path);
	let mut headers = HeaderList::new();
	for (name, value) in resp.headers {
		headers.push(name, value);
	}
	AuthResponse {
		status: resp.status,
		headers,
		body: resp.body,
	}
}

fn spawn_proxy_stream<O: UdpOutbound + 'static>(
	send: quinn::SendStream,
	mut recv: quinn::RecvStream,
	auth_id: String,
	deps: Arc<ConnectionDeps<O>>,
	conn_id: u64,
	traffic_limit_exceeded: Arc<AtomicBool>,
	cancel: CancellationToken,
) {
	tokio::spawn(async move {
		let frame_type = match recv.read_u8().await {
			Ok(b) => b,
			Err(_) => return,
		};
		if frame_type != FRAME_TYPE_TCP_REQUEST {
			return;
		}
		let limiter = deps.accounts.limiter_for(&auth_id).await;
		let stats = Arc::new(StreamStats::new(auth_id, conn_id));
		let outcome = handle_tcp_request(
			Box::new(recv),
			Box::new(send),
			stats,
			deps.hook.clone(),
			deps.dialer.clone(),
			deps.traffic_logger.clone(),
			limiter,
			deps.session_idle_timeout,
			cancel,
		)
		.await;
		if outcome == StreamOutcome::TrafficLimitExceeded {
			traffic_limit_exceeded.store(true, Ordering::Relaxed);
		}
	});
}
