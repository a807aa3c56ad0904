//! UDP session manager, server side (spec §4.G "UDP session manager
//! (server)"). One instance per authenticated QUIC connection.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use protocol::address::Address;
use protocol::hysteria::message::{Defragmenter, UdpMessage, fragment};
use tokio::sync::{Mutex, RwLock};

use crate::hook::RequestHook;

pub(crate) type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One established outbound UDP flow.
pub trait UdpConn: Send + Sync {
	fn send<'a>(&'a self, data: &'a [u8]) -> BoxFut<'a, std::io::Result<()>>;
	fn recv<'a>(&'a self, buf: &'a mut [u8]) -> BoxFut<'a, std::io::Result<usize>>;
}

/// The outbound UDP dial seam (spec glossary "Outbound").
pub trait UdpOutbound: Send + Sync {
	fn dial<'a>(&'a self, addr: &'a Address) -> BoxFut<'a, std::io::Result<Arc<dyn UdpConn>>>;
}

/// Error from sending a `UDPMessage` back over the QUIC datagram channel,
/// distinguishing "too large for one datagram" (retry, fragmented) from
/// everything else (connection is presumed dead).
pub enum DatagramSendError {
	TooLarge,
	Other(anyhow::Error),
}

/// The QUIC connection's unreliable-datagram channel (`SendMessage` /
/// `ReceiveMessage` in spec §4.G), abstracted so the session table doesn't
/// need to know about `quinn::Connection` directly.
pub trait DatagramChannel: Send + Sync {
	fn send(&self, data: Bytes) -> Result<(), DatagramSendError>;
	fn max_datagram_payload_size(&self) -> usize;
}

/// Sends `msg`, re-fragmenting with a fresh random nonzero `packet_id` if
/// the transport rejects it as too large for one datagram (spec §4.G
/// "Failure semantics").
fn send_udp_message(channel: &dyn DatagramChannel, msg: &UdpMessage) {
	let mut buf = bytes::BytesMut::new();
	msg.encode(&mut buf);
	match channel.send(buf.freeze()) {
		Ok(()) => {},
		Err(DatagramSendError::TooLarge) => {
			let max = channel.max_datagram_payload_size();
			for fragment_msg in fragment(msg.session_id, &msg.addr, &msg.data, max) {
				let mut buf = bytes::BytesMut::new();
				fragment_msg.encode(&mut buf);
				if let Err(e) = channel.send(buf.freeze()) {
					if let DatagramSendError::Other(e) = e {
						tracing::debug!(error = %e, "udp fragment send failed");
					}
					break;
				}
			}
		},
		Err(DatagramSendError::Other(e)) => {
			tracing::debug!(error = %e, "udp datagram send failed");
		},
	}
}

struct SessionEntry {
	id: u32,
	original_addr: String,
	override_addr: Mutex<Option<SocketAddr>>,
	defrag: Mutex<Defragmenter>,
	started_at: Instant,
	last_active_nanos: AtomicU64,
	closed: AtomicBool,
	conn: Mutex<Option<Arc<dyn UdpConn>>>,
}

impl SessionEntry {
	fn new(id: u32, original_addr: String) -> Self {
		Self {
			id,
			original_addr,
			override_addr: Mutex::new(None),
			defrag: Mutex::new(Defragmenter::new()),
			started_at: Instant::now(),
			last_active_nanos: AtomicU64::new(0),
			closed: AtomicBool::new(false),
			conn: Mutex::new(None),
		}
	}

	fn touch(&self) {
		self.last_active_nanos.store(self.started_at.elapsed().as_nanos() as u64, Ordering::Relaxed);
	}

	fn idle_for(&self) -> Duration {
		self.started_at.elapsed() - Duration::from_nanos(self.last_active_nanos.load(Ordering::Relaxed))
	}
}

/// Table of active UDP sessions for one connection, keyed by `session_id`.
/// Owns the idle-cleanup loop and the lazy dial-on-first-packet logic.
pub struct SessionTable<O> {
	outbound: Arc<O>,
	hook: Arc<dyn RequestHook>,
	channel: Arc<dyn DatagramChannel>,
	sessions: RwLock<HashMap<u32, Arc<SessionEntry>>>,
	idle_timeout: Duration,
}

impl<O: UdpOutbound + 'static> SessionTable<O> {
	pub fn new(outbound: Arc<O>, hook: Arc<dyn RequestHook>, channel: Arc<dyn DatagramChannel>, idle_timeout: Duration) -> Arc<Self> {
		let table = Arc::new(Self {
			outbound,
			hook,
			channel,
			sessions: RwLock::new(HashMap::new()),
			idle_timeout,
		});
		table.clone().spawn_idle_cleanup();
		table
	}

	/// Feeds one datagram off the QUIC connection's receive path. Invalid
	/// frames are dropped silently per spec §4.G failure semantics.
	pub async fn on_datagram(self: &Arc<Self>, raw: Bytes) {
		let msg = match UdpMessage::decode(&mut raw.clone()) {
			Ok(m) => m,
			Err(_) => return,
		};
		let entry = self.get_or_create(msg.session_id, &msg.addr).await;
		entry.touch();
		let completed = entry.defrag.lock().await.feed(msg);
		if let Some((addr, data)) = completed {
			self.deliver(entry, addr, data).await;
		}
	}

	async fn get_or_create(self: &Arc<Self>, session_id: u32, addr: &str) -> Arc<SessionEntry> {
		if let Some(entry) = self.sessions.read().await.get(&session_id) {
			return entry.clone();
		}
		let mut guard = self.sessions.write().await;
		guard
			.entry(session_id)
			.or_insert_with(|| Arc::new(SessionEntry::new(session_id, addr.to_string())))
			.clone()
	}

	async fn deliver(self: &Arc<Self>, entry: Arc<SessionEntry>, addr: String, data: Bytes) {
		let conn = match self.ensure_conn(&entry, &addr).await {
			Some(c) => c,
			None => return,
		};
		if conn.send(&data).await.is_err() {
			self.close_entry(entry.id, "outbound send failed").await;
		}
	}

	/// Dials the outbound exactly once per entry; `RequestHook::udp` may
	/// rewrite the destination first. Returns `None` if the entry has
	/// already been closed or the dial failed.
	async fn ensure_conn(self: &Arc<Self>, entry: &Arc<SessionEntry>, addr: &str) -> Option<Arc<dyn UdpConn>> {
		if entry.closed.load(Ordering::SeqCst) {
			return None;
		}
		let mut guard = entry.conn.lock().await;
		if let Some(conn) = guard.as_ref() {
			return Some(conn.clone());
		}
		let parsed = parse_addr(addr)?;
		let dial_addr = match self.hook.udp(&parsed) {
			Some(rewritten) => {
				*entry.override_addr.lock().await = Some(rewritten);
				Address::Ip(rewritten)
			},
			None => parsed,
		};
		let conn: Arc<dyn UdpConn> = match self.outbound.dial(&dial_addr).await {
			Ok(c) => c,
			Err(e) => {
				tracing::debug!(error = %e, addr = %dial_addr, "udp dial failed");
				return None;
			},
		};
		*guard = Some(conn.clone());
		drop(guard);
		self.spawn_receive_loop(entry.clone(), conn.clone());
		Some(conn)
	}

	fn spawn_receive_loop(self: &Arc<Self>, entry: Arc<SessionEntry>, conn: Arc<dyn UdpConn>) {
		let table = self.clone();
		tokio::spawn(async move {
			let mut buf = vec![0u8; 65535];
			loop {
				if entry.closed.load(Ordering::SeqCst) {
					break;
				}
				match conn.recv(&mut buf).await {
					Ok(n) => {
						entry.touch();
						let addr = entry
							.override_addr
							.lock()
							.await
							.map(|a| a.to_string())
							.unwrap_or_else(|| entry.original_addr.clone());
						let msg = UdpMessage {
							session_id: entry.id,
							packet_id: 0,
							frag_id: 0,
							frag_count: 1,
							addr,
							data: Bytes::copy_from_slice(&buf[..n]),
						};
						send_udp_message(table.channel.as_ref(), &msg);
					},
					Err(_) => break,
				}
			}
			table.close_entry(entry.id, "outbound closed").await;
		});
	}

	async fn close_entry(self: &Arc<Self>, session_id: u32, cause: &str) {
		let removed = self.sessions.write().await.remove(&session_id);
		if let Some(entry) = removed {
			if !entry.closed.swap(true, Ordering::SeqCst) {
				tracing::debug!(session_id, cause, "udp session closed");
			}
		}
	}

	fn spawn_idle_cleanup(self: Arc<Self>) {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_secs(1));
			loop {
				ticker.tick().await;
				let expired: Vec<u32> = self
					.sessions
					.read()
					.await
					.iter()
					.filter(|(_, e)| e.idle_for() >= self.idle_timeout)
					.map(|(id, _)| *id)
					.collect();
				for id in expired {
					self.close_entry(id, "idle timeout").await;
				}
			}
		});
	}
}

fn parse_addr(raw: &str) -> Option<Address> {
	let (host, port) = raw.rsplit_once(':')?;
	let port: u16 = port.parse().ok()?;
	if let Ok(ip) = host.parse::<std::net::IpAddr>() {
		Some(Address::Ip(SocketAddr::new(ip, port)))
	} else {
		Some(Address::Domain(host.to_string(), port))
	}
}

/// `udp_idle_timeout` must fall in `[2s, 600s]`, defaulting to 60s (spec
/// §4.G).
pub fn clamp_udp_idle_timeout(configured: Duration) -> Duration {
	configured.clamp(Duration::from_secs(2), Duration::from_secs(600))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex as StdMutex;
	use tokio::sync::mpsc;

	struct EchoConn {
		tx: mpsc::UnboundedSender<Vec<u8>>,
		rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
	}

	impl UdpConn for EchoConn {
		fn send<'a>(&'a self, data: &'a [u8]) -> BoxFut<'a, std::io::Result<()>> {
			Box::pin(async move {
				let _ = self.tx.send(data.to_vec());
				Ok(())
			})
		}

		fn recv<'a>(&'a self, buf: &'a mut [u8]) -> BoxFut<'a, std::io::Result<usize>> {
			Box::pin(async move {
				let mut rx = self.rx.lock().await;
				match rx.recv().await {
					Some(data) => {
						let n = data.len().min(buf.len());
						buf[..n].copy_from_slice(&data[..n]);
						Ok(n)
					},
					None => Ok(0),
				}
			})
		}
	}

	struct EchoOutbound;

	impl UdpOutbound for EchoOutbound {
		fn dial<'a>(&'a self, _addr: &'a Address) -> BoxFut<'a, std::io::Result<Arc<dyn UdpConn>>> {
			Box::pin(async move {
				let (tx, rx) = mpsc::unbounded_channel();
				Ok(Arc::new(EchoConn { tx, rx: Mutex::new(rx) }) as Arc<dyn UdpConn>)
			})
		}
	}

	struct CapturingChannel {
		sent: StdMutex<Vec<Bytes>>,
	}

	impl DatagramChannel for CapturingChannel {
		fn send(&self, data: Bytes) -> Result<(), DatagramSendError> {
			self.sent.lock().unwrap().push(data);
			Ok(())
		}

		fn max_datagram_payload_size(&self) -> usize {
			1200
		}
	}

	#[tokio::test]
	async fn unknown_session_is_created_and_routes_to_outbound() {
		let channel = Arc::new(CapturingChannel { sent: StdMutex::new(Vec::new()) });
		let table = SessionTable::new(Arc::new(EchoOutbound), Arc::new(crate::hook::NoopHook), channel.clone(), Duration::from_secs(60));

		let msg = UdpMessage {
			session_id: 1,
			packet_id: 0,
			frag_id: 0,
			frag_count: 1,
			addr: "127.0.0.1:53".to_string(),
			data: Bytes::from_static(b"query"),
		};
		let mut buf = bytes::BytesMut::new();
		msg.encode(&mut buf);
		table.on_datagram(buf.freeze()).await;

		// give the spawned receive loop a moment to echo the reply back.
		for _ in 0..20 {
			tokio::task::yield_now().await;
			if !channel.sent.lock().unwrap().is_empty() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		let sent = channel.sent.lock().unwrap();
		assert_eq!(sent.len(), 1);
		let mut frozen = sent[0].clone();
		let echoed = UdpMessage::decode(&mut frozen).unwrap();
		assert_eq!(echoed.data, Bytes::from_static(b"query"));
		assert_eq!(echoed.session_id, 1);
	}

	#[test]
	fn idle_timeout_is_clamped_to_range() {
		assert_eq!(clamp_udp_idle_timeout(Duration::from_secs(1)), Duration::from_secs(2));
		assert_eq!(clamp_udp_idle_timeout(Duration::from_secs(1000)), Duration::from_secs(600));
		assert_eq!(clamp_udp_idle_timeout(Duration::from_secs(60)), Duration::from_secs(60));
	}
}
