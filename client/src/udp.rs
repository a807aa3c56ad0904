//! UDP session manager, client side (spec §4.H "UDP session manager
//! (client)"). One instance per dialed connection; sessions are created
//! proactively via [`UdpSessionManager::new_udp`] rather than lazily on
//! first inbound packet the way the server side's table is.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use protocol::hysteria::message::{Defragmenter, UdpMessage, fragment};
use tokio::sync::{Mutex, RwLock, mpsc};

const SESSION_CHANNEL_CAPACITY: usize = 1024;

/// Error from sending a `UDPMessage` over the QUIC datagram channel,
/// distinguishing "too large for one datagram" (retry, fragmented) from
/// everything else (connection presumed dead).
pub enum DatagramSendError {
	TooLarge,
	Other(anyhow::Error),
}

/// The QUIC connection's unreliable-datagram channel, abstracted so the
/// session manager doesn't need to know about `quinn::Connection` directly.
pub trait DatagramChannel: Send + Sync {
	fn send(&self, data: Bytes) -> Result<(), DatagramSendError>;
	fn max_datagram_payload_size(&self) -> usize;
}

/// Sends `msg`, falling back to fragmenting with the channel's reported
/// datagram size if the transport rejects the whole message as too large
/// (spec §4.H, the same strategy the server side's session table uses).
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
	defrag: Mutex<Defragmenter>,
	incoming: mpsc::Sender<(String, Bytes)>,
}

/// Per-connection UDP session table. The transport's single receive loop
/// calls [`on_message`](Self::on_message) for every inbound `UDPMessage`;
/// unknown session ids are discarded per spec §4.H.
pub struct UdpSessionManager<C> {
	channel: Arc<C>,
	next_id: AtomicU32,
	sessions: RwLock<HashMap<u32, Arc<SessionEntry>>>,
}

impl<C: DatagramChannel + 'static> UdpSessionManager<C> {
	pub fn new(channel: Arc<C>) -> Arc<Self> {
		Arc::new(Self {
			channel,
			next_id: AtomicU32::new(1),
			sessions: RwLock::new(HashMap::new()),
		})
	}

	/// Allocates a new session id and returns a handle bound to it.
	pub async fn new_udp(self: &Arc<Self>) -> ClientUdpConn<C> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
		let entry = Arc::new(SessionEntry { defrag: Mutex::new(Defragmenter::new()), incoming: tx });
		self.sessions.write().await.insert(id, entry);
		ClientUdpConn { id, manager: self.clone(), rx: Mutex::new(rx) }
	}

	/// Feeds one datagram off the transport's receive path. Invalid frames
	/// and unknown session ids are dropped silently; a full per-session
	/// channel drops the completed packet rather than blocking the shared
	/// receive loop (spec §4.H).
	pub async fn on_message(self: &Arc<Self>, msg: UdpMessage) {
		let entry = match self.sessions.read().await.get(&msg.session_id) {
			Some(e) => e.clone(),
			None => return,
		};
		let completed = entry.defrag.lock().await.feed(msg);
		if let Some((addr, data)) = completed {
			if entry.incoming.try_send((addr, data)).is_err() {
				tracing::debug!("udp session receive channel full or closed, dropping packet");
			}
		}
	}

	async fn remove(&self, id: u32) {
		self.sessions.write().await.remove(&id);
	}
}

/// One client-side UDP "connection" backed by a session id on the shared
/// QUIC datagram channel.
pub struct ClientUdpConn<C> {
	id: u32,
	manager: Arc<UdpSessionManager<C>>,
	rx: Mutex<mpsc::Receiver<(String, Bytes)>>,
}

impl<C: DatagramChannel + 'static> ClientUdpConn<C> {
	pub fn id(&self) -> u32 {
		self.id
	}

	/// Sends one packet to `addr`, zero-fragmentation first.
	pub fn send(&self, addr: &str, data: Bytes) {
		let msg = UdpMessage { session_id: self.id, packet_id: 0, frag_id: 0, frag_count: 1, addr: addr.to_string(), data };
		send_udp_message(self.manager.channel.as_ref(), &msg);
	}

	/// Waits for the next reassembled packet, or `None` once the manager
	/// has dropped this session.
	pub async fn recv(&self) -> Option<(String, Bytes)> {
		self.rx.lock().await.recv().await
	}

	pub async fn close(&self) {
		self.manager.remove(self.id).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex as StdMutex;

	struct CapturingChannel {
		sent: StdMutex<Vec<Bytes>>,
		max_size: usize,
	}

	impl DatagramChannel for CapturingChannel {
		fn send(&self, data: Bytes) -> Result<(), DatagramSendError> {
			if data.len() > self.max_size {
				return Err(DatagramSendError::TooLarge);
			}
			self.sent.lock().unwrap().push(data);
			Ok(())
		}

		fn max_datagram_payload_size(&self) -> usize {
			self.max_size
		}
	}

	#[tokio::test]
	async fn new_udp_allocates_monotonic_ids() {
		let channel = Arc::new(CapturingChannel { sent: StdMutex::new(Vec::new()), max_size: 1200 });
		let manager = UdpSessionManager::new(channel);
		let a = manager.new_udp().await;
		let b = manager.new_udp().await;
		assert_eq!(a.id(), 1);
		assert_eq!(b.id(), 2);
	}

	#[tokio::test]
	async fn on_message_routes_to_matching_session_only() {
		let channel = Arc::new(CapturingChannel { sent: StdMutex::new(Vec::new()), max_size: 1200 });
		let manager = UdpSessionManager::new(channel);
		let a = manager.new_udp().await;
		let _b = manager.new_udp().await;

		let msg = UdpMessage {
			session_id: a.id(),
			packet_id: 0,
			frag_id: 0,
			frag_count: 1,
			addr: "127.0.0.1:53".to_string(),
			data: Bytes::from_static(b"hello"),
		};
		manager.on_message(msg).await;

		let (addr, data) = a.recv().await.unwrap();
		assert_eq!(addr, "127.0.0.1:53");
		assert_eq!(data, Bytes::from_static(b"hello"));
	}

	#[tokio::test]
	async fn unknown_session_id_is_discarded() {
		let channel = Arc::new(CapturingChannel { sent: StdMutex::new(Vec::new()), max_size: 1200 });
		let manager = UdpSessionManager::new(channel);
		let _a = manager.new_udp().await;

		let msg = UdpMessage {
			session_id: 999,
			packet_id: 0,
			frag_id: 0,
			frag_count: 1,
			addr: "127.0.0.1:53".to_string(),
			data: Bytes::from_static(b"hello"),
		};
		// must not panic and must not be observable on any session.
		manager.on_message(msg).await;
	}

	#[tokio::test]
	async fn send_falls_back_to_fragmentation_when_too_large() {
		let channel = Arc::new(CapturingChannel { sent: StdMutex::new(Vec::new()), max_size: 32 });
		let manager = UdpSessionManager::new(channel.clone());
		let conn = manager.new_udp().await;

		conn.send("127.0.0.1:53", Bytes::from(vec![7u8; 200]));

		let sent = channel.sent.lock().unwrap();
		assert!(sent.len() > 1);
		for frame in sent.iter() {
			assert!(frame.len() <= 32);
		}
	}
}
