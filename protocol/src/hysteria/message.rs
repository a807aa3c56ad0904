//! Hysteria2 UDP message wire codec and defragmenter (spec §3, §4.F, §6).

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;

use super::varint;
use crate::error::ProtocolError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpMessage {
	pub session_id: u32,
	pub packet_id: u16,
	pub frag_id: u8,
	pub frag_count: u8,
	pub addr: String,
	pub data: Bytes,
}

impl UdpMessage {
	pub fn encode(&self, out: &mut BytesMut) {
		out.put_u32(self.session_id);
		out.put_u16(self.packet_id);
		out.put_u8(self.frag_id);
		out.put_u8(self.frag_count);
		varint::encode(self.addr.len() as u64, out);
		out.put_slice(self.addr.as_bytes());
		out.put_slice(&self.data);
	}

	pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
		if buf.remaining() < 4 + 2 + 1 + 1 {
			return Err(ProtocolError::protocol("truncated udp message header"));
		}
		let session_id = buf.get_u32();
		let packet_id = buf.get_u16();
		let frag_id = buf.get_u8();
		let frag_count = buf.get_u8();
		let addr_len = varint::decode(buf)? as usize;
		if buf.remaining() < addr_len {
			return Err(ProtocolError::protocol("truncated udp message address"));
		}
		let addr = String::from_utf8(buf.copy_to_bytes(addr_len).to_vec())
			.map_err(|_| ProtocolError::protocol("address is not valid utf-8"))?;
		let data = buf.copy_to_bytes(buf.remaining());
		Ok(Self {
			session_id,
			packet_id,
			frag_id,
			frag_count,
			addr,
			data,
		})
	}

	fn header_len(&self) -> usize {
		4 + 2 + 1 + 1 + varint::encoded_len(self.addr.len() as u64) + self.addr.len()
	}
}

/// Splits `data` into fragments of at most `max_datagram_payload_size` bytes
/// once header overhead is accounted for. Whole messages that fit in one
/// datagram use `packet_id=0, frag_id=0, frag_count=1`; fragmented messages
/// share one randomly chosen nonzero `packet_id`.
pub fn fragment(session_id: u32, addr: &str, data: &[u8], max_datagram_payload_size: usize) -> Vec<UdpMessage> {
	let probe = UdpMessage {
		session_id,
		packet_id: 0,
		frag_id: 0,
		frag_count: 1,
		addr: addr.to_string(),
		data: Bytes::new(),
	};
	let header_overhead = probe.header_len();
	if header_overhead + data.len() <= max_datagram_payload_size {
		return vec![UdpMessage {
			data: Bytes::copy_from_slice(data),
			..probe
		}];
	}

	let max_chunk = max_datagram_payload_size.saturating_sub(header_overhead).max(1);
	let chunks: Vec<&[u8]> = data.chunks(max_chunk).collect();
	let packet_id = loop {
		let candidate: u16 = rand::rng().random();
		if candidate != 0 {
			break candidate;
		}
	};
	chunks
		.iter()
		.enumerate()
		.map(|(i, chunk)| UdpMessage {
			session_id,
			packet_id,
			frag_id: i as u8,
			frag_count: chunks.len() as u8,
			addr: addr.to_string(),
			data: Bytes::copy_from_slice(chunk),
		})
		.collect()
}

struct Partial {
	addr: String,
	frag_count: u8,
	received: u8,
	fragments: Vec<Option<Bytes>>,
}

/// Reassembles fragmented `UdpMessage`s keyed by `(session_id, packet_id)`.
/// A new `packet_id` arriving for an already-tracked session drops that
/// session's stale partial, per spec §4.F.
#[derive(Default)]
pub struct Defragmenter {
	partials: HashMap<(u32, u16), Partial>,
	last_packet_id: HashMap<u32, u16>,
}

impl Defragmenter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Feeds one message; returns the reassembled `(addr, data)` once every
	/// fragment has arrived (in any order). Whole (non-fragmented) messages
	/// complete immediately.
	pub fn feed(&mut self, msg: UdpMessage) -> Option<(String, Bytes)> {
		if msg.frag_count <= 1 {
			return Some((msg.addr, msg.data));
		}

		if let Some(&last) = self.last_packet_id.get(&msg.session_id) {
			if last != msg.packet_id {
				self.partials.remove(&(msg.session_id, last));
			}
		}
		self.last_packet_id.insert(msg.session_id, msg.packet_id);

		let key = (msg.session_id, msg.packet_id);
		let frag_count = msg.frag_count;
		let frag_id = msg.frag_id as usize;
		let entry = self.partials.entry(key).or_insert_with(|| Partial {
			addr: msg.addr.clone(),
			frag_count,
			received: 0,
			fragments: vec![None; frag_count as usize],
		});
		if frag_id >= entry.fragments.len() {
			return None;
		}
		if entry.fragments[frag_id].is_none() {
			entry.fragments[frag_id] = Some(msg.data);
			entry.received += 1;
		}
		if entry.received < entry.frag_count {
			return None;
		}

		let partial = self.partials.remove(&key).unwrap();
		let mut out = BytesMut::new();
		for frag in partial.fragments.into_iter() {
			out.put_slice(&frag.expect("received count matched frag_count"));
		}
		Some((partial.addr, out.freeze()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn whole_message_round_trips() {
		let msg = UdpMessage {
			session_id: 7,
			packet_id: 0,
			frag_id: 0,
			frag_count: 1,
			addr: "example.com:53".to_string(),
			data: Bytes::from_static(b"query"),
		};
		let mut buf = BytesMut::new();
		msg.encode(&mut buf);
		let mut frozen = buf.freeze();
		assert_eq!(UdpMessage::decode(&mut frozen).unwrap(), msg);
	}

	#[test]
	fn fragments_reassemble_out_of_order() {
		let data = vec![0xABu8; 5 * 1024];
		let fragments = fragment(1, "1.1.1.1:53", &data, 1024);
		assert!(fragments.len() > 1);

		let mut defrag = Defragmenter::new();
		let mut reassembled = None;
		for msg in fragments.into_iter().rev() {
			reassembled = defrag.feed(msg);
		}
		let (addr, out) = reassembled.unwrap();
		assert_eq!(addr, "1.1.1.1:53");
		assert_eq!(out.len(), data.len());
		assert_eq!(&out[..], &data[..]);
	}

	#[test]
	fn stale_packet_id_is_dropped() {
		let data = vec![0x11u8; 3000];
		let mut fragments = fragment(1, "a", &data, 1024);
		let mut defrag = Defragmenter::new();
		// Feed only the first fragment of the first packet, then start a new
		// packet for the same session — the stale partial must be dropped.
		defrag.feed(fragments.remove(0));
		let mut next = fragment(1, "a", &vec![0x22u8; 3000], 1024);
		let mut result = None;
		for msg in next.drain(..) {
			result = defrag.feed(msg);
		}
		let (_, out) = result.unwrap();
		assert_eq!(out[0], 0x22);
	}
}
