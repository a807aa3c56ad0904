//! Trojan TCP/UDP framing and lock-free concurrent-map validator (spec
//! §4.E, §6).

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha224};

use crate::address::Address;
use crate::error::ProtocolError;

const HASH_LEN: usize = 56;
const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x03;
const MAX_UDP_PAYLOAD: usize = 8192;

#[derive(Clone, Debug)]
pub struct User {
	pub email: String,
	pub password: String,
}

/// Two lock-free concurrent maps (spec §5): email→user, and the 56-byte hex
/// password hash→user used to authenticate inbound connections.
pub struct Validator {
	by_hash: flurry::HashMap<String, Arc<User>>,
	by_email: flurry::HashMap<String, Arc<User>>,
}

impl Default for Validator {
	fn default() -> Self {
		Self {
			by_hash: flurry::HashMap::new(),
			by_email: flurry::HashMap::new(),
		}
	}
}

pub fn password_hash(password: &str) -> String {
	hex::encode(Sha224::digest(password.as_bytes()))
}

impl Validator {
	/// Empty email skips the email map; a duplicate non-empty email rejects
	/// the add.
	pub fn add(&self, user: User) -> Result<(), ProtocolError> {
		if !user.email.is_empty() {
			let guard = self.by_email.guard();
			if self.by_email.get(&user.email, &guard).is_some() {
				return Err(ProtocolError::protocol(format!(
					"duplicate trojan email {}",
					user.email
				)));
			}
		}
		let hash = password_hash(&user.password);
		let user = Arc::new(user);
		{
			let guard = self.by_hash.guard();
			self.by_hash.insert(hash, user.clone(), &guard);
		}
		if !user.email.is_empty() {
			let guard = self.by_email.guard();
			self.by_email.insert(user.email.clone(), user, &guard);
		}
		Ok(())
	}

	pub fn remove_by_email(&self, email: &str) {
		let user = {
			let guard = self.by_email.guard();
			self.by_email.get(email, &guard).cloned()
		};
		if let Some(user) = user {
			let hash = password_hash(&user.password);
			let guard = self.by_hash.guard();
			self.by_hash.remove(&hash, &guard);
			let guard = self.by_email.guard();
			self.by_email.remove(email, &guard);
		}
	}

	pub fn get_by_hash(&self, hash: &str) -> Option<Arc<User>> {
		let guard = self.by_hash.guard();
		self.by_hash.get(hash, &guard).cloned()
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
	Tcp,
	Udp,
}

/// Parses the Trojan TCP lead: 56-byte hex hash, CRLF, command byte,
/// address, CRLF. Returns the matched user, command, address, and the
/// number of bytes consumed from `buf` so the caller can hand the rest off
/// as payload. A sub-56-byte or malformed lead is the caller's cue to fall
/// back to a masquerade/passthrough path (mirrors spec §4.G's auth-failure
/// fallback).
pub fn read_tcp_header(validator: &Validator, buf: &[u8]) -> Result<(Arc<User>, Command, Address, usize), ProtocolError> {
	if buf.len() < HASH_LEN + 2 {
		return Err(ProtocolError::protocol("short trojan lead"));
	}
	let hash = std::str::from_utf8(&buf[..HASH_LEN]).map_err(|_| ProtocolError::protocol("non-utf8 hash"))?;
	let user = validator.get_by_hash(hash).ok_or(ProtocolError::NotFound)?;
	if &buf[HASH_LEN..HASH_LEN + 2] != b"\r\n" {
		return Err(ProtocolError::protocol("missing crlf after hash"));
	}
	let mut rest = Bytes::copy_from_slice(&buf[HASH_LEN + 2..]);
	if rest.remaining() < 1 {
		return Err(ProtocolError::protocol("missing command byte"));
	}
	let cmd_byte = rest.get_u8();
	let command = match cmd_byte {
		CMD_TCP => Command::Tcp,
		CMD_UDP => Command::Udp,
		other => return Err(ProtocolError::protocol(format!("unknown trojan command {other}"))),
	};
	let consumed_before_addr = HASH_LEN + 2 + 1;
	let addr = Address::parse(&mut rest)?;
	let consumed_addr = buf.len() - rest.remaining() - consumed_before_addr;
	if rest.remaining() < 2 || &rest[..2] != b"\r\n" {
		return Err(ProtocolError::protocol("missing crlf after address"));
	}
	rest.advance(2);
	let total_consumed = consumed_before_addr + consumed_addr + 2;
	Ok((user, command, addr, total_consumed))
}

pub fn write_tcp_header(user: &User, command: Command, addr: &Address, out: &mut BytesMut) {
	out.put_slice(password_hash(&user.password).as_bytes());
	out.put_slice(b"\r\n");
	out.put_u8(match command {
		Command::Tcp => CMD_TCP,
		Command::Udp => CMD_UDP,
	});
	addr.write(out);
	out.put_slice(b"\r\n");
}

/// One Trojan UDP frame inside an already-authenticated TCP-framed stream:
/// `address ‖ u16-be length ‖ "\r\n" ‖ payload`.
pub fn read_udp_frame(buf: &mut Bytes) -> Result<(Address, Bytes), ProtocolError> {
	let addr = Address::parse(buf)?;
	if buf.remaining() < 2 {
		return Err(ProtocolError::protocol("truncated udp frame length"));
	}
	let len = buf.get_u16() as usize;
	if len > MAX_UDP_PAYLOAD {
		return Err(ProtocolError::protocol("trojan udp frame exceeds 8192 bytes"));
	}
	if buf.remaining() < 2 {
		return Err(ProtocolError::protocol("truncated udp frame crlf"));
	}
	if &buf[..2] != b"\r\n" {
		return Err(ProtocolError::protocol("missing crlf in udp frame"));
	}
	buf.advance(2);
	if buf.remaining() < len {
		return Err(ProtocolError::protocol("truncated udp frame payload"));
	}
	let payload = buf.copy_to_bytes(len);
	Ok((addr, payload))
}

pub fn write_udp_frame(addr: &Address, payload: &[u8], out: &mut BytesMut) -> Result<(), ProtocolError> {
	if payload.len() > MAX_UDP_PAYLOAD {
		return Err(ProtocolError::protocol("trojan udp frame exceeds 8192 bytes"));
	}
	addr.write(out);
	out.put_u16(payload.len() as u16);
	out.put_slice(b"\r\n");
	out.put_slice(payload);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tcp_header_round_trips() {
		let validator = Validator::default();
		validator
			.add(User {
				email: "alice@example.com".to_string(),
				password: "hunter2".to_string(),
			})
			.unwrap();

		let addr = Address::Domain("example.com".to_string(), 443);
		let user = User {
			email: "alice@example.com".to_string(),
			password: "hunter2".to_string(),
		};
		let mut buf = BytesMut::new();
		write_tcp_header(&user, Command::Tcp, &addr, &mut buf);

		let (matched, command, parsed_addr, consumed) = read_tcp_header(&validator, &buf).unwrap();
		assert_eq!(matched.email, "alice@example.com");
		assert_eq!(command, Command::Tcp);
		assert_eq!(parsed_addr, addr);
		assert_eq!(consumed, buf.len());
	}

	#[test]
	fn duplicate_email_rejected() {
		let validator = Validator::default();
		validator
			.add(User {
				email: "bob@example.com".to_string(),
				password: "a".to_string(),
			})
			.unwrap();
		let err = validator
			.add(User {
				email: "bob@example.com".to_string(),
				password: "b".to_string(),
			})
			.unwrap_err();
		assert!(matches!(err, ProtocolError::Protocol(_)));
	}

	#[test]
	fn udp_frame_round_trips() {
		let addr = Address::Ip("1.1.1.1:53".parse().unwrap());
		let mut buf = BytesMut::new();
		write_udp_frame(&addr, b"query", &mut buf).unwrap();
		let mut frozen = buf.freeze();
		let (parsed_addr, payload) = read_udp_frame(&mut frozen).unwrap();
		assert_eq!(parsed_addr, addr);
		assert_eq!(&payload[..], b"query");
	}

	#[test]
	fn udp_frame_rejects_oversized_length() {
		let addr = Address::Ip("1.1.1.1:53".parse().unwrap());
		let mut buf = BytesMut::new();
		addr.write(&mut buf);
		buf.put_u16(9000);
		buf.put_slice(b"\r\n");
		let mut frozen = buf.freeze();
		assert!(read_udp_frame(&mut frozen).is_err());
	}
}
