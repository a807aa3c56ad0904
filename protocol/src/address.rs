//! Type-tagged address codec shared by Shadowsocks and Trojan (spec §4.E).
//!
//! Wire shape: `type:u8 ‖ host ‖ port:u16-be`, where `type` is `0x01` for
//! IPv4, `0x04` for IPv6, `0x03` for a length-prefixed domain name. The type
//! byte's low nibble carries the tag; Shadowsocks masks it with `0x0F` before
//! matching, Trojan does not need to (its tag bytes are already bare).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
	Ip(SocketAddr),
	Domain(String, u16),
}

impl Address {
	pub fn port(&self) -> u16 {
		match self {
			Address::Ip(addr) => addr.port(),
			Address::Domain(_, port) => *port,
		}
	}

	/// Parses an address off the front of `buf`, masking the type tag with
	/// `0x0F` (Shadowsocks' scheme; a no-op for Trojan's already-bare tags).
	pub fn parse(buf: &mut Bytes) -> Result<Address, ProtocolError> {
		if buf.is_empty() {
			return Err(ProtocolError::protocol("empty address"));
		}
		let atyp = buf.get_u8() & 0x0F;
		let addr = match atyp {
			ATYP_IPV4 => {
				if buf.remaining() < 4 + 2 {
					return Err(ProtocolError::protocol("truncated ipv4 address"));
				}
				let mut octets = [0u8; 4];
				buf.copy_to_slice(&mut octets);
				let port = buf.get_u16();
				Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
			},
			ATYP_IPV6 => {
				if buf.remaining() < 16 + 2 {
					return Err(ProtocolError::protocol("truncated ipv6 address"));
				}
				let mut octets = [0u8; 16];
				buf.copy_to_slice(&mut octets);
				let port = buf.get_u16();
				Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
			},
			ATYP_DOMAIN => {
				if buf.remaining() < 1 {
					return Err(ProtocolError::protocol("truncated domain length"));
				}
				let len = buf.get_u8() as usize;
				if buf.remaining() < len + 2 {
					return Err(ProtocolError::protocol("truncated domain address"));
				}
				let host = String::from_utf8(buf.copy_to_bytes(len).to_vec())
					.map_err(|_| ProtocolError::protocol("domain is not valid utf-8"))?;
				let port = buf.get_u16();
				Address::Domain(host, port)
			},
			other => return Err(ProtocolError::protocol(format!("unknown address type {other}"))),
		};
		Ok(addr)
	}

	pub fn write(&self, out: &mut BytesMut) {
		match self {
			Address::Ip(SocketAddr::V4(v4)) => {
				out.put_u8(ATYP_IPV4);
				out.put_slice(&v4.ip().octets());
				out.put_u16(v4.port());
			},
			Address::Ip(SocketAddr::V6(v6)) => {
				out.put_u8(ATYP_IPV6);
				out.put_slice(&v6.ip().octets());
				out.put_u16(v6.port());
			},
			Address::Domain(host, port) => {
				out.put_u8(ATYP_DOMAIN);
				out.put_u8(host.len() as u8);
				out.put_slice(host.as_bytes());
				out.put_u16(*port);
			},
		}
	}

	pub fn encoded_len(&self) -> usize {
		match self {
			Address::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
			Address::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
			Address::Domain(host, _) => 1 + 1 + host.len() + 2,
		}
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Address::Ip(addr) => write!(f, "{addr}"),
			Address::Domain(host, port) => write!(f, "{host}:{port}"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_ipv4() {
		let addr = Address::Ip("1.2.3.4:80".parse().unwrap());
		let mut out = BytesMut::new();
		addr.write(&mut out);
		let mut bytes = out.freeze();
		assert_eq!(Address::parse(&mut bytes).unwrap(), addr);
	}

	#[test]
	fn round_trips_domain() {
		let addr = Address::Domain("example.com".to_string(), 443);
		let mut out = BytesMut::new();
		addr.write(&mut out);
		let mut bytes = out.freeze();
		assert_eq!(Address::parse(&mut bytes).unwrap(), addr);
	}

	#[test]
	fn masks_type_tag() {
		// Shadowsocks sometimes ORs extra high bits into the type byte; the
		// low nibble must still select the right variant.
		let mut buf = BytesMut::new();
		buf.put_u8(0xF0 | ATYP_IPV4);
		buf.put_slice(&[127, 0, 0, 1]);
		buf.put_u16(8080);
		let mut bytes = buf.freeze();
		assert_eq!(
			Address::parse(&mut bytes).unwrap(),
			Address::Ip("127.0.0.1:8080".parse().unwrap())
		);
	}
}
