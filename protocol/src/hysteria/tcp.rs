//! Hysteria2 TCP request/response framing, including the random ASCII
//! padding used to defeat traffic-length fingerprinting (spec §4.F, §6).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::varint;
use crate::error::ProtocolError;

/// The single frame-type byte a stream hijacker reads off every QUIC
/// bidirectional stream opened after authentication (spec §4.G). Any other
/// value is declined (the stream is closed, not served).
pub const FRAME_TYPE_TCP_REQUEST: u8 = 0x01;

/// `[min, max)` padding length ranges named in spec §4.F.
pub const AUTH_PADDING_RANGE: (usize, usize) = (256, 2048);
pub const TCP_REQUEST_PADDING_RANGE: (usize, usize) = (64, 512);
pub const TCP_RESPONSE_PADDING_RANGE: (usize, usize) = (128, 1024);

pub fn random_padding(range: (usize, usize)) -> String {
	let len = rand::rng().random_range(range.0..range.1);
	rand::rng()
		.sample_iter(&Alphanumeric)
		.take(len)
		.map(char::from)
		.collect()
}

fn write_length_prefixed(s: &str, out: &mut BytesMut) {
	varint::encode(s.len() as u64, out);
	out.put_slice(s.as_bytes());
}

fn read_length_prefixed(buf: &mut Bytes) -> Result<String, ProtocolError> {
	let len = varint::decode(buf)? as usize;
	if buf.remaining() < len {
		return Err(ProtocolError::protocol("truncated length-prefixed field"));
	}
	String::from_utf8(buf.copy_to_bytes(len).to_vec()).map_err(|_| ProtocolError::protocol("field is not valid utf-8"))
}

/// Client → server: `varint(addr_len) ‖ addr ‖ varint(padding_len) ‖ padding`.
pub fn write_tcp_request(addr: &str, out: &mut BytesMut) {
	write_length_prefixed(addr, out);
	write_length_prefixed(&random_padding(TCP_REQUEST_PADDING_RANGE), out);
}

pub fn read_tcp_request(buf: &mut Bytes) -> Result<String, ProtocolError> {
	let addr = read_length_prefixed(buf)?;
	let _padding = read_length_prefixed(buf)?;
	Ok(addr)
}

/// Server → client: `status:u8(1=ok,0=error) ‖ varint(message_len) ‖ message
/// ‖ varint(padding_len) ‖ padding`.
pub fn write_tcp_response(ok: bool, message: &str, out: &mut BytesMut) {
	out.put_u8(if ok { 1 } else { 0 });
	write_length_prefixed(message, out);
	write_length_prefixed(&random_padding(TCP_RESPONSE_PADDING_RANGE), out);
}

pub fn read_tcp_response(buf: &mut Bytes) -> Result<(bool, String), ProtocolError> {
	if buf.remaining() < 1 {
		return Err(ProtocolError::protocol("truncated tcp response status"));
	}
	let ok = buf.get_u8() == 1;
	let message = read_length_prefixed(buf)?;
	let _padding = read_length_prefixed(buf)?;
	Ok((ok, message))
}

async fn read_varint_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, ProtocolError> {
	let mut value: u64 = 0;
	let mut shift = 0u32;
	loop {
		if shift >= 64 {
			return Err(ProtocolError::protocol("varint too long"));
		}
		let byte = r.read_u8().await?;
		value |= ((byte & 0x7F) as u64) << shift;
		if byte & 0x80 == 0 {
			return Ok(value);
		}
		shift += 7;
	}
}

async fn read_length_prefixed_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
	let len = read_varint_async(r).await? as usize;
	let mut buf = vec![0u8; len];
	r.read_exact(&mut buf).await?;
	String::from_utf8(buf).map_err(|_| ProtocolError::protocol("field is not valid utf-8"))
}

/// Stream-reading counterpart of [`read_tcp_request`], for callers that only
/// have an `AsyncRead` half of a QUIC stream rather than a pre-buffered
/// frame.
pub async fn read_tcp_request_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
	let addr = read_length_prefixed_async(r).await?;
	let _padding = read_length_prefixed_async(r).await?;
	Ok(addr)
}

pub async fn write_tcp_request_async<W: AsyncWrite + Unpin>(w: &mut W, addr: &str) -> Result<(), ProtocolError> {
	let mut buf = BytesMut::new();
	write_tcp_request(addr, &mut buf);
	w.write_all(&buf).await?;
	Ok(())
}

/// Stream-reading counterpart of [`read_tcp_response`].
pub async fn read_tcp_response_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<(bool, String), ProtocolError> {
	let ok = r.read_u8().await? == 1;
	let message = read_length_prefixed_async(r).await?;
	let _padding = read_length_prefixed_async(r).await?;
	Ok((ok, message))
}

pub async fn write_tcp_response_async<W: AsyncWrite + Unpin>(w: &mut W, ok: bool, message: &str) -> Result<(), ProtocolError> {
	let mut buf = BytesMut::new();
	write_tcp_response(ok, message, &mut buf);
	w.write_all(&buf).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_round_trips() {
		let mut buf = BytesMut::new();
		write_tcp_request("example.com:80", &mut buf);
		let mut frozen = buf.freeze();
		assert_eq!(read_tcp_request(&mut frozen).unwrap(), "example.com:80");
	}

	#[test]
	fn response_round_trips() {
		let mut buf = BytesMut::new();
		write_tcp_response(true, "Connected", &mut buf);
		let mut frozen = buf.freeze();
		let (ok, message) = read_tcp_response(&mut frozen).unwrap();
		assert!(ok);
		assert_eq!(message, "Connected");
	}

	#[test]
	fn padding_length_is_within_range() {
		for _ in 0..50 {
			let padding = random_padding(TCP_REQUEST_PADDING_RANGE);
			assert!(padding.len() >= TCP_REQUEST_PADDING_RANGE.0);
			assert!(padding.len() < TCP_REQUEST_PADDING_RANGE.1);
		}
	}

	#[tokio::test]
	async fn async_request_and_response_round_trip_over_a_stream() {
		let (mut client, mut server) = tokio::io::duplex(4096);
		write_tcp_request_async(&mut client, "example.com:443").await.unwrap();
		let addr = read_tcp_request_async(&mut server).await.unwrap();
		assert_eq!(addr, "example.com:443");

		write_tcp_response_async(&mut server, true, "Connected").await.unwrap();
		let (ok, message) = read_tcp_response_async(&mut client).await.unwrap();
		assert!(ok);
		assert_eq!(message, "Connected");
	}
}
