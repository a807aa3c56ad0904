//! HTTP/3-lite auth endpoint codec (spec §4.K, an expansion of §4.G/§6).
//!
//! Rather than depending on `h3`/`h3-quinn` for a single POST exchange, this
//! reimplements exactly the two endpoints the protocol uses as a compact
//! header-list frame over a QUIC stream: a request frame (method, path,
//! headers) and a response frame (status, headers). This preserves the
//! wire-level contract spec §8 tests against (status 233, header names)
//! without pulling in a speculative HTTP/3 crate dependency.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::varint;
use crate::error::ProtocolError;

pub const AUTH_HOST: &str = "hysteria";
pub const AUTH_PATH: &str = "/auth";
pub const STATUS_AUTH_OK: u16 = 233;

pub const HEADER_AUTH: &str = "Hysteria-Auth";
pub const HEADER_CC_RX: &str = "Hysteria-CC-RX";
pub const HEADER_UDP: &str = "Hysteria-UDP";
pub const HEADER_PADDING: &str = "Hysteria-Padding";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
		self.0.push((name.into(), value.into()));
		self
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self
			.0
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	fn encode(&self, out: &mut BytesMut) {
		varint::encode(self.0.len() as u64, out);
		for (name, value) in &self.0 {
			varint::encode(name.len() as u64, out);
			out.put_slice(name.as_bytes());
			varint::encode(value.len() as u64, out);
			out.put_slice(value.as_bytes());
		}
	}

	fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
		let count = varint::decode(buf)?;
		let mut headers = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let name_len = varint::decode(buf)? as usize;
			if buf.remaining() < name_len {
				return Err(ProtocolError::protocol("truncated header name"));
			}
			let name = String::from_utf8(buf.copy_to_bytes(name_len).to_vec())
				.map_err(|_| ProtocolError::protocol("header name is not valid utf-8"))?;
			let value_len = varint::decode(buf)? as usize;
			if buf.remaining() < value_len {
				return Err(ProtocolError::protocol("truncated header value"));
			}
			let value = String::from_utf8(buf.copy_to_bytes(value_len).to_vec())
				.map_err(|_| ProtocolError::protocol("header value is not valid utf-8"))?;
			headers.push((name, value));
		}
		Ok(Self(headers))
	}
}

#[derive(Clone, Debug)]
pub struct AuthRequest {
	pub method: String,
	pub path: String,
	pub headers: HeaderList,
}

impl AuthRequest {
	pub fn encode(&self, out: &mut BytesMut) {
		varint::encode(self.method.len() as u64, out);
		out.put_slice(self.method.as_bytes());
		varint::encode(self.path.len() as u64, out);
		out.put_slice(self.path.as_bytes());
		self.headers.encode(out);
	}

	pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
		let method_len = varint::decode(buf)? as usize;
		if buf.remaining() < method_len {
			return Err(ProtocolError::protocol("truncated method"));
		}
		let method = String::from_utf8(buf.copy_to_bytes(method_len).to_vec())
			.map_err(|_| ProtocolError::protocol("method is not valid utf-8"))?;
		let path_len = varint::decode(buf)? as usize;
		if buf.remaining() < path_len {
			return Err(ProtocolError::protocol("truncated path"));
		}
		let path = String::from_utf8(buf.copy_to_bytes(path_len).to_vec())
			.map_err(|_| ProtocolError::protocol("path is not valid utf-8"))?;
		let headers = HeaderList::decode(buf)?;
		Ok(Self { method, path, headers })
	}

	/// True only for `POST /auth` — the one request this server ever
	/// handles; anything else falls through to the masquerade handler.
	pub fn is_auth_post(&self) -> bool {
		self.method.eq_ignore_ascii_case("POST") && self.path == AUTH_PATH
	}
}

/// `body` carries the masquerade handler's response body on auth failure
/// (spec §4.G "forward the request to a masquerade handler"); empty on the
/// success path.
#[derive(Clone, Debug)]
pub struct AuthResponse {
	pub status: u16,
	pub headers: HeaderList,
	pub body: Vec<u8>,
}

impl AuthResponse {
	pub fn encode(&self, out: &mut BytesMut) {
		out.put_u16(self.status);
		self.headers.encode(out);
		varint::encode(self.body.len() as u64, out);
		out.put_slice(&self.body);
	}

	pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
		if buf.remaining() < 2 {
			return Err(ProtocolError::protocol("truncated status code"));
		}
		let status = buf.get_u16();
		let headers = HeaderList::decode(buf)?;
		let body_len = varint::decode(buf)? as usize;
		if buf.remaining() < body_len {
			return Err(ProtocolError::protocol("truncated body"));
		}
		let body = buf.copy_to_bytes(body_len).to_vec();
		Ok(Self { status, headers, body })
	}

	pub fn is_auth_ok(&self) -> bool {
		self.status == STATUS_AUTH_OK
	}
}

/// Whole frames are length-prefixed on the wire so a stream reader knows
/// how many bytes to buffer before calling [`AuthRequest::decode`] /
/// [`AuthResponse::decode`], which both require the complete frame.
async fn read_frame_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes, ProtocolError> {
	let mut len_buf = Vec::new();
	loop {
		let byte = r.read_u8().await?;
		len_buf.push(byte);
		if byte & 0x80 == 0 {
			break;
		}
	}
	let mut len_bytes = Bytes::from(len_buf);
	let len = varint::decode(&mut len_bytes)? as usize;
	let mut frame = vec![0u8; len];
	r.read_exact(&mut frame).await?;
	Ok(Bytes::from(frame))
}

async fn write_frame_async<W: AsyncWrite + Unpin>(w: &mut W, frame: &BytesMut) -> Result<(), ProtocolError> {
	let mut out = BytesMut::with_capacity(varint::encoded_len(frame.len() as u64) + frame.len());
	varint::encode(frame.len() as u64, &mut out);
	out.put_slice(frame);
	w.write_all(&out).await?;
	Ok(())
}

pub async fn read_auth_request_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<AuthRequest, ProtocolError> {
	let mut frame = read_frame_async(r).await?;
	AuthRequest::decode(&mut frame)
}

pub async fn write_auth_request_async<W: AsyncWrite + Unpin>(w: &mut W, req: &AuthRequest) -> Result<(), ProtocolError> {
	let mut buf = BytesMut::new();
	req.encode(&mut buf);
	write_frame_async(w, &buf).await
}

pub async fn read_auth_response_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<AuthResponse, ProtocolError> {
	let mut frame = read_frame_async(r).await?;
	AuthResponse::decode(&mut frame)
}

pub async fn write_auth_response_async<W: AsyncWrite + Unpin>(w: &mut W, resp: &AuthResponse) -> Result<(), ProtocolError> {
	let mut buf = BytesMut::new();
	resp.encode(&mut buf);
	write_frame_async(w, &buf).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn auth_request_round_trips() {
		let mut headers = HeaderList::new();
		headers.push(HEADER_AUTH, "pass123");
		headers.push(HEADER_CC_RX, "auto");
		headers.push(HEADER_PADDING, "x".repeat(300));
		let req = AuthRequest {
			method: "POST".to_string(),
			path: AUTH_PATH.to_string(),
			headers,
		};
		let mut buf = BytesMut::new();
		req.encode(&mut buf);
		let mut frozen = buf.freeze();
		let decoded = AuthRequest::decode(&mut frozen).unwrap();
		assert!(decoded.is_auth_post());
		assert_eq!(decoded.headers.get(HEADER_AUTH), Some("pass123"));
	}

	#[test]
	fn auth_response_round_trips() {
		let mut headers = HeaderList::new();
		headers.push(HEADER_UDP, "true");
		let resp = AuthResponse {
			status: STATUS_AUTH_OK,
			headers,
			body: Vec::new(),
		};
		let mut buf = BytesMut::new();
		resp.encode(&mut buf);
		let mut frozen = buf.freeze();
		let decoded = AuthResponse::decode(&mut frozen).unwrap();
		assert!(decoded.is_auth_ok());
		assert_eq!(decoded.headers.get(HEADER_UDP), Some("true"));
	}

	#[test]
	fn masquerade_response_carries_a_body() {
		let resp = AuthResponse {
			status: 404,
			headers: HeaderList::new(),
			body: b"404 page not found".to_vec(),
		};
		let mut buf = BytesMut::new();
		resp.encode(&mut buf);
		let mut frozen = buf.freeze();
		let decoded = AuthResponse::decode(&mut frozen).unwrap();
		assert!(!decoded.is_auth_ok());
		assert_eq!(decoded.body, b"404 page not found");
	}

	#[tokio::test]
	async fn async_auth_request_and_response_round_trip_over_a_stream() {
		let (mut client, mut server) = tokio::io::duplex(4096);

		let mut headers = HeaderList::new();
		headers.push(HEADER_AUTH, "pass123");
		let req = AuthRequest {
			method: "POST".to_string(),
			path: AUTH_PATH.to_string(),
			headers,
		};
		write_auth_request_async(&mut client, &req).await.unwrap();
		let decoded_req = read_auth_request_async(&mut server).await.unwrap();
		assert!(decoded_req.is_auth_post());
		assert_eq!(decoded_req.headers.get(HEADER_AUTH), Some("pass123"));

		let mut resp_headers = HeaderList::new();
		resp_headers.push(HEADER_UDP, "true");
		let resp = AuthResponse {
			status: STATUS_AUTH_OK,
			headers: resp_headers,
			body: Vec::new(),
		};
		write_auth_response_async(&mut server, &resp).await.unwrap();
		let decoded_resp = read_auth_response_async(&mut client).await.unwrap();
		assert!(decoded_resp.is_auth_ok());
	}
}
