//! Client-side error taxonomy (spec §7), wrapping the shared kinds plus the
//! ones only the dialing/auth path can produce.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
	#[error(transparent)]
	Core(#[from] proxy_core::Error),

	#[error(transparent)]
	Protocol(#[from] protocol::ProtocolError),

	/// Server rejected authentication. Per spec §7, the client must not
	/// retry auth automatically on this error.
	#[error("authentication rejected (status {0})")]
	Auth(u16),

	#[error("server refused to open stream: {0}")]
	Dial(String),

	#[error("traffic limit exceeded")]
	TrafficLimitExceeded,

	#[error(transparent)]
	Quic(#[from] quinn::ConnectionError),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("tls/transport configuration: {0}")]
	Config(String),
}

impl ClientError {
	/// True for the distinguished error the lazy-reconnecting wrapper uses
	/// to decide whether to re-dial (spec §4.H).
	pub fn is_closed(&self) -> bool {
		match self {
			ClientError::Core(e) => e.is_closed(),
			ClientError::Quic(_) | ClientError::Io(_) => true,
			_ => false,
		}
	}
}
