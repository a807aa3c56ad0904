//! Server-side error taxonomy (spec §7), wrapping the shared kinds plus the
//! ones only the server engine can produce.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServeError {
	#[error(transparent)]
	Core(#[from] proxy_core::Error),

	#[error(transparent)]
	Protocol(#[from] protocol::ProtocolError),

	#[error("authentication rejected (status {0})")]
	Auth(u16),

	#[error("outbound dial refused: {0}")]
	Dial(String),

	#[error("traffic logger requested disconnect")]
	TrafficLimitExceeded,

	#[error(transparent)]
	Quic(#[from] quinn::ConnectionError),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error("tls/transport configuration: {0}")]
	Config(String),
}
