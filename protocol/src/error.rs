//! Protocol-level error taxonomy (spec §7). These terminate only the session
//! they occur in; the server/client crates decide how far the failure
//! propagates.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
	#[error("malformed or unexpected framing: {0}")]
	Protocol(String),

	#[error("anti-replay filter rejected a duplicate iv/token")]
	Replay,

	#[error("validator could not identify a user")]
	NotFound,

	#[error("server refused to dial: {0}")]
	Dial(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl ProtocolError {
	pub fn protocol(msg: impl Into<String>) -> Self {
		ProtocolError::Protocol(msg.into())
	}
}
