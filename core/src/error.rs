//! Shared error taxonomy (spec §7), the part common to both the client and
//! server engines. Protocol-framing and serve-loop errors live closer to
//! their crates (`protocol::ProtocolError`, `server::ServeError`,
//! `client::ClientError`) and wrap these variants.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
	#[error("invalid configuration field {field}: {reason}")]
	ConfigError { field: String, reason: String },

	#[error("connect failed: {0}")]
	ConnectError(#[source] anyhow::Error),

	/// Use of a closed connection. The lazy-reconnecting client treats this
	/// as the trigger to re-dial rather than propagate.
	#[error("connection closed{}", cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
	ClosedError { cause: Option<String> },
}

impl Error {
	pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
		Error::ConfigError {
			field: field.into(),
			reason: reason.into(),
		}
	}

	pub fn closed(cause: Option<String>) -> Self {
		Error::ClosedError { cause }
	}

	/// True for the distinguished error the lazy client uses to decide
	/// whether to reconnect (spec §4.H).
	pub fn is_closed(&self) -> bool {
		matches!(self, Error::ClosedError { .. })
	}
}
