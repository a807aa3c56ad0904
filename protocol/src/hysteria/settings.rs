//! QUIC transport defaults and validation shared by the server and client
//! engines (spec §4.H "Defaults and validation").

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicSettings {
	pub init_stream_receive_window: u64,
	pub max_stream_receive_window: u64,
	pub init_conn_receive_window: u64,
	pub max_conn_receive_window: u64,
	pub max_idle_timeout: Duration,
	pub keep_alive_period: Duration,
	pub disable_path_mtu_discovery: bool,
	pub max_incoming_streams: u32,
	pub udp_idle_timeout: Duration,
}

impl Default for QuicSettings {
	fn default() -> Self {
		Self {
			init_stream_receive_window: 8 * MIB,
			max_stream_receive_window: 8 * MIB,
			init_conn_receive_window: 20 * MIB,
			max_conn_receive_window: 20 * MIB,
			max_idle_timeout: Duration::from_secs(30),
			keep_alive_period: Duration::from_secs(10),
			disable_path_mtu_discovery: false,
			max_incoming_streams: 1024,
			udp_idle_timeout: Duration::from_secs(60),
		}
	}
}

impl QuicSettings {
	pub fn validate(&self) -> Result<(), ProtocolError> {
		in_range(self.max_idle_timeout, 4, 120, "max_idle_timeout")?;
		in_range(self.keep_alive_period, 2, 60, "keep_alive_period")?;
		in_range(self.udp_idle_timeout, 2, 600, "udp_idle_timeout")?;
		if self.max_incoming_streams < 8 {
			return Err(ProtocolError::protocol("max_incoming_streams must be >= 8"));
		}
		Ok(())
	}
}

fn in_range(d: Duration, min_secs: u64, max_secs: u64, field: &'static str) -> Result<(), ProtocolError> {
	if d < Duration::from_secs(min_secs) || d > Duration::from_secs(max_secs) {
		return Err(ProtocolError::protocol(format!(
			"{field} must be in [{min_secs}s, {max_secs}s], got {d:?}"
		)));
	}
	Ok(())
}

/// Bandwidth, if configured nonzero, must be at least 64 KiB/s (spec §4.H).
pub fn validate_bandwidth(bytes_per_sec: u64) -> Result<(), ProtocolError> {
	if bytes_per_sec != 0 && bytes_per_sec < 65536 {
		return Err(ProtocolError::protocol("bandwidth must be 0 or >= 65536 B/s"));
	}
	Ok(())
}

pub fn quic_defaults() -> QuicSettings {
	QuicSettings::default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_valid() {
		quic_defaults().validate().unwrap();
	}

	#[test]
	fn rejects_idle_timeout_out_of_range() {
		let mut s = QuicSettings::default();
		s.max_idle_timeout = Duration::from_secs(1);
		assert!(s.validate().is_err());
	}

	#[test]
	fn rejects_low_nonzero_bandwidth() {
		assert!(validate_bandwidth(1000).is_err());
		assert!(validate_bandwidth(0).is_ok());
		assert!(validate_bandwidth(65536).is_ok());
	}
}
