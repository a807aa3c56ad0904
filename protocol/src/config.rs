//! Config fragments shared verbatim between the server and client config
//! surfaces (spec §6): obfuscation selection and raw bandwidth strings.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObfsConfig {
	#[serde(rename = "type", default)]
	pub kind: ObfsKind,
	#[serde(default)]
	pub salamander: Option<SalamanderConfig>,
}

impl ObfsConfig {
	/// `"salamander"` is a recognized wire value (spec §6, §9 glossary) but
	/// has no packet-transform wired into the QUIC socket path yet — reject
	/// it here rather than silently accepting a config that has no effect.
	pub fn validate(&self) -> Result<(), ProtocolError> {
		match self.kind {
			ObfsKind::None | ObfsKind::Plain => Ok(()),
			ObfsKind::Salamander => Err(ProtocolError::protocol(
				"obfs.type \"salamander\" is configured but not implemented by this engine",
			)),
		}
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObfsKind {
	#[default]
	#[serde(rename = "")]
	None,
	Plain,
	Salamander,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SalamanderConfig {
	pub password: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BandwidthConfig {
	/// Raw strings like `"100 mbps"`; parsing bandwidth strings into bytes/s
	/// is an explicit non-goal, left to the external decoder. Already-decoded
	/// byte rates belong in `up_bytes_per_sec`/`down_bytes_per_sec`.
	#[serde(default)]
	pub up: Option<String>,
	#[serde(default)]
	pub down: Option<String>,
	#[serde(default)]
	pub up_bytes_per_sec: u64,
	#[serde(default)]
	pub down_bytes_per_sec: u64,
}
