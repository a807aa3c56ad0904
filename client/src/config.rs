//! Typed configuration surface (spec §6 "Hysteria config surface").
//!
//! Data contracts only — decoding from JSON/YAML/protobuf is an explicit
//! non-goal; an external loader populates these structs.

use protocol::config::{BandwidthConfig, ObfsConfig};
use protocol::hysteria::QuicSettings;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
	pub server: String,
	pub auth: String,
	#[serde(default)]
	pub obfs: ObfsConfig,
	pub tls: ClientTlsConfig,
	#[serde(default)]
	pub quic: QuicSettings,
	#[serde(default)]
	pub bandwidth: BandwidthConfig,
	#[serde(default)]
	pub fast_open: bool,
}

/// TLS verification knobs the client side needs that the server side
/// doesn't (spec §6): `insecure` skips verification entirely, `pin_sha256`
/// pins a specific leaf certificate hash instead. Loading these into a
/// `rustls::ClientConfig` is this crate's job; reading the PEM/hash off
/// disk is the named non-goal.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTlsConfig {
	#[serde(default)]
	pub sni: Option<String>,
	#[serde(default)]
	pub insecure: bool,
	#[serde(default)]
	pub pin_sha256: Option<String>,
	#[serde(default)]
	pub ca: Option<String>,
	#[serde(default)]
	pub client_certificate: Option<String>,
	#[serde(default)]
	pub client_key: Option<String>,
}
