//! Typed configuration surface (spec §6 "Hysteria config surface").
//!
//! These are data contracts only — decoding them from JSON/YAML/protobuf and
//! the CLI/process-lifecycle wrapper around that decoder are an explicit
//! non-goal; an external loader is expected to populate these structs.

use std::collections::HashMap;
use std::net::SocketAddr;

pub use protocol::config::{BandwidthConfig, ObfsConfig, ObfsKind, SalamanderConfig};
use protocol::hysteria::QuicSettings;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
	pub listen: SocketAddr,
	pub auth: AuthConfig,
	#[serde(default)]
	pub obfs: ObfsConfig,
	pub tls: ServerTlsConfig,
	#[serde(default)]
	pub quic: QuicSettings,
	#[serde(default)]
	pub bandwidth: BandwidthConfig,
	#[serde(default)]
	pub ignore_client_bandwidth: bool,
	#[serde(default)]
	pub disable_udp: bool,
	#[serde(default = "default_udp_idle_timeout")]
	pub udp_idle_timeout_secs: u64,
	#[serde(default)]
	pub rate_limit: RateLimitConfig,
}

fn default_udp_idle_timeout() -> u64 {
	60
}

/// Per-user uplink/downlink byte-rate cap (spec §3 "Server spec / memory
/// user"); `0` means unlimited. Applied uniformly to every authenticated
/// user until the config surface grows per-user overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
	#[serde(default)]
	pub up_bytes_per_sec: u64,
	#[serde(default)]
	pub down_bytes_per_sec: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
	Password { password: String },
	Userpass { userpass: HashMap<String, String> },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SniGuard {
	#[default]
	#[serde(rename = "")]
	Disabled,
	DnsSan,
	Strict,
	Disable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTlsConfig {
	pub cert: String,
	pub key: String,
	#[serde(default)]
	pub sni_guard: SniGuard,
}
