//! Hysteria2 protocol framing (spec §3, §4.F, §4.K, §6): UDP message wire
//! codec + defragmenter, TCP request/response framing with padding, the
//! HTTP/3-lite auth header codec, and shared QUIC transport defaults.

pub mod auth;
pub mod message;
pub mod settings;
pub mod tcp;
pub mod varint;

pub use message::{Defragmenter, UdpMessage, fragment};
pub use settings::{QuicSettings, quic_defaults, validate_bandwidth};

/// QUIC close codes (spec §6).
pub const CLOSE_NO_ERROR: u32 = 0x100;
pub const CLOSE_TRAFFIC_LIMIT: u32 = 0x107;
