//! Hysteria2 client engine (spec §4.H): QUIC dial, the HTTP/3-lite auth
//! exchange, TCP/UDP stream access and the client-side congestion switch,
//! wired behind a lazily-reconnecting wrapper.

pub mod config;
pub mod congestion;
pub mod connect;
pub mod error;
pub mod lazy;
pub mod udp;

pub use config::ClientConfig;
pub use connect::{ClientTransport, ClientUdpHandle};
pub use error::ClientError;
pub use lazy::{ConfigFunc, ConnectedFunc, LazyClient};

/// Builds a [`LazyClient`] over a fixed, already-resolved [`ClientConfig`].
/// Most callers that don't need per-attempt config regeneration (e.g.
/// re-resolving a hostname) can use this instead of authoring their own
/// `ConfigFunc`.
pub fn new_lazy_client(config: ClientConfig, connected_func: Option<ConnectedFunc>) -> std::sync::Arc<LazyClient> {
	let config_func: ConfigFunc = std::sync::Arc::new(move || Ok(config.clone()));
	LazyClient::new(config_func, connected_func)
}
