//! Hysteria2 server engine (spec §4.G): QUIC listener, the HTTP/3-lite auth
//! exchange, masquerade fallback, TCP/UDP stream handling and the congestion
//! controller switch, wired into one `serve` entry point.

pub mod account;
pub mod auth;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod hook;
pub mod listener;
pub mod masquerade;
pub mod outbound;
pub mod stats;
pub mod tcp;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;

use proxy_core::drain::DrainWatcher;

use crate::account::AccountTable;
use crate::auth::{Authenticator, PasswordAuthenticator, UserpassAuthenticator};
use crate::config::{AuthConfig, ServerConfig};
use crate::connection::ConnectionDeps;
use crate::error::ServeError;
use crate::hook::RequestHook;
use crate::listener::{Listener, load_tls_identity};
use crate::masquerade::MasqueradeHandler;
use crate::outbound::DirectUdpOutbound;
use crate::tcp::{Dialer, TrafficLogger};
use crate::udp::{UdpOutbound, clamp_udp_idle_timeout};

/// How long [`serve`]'s graceful shutdown waits for in-flight connections to
/// drain before forcing them closed. The teacher's gateway hardcodes a
/// similar deadline at its own `run_with_drain` call site.
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

fn build_authenticator(auth: &AuthConfig) -> Arc<dyn Authenticator> {
	match auth {
		AuthConfig::Password { password } => Arc::new(PasswordAuthenticator::new(password.clone())),
		AuthConfig::Userpass { userpass } => Arc::new(UserpassAuthenticator::new(userpass.clone())),
	}
}

/// Binds and serves a Hysteria2 listener until `drain` signals shutdown.
/// `udp_outbound` is generic so a deployment can swap in its own routing;
/// pass [`DirectUdpOutbound`] for the plain direct-connect default.
#[allow(clippy::too_many_arguments)]
pub async fn serve<O: UdpOutbound + 'static>(
	config: ServerConfig,
	masquerade: Arc<dyn MasqueradeHandler>,
	hook: Arc<dyn RequestHook>,
	dialer: Arc<dyn Dialer>,
	udp_outbound: Arc<O>,
	traffic_logger: Option<Arc<dyn TrafficLogger>>,
	drain: DrainWatcher,
) -> Result<(), ServeError> {
	config.quic.validate().map_err(ServeError::Protocol)?;
	config.obfs.validate().map_err(ServeError::Protocol)?;
	protocol::hysteria::validate_bandwidth(config.bandwidth.up_bytes_per_sec).map_err(ServeError::Protocol)?;
	protocol::hysteria::validate_bandwidth(config.bandwidth.down_bytes_per_sec).map_err(ServeError::Protocol)?;

	let (certs, key) = load_tls_identity(&config.tls.cert, &config.tls.key)?;
	let authenticator = build_authenticator(&config.auth);

	let accounts = Arc::new(AccountTable::new(config.rate_limit.up_bytes_per_sec, config.rate_limit.down_bytes_per_sec));

	let deps = Arc::new(ConnectionDeps {
		authenticator,
		masquerade,
		hook,
		dialer,
		udp_outbound,
		traffic_logger,
		accounts,
		server_max_tx: config.bandwidth.up_bytes_per_sec,
		ignore_client_bandwidth: config.ignore_client_bandwidth,
		disable_udp: config.disable_udp,
		udp_idle_timeout: clamp_udp_idle_timeout(Duration::from_secs(config.udp_idle_timeout_secs)),
		session_idle_timeout: config.quic.max_idle_timeout,
	});

	let listener = Listener::bind(config.listen, certs, key, config.quic.clone(), deps)?;
	tracing::info!(addr = %config.listen, "hysteria2 listener bound");
	listener.serve(drain, DEFAULT_DRAIN_DEADLINE).await;
	Ok(())
}

/// Convenience wrapper around [`serve`] for the common case of no custom
/// routing: dials straight to whatever address the client asked for.
pub async fn serve_direct(
	config: ServerConfig,
	masquerade: Arc<dyn MasqueradeHandler>,
	hook: Arc<dyn RequestHook>,
	dialer: Arc<dyn Dialer>,
	traffic_logger: Option<Arc<dyn TrafficLogger>>,
	drain: DrainWatcher,
) -> Result<(), ServeError> {
	serve(config, masquerade, hook, dialer, Arc::new(DirectUdpOutbound), traffic_logger, drain).await
}
