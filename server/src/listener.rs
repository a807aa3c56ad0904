//! QUIC endpoint and accept loop (spec §4.G): binds the UDP socket, builds a
//! fresh per-connection `TransportConfig`/`ServerConfig` for every accepted
//! connection (so each connection gets its own [`ConnectionCongestion`]
//! rather than sharing one rate across the whole endpoint), and hands the
//! result to [`crate::connection::handle_connection`] under the same
//! drain-on-shutdown wiring the rest of the stack uses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use proxy_core::drain::DrainWatcher;
use protocol::hysteria::QuicSettings;
use quinn::{Endpoint, IdleTimeout, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_util::sync::CancellationToken;

use crate::congestion::ConnectionCongestion;
use crate::connection::{ConnectionDeps, handle_connection};
use crate::error::ServeError;
use crate::udp::UdpOutbound;

static CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();

/// Installs the process-wide `ring` crypto provider rustls 0.23 needs before
/// any TLS handshake happens. Idempotent: safe to call from every listener
/// a process starts.
fn ensure_crypto_provider() {
	CRYPTO_PROVIDER.call_once(|| {
		let _ = rustls::crypto::ring::default_provider().install_default();
	});
}

/// Loads a PEM certificate chain and private key from disk. The obvious
/// spot to add SNI-guard validation of the presented server name against
/// `ServerTlsConfig.sni_guard` once that hook gets a home.
pub fn load_tls_identity(
	cert_path: &str,
	key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServeError> {
	let cert_bytes = std::fs::read(cert_path)?;
	let key_bytes = std::fs::read(key_path)?;
	let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| ServeError::Config(format!("reading {cert_path}: {e}")))?;
	let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
		.map_err(|e| ServeError::Config(format!("reading {key_path}: {e}")))?
		.ok_or_else(|| ServeError::Config(format!("no private key found in {key_path}")))?;
	Ok((certs, key))
}

fn build_transport_config(settings: &QuicSettings, congestion: &ConnectionCongestion) -> Result<TransportConfig, ServeError> {
	let mut transport = TransportConfig::default();
	transport
		.max_concurrent_bidi_streams(VarInt::from(settings.max_incoming_streams))
		.max_concurrent_uni_streams(VarInt::from(settings.max_incoming_streams))
		.max_idle_timeout(Some(
			IdleTimeout::try_from(settings.max_idle_timeout).map_err(|_| ServeError::Config("max_idle_timeout out of range".to_string()))?,
		))
		.keep_alive_interval(Some(settings.keep_alive_period))
		.stream_receive_window(VarInt::try_from(settings.max_stream_receive_window).unwrap_or_else(|_| VarInt::from_u32(u32::MAX)))
		.receive_window(VarInt::try_from(settings.max_conn_receive_window).unwrap_or_else(|_| VarInt::from_u32(u32::MAX)))
		.datagram_receive_buffer_size(Some(settings.init_stream_receive_window as usize))
		.congestion_controller_factory(congestion.factory());
	if settings.disable_path_mtu_discovery {
		transport.mtu_discovery_config(None);
	}
	Ok(transport)
}

fn build_server_config(
	certs: &[CertificateDer<'static>],
	key: &PrivateKeyDer<'static>,
	settings: &QuicSettings,
	congestion: &ConnectionCongestion,
) -> Result<ServerConfig, ServeError> {
	let mut config =
		ServerConfig::with_single_cert(certs.to_vec(), key.clone_key()).map_err(|e| ServeError::Config(e.to_string()))?;
	config.transport = Arc::new(build_transport_config(settings, congestion)?);
	Ok(config)
}

/// One bound QUIC endpoint serving Hysteria2 connections. Generic over the
/// UDP outbound implementation so deployments can plug in their own
/// routing without this module knowing about it.
pub struct Listener<O> {
	endpoint: Endpoint,
	certs: Vec<CertificateDer<'static>>,
	key: PrivateKeyDer<'static>,
	settings: QuicSettings,
	deps: Arc<ConnectionDeps<O>>,
}

impl<O: UdpOutbound + 'static> Listener<O> {
	pub fn bind(
		addr: SocketAddr,
		certs: Vec<CertificateDer<'static>>,
		key: PrivateKeyDer<'static>,
		settings: QuicSettings,
		deps: Arc<ConnectionDeps<O>>,
	) -> Result<Self, ServeError> {
		ensure_crypto_provider();
		settings.validate().map_err(ServeError::Protocol)?;

		// The endpoint needs some server config to bind with; every connection
		// this module actually accepts gets its own fresh one via `accept_with`
		// below, so this one is never used to serve real traffic.
		let bootstrap_congestion = ConnectionCongestion::new();
		let bootstrap_config = build_server_config(&certs, &key, &settings, &bootstrap_congestion)?;
		let endpoint = Endpoint::server(bootstrap_config, addr)?;

		Ok(Self {
			endpoint,
			certs,
			key,
			settings,
			deps,
		})
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.endpoint.local_addr()
	}

	/// Runs the accept loop until the endpoint closes or a graceful drain
	/// completes, mirroring the teacher's `drain::run_with_drain` wiring
	/// around its own TCP accept loop.
	pub async fn serve(self, drain: DrainWatcher, drain_deadline: Duration) {
		let Listener {
			endpoint,
			certs,
			key,
			settings,
			deps,
		} = self;
		let conn_counter = Arc::new(AtomicU64::new(0));

		let accept = |drain: DrainWatcher, force_shutdown: tokio::sync::watch::Receiver<()>| async move {
			while let Some(incoming) = endpoint.accept().await {
				let congestion = Arc::new(ConnectionCongestion::new());
				let server_config = match build_server_config(&certs, &key, &settings, &congestion) {
					Ok(c) => c,
					Err(e) => {
						tracing::warn!(error = %e, "failed to build per-connection quic config, refusing connection");
						incoming.refuse();
						continue;
					},
				};
				let connecting = match incoming.accept_with(Arc::new(server_config)) {
					Ok(c) => c,
					Err(e) => {
						tracing::debug!(error = %e, "failed to accept incoming connection");
						continue;
					},
				};

				let drain = drain.clone();
				let mut force_shutdown = force_shutdown.clone();
				let deps = deps.clone();
				let conn_id = conn_counter.fetch_add(1, Ordering::Relaxed);

				tokio::spawn(async move {
					let conn = match connecting.await {
						Ok(conn) => conn,
						Err(e) => {
							tracing::debug!(error = %e, "quic handshake failed");
							return;
						},
					};
					let remote = conn.remote_address();
					tracing::debug!(%remote, conn_id, "connection accepted");

					let cancel = CancellationToken::new();
					let bridge_cancel = cancel.clone();
					tokio::spawn(async move {
						let _ = force_shutdown.changed().await;
						bridge_cancel.cancel();
					});

					handle_connection(conn, congestion, deps, conn_id, cancel).await;
					tracing::debug!(%remote, conn_id, "connection closed");
					// Mark we are done with the connection, so drain can complete.
					drop(drain);
				});
			}
		};

		proxy_core::drain::run_with_drain("hysteria2-listener".to_string(), drain, drain_deadline, accept).await;
	}
}

// Salamander packet obfuscation (protocol::salamander) operates on raw
// per-packet payloads and would need a custom quinn::AsyncUdpSocket wrapping
// the bound socket to apply transparently to every datagram this endpoint
// sends and receives. Not implemented here; `ObfsConfig::validate` rejects
// `ObfsKind::Salamander` at config-load time so this never runs silently
// unobfuscated.
