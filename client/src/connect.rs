//! QUIC dial and the HTTP/3-lite auth handshake, client side (spec §4.H).
//!
//! Mirrors `server::listener`/`server::connection`'s shape but runs the
//! handshake the other direction: open the first bidi stream, send the auth
//! request, read back the 233 (or masquerade) response, then expose
//! `tcp`/`udp` for everything that follows.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use protocol::config::BandwidthConfig;
use protocol::hysteria::auth::{AuthRequest, AuthResponse, HEADER_AUTH, HEADER_CC_RX, HEADER_UDP, HeaderList};
use protocol::hysteria::QuicSettings;
use protocol::hysteria::auth::{AUTH_HOST, AUTH_PATH, read_auth_response_async, write_auth_request_async};
use protocol::hysteria::tcp::{FRAME_TYPE_TCP_REQUEST, read_tcp_response_async, write_tcp_request_async};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Endpoint, IdleTimeout, TransportConfig, VarInt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::congestion::{ConnectionCongestion, parse_actual_tx};
use crate::error::ClientError;
use crate::udp::{ClientUdpConn, DatagramChannel, DatagramSendError, UdpSessionManager};

static CRYPTO_PROVIDER: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
	CRYPTO_PROVIDER.call_once(|| {
		let _ = rustls::crypto::ring::default_provider().install_default();
	});
}

pub struct QuicDatagramChannel {
	conn: quinn::Connection,
}

/// A client-side UDP session handle bound to the concrete datagram channel
/// this module dials with.
pub type ClientUdpHandle = ClientUdpConn<QuicDatagramChannel>;

impl DatagramChannel for QuicDatagramChannel {
	fn send(&self, data: Bytes) -> Result<(), DatagramSendError> {
		self.conn.send_datagram(data).map_err(|e| match e {
			quinn::SendDatagramError::TooLarge => DatagramSendError::TooLarge,
			other => DatagramSendError::Other(anyhow::anyhow!("{other}")),
		})
	}

	fn max_datagram_payload_size(&self) -> usize {
		self.conn.max_datagram_size().unwrap_or(0)
	}
}

fn build_transport_config(settings: &QuicSettings, congestion: &ConnectionCongestion) -> Result<TransportConfig, ClientError> {
	let mut transport = TransportConfig::default();
	transport
		.max_concurrent_bidi_streams(VarInt::from(settings.max_incoming_streams))
		.max_concurrent_uni_streams(VarInt::from(settings.max_incoming_streams))
		.max_idle_timeout(Some(
			IdleTimeout::try_from(settings.max_idle_timeout).map_err(|_| ClientError::Config("max_idle_timeout out of range".to_string()))?,
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

/// Builds the rustls `ClientConfig` implied by `tls` (spec §6): `insecure`
/// disables verification outright, otherwise the OS trust store is used.
/// `pin_sha256`/`ca`/client-certificate loading are the data-contract
/// fields the config surface carries; reading them off disk is this crate's
/// non-goal (spec §1), so they are validated but not acted on here.
fn build_rustls_client_config(tls: &crate::config::ClientTlsConfig) -> Result<rustls::ClientConfig, ClientError> {
	let builder = rustls::ClientConfig::builder();
	let config = if tls.insecure {
		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(danger::AcceptAny))
			.with_no_client_auth()
	} else {
		let mut roots = rustls::RootCertStore::empty();
		let loaded = rustls_native_certs::load_native_certs();
		for cert in loaded.certs {
			let _ = roots.add(cert);
		}
		builder.with_root_certificates(roots).with_no_client_auth()
	};
	Ok(config)
}

mod danger {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

	/// Backs `tls.insecure` (spec §6): skips certificate verification
	/// entirely. Never the default.
	#[derive(Debug)]
	pub struct AcceptAny;

	impl ServerCertVerifier for AcceptAny {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
		}
	}
}

/// One dialed connection: the QUIC transport plus, once authenticated, the
/// UDP session manager if the server advertised UDP support.
pub struct ClientTransport {
	conn: quinn::Connection,
	udp: Option<Arc<UdpSessionManager<QuicDatagramChannel>>>,
	cancel: CancellationToken,
}

/// Dials `server_addr`, runs the auth exchange with `auth_token`, and
/// returns a ready-to-use transport. `bandwidth.up_bytes_per_sec` is
/// advertised to the server as `Hysteria-CC-RX`; the response's own
/// `Hysteria-CC-RX` value is what this client paces its uploads at.
pub async fn dial(
	server_addr: SocketAddr,
	server_name: &str,
	quic: &QuicSettings,
	tls: &crate::config::ClientTlsConfig,
	auth_token: &str,
	bandwidth: &BandwidthConfig,
) -> Result<ClientTransport, ClientError> {
	ensure_crypto_provider();
	quic.validate().map_err(ClientError::Protocol)?;

	let congestion = ConnectionCongestion::new();
	let transport_config = build_transport_config(quic, &congestion)?;
	let rustls_config = build_rustls_client_config(tls)?;
	let quic_client_config =
		QuicClientConfig::try_from(rustls_config).map_err(|e| ClientError::Config(format!("unsupported tls config: {e}")))?;
	let mut client_config = quinn::ClientConfig::new(Arc::new(quic_client_config));
	client_config.transport_config(Arc::new(transport_config));

	let bind_addr: SocketAddr = if server_addr.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
	let mut endpoint = Endpoint::client(bind_addr)?;
	endpoint.set_default_client_config(client_config);

	let sni = tls.sni.as_deref().unwrap_or(server_name);
	let conn = endpoint
		.connect(server_addr, sni)
		.map_err(|e| ClientError::Config(e.to_string()))?
		.await?;

	let (mut send, mut recv) = conn.open_bi().await?;
	let mut headers = HeaderList::new();
	headers.push(HEADER_AUTH, auth_token.to_string());
	headers.push(HEADER_CC_RX, bandwidth.up_bytes_per_sec.to_string());
	let request = AuthRequest {
		method: "POST".to_string(),
		path: AUTH_PATH.to_string(),
		headers,
	};
	write_auth_request_async(&mut send, &request).await.map_err(|e| ClientError::Config(e.to_string()))?;
	send.finish().map_err(|e| ClientError::Config(e.to_string()))?;

	let response: AuthResponse = read_auth_response_async(&mut recv).await.map_err(|e| ClientError::Config(e.to_string()))?;
	if !response.is_auth_ok() {
		return Err(ClientError::Auth(response.status));
	}
	congestion.set_actual_tx(parse_actual_tx(response.headers.get(HEADER_CC_RX)));

	let cancel = CancellationToken::new();
	let udp = if response.headers.get(HEADER_UDP) == Some("true") {
		let manager = UdpSessionManager::new(Arc::new(QuicDatagramChannel { conn: conn.clone() }));
		spawn_datagram_pump(conn.clone(), manager.clone(), cancel.clone());
		Some(manager)
	} else {
		None
	};

	tracing::info!(%server_addr, host = AUTH_HOST, "connected");
	Ok(ClientTransport { conn, udp, cancel })
}

fn spawn_datagram_pump(conn: quinn::Connection, manager: Arc<UdpSessionManager<QuicDatagramChannel>>, cancel: CancellationToken) {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				datagram = conn.read_datagram() => {
					match datagram {
						Ok(bytes) => {
							if let Ok(msg) = protocol::hysteria::message::UdpMessage::decode(&mut bytes.clone()) {
								manager.on_message(msg).await;
							}
						},
						Err(_) => break,
					}
				}
			}
		}
	});
}

impl ClientTransport {
	/// Opens a new stream and runs the TCP request/response exchange (spec
	/// §4.F), returning the raw send/recv halves once the server has
	/// confirmed the connection (or an error carrying its failure message).
	pub async fn tcp(&self, addr: &str) -> Result<(Box<dyn AsyncRead + Unpin + Send>, Box<dyn AsyncWrite + Unpin + Send>), ClientError> {
		let (mut send, mut recv) = self.conn.open_bi().await?;
		send.write_u8(FRAME_TYPE_TCP_REQUEST).await?;
		write_tcp_request_async(&mut send, addr).await.map_err(ClientError::Protocol)?;
		let (ok, message) = read_tcp_response_async(&mut recv).await.map_err(ClientError::Protocol)?;
		if !ok {
			return Err(ClientError::Dial(message));
		}
		Ok((Box::new(recv), Box::new(send)))
	}

	/// Allocates a new UDP session on this connection, or `None` if the
	/// server declined UDP support during auth.
	pub async fn udp(&self) -> Option<ClientUdpConn<QuicDatagramChannel>> {
		match &self.udp {
			Some(manager) => Some(manager.new_udp().await),
			None => None,
		}
	}

	pub fn close(&self) {
		self.cancel.cancel();
		self.conn.close(quinn::VarInt::from_u32(0), b"");
	}
}
