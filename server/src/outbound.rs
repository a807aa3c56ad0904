//! Default direct-connect `Dialer`/`UdpOutbound` (spec glossary "Outbound").
//! Resolves the target and connects straight to it — the routing
//! dispatcher's upstream-selection policy sits in front of this and is an
//! explicit non-goal; this is only the dial contract's reference
//! implementation.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::address::Address;
use tokio::net::{TcpStream, UdpSocket};

use crate::tcp::{BoxDial, Dialer, Duplex};
use crate::udp::{BoxFut, UdpConn, UdpOutbound};

async fn resolve(addr: &Address) -> io::Result<SocketAddr> {
	match addr {
		Address::Ip(socket_addr) => Ok(*socket_addr),
		Address::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
			.await?
			.next()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))),
	}
}

pub struct DirectDialer;

impl Dialer for DirectDialer {
	fn dial_tcp<'a>(&'a self, addr: &'a Address) -> BoxDial<'a> {
		Box::pin(async move {
			let target = resolve(addr).await?;
			let stream = TcpStream::connect(target).await?;
			Ok(Box::new(stream) as Box<dyn Duplex>)
		})
	}
}

struct DirectUdpConn {
	socket: UdpSocket,
}

impl UdpConn for DirectUdpConn {
	fn send<'a>(&'a self, data: &'a [u8]) -> BoxFut<'a, io::Result<()>> {
		Box::pin(async move {
			self.socket.send(data).await?;
			Ok(())
		})
	}

	fn recv<'a>(&'a self, buf: &'a mut [u8]) -> BoxFut<'a, io::Result<usize>> {
		Box::pin(async move { self.socket.recv(buf).await })
	}
}

pub struct DirectUdpOutbound;

impl UdpOutbound for DirectUdpOutbound {
	fn dial<'a>(&'a self, addr: &'a Address) -> BoxFut<'a, io::Result<Arc<dyn UdpConn>>> {
		Box::pin(async move {
			let target = resolve(addr).await?;
			let local: SocketAddr = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }.parse().unwrap();
			let socket = UdpSocket::bind(local).await?;
			socket.connect(target).await?;
			Ok(Arc::new(DirectUdpConn { socket }) as Arc<dyn UdpConn>)
		})
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	use super::*;

	#[tokio::test]
	async fn dials_a_real_tcp_listener() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let accept = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 5];
			sock.read_exact(&mut buf).await.unwrap();
			sock.write_all(b"world").await.unwrap();
		});

		let target = Address::Ip(addr);
		let mut stream = DirectDialer.dial_tcp(&target).await.unwrap();
		stream.write_all(b"hello").await.unwrap();
		let mut reply = [0u8; 5];
		stream.read_exact(&mut reply).await.unwrap();
		assert_eq!(&reply, b"world");
		accept.await.unwrap();
	}

	#[tokio::test]
	async fn dials_a_real_udp_echo_socket() {
		let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = socket.local_addr().unwrap();
		tokio::spawn(async move {
			let mut buf = [0u8; 64];
			let (n, from) = socket.recv_from(&mut buf).await.unwrap();
			socket.send_to(&buf[..n], from).await.unwrap();
		});

		let target = Address::Ip(addr);
		let conn = DirectUdpOutbound.dial(&target).await.unwrap();
		conn.send(b"ping").await.unwrap();
		let mut reply = [0u8; 64];
		let n = conn.recv(&mut reply).await.unwrap();
		assert_eq!(&reply[..n], b"ping");
	}
}
