//! `RequestHook`: the optional server-side filter that may intercept the
//! first TCP/UDP request to inspect or rewrite the target (spec §3, §4.G
//! step 2, glossary "Hook").

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use protocol::address::Address;
use tokio::io::AsyncRead;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The outcome of hooking a TCP request: the (possibly rewritten) target
/// address, and any bytes the hook already read off the stream past the
/// original request header that must be replayed to the real upstream once
/// dialed.
pub struct HookDecision {
	pub addr: Address,
	pub putback: Vec<u8>,
}

pub trait RequestHook: Send + Sync {
	/// Whether this hook wants to intercept `addr` at all. The server only
	/// pays the cost of `refine_tcp` (and the fast-open response to the
	/// client) when this returns true.
	fn accepts_tcp(&self, addr: &Address) -> bool;

	/// Reads additional bytes from `stream` to refine the target.
	fn refine_tcp<'a>(
		&'a self,
		addr: Address,
		stream: &'a mut (dyn AsyncRead + Unpin + Send),
	) -> BoxFuture<'a, std::io::Result<HookDecision>>;

	/// UDP hooking is address-rewrite only — no putback, since UDP has no
	/// connection-oriented stream to read ahead from.
	fn udp(&self, addr: &Address) -> Option<SocketAddr>;
}

/// The no-op hook: every request passes through unmodified.
pub struct NoopHook;

impl RequestHook for NoopHook {
	fn accepts_tcp(&self, _addr: &Address) -> bool {
		false
	}

	fn refine_tcp<'a>(
		&'a self,
		addr: Address,
		_stream: &'a mut (dyn AsyncRead + Unpin + Send),
	) -> BoxFuture<'a, std::io::Result<HookDecision>> {
		Box::pin(async move { Ok(HookDecision { addr, putback: Vec::new() }) })
	}

	fn udp(&self, _addr: &Address) -> Option<SocketAddr> {
		None
	}
}
