//! Masquerade handler (spec §3, §4.G): what an unauthenticated client sees,
//! so the endpoint is indistinguishable from a generic HTTP/3 site.

pub struct MasqueradeResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

pub trait MasqueradeHandler: Send + Sync {
	fn handle(&self, method: &str, path: &str) -> MasqueradeResponse;
}

/// Default: a canned 404, the same response regardless of method or path.
pub struct NotFoundMasquerade;

impl MasqueradeHandler for NotFoundMasquerade {
	fn handle(&self, _method: &str, _path: &str) -> MasqueradeResponse {
		MasqueradeResponse {
			status: 404,
			headers: vec![("content-type".to_string(), "text/plain".to_string())],
			body: b"404 page not found".to_vec(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_masquerade_is_indistinguishable_across_requests() {
		let handler = NotFoundMasquerade;
		let a = handler.handle("GET", "/");
		let b = handler.handle("POST", "/auth");
		assert_eq!(a.status, b.status);
		assert_eq!(a.body, b.body);
	}
}
