//! Authenticator contract and the two configured implementations (spec §4.G,
//! §6 `auth.type ∈ {"password", "userpass"}`).

use std::collections::HashMap;
use std::net::SocketAddr;

/// Given the remote address, the client's raw auth token, and its
/// advertised tx bandwidth, returns the authenticated user's id on success.
pub trait Authenticator: Send + Sync {
	fn authenticate(&self, remote: SocketAddr, auth: &str, client_tx: u64) -> Option<String>;
}

pub struct PasswordAuthenticator {
	password: String,
}

impl PasswordAuthenticator {
	pub fn new(password: impl Into<String>) -> Self {
		Self {
			password: password.into(),
		}
	}
}

impl Authenticator for PasswordAuthenticator {
	fn authenticate(&self, _remote: SocketAddr, auth: &str, _client_tx: u64) -> Option<String> {
		(auth == self.password).then(|| "user".to_string())
	}
}

/// Username is matched case-insensitively; the password is not.
pub struct UserpassAuthenticator {
	// Keyed by lowercased username, storing the originally-cased username
	// (returned as `auth_id`) and its password.
	users: HashMap<String, (String, String)>,
}

impl UserpassAuthenticator {
	pub fn new(userpass: HashMap<String, String>) -> Self {
		let users = userpass
			.into_iter()
			.map(|(user, pass)| (user.to_lowercase(), (user, pass)))
			.collect();
		Self { users }
	}
}

impl Authenticator for UserpassAuthenticator {
	fn authenticate(&self, _remote: SocketAddr, auth: &str, _client_tx: u64) -> Option<String> {
		let (user, pass) = auth.split_once(':')?;
		let (original, expected_pass) = self.users.get(&user.to_lowercase())?;
		(pass == expected_pass).then(|| original.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn remote() -> SocketAddr {
		"127.0.0.1:0".parse().unwrap()
	}

	#[test]
	fn password_auth_matches_exactly() {
		let auth = PasswordAuthenticator::new("pass123");
		assert_eq!(auth.authenticate(remote(), "pass123", 0), Some("user".to_string()));
		assert_eq!(auth.authenticate(remote(), "wrong", 0), None);
	}

	#[test]
	fn userpass_username_is_case_insensitive() {
		let mut map = HashMap::new();
		map.insert("user".to_string(), "pass".to_string());
		let auth = UserpassAuthenticator::new(map);
		assert_eq!(auth.authenticate(remote(), "user:pass", 0), Some("user".to_string()));
		assert_eq!(auth.authenticate(remote(), "User:pass", 0), Some("user".to_string()));
		assert_eq!(auth.authenticate(remote(), "nobody:pass", 0), None);
	}

	#[test]
	fn userpass_password_is_case_sensitive() {
		let mut map = HashMap::new();
		map.insert("user".to_string(), "pass".to_string());
		let auth = UserpassAuthenticator::new(map);
		assert_eq!(auth.authenticate(remote(), "user:PASS", 0), None);
	}
}
