//! Salamander packet obfuscator (spec §6). XORs each outbound QUIC packet
//! with a BLAKE2b keystream derived from a shared password and a random
//! per-packet salt, so the wire no longer looks like raw QUIC to a
//! passive observer.

use blake2::Blake2bVar;
use digest::{Update, VariableOutput};
use rand::Rng;

use crate::error::ProtocolError;

const SALT_LEN: usize = 8;
const MAX_DATAGRAM: usize = 2048;
const BLOCK_LEN: usize = 64;

fn keystream(password: &[u8], salt: &[u8], len: usize) -> Vec<u8> {
	let mut out = Vec::with_capacity(len);
	let mut counter: u32 = 0;
	while out.len() < len {
		let mut hasher = Blake2bVar::new(BLOCK_LEN).expect("64 is a valid blake2b output length");
		hasher.update(password);
		hasher.update(salt);
		hasher.update(&counter.to_be_bytes());
		let mut block = [0u8; BLOCK_LEN];
		hasher.finalize_variable(&mut block).expect("block sized exactly to output length");
		out.extend_from_slice(&block);
		counter += 1;
	}
	out.truncate(len);
	out
}

pub struct Salamander {
	password: Vec<u8>,
}

impl Salamander {
	pub fn new(password: impl Into<Vec<u8>>) -> Self {
		Self {
			password: password.into(),
		}
	}

	/// Obfuscates `payload` for the wire: `salt ‖ (payload XOR keystream)`.
	pub fn obfuscate(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
		if payload.len() > MAX_DATAGRAM {
			return Err(ProtocolError::protocol("salamander datagram exceeds 2048 bytes"));
		}
		let mut salt = [0u8; SALT_LEN];
		rand::rng().fill(&mut salt);
		let ks = keystream(&self.password, &salt, payload.len());
		let mut out = Vec::with_capacity(SALT_LEN + payload.len());
		out.extend_from_slice(&salt);
		out.extend(payload.iter().zip(ks.iter()).map(|(p, k)| p ^ k));
		Ok(out)
	}

	/// Reverses `obfuscate`.
	pub fn deobfuscate(&self, wire: &[u8]) -> Result<Vec<u8>, ProtocolError> {
		if wire.len() < SALT_LEN {
			return Err(ProtocolError::protocol("salamander packet shorter than salt"));
		}
		if wire.len() - SALT_LEN > MAX_DATAGRAM {
			return Err(ProtocolError::protocol("salamander datagram exceeds 2048 bytes"));
		}
		let (salt, body) = wire.split_at(SALT_LEN);
		let ks = keystream(&self.password, salt, body.len());
		Ok(body.iter().zip(ks.iter()).map(|(p, k)| p ^ k).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips() {
		let s = Salamander::new(b"shared-secret".to_vec());
		let wire = s.obfuscate(b"hello quic").unwrap();
		let back = s.deobfuscate(&wire).unwrap();
		assert_eq!(back, b"hello quic");
	}

	#[test]
	fn rejects_oversized_payload() {
		let s = Salamander::new(b"pw".to_vec());
		let big = vec![0u8; MAX_DATAGRAM + 1];
		assert!(s.obfuscate(&big).is_err());
	}
}
