//! Shadowsocks cipher suite as a tagged sum type (spec §9 redesign: dispatch
//! by match, not by a cipher trait object). Covers both families named in
//! the data model: AEAD ciphers (multi-user capable, identified by probing)
//! and the legacy stream cipher (single-user only).

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::Hmac;
use sha1::Sha1;

use crate::error::ProtocolError;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherKind {
	Aes128Gcm,
	Aes256Gcm,
	ChaCha20Poly1305,
	Aes128Ctr,
	Aes256Ctr,
}

impl CipherKind {
	pub fn key_len(self) -> usize {
		match self {
			CipherKind::Aes128Gcm => 16,
			CipherKind::Aes256Gcm => 32,
			CipherKind::ChaCha20Poly1305 => 32,
			CipherKind::Aes128Ctr => 16,
			CipherKind::Aes256Ctr => 32,
		}
	}

	/// Per-connection salt/IV length. For AEAD ciphers this equals the key
	/// length (Shadowsocks convention); for the stream cipher it is the
	/// block cipher's IV size.
	pub fn iv_len(self) -> usize {
		match self {
			CipherKind::Aes128Gcm | CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => {
				self.key_len()
			},
			CipherKind::Aes128Ctr | CipherKind::Aes256Ctr => 16,
		}
	}

	pub fn is_aead(self) -> bool {
		matches!(
			self,
			CipherKind::Aes128Gcm | CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305
		)
	}

	pub const fn tag_len(self) -> usize {
		16
	}
}

/// HKDF-SHA1(key, salt, info=b"ss-subkey") truncated to `out_len` (spec
/// §4.E/§6). Used both for the AEAD per-connection subkey and for the
/// validator's cheap user-probing open.
pub fn derive_subkey(key: &[u8], salt: &[u8], out_len: usize) -> Vec<u8> {
	let hk = Hkdf::<Sha1>::new(Some(salt), key);
	let mut out = vec![0u8; out_len];
	hk.expand(b"ss-subkey", &mut out)
		.expect("out_len bounded by 255*SHA1 output size");
	out
}

/// A 12-byte little-endian counter nonce, incremented after each chunk
/// (Shadowsocks AEAD chunk framing convention).
#[derive(Clone, Debug, Default)]
pub struct NonceCounter([u8; 12]);

impl NonceCounter {
	pub fn bytes(&self) -> &[u8; 12] {
		&self.0
	}

	pub fn increment(&mut self) {
		for byte in self.0.iter_mut() {
			let (next, carry) = byte.overflowing_add(1);
			*byte = next;
			if !carry {
				break;
			}
		}
	}
}

/// One AEAD session's open/seal over a derived subkey.
pub enum AeadSession {
	Aes128Gcm(Box<Aes128Gcm>),
	Aes256Gcm(Box<Aes256Gcm>),
	ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl AeadSession {
	pub fn new(kind: CipherKind, subkey: &[u8]) -> Result<Self, ProtocolError> {
		Ok(match kind {
			CipherKind::Aes128Gcm => AeadSession::Aes128Gcm(Box::new(
				Aes128Gcm::new_from_slice(subkey).map_err(|_| ProtocolError::protocol("bad aead key"))?,
			)),
			CipherKind::Aes256Gcm => AeadSession::Aes256Gcm(Box::new(
				Aes256Gcm::new_from_slice(subkey).map_err(|_| ProtocolError::protocol("bad aead key"))?,
			)),
			CipherKind::ChaCha20Poly1305 => AeadSession::ChaCha20Poly1305(Box::new(
				ChaCha20Poly1305::new_from_slice(subkey)
					.map_err(|_| ProtocolError::protocol("bad aead key"))?,
			)),
			_ => return Err(ProtocolError::protocol("not an aead cipher")),
		})
	}

	pub fn open(&self, nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
		let payload = Payload {
			msg: ciphertext,
			aad: &[],
		};
		let result = match self {
			AeadSession::Aes128Gcm(c) => c.decrypt(nonce.into(), payload),
			AeadSession::Aes256Gcm(c) => c.decrypt(nonce.into(), payload),
			AeadSession::ChaCha20Poly1305(c) => c.decrypt(nonce.into(), payload),
		};
		result.map_err(|_| ProtocolError::protocol("aead open failed"))
	}

	pub fn seal(&self, nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
		let payload = Payload {
			msg: plaintext,
			aad: &[],
		};
		let result = match self {
			AeadSession::Aes128Gcm(c) => c.encrypt(nonce.into(), payload),
			AeadSession::Aes256Gcm(c) => c.encrypt(nonce.into(), payload),
			AeadSession::ChaCha20Poly1305(c) => c.encrypt(nonce.into(), payload),
		};
		result.map_err(|_| ProtocolError::protocol("aead seal failed"))
	}
}

/// One stream-cipher session (AES-CTR). The legacy single-user mode named
/// in the data model.
pub enum StreamSession {
	Aes128Ctr(Box<Aes128Ctr>),
	Aes256Ctr(Box<Aes256Ctr>),
}

impl StreamSession {
	pub fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<Self, ProtocolError> {
		Ok(match kind {
			CipherKind::Aes128Ctr => StreamSession::Aes128Ctr(Box::new(
				Aes128Ctr::new_from_slices(key, iv).map_err(|_| ProtocolError::protocol("bad stream key/iv"))?,
			)),
			CipherKind::Aes256Ctr => StreamSession::Aes256Ctr(Box::new(
				Aes256Ctr::new_from_slices(key, iv).map_err(|_| ProtocolError::protocol("bad stream key/iv"))?,
			)),
			_ => return Err(ProtocolError::protocol("not a stream cipher")),
		})
	}

	/// Stream ciphers are symmetric: the same keystream application both
	/// encrypts and decrypts, in place.
	pub fn apply_keystream(&mut self, buf: &mut [u8]) {
		match self {
			StreamSession::Aes128Ctr(c) => c.apply_keystream(buf),
			StreamSession::Aes256Ctr(c) => c.apply_keystream(buf),
		}
	}
}

/// `HMAC-SHA256("SSBSKDF", key)` folded via CRC64, accumulated across users
/// to seed the validator's deterministic probe-defeating drain (spec §3).
pub fn behavior_seed_contribution(key: &[u8]) -> u64 {
	use hmac::Mac;
	let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"SSBSKDF").expect("hmac accepts any key length");
	mac.update(key);
	let digest = mac.finalize().into_bytes();
	let crc = crc::Crc::<u64>::new(&crc::CRC_64_XZ);
	crc.checksum(&digest)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn aead_round_trips() {
		let key = [7u8; 32];
		let subkey = derive_subkey(&key, &[1u8; 32], 32);
		let session = AeadSession::new(CipherKind::Aes256Gcm, &subkey).unwrap();
		let nonce = NonceCounter::default();
		let ct = session.seal(nonce.bytes(), b"hello world").unwrap();
		let pt = session.open(nonce.bytes(), &ct).unwrap();
		assert_eq!(pt, b"hello world");
	}

	#[test]
	fn stream_cipher_is_involutive() {
		let key = [3u8; 32];
		let iv = [9u8; 16];
		let mut enc = StreamSession::new(CipherKind::Aes256Ctr, &key, &iv).unwrap();
		let mut dec = StreamSession::new(CipherKind::Aes256Ctr, &key, &iv).unwrap();
		let mut buf = b"plaintext payload".to_vec();
		enc.apply_keystream(&mut buf);
		dec.apply_keystream(&mut buf);
		assert_eq!(buf, b"plaintext payload");
	}

	#[test]
	fn nonce_counter_increments_little_endian() {
		let mut n = NonceCounter::default();
		n.increment();
		assert_eq!(n.bytes()[0], 1);
		let mut n = NonceCounter([0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
		n.increment();
		assert_eq!(n.bytes()[0], 0);
		assert_eq!(n.bytes()[1], 1);
	}
}
