use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

use crate::onion::{PASSWORD_LEN, PASSWORD_PREFIX};

const PBKDF2_ROUNDS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Errors from any of the crypto adapters.
#[derive(Error, Debug)]
pub enum CryptoError {
	#[error("ciphertext too short to contain a nonce")]
	Truncated,
	#[error("AEAD decryption failed")]
	DecryptFailed,
	#[error("could not read public key at {path}: {source}")]
	KeyIo {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("public key bytes were malformed")]
	BadKey,
	#[error("signature bytes were malformed")]
	BadSignature,
	#[error("signature did not verify")]
	VerifyFailed,
}

/// Derives a symmetric key from the rendezvous password and decrypts an
/// onion ciphertext. Mirrors `rdv_decrypt` in the original server: PBKDF2
/// over the password, ChaCha20-Poly1305 with the nonce prefixed to the
/// ciphertext.
pub trait PasswordCipher: Send + Sync {
	fn decrypt(&self, password: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub struct Pbkdf2ChaChaCipher {
	/// Fixed salt: the original keys every session off the same salt
	/// value since the password itself carries the entropy.
	salt: Vec<u8>,
}

impl Pbkdf2ChaChaCipher {
	pub fn new(salt: impl Into<Vec<u8>>) -> Self {
		Self { salt: salt.into() }
	}

	fn derive_key(&self, password: &str) -> [u8; KEY_LEN] {
		let mut key = [0u8; KEY_LEN];
		pbkdf2_hmac::<Sha256>(password.as_bytes(), &self.salt, PBKDF2_ROUNDS, &mut key);
		key
	}
}

impl PasswordCipher for Pbkdf2ChaChaCipher {
	fn decrypt(&self, password: &str, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
		if ciphertext.len() < NONCE_LEN {
			return Err(CryptoError::Truncated);
		}
		let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
		let mut key = self.derive_key(password);
		let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::BadKey)?;
		key.zeroize();
		cipher
			.decrypt(Nonce::from_slice(nonce_bytes), body)
			.map_err(|_| CryptoError::DecryptFailed)
	}
}

/// Verifies the SIGNED onion layer's signature against the public key
/// named by `DEFIANCE_PUBLIC_KEY_PATH`, read lazily at peel time.
pub trait SignatureVerifier: Send + Sync {
	fn verify(&self, public_key_path: &Path, message: &[u8], signature: &[u8]) -> Result<(), CryptoError>;
}

pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
	fn verify(&self, public_key_path: &Path, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
		let raw = std::fs::read(public_key_path).map_err(|source| CryptoError::KeyIo {
			path: public_key_path.display().to_string(),
			source,
		})?;
		let key_bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| CryptoError::BadKey)?;
		let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::BadKey)?;

		let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| CryptoError::BadSignature)?;
		let signature = Signature::from_bytes(&sig_bytes);

		verifying_key
			.verify_strict(message, &signature)
			.map_err(|_| CryptoError::VerifyFailed)
	}
}

/// Brute-forces the five free letters of the rendezvous password against
/// a commitment hash. `progress` is advanced monotonically so a caller
/// can observe it from another thread; `quit` is polled between
/// attempts and never preempts mid-hash.
pub trait ProofOfWork: Send + Sync {
	fn search(&self, commitment: &[u8], progress: &AtomicU64, quit: &AtomicBool) -> Option<String>;
}

/// Size of the brute-forced keyspace: five lowercase letters.
pub const POW_MAX_ATTEMPTS: u64 = 26u64.pow(5);

pub struct Sha256CommitmentPow;

impl Sha256CommitmentPow {
	fn password_for_index(index: u64) -> String {
		let mut suffix = [0u8; 5];
		let mut n = index;
		for slot in suffix.iter_mut().rev() {
			*slot = b'a' + (n % 26) as u8;
			n /= 26;
		}
		let mut password = String::with_capacity(PASSWORD_LEN);
		password.push_str(PASSWORD_PREFIX);
		password.push_str(std::str::from_utf8(&suffix).unwrap());
		password
	}
}

impl ProofOfWork for Sha256CommitmentPow {
	fn search(&self, commitment: &[u8], progress: &AtomicU64, quit: &AtomicBool) -> Option<String> {
		for index in 0..POW_MAX_ATTEMPTS {
			if quit.load(Ordering::Relaxed) {
				return None;
			}
			let candidate = Self::password_for_index(index);
			let digest = Sha256::digest(candidate.as_bytes());
			if digest.as_slice() == commitment {
				progress.store(POW_MAX_ATTEMPTS, Ordering::Release);
				return Some(candidate);
			}
			progress.store(index, Ordering::Relaxed);
		}
		progress.store(POW_MAX_ATTEMPTS, Ordering::Release);
		None
	}
}

/// Embeds or extracts a payload from cover-image bytes. The spec
/// explicitly excludes real stego robustness from scope (Non-goals):
/// this is a simplified, documented LSB codec that exists so the trait
/// seam has one concrete, round-tripping implementation.
pub trait Steganography: Send + Sync {
	fn extract(&self, cover: &[u8]) -> Result<Vec<u8>, CryptoError>;
	fn embed(&self, cover: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub struct LsbSteganography;

impl Steganography for LsbSteganography {
	fn extract(&self, cover: &[u8]) -> Result<Vec<u8>, CryptoError> {
		if cover.len() < 4 * 8 {
			return Err(CryptoError::Truncated);
		}
		let len_bits = &cover[0..32];
		let len = bits_to_bytes(len_bits)
			.iter()
			.fold(0u32, |acc, b| (acc << 8) | *b as u32) as usize;

		let needed_bits = 32 + len * 8;
		if cover.len() < needed_bits {
			return Err(CryptoError::Truncated);
		}
		Ok(bits_to_bytes(&cover[32..needed_bits]))
	}

	fn embed(&self, cover: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
		let len = payload.len() as u32;
		let header_bits = bytes_to_bits(&len.to_be_bytes());
		let payload_bits = bytes_to_bits(payload);
		let total_bits = header_bits.len() + payload_bits.len();
		if cover.len() < total_bits {
			return Err(CryptoError::Truncated);
		}

		let mut out = cover.to_vec();
		for (byte, bit) in out.iter_mut().zip(header_bits.iter().chain(payload_bits.iter())) {
			*byte = (*byte & !1) | bit;
		}
		Ok(out)
	}
}

fn bytes_to_bits(bytes: &[u8]) -> Vec<u8> {
	bytes
		.iter()
		.flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1))
		.collect()
}

fn bits_to_bytes(bits: &[u8]) -> Vec<u8> {
	bits.chunks(8)
		.map(|chunk| chunk.iter().fold(0u8, |acc, bit| (acc << 1) | bit))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cipher_round_trips_via_known_vector() {
		let cipher = Pbkdf2ChaChaCipher::new(b"rendezvous-salt".to_vec());
		let password = "aaabcdef12345678";
		let mut key = cipher.derive_key(password);
		let aead = ChaCha20Poly1305::new_from_slice(&key).unwrap();
		key.zeroize();
		let nonce = Nonce::from_slice(b"123456789012");
		let ciphertext = aead.encrypt(nonce, b"hello onion".as_ref()).unwrap();
		let mut blob = nonce.to_vec();
		blob.extend_from_slice(&ciphertext);

		let plaintext = cipher.decrypt(password, &blob).unwrap();
		assert_eq!(plaintext, b"hello onion");
	}

	#[test]
	fn cipher_rejects_truncated_ciphertext() {
		let cipher = Pbkdf2ChaChaCipher::new(b"salt".to_vec());
		assert!(matches!(
			cipher.decrypt("aaaxxxxx12345678", b"short"),
			Err(CryptoError::Truncated)
		));
	}

	#[test]
	fn pow_finds_the_planted_password() {
		let target_index = 41;
		let target = Sha256CommitmentPow::password_for_index(target_index);
		let commitment = Sha256::digest(target.as_bytes());

		let progress = AtomicU64::new(0);
		let quit = AtomicBool::new(false);
		let found = Sha256CommitmentPow.search(&commitment, &progress, &quit);
		assert_eq!(found, Some(target));
		assert_eq!(progress.load(Ordering::Relaxed), POW_MAX_ATTEMPTS);
	}

	#[test]
	fn pow_respects_quit_flag() {
		let commitment = Sha256::digest(b"will-never-match");
		let progress = AtomicU64::new(0);
		let quit = AtomicBool::new(true);
		let found = Sha256CommitmentPow.search(&commitment, &progress, &quit);
		assert_eq!(found, None);
	}

	#[test]
	fn steganography_round_trips() {
		let cover = vec![0xAAu8; 4096];
		let payload = b"secret onion layer";
		let embedded = LsbSteganography.embed(&cover, payload).unwrap();
		let extracted = LsbSteganography.extract(&embedded).unwrap();
		assert_eq!(extracted, payload);
	}
}
