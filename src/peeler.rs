use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;

use crate::crypto::{CryptoError, PasswordCipher, ProofOfWork, SignatureVerifier, Steganography};
use crate::dancer::{Dancer, Net};
use crate::onion::{self, Onion, OnionError, OnionType};
use crate::session::SessionStore;
use crate::types::{FileResponse, ImageResponse, PeelAction, PeelResponse};

/// Errors surfaced by the `/rendezvous/*` operations. CAPTCHA mismatches,
/// bad signatures, and a missing `DEFIANCE_PUBLIC_KEY_PATH` are *not*
/// modeled as errors here: the original replies to all of those with a
/// 200 and a descriptive `status` string, preserving the current onion,
/// so `peel` surfaces them as `Ok(PeelResponse)` instead.
#[derive(Error, Debug)]
pub enum PeelerError {
	#[error("no current onion")]
	NoActiveOnion,
	#[error(transparent)]
	Onion(#[from] OnionError),
	#[error(transparent)]
	Crypto(#[from] CryptoError),
	#[error("no password on this session; call gen_request first")]
	NoPassword,
	#[error("onion method not implemented yet")]
	NotImplemented,
	#[error("io error writing artifact: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum FileError {
	#[error("path escapes the artifact root")]
	Forbidden,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

pub const DEFIANCE_PUBLIC_KEY_PATH_ENV: &str = "DEFIANCE_PUBLIC_KEY_PATH";

/// Drives a single session's onion through BASE -> POW -> CAPTCHA ->
/// SIGNED -> COLLECTION, peeling one layer per call per spec.md §4.3.
pub struct Peeler {
	session: Arc<SessionStore>,
	dancer: Arc<Dancer>,
	cipher: Arc<dyn PasswordCipher>,
	verifier: Arc<dyn SignatureVerifier>,
	pow: Arc<dyn ProofOfWork>,
	steg: Arc<dyn Steganography>,
	artifact_root: PathBuf,
}

impl Peeler {
	pub fn new(
		session: Arc<SessionStore>,
		dancer: Arc<Dancer>,
		cipher: Arc<dyn PasswordCipher>,
		verifier: Arc<dyn SignatureVerifier>,
		pow: Arc<dyn ProofOfWork>,
		steg: Arc<dyn Steganography>,
		artifact_root: PathBuf,
	) -> Self {
		Peeler {
			session,
			dancer,
			cipher,
			verifier,
			pow,
			steg,
			artifact_root,
		}
	}

	/// Generates a fresh session password and the cover-page URL a
	/// client fetches to retrieve the steganographic BASE onion,
	/// mimicking a Flickr photo permalink
	/// (`photos/<id>@N08/<id>/lightbox`) as the original cover did. The
	/// password is stashed on the session (not returned to the caller)
	/// so that `image` can later decrypt with it.
	pub fn gen_request(&self, server: &str, secure: bool) -> Result<String, PeelerError> {
		self.session.reset();
		let password = random_password();
		self.session.set_password(password);

		let scheme = if secure { "https" } else { "http" };
		let mut rng = rand::thread_rng();
		let owner_id: u64 = rng.gen();
		let photo_id: u64 = rng.gen();
		Ok(format!("{scheme}://{server}/photos/{owner_id}@N08/{photo_id}/lightbox"))
	}

	/// Extracts, decrypts, and validates the BASE onion from a JPEG body,
	/// using the password stashed by the last `gen_request`, and
	/// installs it (and the cover image) as the session's current
	/// state.
	pub fn image(&self, body: &[u8]) -> Result<ImageResponse, PeelerError> {
		let password = self.session.get_password().ok_or(PeelerError::NoPassword)?;
		onion::validate_password(&password)?;

		let ciphertext = self.steg.extract(body)?;
		let plaintext = self.cipher.decrypt(&password, &ciphertext)?;
		let parsed = onion::validate(plaintext)?;

		let dir = self
			.artifact_root
			.join(format!("session-{:x}", rand::thread_rng().gen::<u64>()));
		std::fs::create_dir_all(&dir)?;
		let image_path = dir.join("cover.jpg");
		if let Err(e) = std::fs::write(&image_path, body) {
			let _ = std::fs::remove_dir_all(&dir);
			return Err(e.into());
		}

		self.session.set_images(image_path.clone(), dir);
		self.session.clear_captcha();
		let onion_type = parsed.onion_type.as_str().to_string();
		self.session.set_onion(parsed);

		Ok(ImageResponse {
			image: format!("/rendezvous/file{}", image_path.display()),
			onion_type,
		})
	}

	/// Peels exactly one layer off the session's current onion,
	/// dispatching by layer type. Peel failures leave the session's
	/// onion state untouched (spec.md §7): the caller may retry.
	pub async fn peel(&self, action: Option<PeelAction>) -> Result<PeelResponse, PeelerError> {
		let onion = self.session.get_onion().ok_or(PeelerError::NoActiveOnion)?;
		match onion.onion_type {
			OnionType::Base => self.peel_base(onion).await,
			OnionType::Pow => self.peel_pow(onion),
			OnionType::Captcha => self.peel_captcha(onion, action),
			OnionType::Signed => self.peel_signed(onion),
			OnionType::Collection => Err(PeelerError::NotImplemented),
		}
	}

	fn advance(&self, next_bytes: &[u8]) -> Result<Onion, PeelerError> {
		let next = onion::validate(next_bytes.to_vec())?;
		self.session.set_onion(next.clone());
		Ok(next)
	}

	/// BASE never advances: its data is the NET record, handed off to
	/// the Dancer, but the BASE onion itself remains `current_onion`
	/// (matches `rdv_peel_base`, which never calls `free_onion` on it).
	async fn peel_base(&self, onion: Onion) -> Result<PeelResponse, PeelerError> {
		match serde_json::from_slice::<Net>(onion.data()) {
			Ok(net) => {
				// The refusal-on-already-dancing case is surfaced by
				// `Dancer::set_net` itself as an ERR status event; unlike
				// the original's `XXX` comment, BASE peel does not need to
				// (and must not) branch on the return value here.
				let _ = self.dancer.set_net(Some(net)).await;
				Ok(PeelResponse::text("NET passed to ACS", "Complete", onion.onion_type.as_str()))
			}
			Err(_) => Ok(PeelResponse::text(
				"Sorry your nep did not parse as JSON",
				"",
				onion.onion_type.as_str(),
			)),
		}
	}

	/// The puzzle slice carries `hash` and `secret` (the two halves fed to
	/// the POW search as the commitment); `onion.data()` is the real
	/// next-layer ciphertext, decrypted once the password is recovered.
	fn peel_pow(&self, onion: Onion) -> Result<PeelResponse, PeelerError> {
		if self.session.pow_snapshot().is_none() {
			let puzzle = onion.puzzle();
			let commitment = puzzle.get(..32).unwrap_or(puzzle).to_vec();
			self.session.pow_start(commitment, self.pow.clone());
			let snapshot = self.session.pow_snapshot().expect("just started");
			return Ok(PeelResponse::percent(
				snapshot.progress * 100 / crate::crypto::POW_MAX_ATTEMPTS,
				"OK the Proof-Of-Work has commenced",
				onion.onion_type.as_str(),
			));
		}

		let snapshot = self.session.pow_snapshot().expect("started above");
		if !snapshot.finished {
			return Ok(PeelResponse::percent(
				snapshot.progress * 100 / crate::crypto::POW_MAX_ATTEMPTS,
				"Working away...",
				onion.onion_type.as_str(),
			));
		}

		let password = match snapshot.found_password {
			Some(p) => p,
			None => {
				self.session.pow_clear();
				return Ok(PeelResponse::text("", "Proof of work FAILED?!?", onion.onion_type.as_str()));
			}
		};

		let inner_bytes = self.cipher.decrypt(&password, onion.data())?;
		let next = self.advance(&inner_bytes)?;
		self.session.pow_clear();

		Ok(PeelResponse::percent(
			100,
			"Your Proof-Of-Work has finished successfully!",
			next.onion_type.as_str(),
		))
	}

	fn peel_captcha(&self, onion: Onion, action: Option<PeelAction>) -> Result<PeelResponse, PeelerError> {
		if self.session.get_captcha().is_none() {
			let dir = self.session.get_image_dir().ok_or(PeelerError::NoActiveOnion)?;
			let path = dir.join("captcha.png");
			std::fs::write(&path, onion.puzzle())?;
			self.session.set_captcha(path.clone());
			return Ok(PeelResponse::text(
				format!("/rendezvous/file{}", path.display()),
				"Here is your captcha image!",
				onion.onion_type.as_str(),
			));
		}

		let answer = action.unwrap_or_default().action;
		let reply = match answer {
			None => Ok(PeelResponse::text("", "Answer not found in JSON", onion.onion_type.as_str())),
			Some(serde_json::Value::String(answer)) => {
				if self.captcha_answer_matches(&onion, &answer) {
					self.session.clear_captcha();
					let next = self.advance(onion.data())?;
					Ok(PeelResponse::text(
						"",
						"Excellent, you solved the captcha",
						next.onion_type.as_str(),
					))
				} else {
					Ok(PeelResponse::text("", "Nope, try again?", onion.onion_type.as_str()))
				}
			}
			Some(_) => Ok(PeelResponse::text(
				"",
				"JSON Answer field wasn't of the right type",
				onion.onion_type.as_str(),
			)),
		};
		reply
	}

	/// The expected answer is carried in the puzzle slice alongside the
	/// rendered CAPTCHA image bytes, as plain UTF-8 appended after a
	/// NUL separator.
	fn captcha_answer_matches(&self, onion: &Onion, answer: &str) -> bool {
		let puzzle = onion.puzzle();
		let nul_at = puzzle.iter().position(|&b| b == 0);
		let expected = match nul_at {
			Some(at) => std::str::from_utf8(&puzzle[at + 1..]).unwrap_or(""),
			None => "",
		};
		answer == expected
	}

	/// Verifies the signature embedded in the SIGNED onion's puzzle
	/// slice against `onion.data()` (the already-signed next layer);
	/// no client input is consulted (matches `rdv_peel_signed`, which
	/// takes no JSON body at all).
	fn peel_signed(&self, onion: Onion) -> Result<PeelResponse, PeelerError> {
		let key_path = match std::env::var(DEFIANCE_PUBLIC_KEY_PATH_ENV) {
			Ok(p) => p,
			Err(_) => {
				return Ok(PeelResponse::text(
					"",
					"The server needs to know the DEFIANCE_PUBLIC_KEY_PATH, so  that the signature can be VERIFIED!",
					onion.onion_type.as_str(),
				))
			}
		};

		if self.verifier.verify(Path::new(&key_path), onion.data(), onion.puzzle()).is_err() {
			return Ok(PeelResponse::text(
				"",
				"The server returned an onion whose signature we COULD NOT verify -- try again?",
				onion.onion_type.as_str(),
			));
		}

		let next = self.advance(onion.data())?;
		Ok(PeelResponse::text(
			"",
			"The server returned an onion whose signature we VERIFIED!",
			next.onion_type.as_str(),
		))
	}

	pub fn reset(&self) {
		self.session.reset();
	}

	/// Serves an artifact from the session's artifact directory. Mirrors
	/// `rdv_file`'s allow-list: only paths under the configured artifact
	/// root may be read. The component-wise containment check runs
	/// before any filesystem access, so an out-of-root request is
	/// refused with 403 regardless of whether the path exists;
	/// canonicalizing afterwards closes the symlink-escape gap the
	/// original's plain `strncmp` allow-list left open.
	pub fn file(&self, path: &str) -> Result<FileResponse, FileError> {
		let requested = PathBuf::from(path);
		if !requested.starts_with(&self.artifact_root) {
			return Err(FileError::Forbidden);
		}

		if let Ok(canonical_root) = self.artifact_root.canonicalize() {
			if let Ok(canonical) = requested.canonicalize() {
				if !canonical.starts_with(&canonical_root) {
					return Err(FileError::Forbidden);
				}
			}
		}

		let bytes = std::fs::read(&requested)?;
		let content_type = match requested.extension().and_then(|e| e.to_str()) {
			Some("png") => "image/png",
			Some("jpg") | Some("jpeg") => "image/jpeg",
			_ => "application/octet-stream",
		};
		Ok(FileResponse { content_type, bytes })
	}
}

fn random_password() -> String {
	const SUFFIX_LEN: usize = onion::PASSWORD_LEN - 3;
	let mut rng = rand::thread_rng();
	let mut password = String::with_capacity(onion::PASSWORD_LEN);
	password.push_str(onion::PASSWORD_PREFIX);
	for _ in 0..SUFFIX_LEN {
		password.push((b'a' + rng.gen_range(0..26)) as char);
	}
	password
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{Ed25519Verifier, LsbSteganography, Pbkdf2ChaChaCipher, Sha256CommitmentPow};
	use crate::dancer::Dancer;
	use crate::onion::test_util::build_onion_bytes;
	use crate::proxy::mock::MockProxy;
	use chacha20poly1305::aead::{Aead, KeyInit};
	use chacha20poly1305::{ChaCha20Poly1305, Nonce};
	use pbkdf2::pbkdf2_hmac;
	use sha2::{Digest, Sha256};
	use std::time::Duration;

	const SALT: &[u8] = b"peeler-test-salt";

	fn encrypt_for(password: &str, plaintext: &[u8]) -> Vec<u8> {
		let mut key = [0u8; 32];
		pbkdf2_hmac::<Sha256>(password.as_bytes(), SALT, 100_000, &mut key);
		let cipher = ChaCha20Poly1305::new_from_slice(&key).unwrap();
		let nonce = Nonce::from_slice(b"unique-nonce");
		let ciphertext = cipher.encrypt(nonce, plaintext).unwrap();
		let mut blob = nonce.to_vec();
		blob.extend_from_slice(&ciphertext);
		blob
	}

	fn test_peeler() -> (Peeler, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let session = Arc::new(SessionStore::new());
		let proxy = Arc::new(MockProxy::new(200));
		let dancer = Dancer::new(proxy, 1024, Duration::from_secs(5));
		let peeler = Peeler::new(
			session,
			dancer,
			Arc::new(Pbkdf2ChaChaCipher::new(SALT.to_vec())),
			Arc::new(Ed25519Verifier),
			Arc::new(Sha256CommitmentPow),
			Arc::new(LsbSteganography),
			dir.path().to_path_buf(),
		);
		(peeler, dir)
	}

	#[test]
	fn gen_request_then_image_installs_base_onion() {
		let (peeler, _dir) = test_peeler();
		let url = peeler.gen_request("example.com", false).unwrap();
		assert!(url.starts_with("http://example.com/photos/"));

		let password = peeler.session.get_password().unwrap();
		let net = r#"{"window":1,"wait":0,"redirect":"r","initial":"i"}"#;
		let onion_bytes = build_onion_bytes(0, b"", net.as_bytes());
		let ciphertext = encrypt_for(&password, &onion_bytes);
		let cover = LsbSteganography.embed(&vec![0xAAu8; 4096], &ciphertext).unwrap();

		let resp = peeler.image(&cover).unwrap();
		assert_eq!(resp.onion_type, "base");
		assert!(resp.image.starts_with("/rendezvous/file"));
	}

	#[tokio::test]
	async fn peel_base_hands_net_to_dancer_and_onion_stays_base() {
		let (peeler, _dir) = test_peeler();
		peeler.gen_request("example.com", false).unwrap();
		let password = peeler.session.get_password().unwrap();
		let net = r#"{"window":1,"wait":0,"redirect":"r","initial":"i"}"#;
		let onion_bytes = build_onion_bytes(0, b"", net.as_bytes());
		let ciphertext = encrypt_for(&password, &onion_bytes);
		let cover = LsbSteganography.embed(&vec![0xAAu8; 4096], &ciphertext).unwrap();
		peeler.image(&cover).unwrap();

		let resp = peeler.peel(None).await.unwrap();
		assert_eq!(resp.status, "Complete");
		assert_eq!(resp.onion_type, "base");
		// BASE never advances, so a second peel behaves identically
		let resp2 = peeler.peel(None).await.unwrap();
		assert_eq!(resp2.onion_type, "base");
	}

	#[test]
	fn peel_pow_decrypts_data_not_puzzle_secret_and_advances() {
		let (peeler, _dir) = test_peeler();
		peeler.gen_request("example.com", false).unwrap();
		let password = peeler.session.get_password().unwrap();

		// index 0 -> suffix "aaaaa", so the search matches on its very
		// first attempt and the test stays fast.
		let pow_password = "aaaaaaaa".to_string();
		let commitment = Sha256::digest(pow_password.as_bytes());
		let mut puzzle = commitment.to_vec();
		puzzle.extend_from_slice(b"unused-secret-half");

		let next_onion = build_onion_bytes(4, b"", b"");
		let inner_ciphertext = encrypt_for(&pow_password, &next_onion);
		let onion_bytes = build_onion_bytes(1, &puzzle, &inner_ciphertext);
		let ciphertext = encrypt_for(&password, &onion_bytes);
		let cover = LsbSteganography.embed(&vec![0xAAu8; 4096], &ciphertext).unwrap();
		peeler.image(&cover).unwrap();

		// kick the search off
		let started = futures::executor::block_on(peeler.peel(None)).unwrap();
		assert_eq!(started.status, "OK the Proof-Of-Work has commenced");

		let mut finished = None;
		for _ in 0..100 {
			let resp = futures::executor::block_on(peeler.peel(None)).unwrap();
			if resp.status == "Your Proof-Of-Work has finished successfully!" {
				finished = Some(resp);
				break;
			}
			std::thread::sleep(std::time::Duration::from_millis(20));
		}

		let resp = finished.expect("pow did not finish in time");
		assert!(matches!(resp.info, crate::types::PeelInfo::Percent(100)));
		assert_eq!(resp.onion_type, "collection");
	}

	#[test]
	fn peel_captcha_materializes_image_on_first_call_then_checks_answer() {
		let (peeler, _dir) = test_peeler();
		peeler.gen_request("example.com", false).unwrap();
		let password = peeler.session.get_password().unwrap();

		let mut puzzle = b"fake-png-bytes".to_vec();
		puzzle.push(0);
		puzzle.extend_from_slice(b"swordfish");
		let next_onion = build_onion_bytes(4, b"", b"");
		let onion_bytes = build_onion_bytes(2, &puzzle, &next_onion);
		let ciphertext = encrypt_for(&password, &onion_bytes);
		let cover = LsbSteganography.embed(&vec![0xAAu8; 4096], &ciphertext).unwrap();
		peeler.image(&cover).unwrap();

		let first = futures::executor::block_on(peeler.peel(None)).unwrap();
		assert_eq!(first.status, "Here is your captcha image!");
		assert!(peeler.session.get_captcha().is_some());

		let wrong = PeelAction {
			action: Some(serde_json::Value::String("nope".to_string())),
		};
		let wrong_resp = futures::executor::block_on(peeler.peel(Some(wrong))).unwrap();
		assert_eq!(wrong_resp.status, "Nope, try again?");

		let right = PeelAction {
			action: Some(serde_json::Value::String("swordfish".to_string())),
		};
		let right_resp = futures::executor::block_on(peeler.peel(Some(right))).unwrap();
		assert_eq!(right_resp.status, "Excellent, you solved the captcha");
	}

	#[test]
	fn file_refuses_paths_outside_the_artifact_root() {
		let (peeler, _dir) = test_peeler();
		assert!(matches!(peeler.file("/etc/passwd"), Err(FileError::Forbidden)));
	}

	#[test]
	fn file_serves_a_path_under_the_artifact_root() {
		let (peeler, dir) = test_peeler();
		let path = dir.path().join("hello.png");
		std::fs::write(&path, b"pngbytes").unwrap();
		let resp = peeler.file(path.to_str().unwrap()).unwrap();
		assert_eq!(resp.bytes, b"pngbytes");
		assert_eq!(resp.content_type, "image/png");
	}

	#[test]
	fn peel_signed_without_key_env_replies_with_soft_error() {
		let (peeler, _dir) = test_peeler();
		peeler.gen_request("example.com", false).unwrap();
		let password = peeler.session.get_password().unwrap();
		let onion_bytes = build_onion_bytes(3, b"not-a-real-signature-64-bytes-long-ok", b"next-onion-bytes");
		let ciphertext = encrypt_for(&password, &onion_bytes);
		let cover = LsbSteganography.embed(&vec![0xAAu8; 4096], &ciphertext).unwrap();
		peeler.image(&cover).unwrap();

		std::env::remove_var(DEFIANCE_PUBLIC_KEY_PATH_ENV);
		let resp = futures::executor::block_on(peeler.peel(None)).unwrap();
		assert!(resp.status.contains("DEFIANCE_PUBLIC_KEY_PATH"));
	}
}
