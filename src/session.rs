use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use zeroize::Zeroize;

use crate::artifact::ArtifactGuard;
use crate::crypto::ProofOfWork;
use crate::onion::Onion;

/// Snapshot of the background proof-of-work search, returned to callers
/// without holding the session lock across the atomic reads.
#[derive(Clone, Debug)]
pub struct PowSnapshot {
	pub started: bool,
	pub finished: bool,
	pub progress: u64,
	/// The recovered password, once the search has finished successfully.
	/// `None` while running, and `None` if the search exhausted its
	/// keyspace (or was cancelled) without a match.
	pub found_password: Option<String>,
}

/// Handle to a running (or just-finished) POW worker thread.
///
/// The worker is a plain `std::thread`, not a tokio task: it never
/// yields mid-search and is only cancellable at iteration boundaries via
/// `quit`, matching spec.md's concurrency model for the original
/// `rdv_pow_worker`.
struct PowHandle {
	progress: Arc<AtomicU64>,
	finished: Arc<AtomicBool>,
	quit: Arc<AtomicBool>,
	/// Set by the worker thread as its last action, after `finished`.
	/// `pow_start` checks this before allowing a new search to begin so
	/// that a cancelled-but-not-yet-exited worker is never raced.
	retired: Arc<AtomicBool>,
	/// Written by the worker *before* `finished` is set (see `pow_start`);
	/// readers observe `finished` first under `Acquire` so this write is
	/// always visible once `finished` reads true.
	found: Arc<Mutex<Option<String>>>,
	join: Option<JoinHandle<()>>,
}

/// All the mutable state owned by one active rendezvous session.
///
/// A fresh [`SessionStore`] starts empty; the HTTP-facing [`crate::peeler::Peeler`]
/// drives it through `gen_request` -> `image` -> `peel`* -> (eventually)
/// `reset`. Every mutation happens behind a single mutex, matching the
/// original's single-session, single-mutex design (spec.md §5) rather
/// than field-level locking.
#[derive(Default)]
struct SessionInner {
	password: Option<String>,
	onion: Option<Onion>,
	image_guard: Option<ArtifactGuard>,
	image_dir_guard: Option<ArtifactGuard>,
	captcha_guard: Option<ArtifactGuard>,
	pow: Option<PowHandle>,
}

impl Drop for SessionInner {
	fn drop(&mut self) {
		if let Some(password) = self.password.as_mut() {
			password.zeroize();
		}
	}
}

pub struct SessionStore {
	inner: Mutex<SessionInner>,
}

impl Default for SessionStore {
	fn default() -> Self {
		Self::new()
	}
}

impl SessionStore {
	pub fn new() -> Self {
		SessionStore {
			inner: Mutex::new(SessionInner::default()),
		}
	}

	/// Releases password, onion, captcha, image, and POW state
	/// independently. A partial unlink failure for any one artifact is
	/// logged by its [`ArtifactGuard`]'s `Drop`, never surfaced here:
	/// `reset` always succeeds from the caller's point of view.
	pub fn reset(&self) {
		let mut inner = self.inner.lock().unwrap();
		if let Some(mut password) = inner.password.take() {
			password.zeroize();
		}
		inner.onion = None;
		inner.image_guard = None;
		inner.image_dir_guard = None;
		inner.captcha_guard = None;
		if let Some(pow) = inner.pow.take() {
			pow.quit.store(true, Ordering::Relaxed);
			// Fire-and-forget cancellation: reset does not block waiting
			// for the worker thread to retire.
			drop(pow.join);
		}
	}

	pub fn set_password(&self, password: String) {
		self.inner.lock().unwrap().password = Some(password);
	}

	pub fn get_password(&self) -> Option<String> {
		self.inner.lock().unwrap().password.clone()
	}

	pub fn set_onion(&self, onion: Onion) {
		self.inner.lock().unwrap().onion = Some(onion);
	}

	pub fn get_onion(&self) -> Option<Onion> {
		self.inner.lock().unwrap().onion.clone()
	}

	pub fn set_images(&self, image_path: PathBuf, image_dir: PathBuf) {
		let mut inner = self.inner.lock().unwrap();
		inner.image_guard = Some(ArtifactGuard::file(image_path));
		inner.image_dir_guard = Some(ArtifactGuard::dir(image_dir));
	}

	/// The session's current image directory, if an `image` call has
	/// installed one. Used by the first CAPTCHA `peel` to materialize
	/// `captcha.png` alongside the extracted cover JPEG.
	pub fn get_image_dir(&self) -> Option<PathBuf> {
		self.inner
			.lock()
			.unwrap()
			.image_dir_guard
			.as_ref()
			.map(|g| g.path().to_path_buf())
	}

	pub fn clear_captcha(&self) {
		self.inner.lock().unwrap().captcha_guard = None;
	}

	pub fn set_captcha(&self, path: PathBuf) {
		self.inner.lock().unwrap().captcha_guard = Some(ArtifactGuard::file(path));
	}

	pub fn get_captcha(&self) -> Option<PathBuf> {
		self.inner
			.lock()
			.unwrap()
			.captcha_guard
			.as_ref()
			.map(|g| g.path().to_path_buf())
	}

	/// Starts a background POW search for `onion`'s commitment. Refuses
	/// (returns `false`) if a worker is already running and has not yet
	/// retired, matching the original's idempotent-refusing `pow_start`.
	pub fn pow_start(&self, commitment: Vec<u8>, pow: Arc<dyn ProofOfWork>) -> bool {
		let mut inner = self.inner.lock().unwrap();
		if let Some(existing) = &inner.pow {
			if !existing.retired.load(Ordering::Acquire) {
				return false;
			}
		}

		let progress = Arc::new(AtomicU64::new(0));
		let finished = Arc::new(AtomicBool::new(false));
		let quit = Arc::new(AtomicBool::new(false));
		let retired = Arc::new(AtomicBool::new(false));
		let found = Arc::new(Mutex::new(None));

		let thread_progress = progress.clone();
		let thread_finished = finished.clone();
		let thread_quit = quit.clone();
		let thread_retired = retired.clone();
		let thread_found = found.clone();

		let join = std::thread::spawn(move || {
			let result = pow.search(&commitment, &thread_progress, &thread_quit);
			// `found` is written before `finished`/`retired`: readers
			// must observe `finished` (Acquire) before trusting `found`.
			*thread_found.lock().unwrap() = result;
			thread_finished.store(true, Ordering::Release);
			thread_retired.store(true, Ordering::Release);
		});

		inner.pow = Some(PowHandle {
			progress,
			finished,
			quit,
			retired,
			found,
			join: Some(join),
		});
		true
	}

	pub fn pow_cancel(&self) {
		let inner = self.inner.lock().unwrap();
		if let Some(pow) = &inner.pow {
			pow.quit.store(true, Ordering::Relaxed);
		}
	}

	pub fn pow_snapshot(&self) -> Option<PowSnapshot> {
		let inner = self.inner.lock().unwrap();
		inner.pow.as_ref().map(|pow| PowSnapshot {
			started: true,
			finished: pow.finished.load(Ordering::Acquire),
			progress: pow.progress.load(Ordering::Relaxed),
			found_password: pow.found.lock().unwrap().clone(),
		})
	}

	/// Drops the POW slot entirely once its result has been consumed by a
	/// `peel`, matching `rdv_pow_reset` being called right after the
	/// inner onion is installed. Distinct from `pow_cancel`, which only
	/// requests cancellation of a still-running search.
	pub fn pow_clear(&self) {
		self.inner.lock().unwrap().pow = None;
	}
}
