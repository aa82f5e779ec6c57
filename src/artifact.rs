use std::path::{Path, PathBuf};

/// Owns a filesystem path and removes it on drop. Used for the image,
/// captcha, and cover-JPEG artifacts a session creates so that `reset`
/// (and ordinary `Drop`) never leaves stray files behind, matching the
/// unlink-on-reset behavior of the original `rdv_reset`.
///
/// A failed unlink is logged, never propagated: by the time a guard is
/// dropped there is no caller left to hand an error to.
pub struct ArtifactGuard {
	path: PathBuf,
	is_dir: bool,
}

impl ArtifactGuard {
	pub fn file(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			is_dir: false,
		}
	}

	pub fn dir(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			is_dir: true,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for ArtifactGuard {
	fn drop(&mut self) {
		let result = if self.is_dir {
			std::fs::remove_dir_all(&self.path)
		} else {
			std::fs::remove_file(&self.path)
		};
		if let Err(e) = result {
			if e.kind() != std::io::ErrorKind::NotFound {
				log::warn!("failed to unlink artifact {}: {}", self.path.display(), e);
			}
		}
	}
}
