use thiserror::Error;

/// Magic bytes that must begin every onion buffer.
pub const ONION_MAGIC: [u8; 4] = *b"RDV1";

/// Size in bytes of the fixed onion header, before the payload.
pub const HEADER_LEN: usize = 24;

/// The password handed to clients always begins with these three bytes;
/// the remaining five lowercase letters are the proof-of-work keyspace.
pub const PASSWORD_PREFIX: &str = "aaa";
pub const PASSWORD_LEN: usize = 16;

/// The layer type recovered from an onion header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OnionType {
	Base,
	Pow,
	Captcha,
	Signed,
	Collection,
}

impl OnionType {
	fn from_byte(b: u8) -> Result<OnionType, OnionError> {
		match b {
			0 => Ok(OnionType::Base),
			1 => Ok(OnionType::Pow),
			2 => Ok(OnionType::Captcha),
			3 => Ok(OnionType::Signed),
			4 => Ok(OnionType::Collection),
			_ => Err(OnionError::UnknownType(b)),
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			OnionType::Base => "base",
			OnionType::Pow => "pow",
			OnionType::Captcha => "captcha",
			OnionType::Signed => "signed",
			OnionType::Collection => "collection",
		}
	}
}

/// A single decoded onion layer: header fields plus the raw payload
/// bytes the peeler dispatches on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Onion {
	pub onion_type: OnionType,
	pub size: u32,
	pub puzzle_offset: u32,
	pub puzzle_size: u32,
	pub data_offset: u32,
	pub data_size: u32,
	pub bytes: Vec<u8>,
}

impl Onion {
	/// The puzzle slice (CAPTCHA image bytes, POW commitment, signature
	/// bytes, ...) as described by the header offsets.
	pub fn puzzle(&self) -> &[u8] {
		let start = self.puzzle_offset as usize;
		let end = start + self.puzzle_size as usize;
		&self.bytes[start..end]
	}

	/// The data slice: the next onion layer, or the terminal COLLECTION
	/// payload.
	pub fn data(&self) -> &[u8] {
		let start = self.data_offset as usize;
		let end = start + self.data_size as usize;
		&self.bytes[start..end]
	}
}

/// Parse and bounds-check a decrypted onion buffer.
///
/// Mirrors `rdv_validate_onion` in the original rendezvous server: magic
/// must match, `size` must equal the buffer length, and both the puzzle
/// and data slices must lie entirely within the buffer.
pub fn validate(bytes: Vec<u8>) -> Result<Onion, OnionError> {
	if bytes.len() < HEADER_LEN {
		return Err(OnionError::Truncated {
			have: bytes.len(),
			need: HEADER_LEN,
		});
	}

	let magic = &bytes[0..4];
	if magic != ONION_MAGIC {
		return Err(OnionError::BadMagic);
	}

	let onion_type = OnionType::from_byte(bytes[4])?;
	let size = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
	let puzzle_offset = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
	let puzzle_size = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
	let data_offset = u32::from_le_bytes(bytes[20..24].try_into().unwrap());

	if size as usize != bytes.len() {
		return Err(OnionError::SizeMismatch {
			header: size,
			actual: bytes.len() as u32,
		});
	}

	let puzzle_end = (puzzle_offset as u64) + (puzzle_size as u64);
	if puzzle_end > bytes.len() as u64 {
		return Err(OnionError::OutOfBounds("puzzle"));
	}

	// data_size is implicit: everything after data_offset belongs to the
	// next layer (or the terminal collection payload).
	if data_offset as usize > bytes.len() {
		return Err(OnionError::OutOfBounds("data"));
	}
	let data_size = bytes.len() as u32 - data_offset;

	Ok(Onion {
		onion_type,
		size,
		puzzle_offset,
		puzzle_size,
		data_offset,
		data_size,
		bytes,
	})
}

/// Error types for decoding and validating onions.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum OnionError {
	#[error("onion buffer too short: have {have}, need at least {need}")]
	Truncated { have: usize, need: usize },
	#[error("onion magic bytes do not match")]
	BadMagic,
	#[error("unknown onion type byte: {0}")]
	UnknownType(u8),
	#[error("onion header size {header} does not match buffer length {actual}")]
	SizeMismatch { header: u32, actual: u32 },
	#[error("{0} slice lies outside the onion buffer")]
	OutOfBounds(&'static str),
	#[error("password must be {PASSWORD_LEN} bytes starting with \"{PASSWORD_PREFIX}\"")]
	BadPassword,
	#[error("steganography extraction failed: {0}")]
	StegError(String),
	#[error("decryption failed: {0}")]
	DecryptError(String),
}

/// Checks that a candidate password has the shape `rdv_*` requires:
/// exactly [`PASSWORD_LEN`] ASCII bytes, the first three always `"aaa"`.
pub fn validate_password(password: &str) -> Result<(), OnionError> {
	if password.len() != PASSWORD_LEN || !password.starts_with(PASSWORD_PREFIX) {
		return Err(OnionError::BadPassword);
	}
	if !password.is_ascii() {
		return Err(OnionError::BadPassword);
	}
	Ok(())
}
