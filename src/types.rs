use serde::{Deserialize, Serialize};

/// Body of `POST /rendezvous/gen_request`.
#[derive(Debug, Deserialize)]
pub struct GenRequestBody {
	pub server: String,
	#[serde(default)]
	pub secure: bool,
}

/// Reply to `POST /rendezvous/image`: where the extracted cover image can
/// be fetched from, and the type of the onion layer it held.
#[derive(Debug, Serialize)]
pub struct ImageResponse {
	pub image: String,
	pub onion_type: String,
}

/// Body of `POST /rendezvous/peel`. Only the CAPTCHA layer reads
/// `action` (a CAPTCHA answer); every other layer ignores the body
/// entirely, matching the original's onion-type-dispatched peel. It is
/// left as a raw JSON value (not `String`) so an answer of the wrong
/// type can be reported precisely instead of failing body parsing.
#[derive(Debug, Deserialize, Default)]
pub struct PeelAction {
	pub action: Option<serde_json::Value>,
}

/// Reply to `peel`: `{info, status, onion_type}` per spec.md §4.3.
/// `info` is numeric for POW progress, a string everywhere else.
#[derive(Debug, Serialize, Clone)]
pub struct PeelResponse {
	pub info: PeelInfo,
	pub status: String,
	pub onion_type: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(untagged)]
pub enum PeelInfo {
	Percent(u64),
	Text(String),
}

impl PeelResponse {
	pub fn text(info: impl Into<String>, status: impl Into<String>, onion_type: impl Into<String>) -> Self {
		PeelResponse {
			info: PeelInfo::Text(info.into()),
			status: status.into(),
			onion_type: onion_type.into(),
		}
	}

	pub fn percent(percent: u64, status: impl Into<String>, onion_type: impl Into<String>) -> Self {
		PeelResponse {
			info: PeelInfo::Percent(percent),
			status: status.into(),
			onion_type: onion_type.into(),
		}
	}
}

/// Reply to `GET /rendezvous/file/<path>`: raw bytes plus a content type,
/// used by the router to build the HTTP response.
pub struct FileResponse {
	pub content_type: &'static str,
	pub bytes: Vec<u8>,
}
