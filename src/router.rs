use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};

use crate::dancer::{Dancer, Net};
use crate::peeler::{FileError, Peeler, PeelerError};
use crate::types::{GenRequestBody, PeelAction};

/// Demultiplexes the `/rendezvous/*` and `/acs/*` HTTP surface (spec.md
/// §6) onto [`Peeler`]/[`Dancer`] calls and formats JSON replies.
///
/// Command segments are matched case-insensitively, mirroring the
/// original's `strcasecmp`-based dispatch; `file/<path>` itself is
/// matched literally since it is a filesystem path, not a command
/// name.
pub struct Router {
	peeler: Arc<Peeler>,
	dancer: Arc<Dancer>,
}

impl Router {
	pub fn new(peeler: Arc<Peeler>, dancer: Arc<Dancer>) -> Self {
		Router { peeler, dancer }
	}

	pub async fn route(&self, req: Request<Body>) -> Response<Body> {
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let lower = path.to_ascii_lowercase();

		match lower.as_str() {
			"/rendezvous/gen_request" => match require_post(&method, "gen_request") {
				Ok(()) => self.gen_request(req).await,
				Err(resp) => resp,
			},
			"/rendezvous/image" => match require_post(&method, "image") {
				Ok(()) => self.image(req).await,
				Err(resp) => resp,
			},
			"/rendezvous/peel" => match require_post(&method, "peel") {
				Ok(()) => self.peel(req).await,
				Err(resp) => resp,
			},
			"/rendezvous/reset" => self.reset(),
			"/acs/setup/" | "/acs/setup" => match require_post(&method, "setup") {
				Ok(()) => self.setup(req).await,
				Err(resp) => resp,
			},
			"/acs/progress" | "/acs/progress/" => self.progress().await,
			_ if lower.starts_with("/rendezvous/file/") => {
				if method != Method::GET {
					return bad_request("file requires a GET");
				}
				// the "file/" keyword is matched case-insensitively above;
				// the path that follows it is preserved verbatim, since it
				// names a real filesystem path.
				self.file(&path["/rendezvous/file/".len()..])
			}
			_ if lower.starts_with("/rendezvous/") => not_found_rendezvous(),
			_ if lower.starts_with("/acs/") => not_found_acs(),
			_ => not_found_rendezvous(),
		}
	}

	async fn gen_request(&self, req: Request<Body>) -> Response<Body> {
		let body = match read_json::<GenRequestBody>(req).await {
			Ok(b) => b,
			Err(resp) => return resp,
		};
		match self.peeler.gen_request(&body.server, body.secure) {
			Ok(url) => Response::builder()
				.status(StatusCode::OK)
				.header("content-type", "text/plain")
				.body(Body::from(url))
				.unwrap(),
			Err(e) => error_response(e),
		}
	}

	async fn image(&self, req: Request<Body>) -> Response<Body> {
		let body = match hyper::body::to_bytes(req.into_body()).await {
			Ok(b) => b,
			Err(_) => return bad_request("could not read request body"),
		};

		match self.peeler.image(&body) {
			Ok(resp) => json_response(StatusCode::OK, &resp),
			Err(e) => error_response(e),
		}
	}

	async fn peel(&self, req: Request<Body>) -> Response<Body> {
		let action = match read_json::<Option<PeelAction>>(req).await {
			Ok(a) => a,
			Err(resp) => return resp,
		};
		match self.peeler.peel(action).await {
			Ok(resp) => json_response(StatusCode::OK, &resp),
			Err(e) => error_response(e),
		}
	}

	fn reset(&self) -> Response<Body> {
		self.peeler.reset();
		Response::builder()
			.status(StatusCode::OK)
			.header("content-type", "text/plain")
			.body(Body::from("Reset OK"))
			.unwrap()
	}

	fn file(&self, path: &str) -> Response<Body> {
		match self.peeler.file(path) {
			Ok(resp) => Response::builder()
				.status(StatusCode::OK)
				.header("content-type", resp.content_type)
				.body(Body::from(resp.bytes))
				.unwrap(),
			Err(FileError::Forbidden) => Response::builder().status(StatusCode::FORBIDDEN).body(Body::empty()).unwrap(),
			Err(FileError::Io(_)) => not_found_rendezvous(),
		}
	}

	/// `POST /acs/setup/`: accepts a whole NET body directly, bypassing
	/// the BASE-onion peel path.
	async fn setup(&self, req: Request<Body>) -> Response<Body> {
		let net = match read_json::<Net>(req).await {
			Ok(n) => n,
			Err(resp) => return resp,
		};
		if self.dancer.setup(net).await {
			json_response(StatusCode::OK, &SetupResult::ok("ACS setup succesful"))
		} else {
			json_response(StatusCode::OK, &SetupResult::err("Already dancing the night away"))
		}
	}

	async fn progress(&self) -> Response<Body> {
		let event = self.dancer.progress().await;
		json_response(StatusCode::OK, &event)
	}
}

#[derive(serde::Serialize)]
struct SetupResult {
	status: &'static str,
	message: &'static str,
}

impl SetupResult {
	fn ok(message: &'static str) -> Self {
		SetupResult { status: "ok", message }
	}

	fn err(message: &'static str) -> Self {
		SetupResult { status: "error", message }
	}
}

fn error_response(e: PeelerError) -> Response<Body> {
	let status = match e {
		PeelerError::NoActiveOnion => StatusCode::BAD_REQUEST,
		PeelerError::Onion(_) => StatusCode::BAD_REQUEST,
		PeelerError::Crypto(_) => StatusCode::BAD_REQUEST,
		PeelerError::NoPassword => StatusCode::BAD_REQUEST,
		PeelerError::NotImplemented => StatusCode::BAD_REQUEST,
		PeelerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
	};
	let message = e.to_string();
	Response::builder()
		.status(status)
		.header("content-type", "application/json")
		.body(Body::from(format!(r#"{{"error":"{message}"}}"#)))
		.unwrap()
}

/// `/rendezvous/*`'s default for an unmatched path: a 400, mirroring
/// "No such DJB API request (Rendezvous)".
fn not_found_rendezvous() -> Response<Body> {
	Response::builder()
		.status(StatusCode::BAD_REQUEST)
		.body(Body::from("No such DJB API request (Rendezvous)"))
		.unwrap()
}

/// `/acs/*`'s default for an unmatched path: a 404, unlike rendezvous's
/// 400 default — this asymmetry is deliberate and mirrors the two
/// originals' differing fallback status codes.
fn not_found_acs() -> Response<Body> {
	Response::builder()
		.status(StatusCode::NOT_FOUND)
		.body(Body::from("No such DJB API request (ACS)"))
		.unwrap()
}

fn bad_request(message: &str) -> Response<Body> {
	Response::builder().status(StatusCode::BAD_REQUEST).body(Body::from(message.to_string())).unwrap()
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Body> {
	match serde_json::to_vec(value) {
		Ok(bytes) => Response::builder()
			.status(status)
			.header("content-type", "application/json")
			.body(Body::from(bytes))
			.unwrap(),
		Err(_) => Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Body::empty()).unwrap(),
	}
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
	let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|_| bad_request("could not read request body"))?;
	let bytes: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
	serde_json::from_slice(bytes).map_err(|_| bad_request("malformed JSON body"))
}

fn require_post(method: &Method, name: &str) -> Result<(), Response<Body>> {
	if method == Method::POST {
		Ok(())
	} else {
		Err(bad_request(&format!("{name} requires a POST")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{Ed25519Verifier, LsbSteganography, Pbkdf2ChaChaCipher, Sha256CommitmentPow};
	use crate::peeler::Peeler;
	use crate::proxy::mock::MockProxy;
	use crate::session::SessionStore;
	use std::time::Duration;

	fn test_router() -> (Router, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let session = Arc::new(SessionStore::new());
		let proxy = Arc::new(MockProxy::new(200));
		let dancer = Dancer::new(proxy, 1024, Duration::from_secs(5));
		let peeler = Arc::new(Peeler::new(
			session,
			dancer.clone(),
			Arc::new(Pbkdf2ChaChaCipher::new(b"test-salt".to_vec())),
			Arc::new(Ed25519Verifier),
			Arc::new(Sha256CommitmentPow),
			Arc::new(LsbSteganography),
			dir.path().to_path_buf(),
		));
		(Router::new(peeler, dancer), dir)
	}

	fn request(method: Method, path: &str) -> Request<Body> {
		Request::builder().method(method).uri(path).body(Body::empty()).unwrap()
	}

	#[tokio::test]
	async fn unknown_rendezvous_path_defaults_to_400() {
		let (router, _dir) = test_router();
		let resp = router.route(request(Method::GET, "/rendezvous/nonsense")).await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn unknown_acs_path_defaults_to_404() {
		let (router, _dir) = test_router();
		let resp = router.route(request(Method::GET, "/acs/nonsense")).await;
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn gen_request_wrong_method_is_400() {
		let (router, _dir) = test_router();
		let resp = router.route(request(Method::GET, "/rendezvous/gen_request")).await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
		let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
		assert_eq!(&body[..], b"gen_request requires a POST");
	}

	#[tokio::test]
	async fn command_segment_matching_is_case_insensitive() {
		let (router, _dir) = test_router();
		let req = Request::builder()
			.method(Method::POST)
			.uri("/RenDezVous/Gen_Request")
			.body(Body::from(r#"{"server":"example.com","secure":false}"#))
			.unwrap();
		let resp = router.route(req).await;
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn reset_accepts_any_method() {
		let (router, _dir) = test_router();
		let resp = router.route(request(Method::GET, "/rendezvous/reset")).await;
		assert_eq!(resp.status(), StatusCode::OK);
		let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
		assert_eq!(&body[..], b"Reset OK");
	}

	#[tokio::test]
	async fn acs_setup_rejects_a_second_setup_while_dancing() {
		let (router, _dir) = test_router();
		let net_body = r#"{"window":1,"wait":5,"redirect":"r.example","initial":"i.example"}"#;
		let first = Request::builder()
			.method(Method::POST)
			.uri("/acs/setup/")
			.body(Body::from(net_body))
			.unwrap();
		let resp = router.route(first).await;
		assert_eq!(resp.status(), StatusCode::OK);

		// kick the dance off
		let _ = router.route(request(Method::GET, "/acs/progress")).await;

		let second = Request::builder()
			.method(Method::POST)
			.uri("/acs/setup/")
			.body(Body::from(net_body))
			.unwrap();
		let resp = router.route(second).await;
		assert_eq!(resp.status(), StatusCode::OK);
		let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
		assert!(std::str::from_utf8(&body).unwrap().contains("Already dancing"));
	}
}
