use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::Client;
use hyper_proxy::{Intercept, Proxy, ProxyConnector};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
	#[error("request to {host} failed: {source}")]
	Request {
		host: String,
		#[source]
		source: hyper::Error,
	},
	#[error("invalid proxy URI: {0}")]
	BadProxyUri(#[from] http::uri::InvalidUri),
}

/// Performs an outbound GET against `host` (always to `/`, matching
/// `acs_request`'s fixed-path hops) and reports the status code
/// observed — the async counterpart to the original `djb_proxy_add`
/// push-callback queue the ACS dance used to reach its initial/redirect
/// endpoints.
#[async_trait]
pub trait OutboundProxy: Send + Sync {
	async fn get(&self, host: &str) -> Result<u16, ProxyError>;
}

/// Concrete [`OutboundProxy`] built on `hyper::Client`, optionally routed
/// through an upstream HTTP proxy via `hyper-proxy`.
pub struct HyperProxy {
	client: Client<ProxyConnector<HttpConnector>>,
}

impl HyperProxy {
	/// `upstream` is the address of an upstream HTTP proxy to tunnel
	/// through (e.g. a local Tor/StegoTorus bridge), or `None` to connect
	/// directly.
	pub fn new(upstream: Option<http::Uri>) -> Result<Self, ProxyError> {
		let connector = HttpConnector::new();
		let mut proxy_connector = ProxyConnector::new(connector).expect("proxy connector");
		if let Some(uri) = upstream {
			let proxy = Proxy::new(Intercept::All, uri);
			proxy_connector.add_proxy(proxy);
		}
		Ok(HyperProxy {
			client: Client::builder().build(proxy_connector),
		})
	}
}

#[async_trait]
impl OutboundProxy for HyperProxy {
	async fn get(&self, host: &str) -> Result<u16, ProxyError> {
		let uri: http::Uri = format!("http://{host}/").parse().map_err(ProxyError::BadProxyUri)?;
		let response = self
			.client
			.get(uri)
			.await
			.map_err(|source| ProxyError::Request {
				host: host.to_string(),
				source,
			})?;
		Ok(response.status().as_u16())
	}
}
