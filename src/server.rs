use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::Server as HyperServer;

use crate::router::Router;

/// Binds the HTTP listener, routes every request through [`Router`], and
/// installs SIGINT/SIGTERM handling for graceful shutdown, reusing the
/// teacher's `build_signals_fut` shape.
pub async fn run(bind_addr: SocketAddr, router: Arc<Router>) -> Result<(), hyper::Error> {
	let make_svc = make_service_fn(move |_conn| {
		let router = router.clone();
		async move {
			Ok::<_, Infallible>(service_fn(move |req| {
				let router = router.clone();
				async move { Ok::<_, Infallible>(router.route(req).await) }
			}))
		}
	});

	log::info!("listening on {bind_addr}");
	let server = HyperServer::bind(&bind_addr).serve(make_svc);
	server.with_graceful_shutdown(shutdown_signal()).await
}

async fn shutdown_signal() {
	build_signals_fut().await;
	log::info!("shutdown signal received, draining in-flight requests");
}

async fn build_signals_fut() {
	if cfg!(unix) {
		use tokio::signal::unix::{signal, SignalKind};

		let mut terminate_signal =
			signal(SignalKind::terminate()).expect("failed to create terminate signal");
		let mut quit_signal = signal(SignalKind::quit()).expect("failed to create quit signal");
		let mut interrupt_signal =
			signal(SignalKind::interrupt()).expect("failed to create interrupt signal");

		futures::future::select_all(vec![
			Box::pin(terminate_signal.recv()),
			Box::pin(quit_signal.recv()),
			Box::pin(interrupt_signal.recv()),
		])
		.await;
	} else {
		tokio::signal::ctrl_c()
			.await
			.expect("failed to install CTRL+C signal handler");
	}
}
