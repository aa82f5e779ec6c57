mod artifact;
mod config;
mod crypto;
mod dancer;
mod onion;
mod peeler;
mod proxy;
mod router;
mod server;
mod session;
mod types;

use std::sync::Arc;

use clap::Parser;

use config::{Cli, Command, Config, ConfigError};
use crypto::{Ed25519Verifier, LsbSteganography, Pbkdf2ChaChaCipher, Sha256CommitmentPow};
use dancer::Dancer;
use peeler::Peeler;
use proxy::HyperProxy;
use router::Router;
use session::SessionStore;

fn main() {
	if let Err(e) = real_main() {
		log::error!("fatal: {e}");
		std::process::exit(1);
	}
}

fn real_main() -> Result<(), Box<dyn std::error::Error>> {
	let cli = Cli::parse();

	if let Some(Command::GenConfig { path }) = &cli.command {
		Config::write_starter(path).map_err(box_config_error)?;
		println!("Config file written to {:?}.", path);
		return Ok(());
	}

	let config = cli.resolve().map_err(box_config_error)?;
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();

	std::fs::create_dir_all(&config.artifact_root)?;

	let upstream_proxy = match &config.upstream_proxy {
		Some(uri) => Some(uri.parse()?),
		None => None,
	};

	let session = Arc::new(SessionStore::new());
	let proxy = Arc::new(HyperProxy::new(upstream_proxy)?);
	let dancer = Dancer::new(proxy, config.history_cap, config.progress_timeout());
	let peeler = Arc::new(Peeler::new(
		session,
		dancer.clone(),
		Arc::new(Pbkdf2ChaChaCipher::new(b"rendezvous-acs".to_vec())),
		Arc::new(Ed25519Verifier),
		Arc::new(Sha256CommitmentPow),
		Arc::new(LsbSteganography),
		config.artifact_root.clone(),
	));
	let router = Arc::new(Router::new(peeler, dancer));

	let rt = tokio::runtime::Runtime::new()?;
	rt.block_on(server::run(config.bind_addr, router))?;
	Ok(())
}

fn box_config_error(e: ConfigError) -> Box<dyn std::error::Error> {
	Box::new(e)
}
