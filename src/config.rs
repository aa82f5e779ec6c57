use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("config file already exists at {0}")]
	AlreadyExists(PathBuf),
	#[error("io error reading/writing config: {0}")]
	Io(#[from] std::io::Error),
	#[error("could not parse config file: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("could not serialize config file: {0}")]
	Serialize(#[from] toml::ser::Error),
}

/// Runtime configuration, loaded from an optional TOML file and
/// overridden by CLI flags, mirroring the teacher's config-from-args-
/// and-file layering.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub bind_addr: SocketAddr,
	pub artifact_root: PathBuf,
	pub history_cap: usize,
	pub progress_timeout_secs: u64,
	pub log_level: String,
	pub upstream_proxy: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			bind_addr: "0.0.0.0:8080".parse().unwrap(),
			artifact_root: PathBuf::from("/tmp/jpeg_steg_embed"),
			history_cap: 1024,
			progress_timeout_secs: 5,
			log_level: "info".to_string(),
			upstream_proxy: None,
		}
	}
}

impl Config {
	pub fn progress_timeout(&self) -> Duration {
		Duration::from_secs(self.progress_timeout_secs)
	}

	pub fn load(path: &Path) -> Result<Config, ConfigError> {
		let text = std::fs::read_to_string(path)?;
		Ok(toml::from_str(&text)?)
	}

	/// Writes a starter config file, refusing to overwrite an existing
	/// one, mirroring the teacher's `init-config` subcommand (here:
	/// `gen-config`, with no wallet-password prompt since there is no
	/// analogue in this domain).
	pub fn write_starter(path: &Path) -> Result<(), ConfigError> {
		if path.exists() {
			return Err(ConfigError::AlreadyExists(path.to_path_buf()));
		}
		let text = toml::to_string_pretty(&Config::default())?;
		std::fs::write(path, text)?;
		Ok(())
	}
}

/// The public key environment variable name, read lazily at SIGNED-peel
/// time rather than at startup (spec.md §4.3.3): it names the variable,
/// it is not itself a config value.
pub const DEFIANCE_PUBLIC_KEY_PATH_ENV: &str = crate::peeler::DEFIANCE_PUBLIC_KEY_PATH_ENV;

#[derive(Parser, Debug)]
#[command(name = "rendezvous-acsd", version, about = "Rendezvous/ACS protocol server")]
pub struct Cli {
	#[command(subcommand)]
	pub command: Option<Command>,

	/// Path to a TOML config file.
	#[arg(long)]
	pub config: Option<PathBuf>,

	/// Override the bind address from the config file.
	#[arg(long)]
	pub bind_addr: Option<SocketAddr>,

	/// Override the artifact root directory from the config file.
	#[arg(long)]
	pub artifact_root: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
	/// Writes a starter config file and exits.
	GenConfig {
		#[arg(long, default_value = "rendezvous-acsd.toml")]
		path: PathBuf,
	},
}

impl Cli {
	pub fn resolve(self) -> Result<Config, ConfigError> {
		let mut config = match &self.config {
			Some(path) => Config::load(path)?,
			None => Config::default(),
		};
		if let Some(bind_addr) = self.bind_addr {
			config.bind_addr = bind_addr;
		}
		if let Some(artifact_root) = self.artifact_root {
			config.artifact_root = artifact_root;
		}
		Ok(config)
	}
}
