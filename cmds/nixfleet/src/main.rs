mod api;
mod cmds;
mod jobs;
mod scheduler;
mod webhook;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use nixfleet_base::Inventory;
use nixfleet_pki::PkiStore;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{prelude::*, EnvFilter};

use cmds::{
	apply::{Apply, Plan},
	drift::Drift,
	pki::Pki,
	pull::Pull,
	serve::Serve,
};

#[derive(Parser, Clone)]
pub struct CommonOpts {
	/// Inventory file (JSON)
	#[clap(long, env = "NIXFLEET_INVENTORY", default_value = "inventory.json")]
	pub inventory: PathBuf,

	/// Flake reference host closures are built from
	#[clap(long, env = "NIXFLEET_FLAKE", default_value = ".")]
	pub flake: String,

	/// PKI store directory on the control plane
	#[clap(long, env = "NIXFLEET_PKI_DIR", default_value = "secrets/pki")]
	pub pki_dir: PathBuf,

	/// age recipient (age1… or ssh public key) private keys are encrypted to
	#[clap(long = "recipient")]
	pub recipients: Vec<String>,

	/// age identity file used to decrypt private keys
	#[clap(long = "identity")]
	pub identities: Vec<PathBuf>,
}

impl CommonOpts {
	pub fn load_inventory(&self) -> Result<Inventory> {
		Inventory::from_path(&self.inventory)
	}

	pub fn pki_store(&self) -> PkiStore {
		PkiStore::new(
			self.pki_dir.clone(),
			self.recipients.clone(),
			self.identities.clone(),
		)
	}
}

#[derive(Parser)]
enum Opts {
	/// Build, copy and activate closures on hosts
	Apply(Apply),
	/// Build and compare against recorded state without deploying
	Plan(Plan),
	/// Drift detection and repair
	#[clap(subcommand)]
	Drift(Drift),
	/// Certificate authority management
	#[clap(subcommand)]
	Pki(Pki),
	/// Pull-mode agent management
	#[clap(subcommand)]
	Pull(Pull),
	/// Run the HTTP API and scheduler
	Serve(Serve),
	/// Generate shell completions
	Completion {
		#[clap(value_enum)]
		shell: clap_complete::Shell,
	},
}

#[derive(Parser)]
#[clap(version, author)]
struct RootOpts {
	#[clap(flatten)]
	common: CommonOpts,
	#[clap(subcommand)]
	command: Opts,
}

async fn run_command(common: &CommonOpts, command: Opts) -> Result<()> {
	match command {
		Opts::Apply(c) => c.run(common).await?,
		Opts::Plan(c) => c.run(common).await?,
		Opts::Drift(c) => c.run(common).await?,
		Opts::Pki(c) => c.run(common).await?,
		Opts::Pull(c) => c.run(common).await?,
		Opts::Serve(c) => c.run(common).await?,
		Opts::Completion { shell } => {
			clap_complete::generate(
				shell,
				&mut RootOpts::command(),
				"nixfleet",
				&mut std::io::stdout(),
			);
		}
	}
	Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
	let filter = EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into());
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.without_time()
				.with_target(false)
				.with_filter(filter),
		)
		.init();

	let opts = RootOpts::parse();
	run_command(&opts.common, opts.command)
		.await
		.context("command failed")
}
