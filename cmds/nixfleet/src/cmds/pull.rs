use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use nixfleet_base::ssh::{SshPool, SshPoolConfig};
use nixfleet_pull::{HomeManagerConfig, PullConfig};

use crate::CommonOpts;

#[derive(Parser)]
pub enum Pull {
	/// Install the self-updating pull agent on a host
	Install {
		host: String,
		#[clap(long)]
		git_url: String,
		#[clap(long, default_value = "main")]
		branch: String,
		/// Timer interval, systemd time syntax
		#[clap(long, default_value = "15min")]
		interval: String,
		/// File containing the private deploy key to install
		#[clap(long)]
		deploy_key_file: Option<PathBuf>,
		#[clap(long)]
		webhook_url: Option<String>,
		#[clap(long, env = "NIXFLEET_WEBHOOK_SECRET")]
		webhook_secret: Option<String>,
		/// Also manage a user's dotfiles via home-manager: URL of the repo
		#[clap(long)]
		dotfiles_url: Option<String>,
		#[clap(long, default_value = "main")]
		dotfiles_branch: String,
		#[clap(long)]
		dotfiles_path: Option<String>,
		#[clap(long)]
		dotfiles_user: Option<String>,
		#[clap(long)]
		dotfiles_config: Option<String>,
	},
	/// Remove the pull agent from a host
	Uninstall { host: String },
	/// Show timer state, last run, and current commit
	Status { host: String },
	/// Start one pull immediately, out of band
	Trigger { host: String },
}

impl Pull {
	pub async fn run(self, common: &CommonOpts) -> Result<()> {
		let inventory = common.load_inventory()?;
		let pool = Arc::new(SshPool::new(SshPoolConfig::default()));

		let host_name = match &self {
			Pull::Install { host, .. }
			| Pull::Uninstall { host }
			| Pull::Status { host }
			| Pull::Trigger { host } => host.clone(),
		};
		let host = inventory
			.get(&host_name)
			.ok_or_else(|| anyhow::anyhow!("host {host_name} is not in the inventory"))?;
		let client = pool.get(host).await?;
		let exec = client.as_ref();

		match self {
			Pull::Install {
				git_url,
				branch,
				interval,
				deploy_key_file,
				webhook_url,
				webhook_secret,
				dotfiles_url,
				dotfiles_branch,
				dotfiles_path,
				dotfiles_user,
				dotfiles_config,
				..
			} => {
				let deploy_key = deploy_key_file
					.map(|path| {
						std::fs::read_to_string(&path)
							.with_context(|| format!("failed to read deploy key {path:?}"))
					})
					.transpose()?;
				let home_manager = match (dotfiles_url, dotfiles_user) {
					(Some(url), Some(user)) => Some(HomeManagerConfig {
						dotfiles_path: dotfiles_path
							.unwrap_or_else(|| format!("/home/{user}/dotfiles")),
						config_name: dotfiles_config
							.unwrap_or_else(|| format!("{user}@{host_name}")),
						dotfiles_url: url,
						dotfiles_branch,
						user,
						deploy_key_path: None,
					}),
					_ => None,
				};
				let config = PullConfig {
					branch,
					interval,
					deploy_key,
					webhook_url,
					webhook_secret,
					home_manager,
					..PullConfig::new(host_name, git_url)
				};
				let steps = nixfleet_pull::install(exec, &config).await?;
				for step in steps {
					println!("installed: {step}");
				}
			}
			Pull::Uninstall { .. } => {
				nixfleet_pull::uninstall(exec).await?;
				println!("pull mode removed from {host_name}");
			}
			Pull::Status { .. } => {
				let status = nixfleet_pull::status(exec).await?;
				println!("{}", serde_json::to_string_pretty(&status)?);
			}
			Pull::Trigger { .. } => {
				nixfleet_pull::trigger(exec).await?;
				println!("pull started on {host_name}");
			}
		}
		pool.close().await;
		Ok(())
	}
}
