use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use nixfleet_base::{
	deploy::{ApplyOptions, FailurePolicy, Pipeline},
	inventory::Host,
	nix::{ActivateAction, Builder, NixBuilder},
	ssh::{SshPool, SshPoolConfig},
	state, Inventory,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::CommonOpts;

#[derive(ValueEnum, Clone, Copy)]
pub enum ActionArg {
	/// Activate now and make it the boot default
	Switch,
	/// Make it the boot default without activating now
	Boot,
	/// Activate now without touching the boot default
	Test,
}

impl From<ActionArg> for ActivateAction {
	fn from(a: ActionArg) -> Self {
		match a {
			ActionArg::Switch => ActivateAction::Switch,
			ActionArg::Boot => ActivateAction::Boot,
			ActionArg::Test => ActivateAction::Test,
		}
	}
}

#[derive(ValueEnum, Clone, Copy)]
pub enum PolicyArg {
	Rollback,
	Halt,
	Continue,
}

impl From<PolicyArg> for FailurePolicy {
	fn from(p: PolicyArg) -> Self {
		match p {
			PolicyArg::Rollback => FailurePolicy::Rollback,
			PolicyArg::Halt => FailurePolicy::Halt,
			PolicyArg::Continue => FailurePolicy::Continue,
		}
	}
}

pub fn select_hosts(
	inventory: &Inventory,
	names: &[String],
	group: Option<&str>,
) -> Result<Vec<Host>> {
	let hosts: Vec<Host> = if !names.is_empty() {
		let mut out = Vec::new();
		for name in names {
			match inventory.get(name) {
				Some(host) => out.push(host.clone()),
				None => bail!("host {name} is not in the inventory"),
			}
		}
		out
	} else if let Some(group) = group {
		inventory.group(group).into_iter().cloned().collect()
	} else {
		inventory.list().to_vec()
	};
	if hosts.is_empty() {
		bail!("no hosts selected");
	}
	Ok(hosts)
}

#[derive(Parser)]
pub struct Apply {
	/// Hosts to apply; the whole inventory when empty
	hosts: Vec<String>,
	/// Select hosts by tag or role instead of by name
	#[clap(long)]
	group: Option<String>,
	/// Stop after the build, recording what would be deployed
	#[clap(long)]
	dry_run: bool,
	#[clap(long)]
	skip_preflight: bool,
	#[clap(long)]
	skip_health: bool,
	#[clap(long, value_enum, default_value = "switch")]
	action: ActionArg,
	#[clap(long, value_enum, default_value = "rollback")]
	on_failure: PolicyArg,
	/// Maximum hosts deployed concurrently
	#[clap(long, default_value_t = 5)]
	parallel: usize,
	/// Seconds to wait before post-deploy health checks
	#[clap(long, default_value_t = 5)]
	health_check_delay: u64,
	/// Auto-renew and deploy certificates from the PKI store
	#[clap(long)]
	with_pki: bool,
}

impl Apply {
	pub async fn run(self, common: &CommonOpts) -> Result<()> {
		let inventory = common.load_inventory()?;
		let hosts = select_hosts(&inventory, &self.hosts, self.group.as_deref())?;

		let pool = Arc::new(SshPool::new(SshPoolConfig::default()));
		let builder = Arc::new(NixBuilder::new(common.flake.clone()));
		let pki = self.with_pki.then(|| Arc::new(common.pki_store()));

		let opts = ApplyOptions {
			action: self.action.into(),
			parallel: self.parallel,
			skip_preflight: self.skip_preflight,
			skip_health: self.skip_health,
			dry_run: self.dry_run,
			failure_policy: self.on_failure.into(),
			health_check_delay: Duration::from_secs(self.health_check_delay),
			..Default::default()
		};

		let pipeline = Pipeline::new(pool.clone(), builder, pki, opts);
		let cancel = CancellationToken::new();
		let results = pipeline.apply(&hosts, &cancel).await;
		pool.close().await;

		println!("{}", serde_json::to_string_pretty(&results)?);
		if results.failure_count > 0 {
			bail!("{} host(s) failed", results.failure_count);
		}
		Ok(())
	}
}

#[derive(Parser)]
pub struct Plan {
	/// Limit the plan to one host
	host: Option<String>,
}

impl Plan {
	pub async fn run(self, common: &CommonOpts) -> Result<()> {
		let inventory = common.load_inventory()?;
		let names: Vec<String> = self.host.clone().into_iter().collect();
		let hosts = select_hosts(&inventory, &names, None)?;

		let pool = Arc::new(SshPool::new(SshPoolConfig::default()));
		let builder = NixBuilder::new(common.flake.clone());

		for host in &hosts {
			let status = match pool.get(host).await {
				Err(e) => format!("unreachable ({e})"),
				Ok(client) => {
					let recorded = state::read_state(client.as_ref()).await?;
					let closure = builder.build_host(&host.name, host.base).await?;
					if recorded.manifest_hash.is_empty() {
						format!("new_deployment ({})", closure.store_path)
					} else if recorded.manifest_hash == closure.manifest_hash {
						"up_to_date".to_owned()
					} else {
						format!("changes_pending ({})", closure.store_path)
					}
				}
			};
			info!("{}: {}", host.name, status);
			println!("{}\t{}", host.name, status);
		}
		pool.close().await;
		Ok(())
	}
}
