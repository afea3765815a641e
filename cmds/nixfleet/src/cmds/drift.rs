use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use nixfleet_base::{
	ssh::{SshPool, SshPoolConfig},
	state,
};
use nixfleet_shared::DriftResult;

use crate::{cmds::apply::select_hosts, CommonOpts};

#[derive(Parser)]
pub enum Drift {
	/// Check managed files for drift and record the result on each host
	Check {
		/// Hosts to check; the whole inventory when empty
		hosts: Vec<String>,
		#[clap(long)]
		group: Option<String>,
	},
	/// Repair permission drift in place (content drift is never repaired)
	Fix {
		host: String,
	},
}

impl Drift {
	pub async fn run(self, common: &CommonOpts) -> Result<()> {
		let inventory = common.load_inventory()?;
		let pool = Arc::new(SshPool::new(SshPoolConfig::default()));

		let result = match self {
			Drift::Check { hosts, group } => {
				let selected = select_hosts(&inventory, &hosts, group.as_deref())?;
				let mut drifted_hosts = 0usize;
				for host in &selected {
					let client = pool.get(host).await?;
					let drift = state::check_and_record_drift(client.as_ref()).await?;
					let drifted: Vec<&DriftResult> =
						drift.iter().filter(|d| d.is_drifted()).collect();
					if drifted.is_empty() {
						println!("{}: clean ({} files)", host.name, drift.len());
					} else {
						drifted_hosts += 1;
						for result in drifted {
							println!(
								"{}: {} {}",
								host.name,
								serde_json::to_string(&result.status)?,
								result.path
							);
						}
					}
				}
				if drifted_hosts > 0 {
					Err(anyhow::anyhow!("{drifted_hosts} host(s) drifted"))
				} else {
					Ok(())
				}
			}
			Drift::Fix { host } => {
				let host = inventory
					.get(&host)
					.ok_or_else(|| anyhow::anyhow!("host {host} is not in the inventory"))?;
				let client = pool.get(host).await?;
				let exec = client.as_ref();
				let host_state = state::read_state(exec).await?;
				let drift = state::check_drift(exec, &host_state.managed_files).await?;
				let report = state::fix_drift(exec, &host_state.managed_files, &drift).await?;
				for path in &report.fixed {
					println!("fixed: {path}");
				}
				for path in &report.refused {
					println!("refused (needs re-apply): {path}");
				}
				Ok(())
			}
		};
		pool.close().await;
		result
	}
}
