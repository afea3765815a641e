use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nixfleet_base::ssh::{SshPool, SshPoolConfig};
use nixfleet_pki::{
	deploy_certs, issue_cert, parse_cert_info, rotate_certificates, verify_chain, CaConfig,
	CertInstallSpec, IssueRequest, RotationAction, RotationConfig,
};

use crate::CommonOpts;

#[derive(Parser)]
pub enum Pki {
	/// Initialize the root CA (and optionally an intermediate)
	Init {
		/// Root common name
		#[clap(long, default_value = "NixFleet Root CA")]
		cn: String,
		#[clap(long)]
		organization: Option<String>,
		#[clap(long, default_value_t = 3650)]
		validity_days: u32,
		/// Also mint an intermediate with this common name
		#[clap(long)]
		intermediate_cn: Option<String>,
		#[clap(long, default_value_t = 1825)]
		intermediate_validity_days: u32,
	},
	/// Issue a certificate for a host
	Issue {
		hostname: String,
		/// Distinguishes multiple certs per host
		#[clap(long, default_value = "host")]
		name: String,
		#[clap(long = "san")]
		sans: Vec<String>,
		#[clap(long, default_value_t = 365)]
		validity_days: u32,
	},
	/// Renew certificates approaching expiry
	Rotate {
		#[clap(long, default_value_t = 30)]
		renew_before: i64,
		#[clap(long)]
		force: bool,
		#[clap(long)]
		dry_run: bool,
	},
	/// Verify a stored certificate against the CA chain
	Verify {
		host: String,
		#[clap(long, default_value = "host")]
		name: String,
	},
	/// List stored certificates with expiry status
	List,
	/// Copy a host's certificates onto it
	Deploy {
		host: String,
		/// Also install the CA bundle
		#[clap(long)]
		with_ca: bool,
	},
}

impl Pki {
	pub async fn run(self, common: &CommonOpts) -> Result<()> {
		let store = common.pki_store();
		match self {
			Pki::Init {
				cn,
				organization,
				validity_days,
				intermediate_cn,
				intermediate_validity_days,
			} => {
				let mut cfg = CaConfig::root(cn);
				cfg.organization = organization.clone();
				cfg.validity_days = validity_days;
				store.init_root(&cfg)?;
				println!("root CA initialized");
				if let Some(cn) = intermediate_cn {
					let mut cfg = CaConfig::intermediate(cn);
					cfg.organization = organization;
					cfg.validity_days = intermediate_validity_days;
					store.init_intermediate(&cfg)?;
					println!("intermediate CA initialized");
				}
			}
			Pki::Issue {
				hostname,
				name,
				sans,
				validity_days,
			} => {
				let issuer = store.load_issuer()?;
				let issued = issue_cert(
					&issuer,
					&IssueRequest {
						hostname,
						name,
						sans,
						validity_days,
					},
				)?;
				store.save_issued(&issued)?;
				println!(
					"issued {}/{} serial {} valid until {}",
					issued.hostname, issued.name, issued.serial, issued.not_after
				);
			}
			Pki::Rotate {
				renew_before,
				force,
				dry_run,
			} => {
				let issuer = store.load_issuer()?;
				let cfg = RotationConfig {
					renew_before_days: renew_before,
					force,
					dry_run,
				};
				let records = rotate_certificates(&store, &issuer, &cfg)?;
				let mut failed = 0usize;
				for record in &records {
					println!(
						"{}/{}: {}{}",
						record.host,
						record.name,
						serde_json::to_string(&record.action)?.trim_matches('"'),
						record
							.detail
							.as_deref()
							.map(|d| format!(" ({d})"))
							.unwrap_or_default()
					);
					if record.action == RotationAction::Failed {
						failed += 1;
					}
				}
				if failed > 0 {
					bail!("{failed} certificate(s) failed to rotate");
				}
			}
			Pki::Verify { host, name } => {
				let cert = store.load_cert_pem(&host, &name)?;
				let root = store.root_cert_pem()?;
				let intermediate = store.intermediate_cert_pem()?;
				verify_chain(&cert, intermediate.as_deref(), &root)
					.with_context(|| format!("{host}/{name} failed verification"))?;
				println!("{host}/{name}: chain verifies against the stored root");
			}
			Pki::List => {
				for stored in store.list_host_certs()? {
					let info = parse_cert_info(&store.load_cert_pem(&stored.host, &stored.name)?)?;
					println!(
						"{}/{}\tserial {}\texpires {}\t{} day(s) left\t{}",
						stored.host,
						stored.name,
						info.serial,
						info.not_after.format("%Y-%m-%d"),
						info.days_left,
						serde_json::to_string(&info.status)?.trim_matches('"'),
					);
				}
			}
			Pki::Deploy { host, with_ca } => {
				let inventory = common.load_inventory()?;
				let target = inventory
					.get(&host)
					.ok_or_else(|| anyhow::anyhow!("host {host} is not in the inventory"))?;
				let pool = Arc::new(SshPool::new(SshPoolConfig::default()));
				let client = pool.get(target).await?;
				let mut specs = target.certs.clone();
				if specs.is_empty() {
					specs.push(CertInstallSpec {
						install_ca: with_ca,
						..Default::default()
					});
				} else if with_ca {
					for spec in &mut specs {
						spec.install_ca = true;
					}
				}
				let installed = deploy_certs(client.as_ref(), &store, &host, &specs).await?;
				pool.close().await;
				for path in installed {
					println!("installed {path}");
				}
			}
		}
		Ok(())
	}
}
