use anyhow::{Context, Result};
use nixfleet_shared::exec::{quote, Executor, ExecutorExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::PkiStore;

pub const PKI_INSTALL_DIR: &str = "/etc/nixfleet/pki";

/// Where and how a host's certificate material is installed.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CertInstallSpec {
	#[serde(default = "default_name")]
	pub name: String,
	#[serde(default = "default_install_dir")]
	pub install_dir: String,
	#[serde(default = "default_cert_mode")]
	pub cert_mode: String,
	#[serde(default = "default_key_mode")]
	pub key_mode: String,
	#[serde(default = "default_owner")]
	pub owner: String,
	#[serde(default = "default_owner")]
	pub group: String,
	/// Install the chain bundle instead of the bare leaf when one exists.
	#[serde(default)]
	pub deploy_chain: bool,
	/// Also install the CA trust bundle at `<install_dir>/ca.crt`.
	#[serde(default)]
	pub install_ca: bool,
}

fn default_name() -> String {
	"host".to_owned()
}
fn default_install_dir() -> String {
	PKI_INSTALL_DIR.to_owned()
}
fn default_cert_mode() -> String {
	"0644".to_owned()
}
fn default_key_mode() -> String {
	"0600".to_owned()
}
fn default_owner() -> String {
	"root".to_owned()
}

impl Default for CertInstallSpec {
	fn default() -> Self {
		Self {
			name: default_name(),
			install_dir: default_install_dir(),
			cert_mode: default_cert_mode(),
			key_mode: default_key_mode(),
			owner: default_owner(),
			group: default_owner(),
			deploy_chain: false,
			install_ca: false,
		}
	}
}

/// Copies the selected certificates and decrypted keys onto the host.
/// Returns the list of installed paths.
pub async fn deploy_certs(
	exec: &dyn Executor,
	store: &PkiStore,
	host: &str,
	specs: &[CertInstallSpec],
) -> Result<Vec<String>> {
	let mut installed = Vec::new();
	for spec in specs {
		let cert_pem = if spec.deploy_chain {
			match store.load_chain_pem(host, &spec.name)? {
				Some(chain) => chain,
				None => store.load_cert_pem(host, &spec.name)?,
			}
		} else {
			store.load_cert_pem(host, &spec.name)?
		};
		let key_pem = store
			.load_key_pem(host, &spec.name)
			.with_context(|| format!("no key stored for {host}/{}", spec.name))?;

		let cert_path = format!("{}/{}.crt", spec.install_dir, spec.name);
		let key_path = format!("{}/{}.key", spec.install_dir, spec.name);
		exec.write_file(&cert_path, &cert_pem, &spec.cert_mode).await?;
		exec.write_file(&key_path, &key_pem, &spec.key_mode).await?;
		chown(exec, &spec.owner, &spec.group, &[&cert_path, &key_path]).await?;
		installed.push(cert_path);
		installed.push(key_path);

		if spec.install_ca {
			let ca_path = format!("{}/ca.crt", spec.install_dir);
			exec.write_file(&ca_path, &store.ca_bundle_pem()?, "0644").await?;
			chown(exec, &spec.owner, &spec.group, &[&ca_path]).await?;
			installed.push(ca_path);
		}
	}
	info!(host, count = installed.len(), "deployed certificates");
	Ok(installed)
}

async fn chown(exec: &dyn Executor, owner: &str, group: &str, paths: &[&str]) -> Result<()> {
	let targets = paths.iter().map(|p| quote(p)).collect::<Vec<_>>().join(" ");
	let out = exec
		.exec_sudo(&format!("chown {}:{} {targets}", quote(owner), quote(group)))
		.await?;
	if !out.success() {
		anyhow::bail!("chown failed: {}", out.stderr.trim());
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use nixfleet_shared::MockExecutor;

	use super::*;
	use crate::{
		ca::CaConfig,
		issue::{issue_cert, IssueRequest},
		store::tests::test_store,
	};

	#[tokio::test]
	async fn deploys_cert_key_and_ca() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(dir.path());
		store.init_root(&CaConfig::root("Deploy Root")).unwrap();
		let issuer = store.load_issuer().unwrap();
		store
			.save_issued(&issue_cert(&issuer, &IssueRequest::new("web1")).unwrap())
			.unwrap();

		let mock = MockExecutor::new("web1");
		let spec = CertInstallSpec {
			install_ca: true,
			..Default::default()
		};
		let installed = deploy_certs(&mock, &store, "web1", &[spec]).await.unwrap();
		assert_eq!(
			installed,
			vec![
				"/etc/nixfleet/pki/host.crt".to_owned(),
				"/etc/nixfleet/pki/host.key".to_owned(),
				"/etc/nixfleet/pki/ca.crt".to_owned(),
			]
		);
		assert!(mock.ran("chmod 0600"));
		assert!(mock.ran("chown root:root"));
	}
}
