use std::path::Path;

use anyhow::{bail, Context, Result};
use nixfleet_pki::CertInstallSpec;
use serde::{Deserialize, Serialize};

use crate::health::HealthCheckConfig;

/// Operating-system family of a host, selecting activation, preflight and
/// rollback primitives.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Base {
	Ubuntu,
	Nixos,
	Darwin,
}

impl Base {
	pub fn as_str(&self) -> &'static str {
		match self {
			Base::Ubuntu => "ubuntu",
			Base::Nixos => "nixos",
			Base::Darwin => "darwin",
		}
	}
}

impl std::fmt::Display for Base {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

fn default_port() -> u16 {
	22
}

/// One inventory entry. The YAML inventory surface is parsed elsewhere;
/// the control plane consumes this resolved form.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Host {
	pub name: String,
	pub addr: String,
	#[serde(default = "default_port")]
	pub port: u16,
	pub ssh_user: String,
	pub base: Base,
	#[serde(default)]
	pub roles: Vec<String>,
	#[serde(default)]
	pub tags: Vec<String>,
	#[serde(default)]
	pub health_checks: Vec<HealthCheckConfig>,
	#[serde(default)]
	pub certs: Vec<CertInstallSpec>,
}

impl Host {
	/// Pool key and `nix copy` destination identity.
	pub fn ssh_destination(&self) -> String {
		if self.port == default_port() {
			format!("{}@{}", self.ssh_user, self.addr)
		} else {
			format!("{}@{}:{}", self.ssh_user, self.addr, self.port)
		}
	}
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
	#[serde(default)]
	pub hosts: Vec<Host>,
}

impl Inventory {
	pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read inventory {path:?}"))?;
		let inventory: Inventory =
			serde_json::from_str(&text).with_context(|| format!("failed to parse {path:?}"))?;
		let mut seen = std::collections::BTreeSet::new();
		for host in &inventory.hosts {
			if !seen.insert(&host.name) {
				bail!("duplicate host name {} in inventory", host.name);
			}
		}
		Ok(inventory)
	}

	pub fn get(&self, name: &str) -> Option<&Host> {
		self.hosts.iter().find(|h| h.name == name)
	}

	pub fn list(&self) -> &[Host] {
		&self.hosts
	}

	pub fn group(&self, tag: &str) -> Vec<&Host> {
		self.hosts
			.iter()
			.filter(|h| h.tags.iter().any(|t| t == tag) || h.roles.iter().any(|r| r == tag))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> Inventory {
		serde_json::from_str(
			r#"{
				"hosts": [
					{"name": "web1", "addr": "10.0.0.1", "sshUser": "deploy", "base": "ubuntu", "tags": ["web"]},
					{"name": "nix1", "addr": "10.0.0.2", "port": 2222, "sshUser": "root", "base": "nixos", "roles": ["builder"]},
					{"name": "mac1", "addr": "10.0.0.3", "sshUser": "admin", "base": "darwin"}
				]
			}"#,
		)
		.unwrap()
	}

	#[test]
	fn lookup_and_grouping() {
		let inv = sample();
		assert_eq!(inv.get("web1").unwrap().base, Base::Ubuntu);
		assert!(inv.get("nope").is_none());
		assert_eq!(inv.group("web").len(), 1);
		assert_eq!(inv.group("builder").len(), 1);
	}

	#[test]
	fn ssh_destination_includes_non_default_port() {
		let inv = sample();
		assert_eq!(inv.get("web1").unwrap().ssh_destination(), "deploy@10.0.0.1");
		assert_eq!(inv.get("nix1").unwrap().ssh_destination(), "root@10.0.0.2:2222");
	}
}
