use std::{process::Stdio, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use nixfleet_shared::{
	exec::{quote, Executor, ExecutorExt},
	ManagedFile,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{process::Command, time::sleep};
use tracing::{debug, info, warn};

use crate::inventory::{Base, Host};

pub const SYSTEM_PROFILE: &str = "/nix/var/nix/profiles/system";

/// An immutable build product: the store path plus the fingerprint of the
/// inputs that produced it.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Closure {
	pub store_path: String,
	pub manifest_hash: String,
	pub base: Base,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActivateAction {
	/// Activate now and make it the boot default.
	Switch,
	/// Make it the boot default without activating now.
	Boot,
	/// Activate now without touching the boot default.
	Test,
}

impl ActivateAction {
	pub fn as_str(&self) -> &'static str {
		match self {
			ActivateAction::Switch => "switch",
			ActivateAction::Boot => "boot",
			ActivateAction::Test => "test",
		}
	}
}

/// Seam over the external Nix builder so the pipeline is testable without
/// evaluating anything.
#[async_trait]
pub trait Builder: Send + Sync {
	async fn build_host(&self, host: &str, base: Base) -> Result<Closure>;
	async fn copy_to_host(&self, closure: &Closure, host: &Host) -> Result<()>;
}

/// Shells out to `nix` on the control plane.
pub struct NixBuilder {
	pub flake: String,
}

impl NixBuilder {
	pub fn new(flake: impl Into<String>) -> Self {
		Self { flake: flake.into() }
	}

	/// Flake attribute selected per base. The ubuntu attribute matches what
	/// the pull script builds so push and pull modes agree.
	pub fn flake_attr(&self, host: &str, base: Base) -> String {
		match base {
			Base::Ubuntu => format!("{}#nixfleetConfigurations.\"{host}\".system", self.flake),
			Base::Nixos => format!(
				"{}#nixosConfigurations.\"{host}\".config.system.build.toplevel",
				self.flake
			),
			Base::Darwin => format!("{}#darwinConfigurations.\"{host}\".system", self.flake),
		}
	}

	async fn run_nix(args: &[&str]) -> Result<String> {
		let out = Command::new("nix")
			.args([
				"--extra-experimental-features",
				"nix-command",
				"--extra-experimental-features",
				"flakes",
			])
			.args(args)
			.stdin(Stdio::null())
			.output()
			.await
			.context("failed to spawn nix")?;
		if !out.status.success() {
			bail!(
				"nix {} failed with {}: {}",
				args.first().copied().unwrap_or_default(),
				out.status,
				String::from_utf8_lossy(&out.stderr).trim()
			);
		}
		Ok(String::from_utf8_lossy(&out.stdout).into_owned())
	}
}

/// The deriver reported by `nix path-info --json`. Both the modern map
/// shape and the older array shape are accepted.
fn deriver_from_path_info(json: &str) -> Option<String> {
	let value: serde_json::Value = serde_json::from_str(json).ok()?;
	let objects: Vec<&serde_json::Value> = match &value {
		serde_json::Value::Object(map) => map.values().collect(),
		serde_json::Value::Array(items) => items.iter().collect(),
		_ => return None,
	};
	objects
		.iter()
		.find_map(|o| o.get("deriver").and_then(|d| d.as_str()))
		.map(ToOwned::to_owned)
}

fn fingerprint(input: &str) -> String {
	hex::encode(Sha256::digest(input.as_bytes()))
}

#[async_trait]
impl Builder for NixBuilder {
	async fn build_host(&self, host: &str, base: Base) -> Result<Closure> {
		let attr = self.flake_attr(host, base);
		info!(host, attr, "building system closure");
		let stdout = Self::run_nix(&["build", "--no-link", "--print-out-paths", &attr])
			.await
			.with_context(|| format!("build failed for {host}"))?;
		let store_path = stdout
			.lines()
			.last()
			.ok_or_else(|| anyhow!("nix build produced no output path"))?
			.to_owned();

		// The manifest hash fingerprints the declared inputs: derived from
		// the deriver path, which is stable for identical inputs.
		let manifest_hash = match Self::run_nix(&["path-info", "--json", &store_path]).await {
			Ok(json) => deriver_from_path_info(&json)
				.map(|d| fingerprint(&d))
				.unwrap_or_else(|| fingerprint(&store_path)),
			Err(e) => {
				warn!("path-info failed, fingerprinting the out path: {e}");
				fingerprint(&store_path)
			}
		};

		Ok(Closure {
			store_path,
			manifest_hash,
			base,
		})
	}

	async fn copy_to_host(&self, closure: &Closure, host: &Host) -> Result<()> {
		let dest = format!("ssh://{}", host.ssh_destination());
		let mut tries = 0;
		loop {
			let result = Self::run_nix(&[
				"copy",
				"--substitute-on-destination",
				"--to",
				&dest,
				&closure.store_path,
			])
			.await;
			match result {
				Ok(_) => return Ok(()),
				Err(e) if tries < 3 => {
					tries += 1;
					warn!(host = host.name, "copy failure ({tries}/3): {e}");
					sleep(Duration::from_millis(5000)).await;
				}
				Err(e) => return Err(e.context(format!("copy to {} failed", host.name))),
			}
		}
	}
}

fn parse_generation(link: &str) -> Option<u64> {
	link.trim()
		.rsplit('/')
		.next()?
		.strip_suffix("-link")?
		.rsplit('-')
		.next()?
		.parse()
		.ok()
}

/// Reads the generation number the system profile currently points at.
/// A host that has never been applied reads as generation 0.
pub async fn get_current_generation(exec: &dyn Executor) -> Result<u64> {
	let out = exec
		.exec(&format!("readlink {}", quote(SYSTEM_PROFILE)))
		.await?;
	if !out.success() {
		return Ok(0);
	}
	parse_generation(&out.stdout)
		.ok_or_else(|| anyhow!("unparsable profile link {:?}", out.stdout_trimmed()))
}

/// Switches the system profile to the closure and runs the base-specific
/// activation.
pub async fn activate(
	exec: &dyn Executor,
	closure: &Closure,
	action: ActivateAction,
) -> Result<()> {
	if action != ActivateAction::Test {
		let out = exec
			.exec_sudo(&format!(
				"nix-env --profile {} --set {}",
				quote(SYSTEM_PROFILE),
				quote(&closure.store_path)
			))
			.await?;
		if !out.success() {
			bail!("profile switch failed: {}", out.stderr.trim());
		}
	}

	let cmd = match closure.base {
		// Custom activation script bundled inside the closure.
		Base::Ubuntu | Base::Darwin => format!("{}/activate", closure.store_path),
		Base::Nixos => format!(
			"{}/bin/switch-to-configuration {}",
			closure.store_path,
			action.as_str()
		),
	};
	info!(host = exec.host_name(), "activating {}", closure.store_path);
	let out = exec.exec_sudo(&cmd).await?;
	if !out.success() {
		bail!("activation failed: {}", out.stderr.trim());
	}
	Ok(())
}

/// Activates the previous generation, or an explicit one.
pub async fn rollback(exec: &dyn Executor, base: Base, generation: Option<u64>) -> Result<()> {
	let switch = match generation {
		Some(n) => format!(
			"nix-env --profile {} --switch-generation {n}",
			quote(SYSTEM_PROFILE)
		),
		None => format!("nix-env --profile {} --rollback", quote(SYSTEM_PROFILE)),
	};
	let out = exec.exec_sudo(&switch).await?;
	if !out.success() {
		bail!("generation switch failed: {}", out.stderr.trim());
	}

	let cmd = match base {
		Base::Ubuntu | Base::Darwin => format!("{SYSTEM_PROFILE}/activate"),
		Base::Nixos => format!("{SYSTEM_PROFILE}/bin/switch-to-configuration switch"),
	};
	info!(host = exec.host_name(), "rolling back via {cmd}");
	let out = exec.exec_sudo(&cmd).await?;
	if !out.success() {
		bail!("rollback activation failed: {}", out.stderr.trim());
	}
	Ok(())
}

/// Whether the host needs a reboot to finish applying its configuration.
pub async fn check_reboot_needed(exec: &dyn Executor, base: Base) -> Result<bool> {
	match base {
		Base::Nixos => {
			let booted = exec.exec("readlink /run/booted-system/kernel").await?;
			let current = exec.exec("readlink /run/current-system/kernel").await?;
			Ok(booted.success()
				&& current.success()
				&& booted.stdout_trimmed() != current.stdout_trimmed())
		}
		Base::Ubuntu => exec.file_exists("/var/run/reboot-required").await,
		Base::Darwin => {
			let out = exec.exec("softwareupdate -l 2>&1").await?;
			Ok(out.stdout.to_lowercase().contains("restart"))
		}
	}
}

/// Optional manifest the closure bundles describing the files and units it
/// manages; absent for closures that don't ship one.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClosureManifest {
	#[serde(default)]
	pub managed_files: Vec<ManagedFile>,
	#[serde(default)]
	pub activated_units: Vec<String>,
}

pub async fn read_closure_manifest(
	exec: &dyn Executor,
	store_path: &str,
) -> Result<Option<ClosureManifest>> {
	let path = format!("{store_path}/nixfleet/manifest.json");
	if !exec.file_exists(&path).await? {
		return Ok(None);
	}
	let text = exec.read_file_text(&path, false).await?;
	let manifest = serde_json::from_str(&text)
		.with_context(|| format!("bad closure manifest at {path}"))?;
	debug!(host = exec.host_name(), "loaded closure manifest");
	Ok(Some(manifest))
}

#[cfg(test)]
mod tests {
	use nixfleet_shared::{ExecOutput, MockExecutor};

	use super::*;

	#[test]
	fn flake_attrs_per_base() {
		let builder = NixBuilder::new(".");
		assert_eq!(
			builder.flake_attr("web1", Base::Ubuntu),
			".#nixfleetConfigurations.\"web1\".system"
		);
		assert_eq!(
			builder.flake_attr("nix1", Base::Nixos),
			".#nixosConfigurations.\"nix1\".config.system.build.toplevel"
		);
		assert_eq!(
			builder.flake_attr("mac1", Base::Darwin),
			".#darwinConfigurations.\"mac1\".system"
		);
	}

	#[test]
	fn generation_parsing() {
		assert_eq!(parse_generation("system-42-link\n"), Some(42));
		assert_eq!(
			parse_generation("/nix/var/nix/profiles/system-7-link"),
			Some(7)
		);
		assert_eq!(parse_generation("garbage"), None);
	}

	#[test]
	fn deriver_parsing_both_shapes() {
		let map = r#"{"/nix/store/abc-system": {"deriver": "/nix/store/abc-system.drv"}}"#;
		let array = r#"[{"path": "/nix/store/abc-system", "deriver": "/nix/store/abc-system.drv"}]"#;
		assert_eq!(
			deriver_from_path_info(map).as_deref(),
			Some("/nix/store/abc-system.drv")
		);
		assert_eq!(
			deriver_from_path_info(array).as_deref(),
			Some("/nix/store/abc-system.drv")
		);
		assert_eq!(deriver_from_path_info("null"), None);
	}

	#[tokio::test]
	async fn nixos_activation_switches_profile_then_configuration() {
		let mock = MockExecutor::new("nix1");
		let closure = Closure {
			store_path: "/nix/store/abc-system".to_owned(),
			manifest_hash: "aa11".to_owned(),
			base: Base::Nixos,
		};
		activate(&mock, &closure, ActivateAction::Switch).await.unwrap();
		let commands = mock.commands();
		assert!(commands[0].contains("nix-env --profile /nix/var/nix/profiles/system --set"));
		assert!(commands[1].contains("/nix/store/abc-system/bin/switch-to-configuration switch"));
	}

	#[tokio::test]
	async fn test_action_skips_profile_switch() {
		let mock = MockExecutor::new("nix1");
		let closure = Closure {
			store_path: "/nix/store/abc-system".to_owned(),
			manifest_hash: "aa11".to_owned(),
			base: Base::Nixos,
		};
		activate(&mock, &closure, ActivateAction::Test).await.unwrap();
		assert!(!mock.ran("nix-env"));
		assert!(mock.ran("switch-to-configuration test"));
	}

	#[tokio::test]
	async fn ubuntu_activation_uses_bundled_script() {
		let mock = MockExecutor::new("web1");
		let closure = Closure {
			store_path: "/nix/store/abc-system".to_owned(),
			manifest_hash: "aa11".to_owned(),
			base: Base::Ubuntu,
		};
		activate(&mock, &closure, ActivateAction::Switch).await.unwrap();
		assert!(mock.ran("sudo /nix/store/abc-system/activate"));
	}

	#[tokio::test]
	async fn rollback_to_explicit_generation() {
		let mock = MockExecutor::new("web1");
		rollback(&mock, Base::Ubuntu, Some(41)).await.unwrap();
		assert!(mock.ran("--switch-generation 41"));
		assert!(mock.ran("/nix/var/nix/profiles/system/activate"));
	}

	#[tokio::test]
	async fn reboot_detection() {
		let mock = MockExecutor::new("nix1");
		mock.on_exact(
			"readlink /run/booted-system/kernel",
			ExecOutput::ok("/nix/store/old-kernel\n"),
		);
		mock.on_exact(
			"readlink /run/current-system/kernel",
			ExecOutput::ok("/nix/store/new-kernel\n"),
		);
		assert!(check_reboot_needed(&mock, Base::Nixos).await.unwrap());

		let ubuntu = MockExecutor::new("web1");
		ubuntu.on_prefix("test -e /var/run/reboot-required", ExecOutput::ok("false\n"));
		assert!(!check_reboot_needed(&ubuntu, Base::Ubuntu).await.unwrap());
	}

	#[tokio::test]
	async fn fresh_host_reads_generation_zero() {
		let mock = MockExecutor::new("new1");
		mock.on_prefix(
			"readlink /nix/var/nix/profiles/system",
			ExecOutput::failed(1, "No such file or directory"),
		);
		assert_eq!(get_current_generation(&mock).await.unwrap(), 0);
	}
}
