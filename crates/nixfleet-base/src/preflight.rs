use nixfleet_shared::exec::{ExecError, Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::inventory::Base;

pub const MIN_NIX_FREE_KIB: u64 = 5 * 1024 * 1024;
pub const MIN_VAR_FREE_KIB: u64 = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PreflightCheck {
	pub name: String,
	pub passed: bool,
	pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PreflightResults {
	pub passed: bool,
	pub checks: Vec<PreflightCheck>,
}

impl PreflightResults {
	fn push(&mut self, name: &str, passed: bool, message: impl Into<String>) {
		self.checks.push(PreflightCheck {
			name: name.to_owned(),
			passed,
			message: message.into(),
		});
	}

	pub fn summary(&self) -> String {
		let passed = self.checks.iter().filter(|c| c.passed).count();
		format!("{passed}/{} preflight checks passed", self.checks.len())
	}

	pub fn first_failure(&self) -> Option<&PreflightCheck> {
		self.checks.iter().find(|c| !c.passed)
	}
}

fn parse_df_avail_kib(df_output: &str) -> Option<u64> {
	df_output
		.lines()
		.filter(|l| !l.trim().is_empty())
		.next_back()?
		.split_whitespace()
		.nth(3)?
		.parse()
		.ok()
}

/// Pre-deploy checklist for one host: reachability, passwordless
/// escalation, free disk, and the base's package-manager daemon. A failed
/// check makes the whole result fail, which short-circuits the apply.
pub async fn run_preflight(exec: &dyn Executor, base: Base) -> PreflightResults {
	let mut results = PreflightResults::default();

	// Transport round-trip first; nothing else is meaningful without it.
	match exec.exec("echo nixfleet-preflight").await {
		Ok(out) if out.stdout.contains("nixfleet-preflight") => {
			results.push("ssh", true, "transport round-trip ok");
		}
		Ok(out) => {
			results.push("ssh", false, format!("unexpected echo output: {:?}", out.stdout));
			return results;
		}
		Err(e) => {
			results.push("ssh", false, e.to_string());
			return results;
		}
	}

	match exec.exec_sudo("true").await {
		Ok(out) if out.success() => results.push("sudo", true, "passwordless escalation ok"),
		Ok(out) => results.push("sudo", false, format!("sudo failed: {}", out.stderr.trim())),
		Err(ExecError::EscalationDenied { .. }) => {
			results.push("sudo", false, "host does not grant passwordless escalation")
		}
		Err(e) => {
			results.push("sudo", false, e.to_string());
			results.passed = false;
			return results;
		}
	}

	for (mount, minimum) in [("/nix", MIN_NIX_FREE_KIB), ("/var", MIN_VAR_FREE_KIB)] {
		let name = format!("disk-{mount}");
		match exec.exec(&format!("df -Pk {mount}")).await {
			Ok(out) if out.success() => match parse_df_avail_kib(&out.stdout) {
				Some(avail) if avail >= minimum => results.push(
					&name,
					true,
					format!("{} GiB free", avail / 1024 / 1024),
				),
				Some(avail) => results.push(
					&name,
					false,
					format!(
						"only {} MiB free on {mount}, {} GiB required",
						avail / 1024,
						minimum / 1024 / 1024
					),
				),
				None => results.push(&name, false, "unparsable df output"),
			},
			Ok(out) => results.push(&name, false, format!("df failed: {}", out.stderr.trim())),
			Err(e) => {
				results.push(&name, false, e.to_string());
				results.passed = false;
				return results;
			}
		}
	}

	if let Err(e) = base_checks(exec, base, &mut results).await {
		results.push("daemon", false, e.to_string());
	}

	results.passed = results.checks.iter().all(|c| c.passed);
	debug!(host = exec.host_name(), "{}", results.summary());
	results
}

async fn base_checks(
	exec: &dyn Executor,
	base: Base,
	results: &mut PreflightResults,
) -> Result<(), ExecError> {
	match base {
		Base::Ubuntu => {
			let out = exec.exec("systemctl is-active nix-daemon").await?;
			results.push(
				"nix-daemon",
				out.stdout_trimmed() == "active",
				format!("nix-daemon is {}", out.stdout_trimmed()),
			);
		}
		Base::Nixos => {
			let out = exec.exec_sudo("nix-store --verify").await?;
			results.push(
				"nix-store",
				out.success(),
				if out.success() {
					"store verification passed".to_owned()
				} else {
					format!("store verification failed: {}", out.stderr.trim())
				},
			);
		}
		Base::Darwin => {
			let out = exec.exec("launchctl list org.nixos.nix-daemon").await?;
			let running = out.success() && out.stdout.contains("PID");
			results.push(
				"nix-daemon",
				running,
				if running {
					"nix-daemon loaded and running".to_owned()
				} else {
					"nix-daemon is not running under launchd".to_owned()
				},
			);
		}
	}

	let out = exec.exec("nix --version").await?;
	results.push(
		"nix",
		out.success(),
		out.stdout_trimmed().to_owned(),
	);
	Ok(())
}

#[cfg(test)]
mod tests {
	use nixfleet_shared::{ExecOutput, MockExecutor};

	use super::*;

	fn healthy_ubuntu_mock() -> MockExecutor {
		let mock = MockExecutor::new("web1");
		mock.on_exact("echo nixfleet-preflight", ExecOutput::ok("nixfleet-preflight\n"));
		mock.on_exact("sudo true", ExecOutput::ok(""));
		mock.on_exact(
			"df -Pk /nix",
			ExecOutput::ok(
				"Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/sda1 104857600 10485760 94371840 10% /\n",
			),
		);
		mock.on_exact(
			"df -Pk /var",
			ExecOutput::ok(
				"Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/sda1 104857600 10485760 94371840 10% /\n",
			),
		);
		mock.on_exact("systemctl is-active nix-daemon", ExecOutput::ok("active\n"));
		mock.on_exact("nix --version", ExecOutput::ok("nix (Nix) 2.18.1\n"));
		mock
	}

	#[tokio::test]
	async fn ubuntu_happy_path() {
		let results = run_preflight(&healthy_ubuntu_mock(), Base::Ubuntu).await;
		assert!(results.passed, "{:?}", results.checks);
		assert_eq!(results.summary(), "6/6 preflight checks passed");
	}

	#[tokio::test]
	async fn low_nix_disk_fails() {
		let mock = MockExecutor::new("web1");
		mock.on_exact("echo nixfleet-preflight", ExecOutput::ok("nixfleet-preflight\n"));
		mock.on_exact("sudo true", ExecOutput::ok(""));
		// Less than 5 GiB available on /nix.
		mock.on_exact(
			"df -Pk /nix",
			ExecOutput::ok("Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/sda1 10485760 9437184 1048576 90% /\n"),
		);
		mock.on_prefix("df -Pk /var", ExecOutput::ok("fs 1 1 94371840 1% /\n"));
		mock.on_exact("systemctl is-active nix-daemon", ExecOutput::ok("active\n"));
		mock.on_exact("nix --version", ExecOutput::ok("nix (Nix) 2.18.1\n"));

		let results = run_preflight(&mock, Base::Ubuntu).await;
		assert!(!results.passed);
		let disk = results.first_failure().unwrap();
		assert_eq!(disk.name, "disk-/nix");
		assert!(disk.message.contains("5 GiB required"));
	}

	#[tokio::test]
	async fn unreachable_host_short_circuits() {
		let mock = MockExecutor::new("db1");
		mock.fail_with("connection refused");
		let results = run_preflight(&mock, Base::Nixos).await;
		assert!(!results.passed);
		assert_eq!(results.checks.len(), 1);
		assert_eq!(results.checks[0].name, "ssh");
	}

	#[tokio::test]
	async fn inactive_daemon_fails() {
		let mock = MockExecutor::new("web1");
		mock.on_exact("echo nixfleet-preflight", ExecOutput::ok("nixfleet-preflight\n"));
		mock.on_exact("sudo true", ExecOutput::ok(""));
		mock.on_prefix("df -Pk", ExecOutput::ok("fs 1 1 94371840 1% /\n"));
		mock.on_exact(
			"systemctl is-active nix-daemon",
			ExecOutput {
				stdout: "inactive\n".to_owned(),
				stderr: String::new(),
				exit_code: 3,
			},
		);
		mock.on_exact("nix --version", ExecOutput::ok("nix (Nix) 2.18.1\n"));
		let results = run_preflight(&mock, Base::Ubuntu).await;
		assert!(!results.passed);
		assert_eq!(results.first_failure().unwrap().name, "nix-daemon");
	}
}
