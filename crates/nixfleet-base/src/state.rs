use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use nixfleet_shared::{
	exec::{quote, Executor, ExecutorExt},
	DriftResult, DriftStatus, HostState, ManagedFile,
};
use tracing::{debug, info};

pub const STATE_PATH: &str = "/var/lib/nixfleet/state.json";
pub const STATE_MODE: &str = "0640";

/// Reads the host's state file. A missing file yields a fresh zeroed state;
/// an unparsable file is an error.
pub async fn read_state(exec: &dyn Executor) -> Result<HostState> {
	if !exec.file_exists(STATE_PATH).await? {
		debug!(host = exec.host_name(), "no state file, synthesizing fresh state");
		return Ok(HostState::default());
	}
	let text = exec.read_file_text(STATE_PATH, true).await?;
	serde_json::from_str(&text)
		.with_context(|| format!("corrupt state file on {}", exec.host_name()))
}

pub async fn write_state(exec: &dyn Executor, state: &HostState) -> Result<()> {
	let json = serde_json::to_string_pretty(state)?;
	exec.write_file(STATE_PATH, &json, STATE_MODE).await
}

/// Records a successful activation. Unknown fields written by newer
/// controllers survive because [`HostState`] round-trips them.
pub async fn update_after_apply(
	exec: &dyn Executor,
	store_path: &str,
	manifest_hash: &str,
	generation: u64,
	duration: std::time::Duration,
) -> Result<HostState> {
	let mut state = read_state(exec).await?;
	state.store_path = store_path.to_owned();
	state.manifest_hash = manifest_hash.to_owned();
	state.generation = generation;
	state.last_apply = Some(Utc::now());
	state.last_apply_duration_secs = duration.as_secs();
	write_state(exec, &state).await?;
	Ok(state)
}

/// Compares each previously-recorded managed file against its current
/// on-host attributes: existence, content hash, permissions, ownership.
pub async fn check_drift(
	exec: &dyn Executor,
	managed_files: &[ManagedFile],
) -> Result<Vec<DriftResult>> {
	let mut results = Vec::with_capacity(managed_files.len());
	for file in managed_files {
		results.push(check_file(exec, file).await?);
	}
	Ok(results)
}

async fn check_file(exec: &dyn Executor, file: &ManagedFile) -> Result<DriftResult> {
	let path = file.path.as_str();
	if !exec.file_exists(path).await? {
		return Ok(DriftResult {
			path: file.path.clone(),
			status: DriftStatus::Missing,
			detail: None,
		});
	}
	if file.sha256.is_empty() {
		// Recorded as a placeholder at activation: the file appeared outside
		// the control plane's knowledge.
		return Ok(DriftResult {
			path: file.path.clone(),
			status: DriftStatus::Added,
			detail: None,
		});
	}

	let sum = exec.exec_sudo(&format!("sha256sum {}", quote(path))).await?;
	if !sum.success() {
		return Ok(DriftResult {
			path: file.path.clone(),
			status: DriftStatus::Missing,
			detail: Some(sum.stderr.trim().to_owned()),
		});
	}
	let current_hash = sum
		.stdout_trimmed()
		.split_whitespace()
		.next()
		.unwrap_or_default()
		.to_owned();
	if current_hash != file.sha256 {
		return Ok(DriftResult {
			path: file.path.clone(),
			status: DriftStatus::ContentChanged,
			detail: Some(format!("sha256 {current_hash} != recorded {}", file.sha256)),
		});
	}

	let stat = exec
		.exec_sudo(&format!("stat -c '%a %U %G' {}", quote(path)))
		.await?;
	if stat.success() {
		let fields: Vec<&str> = stat.stdout_trimmed().split_whitespace().collect();
		if let [mode, owner, group] = fields[..] {
			if mode != file.mode || owner != file.owner || group != file.group {
				return Ok(DriftResult {
					path: file.path.clone(),
					status: DriftStatus::PermissionsChanged,
					detail: Some(format!(
						"{mode} {owner}:{group} != recorded {} {}:{}",
						file.mode, file.owner, file.group
					)),
				});
			}
		}
	}

	Ok(DriftResult {
		path: file.path.clone(),
		status: DriftStatus::Unchanged,
		detail: None,
	})
}

/// Runs a drift check against the recorded managed files and persists the
/// outcome (`driftDetected`, `driftFiles`, `lastDriftCheck`) back to the
/// state file. Returns the per-file results.
pub async fn check_and_record_drift(exec: &dyn Executor) -> Result<Vec<DriftResult>> {
	let mut state = read_state(exec).await?;
	let drift = check_drift(exec, &state.managed_files).await?;
	state.drift_files = drift
		.iter()
		.filter(|d| d.is_drifted())
		.map(|d| d.path.clone())
		.collect();
	state.drift_detected = !state.drift_files.is_empty();
	state.last_drift_check = Some(Utc::now());
	write_state(exec, &state).await?;
	Ok(drift)
}

#[derive(Debug, Default)]
pub struct FixDriftReport {
	pub fixed: Vec<String>,
	pub refused: Vec<String>,
}

/// Repairs permission/ownership drift in place. Content drift is refused:
/// it is surfaced for a re-apply, never silently overwritten.
pub async fn fix_drift(
	exec: &dyn Executor,
	managed_files: &[ManagedFile],
	drift: &[DriftResult],
) -> Result<FixDriftReport> {
	let mut report = FixDriftReport::default();
	for result in drift {
		match result.status {
			DriftStatus::Unchanged => {}
			DriftStatus::PermissionsChanged => {
				let file = managed_files
					.iter()
					.find(|f| f.path == result.path)
					.ok_or_else(|| anyhow!("drift result for unmanaged file {}", result.path))?;
				let cmd = format!(
					"chmod {} {path} && chown {}:{} {path}",
					quote(&file.mode),
					quote(&file.owner),
					quote(&file.group),
					path = quote(&file.path),
				);
				let out = exec.exec_sudo(&cmd).await?;
				if out.success() {
					info!(host = exec.host_name(), path = file.path, "repaired permission drift");
					report.fixed.push(result.path.clone());
				} else {
					report.refused.push(result.path.clone());
				}
			}
			DriftStatus::ContentChanged | DriftStatus::Missing | DriftStatus::Added => {
				report.refused.push(result.path.clone());
			}
		}
	}
	Ok(report)
}

#[cfg(test)]
mod tests {
	use nixfleet_shared::{ExecOutput, MockExecutor};

	use super::*;

	fn managed(path: &str, sha: &str) -> ManagedFile {
		ManagedFile {
			path: path.to_owned(),
			sha256: sha.to_owned(),
			mode: "644".to_owned(),
			owner: "root".to_owned(),
			group: "root".to_owned(),
		}
	}

	#[tokio::test]
	async fn missing_state_synthesizes_default() {
		let mock = MockExecutor::new("web1");
		mock.on_prefix("test -e /var/lib/nixfleet/state.json", ExecOutput::ok("false\n"));
		let state = read_state(&mock).await.unwrap();
		assert_eq!(state.generation, 0);
		assert!(state.manifest_hash.is_empty());
	}

	#[tokio::test]
	async fn update_after_apply_writes_new_fields() {
		let mock = MockExecutor::new("web1");
		mock.on_prefix("test -e /var/lib/nixfleet/state.json", ExecOutput::ok("false\n"));
		let state = update_after_apply(
			&mock,
			"/nix/store/abc-system",
			"aa11",
			42,
			std::time::Duration::from_secs(7),
		)
		.await
		.unwrap();
		assert_eq!(state.generation, 42);
		assert_eq!(state.manifest_hash, "aa11");
		assert!(state.last_apply.is_some());
		assert!(mock.ran("chmod 0640"));
		assert!(mock.ran("state.json"));
	}

	#[tokio::test]
	async fn drift_statuses() {
		let mock = MockExecutor::new("web1");
		mock.on_prefix("test -e /etc/gone.conf", ExecOutput::ok("false\n"));
		mock.on_prefix("test -e", ExecOutput::ok("true\n"));
		mock.on_exact(
			"sudo sha256sum /etc/same.conf",
			ExecOutput::ok("aaaa  /etc/same.conf\n"),
		);
		mock.on_exact(
			"sudo stat -c '%a %U %G' /etc/same.conf",
			ExecOutput::ok("644 root root\n"),
		);
		mock.on_exact(
			"sudo sha256sum /etc/edited.conf",
			ExecOutput::ok("bbbb  /etc/edited.conf\n"),
		);
		mock.on_exact(
			"sudo sha256sum /etc/chmodded.conf",
			ExecOutput::ok("cccc  /etc/chmodded.conf\n"),
		);
		mock.on_exact(
			"sudo stat -c '%a %U %G' /etc/chmodded.conf",
			ExecOutput::ok("600 nobody root\n"),
		);

		let files = vec![
			managed("/etc/same.conf", "aaaa"),
			managed("/etc/edited.conf", "aaaa"),
			managed("/etc/chmodded.conf", "cccc"),
			managed("/etc/gone.conf", "dddd"),
		];
		let drift = check_drift(&mock, &files).await.unwrap();
		assert_eq!(drift[0].status, DriftStatus::Unchanged);
		assert_eq!(drift[1].status, DriftStatus::ContentChanged);
		assert_eq!(drift[2].status, DriftStatus::PermissionsChanged);
		assert_eq!(drift[3].status, DriftStatus::Missing);
	}

	#[tokio::test]
	async fn fix_drift_repairs_permissions_only() {
		let mock = MockExecutor::new("web1");
		let files = vec![
			managed("/etc/chmodded.conf", "cccc"),
			managed("/etc/edited.conf", "aaaa"),
		];
		let drift = vec![
			DriftResult {
				path: "/etc/chmodded.conf".to_owned(),
				status: DriftStatus::PermissionsChanged,
				detail: None,
			},
			DriftResult {
				path: "/etc/edited.conf".to_owned(),
				status: DriftStatus::ContentChanged,
				detail: None,
			},
		];
		let report = fix_drift(&mock, &files, &drift).await.unwrap();
		assert_eq!(report.fixed, vec!["/etc/chmodded.conf"]);
		assert_eq!(report.refused, vec!["/etc/edited.conf"]);
		assert!(mock.ran("chmod 644 /etc/chmodded.conf"));
		assert!(!mock.ran("edited.conf && chown"), "content drift must not be rewritten");
	}
}
