use anyhow::Result;
use nixfleet_shared::{
	exec::{quote, Executor, ExecutorExt},
	HelmChartRef, K0sState,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{parse::parse_state, K0S_CONFIG_PATH, K0S_MANIFESTS_DIR, SYSTEM_NAMESPACES};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
	pub deleted_charts: Vec<String>,
	/// `Kind/namespace/name` keys of removed resources.
	pub deleted_resources: Vec<String>,
	pub deleted_namespaces: Vec<String>,
	/// Dry-run intents; empty on a real run.
	pub would_delete: Vec<String>,
	/// Accumulated non-fatal cleanup errors.
	pub errors: Vec<String>,
}

impl ReconcileResult {
	pub fn is_noop(&self) -> bool {
		self.deleted_charts.is_empty()
			&& self.deleted_resources.is_empty()
			&& self.would_delete.is_empty()
	}
}

/// Whether k0s is present and running on the host.
pub async fn detect(exec: &dyn Executor) -> bool {
	match exec.exec_sudo("k0s status").await {
		Ok(out) => out.success(),
		Err(_) => false,
	}
}

/// Reads the live k0s config and auto-apply manifests from the host and
/// parses them into a state record. `None` when the host has no k0s config.
pub async fn collect_current(exec: &dyn Executor) -> Result<Option<K0sState>> {
	if !exec.file_exists(K0S_CONFIG_PATH).await? {
		return Ok(None);
	}
	let config_text = exec.read_file_text(K0S_CONFIG_PATH, true).await?;

	let mut manifests = Vec::new();
	let listing = exec
		.exec_sudo(&format!(
			"find {} -type f \\( -name '*.yaml' -o -name '*.yml' \\) 2>/dev/null",
			quote(K0S_MANIFESTS_DIR)
		))
		.await?;
	if listing.success() {
		for path in listing.stdout.lines().filter(|l| !l.is_empty()) {
			match exec.read_file_text(path, true).await {
				Ok(content) => manifests.push((path.to_owned(), content)),
				Err(e) => warn!(path, "failed to read manifest: {e}"),
			}
		}
	}
	Ok(Some(parse_state(&config_text, &manifests)))
}

/// Deletes Helm releases and resources present in `prev` but absent from
/// `current`. Errors accumulate in the result; nothing here is fatal.
pub async fn reconcile(
	exec: &dyn Executor,
	prev: &K0sState,
	current: &K0sState,
	dry_run: bool,
) -> ReconcileResult {
	let mut result = ReconcileResult::default();

	let orphaned_charts: Vec<&HelmChartRef> = prev
		.helm_charts
		.iter()
		.filter(|p| !current.helm_charts.iter().any(|c| c.name == p.name))
		.collect();
	let current_keys: Vec<String> = current.manifests.iter().map(|m| m.key()).collect();
	let orphaned_resources: Vec<_> = prev
		.manifests
		.iter()
		.filter(|m| !current_keys.contains(&m.key()))
		.collect();

	if orphaned_charts.is_empty() && orphaned_resources.is_empty() {
		return result;
	}
	info!(
		charts = orphaned_charts.len(),
		resources = orphaned_resources.len(),
		"removing orphaned k0s resources"
	);

	for chart in orphaned_charts {
		if dry_run {
			result
				.would_delete
				.push(format!("chart/{} (namespace {})", chart.name, chart.namespace));
			continue;
		}
		delete_chart(exec, chart, &mut result).await;
	}

	for resource in orphaned_resources {
		let key = resource.key();
		if dry_run {
			result.would_delete.push(format!("resource/{key}"));
			continue;
		}
		let mut cmd = format!(
			"k0s kubectl delete {} {}",
			quote(&resource.kind.to_lowercase()),
			quote(&resource.name)
		);
		if !resource.namespace.is_empty() {
			cmd.push_str(&format!(" -n {}", quote(&resource.namespace)));
		}
		cmd.push_str(" --ignore-not-found");
		match exec.exec_sudo(&cmd).await {
			Ok(out) if out.success() => result.deleted_resources.push(key),
			Ok(out) => result
				.errors
				.push(format!("delete {key}: {}", out.stderr.trim())),
			Err(e) => result.errors.push(format!("delete {key}: {e}")),
		}
	}

	result
}

async fn delete_chart(exec: &dyn Executor, chart: &HelmChartRef, result: &mut ReconcileResult) {
	let mut failed = false;

	// Helm bookkeeping secrets for the release.
	let secrets = format!(
		"k0s kubectl delete secret -n {} -l name={},owner=helm --ignore-not-found",
		quote(&chart.namespace),
		quote(&chart.name)
	);
	match exec.exec_sudo(&secrets).await {
		Ok(out) if out.success() => {}
		Ok(out) => {
			failed = true;
			result.errors.push(format!(
				"chart {}: release secrets: {}",
				chart.name,
				out.stderr.trim()
			));
		}
		Err(e) => {
			failed = true;
			result
				.errors
				.push(format!("chart {}: release secrets: {e}", chart.name));
		}
	}

	// The k0s helm extension tracks each chart as a Chart custom resource.
	let chart_cr = format!(
		"k0s kubectl -n kube-system delete chart k0s-addon-chart-{} --ignore-not-found",
		quote(&chart.name)
	);
	match exec.exec_sudo(&chart_cr).await {
		Ok(out) if out.success() => {}
		Ok(out) => {
			failed = true;
			result.errors.push(format!(
				"chart {}: chart resource: {}",
				chart.name,
				out.stderr.trim()
			));
		}
		Err(e) => {
			failed = true;
			result
				.errors
				.push(format!("chart {}: chart resource: {e}", chart.name));
		}
	}

	if !failed {
		result.deleted_charts.push(chart.name.clone());
	}

	maybe_delete_namespace(exec, &chart.namespace, result).await;
}

async fn maybe_delete_namespace(
	exec: &dyn Executor,
	namespace: &str,
	result: &mut ReconcileResult,
) {
	if namespace.is_empty() || SYSTEM_NAMESPACES.contains(&namespace) {
		return;
	}
	let probe = format!(
		"k0s kubectl get all -n {} --no-headers 2>/dev/null",
		quote(namespace)
	);
	match exec.exec_sudo(&probe).await {
		Ok(out) if out.success() && out.stdout.trim().is_empty() => {
			let delete = format!("k0s kubectl delete namespace {}", quote(namespace));
			match exec.exec_sudo(&delete).await {
				Ok(out) if out.success() => result.deleted_namespaces.push(namespace.to_owned()),
				Ok(out) => result
					.errors
					.push(format!("namespace {namespace}: {}", out.stderr.trim())),
				Err(e) => result.errors.push(format!("namespace {namespace}: {e}")),
			}
		}
		// Non-empty or unreadable namespaces are left alone.
		_ => {}
	}
}

#[cfg(test)]
mod tests {
	use nixfleet_shared::{ExecOutput, ManifestRef, MockExecutor};

	use super::*;

	fn prev_state() -> K0sState {
		K0sState {
			enabled: true,
			config_hash: "old".to_owned(),
			helm_charts: vec![HelmChartRef {
				name: "prom".to_owned(),
				chart: "prometheus-community/prometheus".to_owned(),
				version: "14.6.1".to_owned(),
				namespace: "monitoring".to_owned(),
			}],
			manifests: vec![ManifestRef {
				api_version: "v1".to_owned(),
				kind: "ConfigMap".to_owned(),
				name: "cm1".to_owned(),
				namespace: "default".to_owned(),
				file: "cm.yaml".to_owned(),
				logical_name: "configmap-cm1".to_owned(),
			}],
			last_reconcile: None,
		}
	}

	#[tokio::test]
	async fn deletes_orphaned_chart_and_resource() {
		let mock = MockExecutor::new("k8s1");
		// Empty namespace, eligible for cleanup.
		mock.on_prefix("sudo k0s kubectl get all -n monitoring", ExecOutput::ok("\n"));

		let result = reconcile(&mock, &prev_state(), &K0sState::default(), false).await;
		assert_eq!(result.deleted_charts, vec!["prom"]);
		assert_eq!(result.deleted_resources, vec!["ConfigMap/default/cm1"]);
		assert_eq!(result.deleted_namespaces, vec!["monitoring"]);
		assert!(result.errors.is_empty());

		assert!(mock.ran("delete chart k0s-addon-chart-prom"));
		assert!(mock.ran("delete secret -n monitoring -l name=prom,owner=helm"));
		assert!(mock.ran("delete configmap cm1 -n default --ignore-not-found"));
	}

	#[tokio::test]
	async fn keeps_non_empty_namespace() {
		let mock = MockExecutor::new("k8s1");
		mock.on_prefix(
			"sudo k0s kubectl get all -n monitoring",
			ExecOutput::ok("pod/other-pod  1/1  Running\n"),
		);
		let result = reconcile(&mock, &prev_state(), &K0sState::default(), false).await;
		assert!(result.deleted_namespaces.is_empty());
		assert!(!mock.ran("delete namespace monitoring"));
	}

	#[tokio::test]
	async fn never_deletes_system_namespaces() {
		let mut prev = prev_state();
		prev.helm_charts[0].namespace = "kube-system".to_owned();
		let mock = MockExecutor::new("k8s1");
		let result = reconcile(&mock, &prev, &K0sState::default(), false).await;
		assert!(result.deleted_namespaces.is_empty());
		assert!(!mock.ran("get all -n kube-system"));
	}

	#[tokio::test]
	async fn dry_run_only_reports() {
		let mock = MockExecutor::new("k8s1");
		let result = reconcile(&mock, &prev_state(), &K0sState::default(), true).await;
		assert_eq!(result.would_delete.len(), 2);
		assert!(result.would_delete.iter().any(|i| i.contains("chart/prom")));
		assert!(result
			.would_delete
			.iter()
			.any(|i| i.contains("resource/ConfigMap/default/cm1")));
		assert!(mock.commands().is_empty());
	}

	#[tokio::test]
	async fn errors_accumulate_without_aborting() {
		let mock = MockExecutor::new("k8s1");
		mock.on_prefix(
			"sudo k0s kubectl delete secret",
			ExecOutput::failed(1, "connection refused"),
		);
		mock.on_prefix("sudo k0s kubectl get all -n monitoring", ExecOutput::ok(""));
		let result = reconcile(&mock, &prev_state(), &K0sState::default(), false).await;
		assert!(!result.errors.is_empty());
		// The manifest deletion still happened.
		assert_eq!(result.deleted_resources, vec!["ConfigMap/default/cm1"]);
	}

	#[tokio::test]
	async fn unchanged_state_is_noop() {
		let mock = MockExecutor::new("k8s1");
		let prev = prev_state();
		let result = reconcile(&mock, &prev, &prev.clone(), false).await;
		assert!(result.is_noop());
		assert!(mock.commands().is_empty());
	}
}
