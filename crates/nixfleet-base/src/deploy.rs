use std::{
	sync::Arc,
	time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use nixfleet_pki::{deploy_certs, rotate_for_hosts, PkiStore, RotationConfig};
use nixfleet_shared::exec::Executor;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
	health::{self, HealthCheckConfig, HealthResults},
	inventory::Host,
	nix::{self, ActivateAction, Builder, Closure},
	parallel,
	preflight::{self, PreflightResults},
	ssh::ClientProvider,
	state,
};

/// What to do when activation or post-deploy health checks fail.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
	/// Return to the previous generation (the default).
	Rollback,
	/// Leave the host as-is and report failure.
	Halt,
	/// Log and report success anyway.
	Continue,
}

#[derive(Clone, Debug)]
pub struct ApplyOptions {
	pub action: ActivateAction,
	pub parallel: usize,
	pub skip_preflight: bool,
	pub skip_health: bool,
	pub dry_run: bool,
	pub failure_policy: FailurePolicy,
	pub health_check_delay: Duration,
	pub pki_renew_before_days: i64,
}

impl Default for ApplyOptions {
	fn default() -> Self {
		Self {
			action: ActivateAction::Switch,
			parallel: parallel::DEFAULT_PARALLEL,
			skip_preflight: false,
			skip_health: false,
			dry_run: false,
			failure_policy: FailurePolicy::Rollback,
			health_check_delay: Duration::from_secs(5),
			pki_renew_before_days: 30,
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HostResult {
	pub host: String,
	pub success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub preflight: Option<PreflightResults>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub closure: Option<Closure>,
	#[serde(skip_serializing_if = "Vec::is_empty", default)]
	pub pki_installed: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pki_error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub k0s: Option<nixfleet_k0s::ReconcileResult>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub health: Option<HealthResults>,
	pub rollback_performed: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	pub duration_ms: u64,
}

impl HostResult {
	fn new(host: &str) -> Self {
		Self {
			host: host.to_owned(),
			success: false,
			preflight: None,
			closure: None,
			pki_installed: Vec::new(),
			pki_error: None,
			k0s: None,
			health: None,
			rollback_performed: false,
			error: None,
			duration_ms: 0,
		}
	}

	fn finish(mut self, started: Instant) -> Self {
		self.duration_ms = started.elapsed().as_millis() as u64;
		self
	}

	fn fail(mut self, error: impl Into<String>, started: Instant) -> Self {
		let error = error.into();
		error!("{error}");
		self.error = Some(error);
		self.success = false;
		self.finish(started)
	}
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResults {
	pub started: DateTime<Utc>,
	pub finished: DateTime<Utc>,
	pub hosts: Vec<HostResult>,
	pub success_count: usize,
	pub failure_count: usize,
}

impl PipelineResults {
	pub fn summary(&self) -> String {
		format!(
			"{}/{} hosts applied in {}s",
			self.success_count,
			self.hosts.len(),
			(self.finished - self.started).num_seconds()
		)
	}
}

/// The master orchestrator: preflight → build → copy → activate → PKI →
/// k0s reconcile → health, per host, with bounded fan-out. A failed host
/// never aborts its peers.
pub struct Pipeline {
	provider: Arc<dyn ClientProvider>,
	builder: Arc<dyn Builder>,
	pki: Option<Arc<PkiStore>>,
	opts: ApplyOptions,
}

impl Pipeline {
	pub fn new(
		provider: Arc<dyn ClientProvider>,
		builder: Arc<dyn Builder>,
		pki: Option<Arc<PkiStore>>,
		opts: ApplyOptions,
	) -> Self {
		Self {
			provider,
			builder,
			pki,
			opts,
		}
	}

	pub async fn apply(&self, hosts: &[Host], cancel: &CancellationToken) -> PipelineResults {
		let started = Utc::now();

		// Batch auto-renew before any host work: every stored cert for a
		// host in this batch that is inside the renewal window.
		if let Some(store) = &self.pki {
			let names: Vec<String> = hosts.iter().map(|h| h.name.clone()).collect();
			let cfg = RotationConfig {
				renew_before_days: self.opts.pki_renew_before_days,
				..Default::default()
			};
			match store.load_issuer() {
				Ok(issuer) => {
					if let Err(e) = rotate_for_hosts(store, &issuer, &cfg, &names) {
						warn!("batch certificate auto-renewal failed: {e}");
					}
				}
				Err(e) => warn!("pki enabled but issuer unavailable: {e}"),
			}
		}

		let task_results = parallel::run_bounded(hosts, self.opts.parallel, cancel, |host| {
			let provider = self.provider.clone();
			let builder = self.builder.clone();
			let pki = self.pki.clone();
			let opts = self.opts.clone();
			let span = info_span!("deploy", host = host.name.as_str());
			async move { Ok(apply_host(provider, builder, pki, opts, host).await) }
				.instrument(span)
		})
		.await;

		let hosts: Vec<HostResult> = task_results
			.into_iter()
			.map(|task| match task.outcome {
				Ok(result) => result,
				Err(e) => HostResult::new(&task.host).fail(e.to_string(), Instant::now()),
			})
			.collect();
		let success_count = hosts.iter().filter(|h| h.success).count();
		let failure_count = hosts.len() - success_count;

		let results = PipelineResults {
			started,
			finished: Utc::now(),
			hosts,
			success_count,
			failure_count,
		};
		info!("{}", results.summary());
		results
	}
}

fn default_health_check() -> HealthCheckConfig {
	HealthCheckConfig::command("post-deploy-ssh", "echo nixfleet-health")
}

async fn apply_host(
	provider: Arc<dyn ClientProvider>,
	builder: Arc<dyn Builder>,
	pki: Option<Arc<PkiStore>>,
	opts: ApplyOptions,
	host: Host,
) -> HostResult {
	let started = Instant::now();
	let mut result = HostResult::new(&host.name);

	let client = match provider.client(&host).await {
		Ok(client) => client,
		Err(e) => return result.fail(format!("ssh connection failed: {e}"), started),
	};
	let exec = client.as_ref();

	if !opts.skip_preflight {
		let checks = preflight::run_preflight(exec, host.base).await;
		let failure = checks
			.first_failure()
			.map(|c| format!("{}: {}", c.name, c.message));
		let passed = checks.passed;
		result.preflight = Some(checks);
		if !passed {
			return result.fail(
				format!("preflight failed: {}", failure.unwrap_or_default()),
				started,
			);
		}
	}

	let closure = match builder.build_host(&host.name, host.base).await {
		Ok(closure) => closure,
		Err(e) => return result.fail(format!("build failed: {e:#}"), started),
	};
	result.closure = Some(closure.clone());

	if opts.dry_run {
		info!(
			store_path = closure.store_path,
			"dry-run: stopping before copy"
		);
		result.success = true;
		return result.finish(started);
	}

	if let Err(e) = builder.copy_to_host(&closure, &host).await {
		return result.fail(format!("copy failed: {e:#}"), started);
	}

	let pre_generation = nix::get_current_generation(exec).await.unwrap_or(0);

	if let Err(e) = nix::activate(exec, &closure, opts.action).await {
		return apply_failure_policy(
			exec,
			&host,
			&opts,
			pre_generation,
			result,
			format!("Activation failed: {e:#}"),
			started,
		)
		.await;
	}

	let generation = nix::get_current_generation(exec)
		.await
		.unwrap_or(pre_generation + 1);
	let mut host_state = match state::update_after_apply(
		exec,
		&closure.store_path,
		&closure.manifest_hash,
		generation,
		started.elapsed(),
	)
	.await
	{
		Ok(host_state) => host_state,
		Err(e) => return result.fail(format!("state update failed: {e:#}"), started),
	};

	// Closures may bundle a manifest of the files and units they manage;
	// that becomes the next drift baseline.
	match nix::read_closure_manifest(exec, &closure.store_path).await {
		Ok(Some(manifest)) => {
			host_state.managed_files = manifest.managed_files;
			host_state.activated_units = manifest.activated_units;
			if let Err(e) = state::write_state(exec, &host_state).await {
				return result.fail(format!("state update failed: {e:#}"), started);
			}
		}
		Ok(None) => {}
		Err(e) => warn!("unreadable closure manifest: {e}"),
	}

	if let Some(store) = &pki {
		if !host.certs.is_empty() {
			match deploy_certs(exec, store, &host.name, &host.certs).await {
				Ok(installed) => result.pki_installed = installed,
				// Non-fatal by design: the apply continues.
				Err(e) => {
					warn!("certificate deployment failed: {e:#}");
					result.pki_error = Some(format!("{e:#}"));
				}
			}
		}
	}

	if nixfleet_k0s::detect(exec).await {
		match nixfleet_k0s::collect_current(exec).await {
			Ok(Some(current)) => {
				match &host_state.k0s {
					Some(prev) => {
						let reconcile =
							nixfleet_k0s::reconcile(exec, prev, &current, false).await;
						for err in &reconcile.errors {
							warn!("k0s cleanup: {err}");
						}
						result.k0s = Some(reconcile);
					}
					// First deploy seeds state only.
					None => {}
				}
				host_state.k0s = Some(current);
				if let Err(e) = state::write_state(exec, &host_state).await {
					warn!("failed to persist k0s state: {e:#}");
				}
			}
			Ok(None) => {}
			Err(e) => warn!("k0s state collection failed: {e:#}"),
		}
	}

	if !opts.skip_health {
		sleep(opts.health_check_delay).await;
		let mut configs = vec![default_health_check()];
		configs.extend(host.health_checks.iter().cloned());
		let checks = health::run_checks(exec, &configs).await;
		let passed = checks.passed;
		result.health = Some(checks);
		if !passed {
			return apply_failure_policy(
				exec,
				&host,
				&opts,
				pre_generation,
				result,
				"Health checks failed".to_owned(),
				started,
			)
			.await;
		}
	}

	info!(generation, "apply complete");
	result.success = true;
	result.finish(started)
}

async fn apply_failure_policy(
	exec: &dyn Executor,
	host: &Host,
	opts: &ApplyOptions,
	pre_generation: u64,
	mut result: HostResult,
	reason: String,
	started: Instant,
) -> HostResult {
	match opts.failure_policy {
		FailurePolicy::Rollback => {
			let target = (pre_generation > 0).then_some(pre_generation);
			match nix::rollback(exec, host.base, target).await {
				Ok(()) => {
					result.rollback_performed = true;
					result.fail(format!("{reason}, rolled back"), started)
				}
				Err(e) => result.fail(format!("{reason}; rollback also failed: {e:#}"), started),
			}
		}
		FailurePolicy::Halt => result.fail(reason, started),
		FailurePolicy::Continue => {
			warn!("{reason}, continuing per failure policy");
			result.success = true;
			result.finish(started)
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use anyhow::{anyhow, Result};
	use async_trait::async_trait;
	use nixfleet_shared::exec::{ExecError, ExecOutput};
	use nixfleet_shared::MockExecutor;

	use super::*;
	use crate::inventory::Base;

	struct MockFleet {
		clients: HashMap<String, Arc<MockExecutor>>,
	}

	#[async_trait]
	impl ClientProvider for MockFleet {
		async fn client(&self, host: &Host) -> Result<Arc<dyn Executor>, ExecError> {
			match self.clients.get(&host.name) {
				Some(client) => Ok(client.clone() as Arc<dyn Executor>),
				None => Err(ExecError::Transport {
					host: host.name.clone(),
					message: "no route to host".to_owned(),
				}),
			}
		}
	}

	struct MockBuilder {
		fail_build: bool,
	}

	#[async_trait]
	impl Builder for MockBuilder {
		async fn build_host(&self, _host: &str, base: Base) -> Result<Closure> {
			if self.fail_build {
				return Err(anyhow!("evaluation error"));
			}
			Ok(Closure {
				store_path: "/nix/store/abc-system".to_owned(),
				manifest_hash: "aa11".to_owned(),
				base,
			})
		}

		async fn copy_to_host(&self, _closure: &Closure, _host: &Host) -> Result<()> {
			Ok(())
		}
	}

	fn ubuntu_host(name: &str) -> Host {
		Host {
			name: name.to_owned(),
			addr: "10.0.0.1".to_owned(),
			port: 22,
			ssh_user: "deploy".to_owned(),
			base: Base::Ubuntu,
			roles: vec![],
			tags: vec![],
			health_checks: vec![HealthCheckConfig::service_unit("nginx", "nginx")],
			certs: vec![],
		}
	}

	fn ubuntu_mock(nginx_state: &str) -> Arc<MockExecutor> {
		let mock = MockExecutor::new("web1");
		mock.on_exact("echo nixfleet-preflight", ExecOutput::ok("nixfleet-preflight\n"));
		mock.on_exact("sudo true", ExecOutput::ok(""));
		mock.on_prefix("df -Pk", ExecOutput::ok("fs 1 1 94371840 1% /\n"));
		mock.on_exact("systemctl is-active nix-daemon", ExecOutput::ok("active\n"));
		mock.on_exact("nix --version", ExecOutput::ok("nix (Nix) 2.18.1\n"));
		mock.on_prefix(
			"readlink /nix/var/nix/profiles/system",
			ExecOutput::ok("system-42-link\n"),
		);
		mock.on_exact(
			"systemctl is-active nginx",
			if nginx_state == "active" {
				ExecOutput::ok("active\n")
			} else {
				ExecOutput {
					stdout: format!("{nginx_state}\n"),
					stderr: String::new(),
					exit_code: 3,
				}
			},
		);
		mock.on_prefix("systemctl status nginx", ExecOutput::ok("nginx.service details\n"));
		// k0s absent on this host.
		mock.on_exact("sudo k0s status", ExecOutput::failed(127, "k0s: not found"));
		Arc::new(mock)
	}

	fn pipeline(provider: MockFleet, builder: MockBuilder, opts: ApplyOptions) -> Pipeline {
		Pipeline::new(Arc::new(provider), Arc::new(builder), None, opts)
	}

	fn fast_opts() -> ApplyOptions {
		ApplyOptions {
			health_check_delay: Duration::from_millis(0),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn happy_path_ubuntu_apply() {
		let mock = ubuntu_mock("active");
		let provider = MockFleet {
			clients: HashMap::from([("web1".to_owned(), mock.clone())]),
		};
		let p = pipeline(provider, MockBuilder { fail_build: false }, fast_opts());
		let results = p
			.apply(&[ubuntu_host("web1")], &CancellationToken::new())
			.await;

		assert_eq!(results.success_count, 1);
		let host = &results.hosts[0];
		assert!(host.success, "{:?}", host.error);
		assert!(!host.rollback_performed);
		assert!(host.preflight.as_ref().unwrap().passed);
		assert_eq!(host.closure.as_ref().unwrap().manifest_hash, "aa11");
		assert!(host.health.as_ref().unwrap().passed);

		// Profile switched, activation script ran, state persisted.
		assert!(mock.ran("nix-env --profile /nix/var/nix/profiles/system --set /nix/store/abc-system"));
		assert!(mock.ran("sudo /nix/store/abc-system/activate"));
		assert!(mock.ran("state.json"));
		assert!(mock.ran("aa11"));
		assert!(mock.ran("\"generation\": 42"));
	}

	#[tokio::test]
	async fn failed_health_rolls_back() {
		let mock = ubuntu_mock("failed");
		let provider = MockFleet {
			clients: HashMap::from([("web1".to_owned(), mock.clone())]),
		};
		let p = pipeline(provider, MockBuilder { fail_build: false }, fast_opts());
		let results = p
			.apply(&[ubuntu_host("web1")], &CancellationToken::new())
			.await;

		let host = &results.hosts[0];
		assert!(!host.success);
		assert!(host.rollback_performed);
		assert!(host
			.error
			.as_ref()
			.unwrap()
			.contains("Health checks failed, rolled back"));
		// Rolled back to the pre-apply generation.
		assert!(mock.ran("--switch-generation 42"));
		assert!(mock.ran("/nix/var/nix/profiles/system/activate"));
	}

	#[tokio::test]
	async fn halt_policy_skips_rollback() {
		let mock = ubuntu_mock("failed");
		let provider = MockFleet {
			clients: HashMap::from([("web1".to_owned(), mock.clone())]),
		};
		let opts = ApplyOptions {
			failure_policy: FailurePolicy::Halt,
			..fast_opts()
		};
		let p = pipeline(provider, MockBuilder { fail_build: false }, opts);
		let results = p
			.apply(&[ubuntu_host("web1")], &CancellationToken::new())
			.await;
		let host = &results.hosts[0];
		assert!(!host.success);
		assert!(!host.rollback_performed);
		assert!(!mock.ran("--switch-generation"));
	}

	#[tokio::test]
	async fn build_failure_short_circuits() {
		let mock = ubuntu_mock("active");
		let provider = MockFleet {
			clients: HashMap::from([("web1".to_owned(), mock.clone())]),
		};
		let p = pipeline(provider, MockBuilder { fail_build: true }, fast_opts());
		let results = p
			.apply(&[ubuntu_host("web1")], &CancellationToken::new())
			.await;
		let host = &results.hosts[0];
		assert!(!host.success);
		assert!(host.error.as_ref().unwrap().contains("build failed"));
		assert!(!mock.ran("activate"), "must not reach activation");
	}

	#[tokio::test]
	async fn dry_run_stops_after_build() {
		let mock = ubuntu_mock("active");
		let provider = MockFleet {
			clients: HashMap::from([("web1".to_owned(), mock.clone())]),
		};
		let opts = ApplyOptions {
			dry_run: true,
			..fast_opts()
		};
		let p = pipeline(provider, MockBuilder { fail_build: false }, opts);
		let results = p
			.apply(&[ubuntu_host("web1")], &CancellationToken::new())
			.await;
		let host = &results.hosts[0];
		assert!(host.success);
		assert!(host.closure.is_some());
		assert!(!mock.ran("nix-env"), "dry-run must not touch the host profile");
	}

	#[tokio::test]
	async fn unreachable_host_does_not_abort_peers() {
		let mock = ubuntu_mock("active");
		let provider = MockFleet {
			clients: HashMap::from([("web1".to_owned(), mock.clone())]),
		};
		let p = pipeline(provider, MockBuilder { fail_build: false }, fast_opts());
		let results = p
			.apply(
				&[ubuntu_host("unreachable"), ubuntu_host("web1")],
				&CancellationToken::new(),
			)
			.await;
		assert_eq!(results.success_count, 1);
		assert_eq!(results.failure_count, 1);
		assert_eq!(results.hosts[0].host, "unreachable");
		assert!(results.hosts[0]
			.error
			.as_ref()
			.unwrap()
			.contains("ssh connection failed"));
		assert!(results.hosts[1].success);
	}
}
