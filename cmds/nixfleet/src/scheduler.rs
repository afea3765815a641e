use std::{sync::Arc, time::Duration};

use chrono::Utc;
use nixfleet_base::{
	inventory::{Base, Host},
	nix, state,
	ssh::ClientProvider,
	Inventory,
};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::webhook::WebhookNotifier;

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
	pub drift_check_secs: Option<u64>,
	pub update_check_secs: Option<u64>,
	pub health_check_secs: Option<u64>,
}

/// The narrow surface the scheduler needs: inventory, SSH access, and the
/// webhook sender. Deliberately not the server, which would be a cycle.
pub struct SchedulerDeps {
	pub inventory: Inventory,
	pub provider: Arc<dyn ClientProvider>,
	pub webhooks: Arc<WebhookNotifier>,
}

/// Up to three periodic loops, each with its own interval and all stopped
/// by one cancellation token.
pub struct Scheduler {
	handles: Vec<JoinHandle<()>>,
	cancel: CancellationToken,
}

impl Scheduler {
	pub fn start(config: &SchedulerConfig, deps: Arc<SchedulerDeps>) -> Self {
		let cancel = CancellationToken::new();
		let mut handles = Vec::new();

		if let Some(secs) = config.drift_check_secs {
			handles.push(spawn_loop(
				"drift-check",
				Duration::from_secs(secs),
				cancel.clone(),
				deps.clone(),
				|deps| Box::pin(drift_check_tick(deps)),
			));
		}
		if let Some(secs) = config.update_check_secs {
			handles.push(spawn_loop(
				"update-check",
				Duration::from_secs(secs),
				cancel.clone(),
				deps.clone(),
				|deps| Box::pin(update_check_tick(deps)),
			));
		}
		if let Some(secs) = config.health_check_secs {
			handles.push(spawn_loop(
				"health-check",
				Duration::from_secs(secs),
				cancel.clone(),
				deps.clone(),
				|deps| Box::pin(health_check_tick(deps)),
			));
		}
		info!(tasks = handles.len(), "scheduler started");
		Self { handles, cancel }
	}

	pub async fn stop(self) {
		self.cancel.cancel();
		for handle in self.handles {
			let _ = handle.await;
		}
	}
}

type TickFn = fn(
	Arc<SchedulerDeps>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

fn spawn_loop(
	name: &'static str,
	interval: Duration,
	cancel: CancellationToken,
	deps: Arc<SchedulerDeps>,
	tick: TickFn,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					debug!("{name} loop stopped");
					break;
				}
				_ = tokio::time::sleep(interval) => {
					debug!("{name} tick");
					tick(deps.clone()).await;
				}
			}
		}
	})
}

async fn drift_check_tick(deps: Arc<SchedulerDeps>) {
	for host in deps.inventory.list() {
		if let Err(e) = drift_check_host(&deps, host).await {
			warn!(host = host.name, "drift check failed: {e:#}");
		}
	}
}

async fn drift_check_host(deps: &SchedulerDeps, host: &Host) -> anyhow::Result<()> {
	let client = deps.provider.client(host).await?;
	let drift = state::check_and_record_drift(client.as_ref()).await?;
	let drifted: Vec<&str> = drift
		.iter()
		.filter(|d| d.is_drifted())
		.map(|d| d.path.as_str())
		.collect();
	if !drifted.is_empty() {
		deps.webhooks
			.send_host_event("drift", &host.name, json!({ "files": drifted }))
			.await;
	}
	Ok(())
}

async fn update_check_tick(deps: Arc<SchedulerDeps>) {
	for host in deps.inventory.list() {
		if host.base != Base::Ubuntu {
			continue;
		}
		if let Err(e) = update_check_host(&deps, host).await {
			warn!(host = host.name, "update check failed: {e:#}");
		}
	}
}

fn count_from_stdout(stdout: &str) -> u64 {
	stdout.trim().parse().unwrap_or(0)
}

async fn update_check_host(deps: &SchedulerDeps, host: &Host) -> anyhow::Result<()> {
	let client = deps.provider.client(host).await?;
	let exec = client.as_ref();

	// `grep -c` exits 1 on zero matches; the count is still on stdout.
	let pending = exec
		.exec_sudo("apt-get update -qq && apt-get -s upgrade | grep -c '^Inst'")
		.await?;
	let security = exec
		.exec_sudo("apt-get -s upgrade | grep -c security")
		.await?;

	let mut host_state = state::read_state(exec).await?;
	host_state.pending_updates = count_from_stdout(&pending.stdout);
	host_state.security_updates = count_from_stdout(&security.stdout);
	host_state.last_update_check = Some(Utc::now());
	state::write_state(exec, &host_state).await?;
	debug!(
		host = host.name,
		pending = host_state.pending_updates,
		security = host_state.security_updates,
		"update counts stored"
	);
	Ok(())
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum HostHealth {
	Online,
	Unhealthy,
	Offline,
}

async fn health_check_tick(deps: Arc<SchedulerDeps>) {
	let mut degraded: Vec<(String, HostHealth)> = Vec::new();
	for host in deps.inventory.list() {
		let health = health_check_host(&deps, host).await;
		if health != HostHealth::Online {
			degraded.push((host.name.clone(), health));
		}
	}
	if !degraded.is_empty() {
		let data: Vec<_> = degraded
			.iter()
			.map(|(host, health)| json!({ "host": host, "status": format!("{health:?}").to_lowercase() }))
			.collect();
		deps.webhooks.send("health", json!({ "hosts": data })).await;
	}
}

async fn health_check_host(deps: &SchedulerDeps, host: &Host) -> HostHealth {
	let client = match deps.provider.client(host).await {
		Ok(client) => client,
		Err(e) => {
			warn!(host = host.name, "offline: {e}");
			return HostHealth::Offline;
		}
	};
	let exec = client.as_ref();

	let health = match host.base {
		Base::Darwin => match exec.exec("echo ok").await {
			Ok(out) if out.success() => HostHealth::Online,
			_ => HostHealth::Unhealthy,
		},
		_ => match exec.exec("systemctl is-system-running").await {
			Ok(out) => match out.stdout_trimmed() {
				"running" => HostHealth::Online,
				_ => HostHealth::Unhealthy,
			},
			Err(_) => HostHealth::Offline,
		},
	};

	// Keep the reboot flag current while we're connected anyway.
	if health != HostHealth::Offline {
		if let Ok(needed) = nix::check_reboot_needed(exec, host.base).await {
			let update = async {
				let mut host_state = state::read_state(exec).await?;
				if host_state.reboot_required != needed {
					host_state.reboot_required = needed;
					state::write_state(exec, &host_state).await?;
					if needed {
						deps.webhooks
							.send_host_event("reboot", &host.name, json!({ "required": true }))
							.await;
					}
				}
				anyhow::Ok(())
			};
			if let Err(e) = update.await {
				warn!(host = host.name, "failed to store reboot flag: {e:#}");
			}
		}
	}
	health
}
