use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use nixfleet_base::{
	deploy::ApplyOptions,
	nix::NixBuilder,
	ssh::{SshPool, SshPoolConfig},
};
use serde::Deserialize;
use tracing::info;

use crate::{
	api::{self, AppState},
	jobs::JobRegistry,
	scheduler::{Scheduler, SchedulerConfig, SchedulerDeps},
	webhook::{WebhookConfig, WebhookNotifier},
	CommonOpts,
};

/// File-based server configuration; command-line flags override it.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ServerConfig {
	listen: Option<String>,
	auth_token: Option<String>,
	webhook: WebhookConfig,
	scheduler: SchedulerConfig,
}

#[derive(Parser)]
pub struct Serve {
	/// JSON config file for the server
	#[clap(long)]
	config: Option<PathBuf>,
	#[clap(long, default_value = "127.0.0.1:8320")]
	listen: String,
	/// Static bearer token; auth is disabled when unset
	#[clap(long, env = "NIXFLEET_API_TOKEN")]
	token: Option<String>,
	#[clap(long)]
	webhook_url: Option<String>,
	#[clap(long, env = "NIXFLEET_WEBHOOK_SECRET")]
	webhook_secret: Option<String>,
	/// Periodic drift-check interval in seconds
	#[clap(long)]
	drift_check_secs: Option<u64>,
	/// Periodic apt update-check interval in seconds
	#[clap(long)]
	update_check_secs: Option<u64>,
	/// Periodic host health-check interval in seconds
	#[clap(long)]
	health_check_secs: Option<u64>,
	/// Enable the PKI store for apply jobs
	#[clap(long)]
	with_pki: bool,
}

impl Serve {
	pub async fn run(self, common: &CommonOpts) -> Result<()> {
		let mut config = match &self.config {
			Some(path) => {
				let text = std::fs::read_to_string(path)
					.with_context(|| format!("failed to read server config {path:?}"))?;
				serde_json::from_str::<ServerConfig>(&text)
					.with_context(|| format!("failed to parse {path:?}"))?
			}
			None => ServerConfig::default(),
		};
		if self.webhook_url.is_some() {
			config.webhook.url = self.webhook_url.clone();
		}
		if self.webhook_secret.is_some() {
			config.webhook.secret = self.webhook_secret.clone();
		}
		if self.token.is_some() {
			config.auth_token = self.token.clone();
		}
		config.scheduler.drift_check_secs =
			self.drift_check_secs.or(config.scheduler.drift_check_secs);
		config.scheduler.update_check_secs =
			self.update_check_secs.or(config.scheduler.update_check_secs);
		config.scheduler.health_check_secs =
			self.health_check_secs.or(config.scheduler.health_check_secs);
		let listen = config.listen.clone().unwrap_or(self.listen.clone());

		let inventory = common.load_inventory()?;
		let pool = Arc::new(SshPool::new(SshPoolConfig::default()));
		let builder = Arc::new(NixBuilder::new(common.flake.clone()));
		let pki = self.with_pki.then(|| Arc::new(common.pki_store()));
		let webhooks = Arc::new(WebhookNotifier::new(config.webhook.clone()));

		let state = Arc::new(AppState {
			inventory: inventory.clone(),
			provider: pool.clone(),
			builder,
			pki,
			jobs: JobRegistry::default(),
			webhooks: webhooks.clone(),
			auth_token: config.auth_token.clone(),
			started: Utc::now(),
			apply_opts: ApplyOptions::default(),
		});

		// The scheduler only sees the narrow dependencies it needs, never
		// the server state itself.
		let scheduler = Scheduler::start(
			&config.scheduler,
			Arc::new(SchedulerDeps {
				inventory,
				provider: pool.clone(),
				webhooks,
			}),
		);

		let listener = tokio::net::TcpListener::bind(&listen)
			.await
			.with_context(|| format!("failed to bind {listen}"))?;
		info!(
			listen,
			auth = config.auth_token.is_some(),
			"nixfleet API listening"
		);
		axum::serve(listener, api::router(state))
			.with_graceful_shutdown(async {
				let _ = tokio::signal::ctrl_c().await;
				info!("shutting down");
			})
			.await
			.context("http server failed")?;

		scheduler.stop().await;
		pool.close().await;
		Ok(())
	}
}
