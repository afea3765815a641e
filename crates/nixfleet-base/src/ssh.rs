use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use async_trait::async_trait;
use nixfleet_shared::exec::{quote, ExecError, ExecOutput, Executor};
use openssh::{KnownHosts, SessionBuilder};
use tokio::{sync::RwLock, task::JoinHandle, time::sleep};
use tracing::{debug, warn};

use crate::inventory::Host;

/// A live SSH connection to one host. Non-zero exit codes are data here;
/// only transport failures become errors.
pub struct SshClient {
	name: String,
	session: openssh::Session,
}

impl SshClient {
	pub async fn connect(host: &Host, connect_timeout: Duration) -> Result<Self, ExecError> {
		let mut builder = SessionBuilder::default();
		builder
			.user(host.ssh_user.clone())
			.port(host.port)
			.connect_timeout(connect_timeout)
			.known_hosts_check(KnownHosts::Accept);
		let session = builder.connect(&host.addr).await.map_err(|e| {
			ExecError::Transport {
				host: host.name.clone(),
				message: format!("ssh connect to {} failed: {e}", host.addr),
			}
		})?;
		debug!(host = host.name, addr = host.addr, "ssh session established");
		Ok(Self {
			name: host.name.clone(),
			session,
		})
	}

	/// The cached session is usable: the master connection still answers.
	pub async fn is_alive(&self) -> bool {
		self.session.check().await.is_ok()
	}
}

pub(crate) fn escalation_denied(out: &ExecOutput) -> bool {
	if out.success() {
		return false;
	}
	let stderr = out.stderr.to_lowercase();
	stderr.contains("a password is required")
		|| stderr.contains("a terminal is required")
		|| stderr.contains("sudo: no tty present")
}

#[async_trait]
impl Executor for SshClient {
	fn host_name(&self) -> &str {
		&self.name
	}

	async fn exec(&self, cmd: &str) -> Result<ExecOutput, ExecError> {
		let out = self
			.session
			.shell(cmd)
			.output()
			.await
			.map_err(|e| ExecError::Transport {
				host: self.name.clone(),
				message: e.to_string(),
			})?;
		Ok(ExecOutput {
			stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
			stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
			exit_code: out.status.code().unwrap_or(-1),
		})
	}

	async fn exec_sudo(&self, cmd: &str) -> Result<ExecOutput, ExecError> {
		let out = self.exec(&format!("sudo -n sh -c {}", quote(cmd))).await?;
		if escalation_denied(&out) {
			return Err(ExecError::EscalationDenied {
				host: self.name.clone(),
			});
		}
		Ok(out)
	}
}

/// Hands out live executors for hosts. The pipeline and scheduler depend on
/// this seam, which is what lets tests substitute mock executors.
#[async_trait]
pub trait ClientProvider: Send + Sync {
	async fn client(&self, host: &Host) -> Result<Arc<dyn Executor>, ExecError>;
}

#[derive(Clone, Debug)]
pub struct SshPoolConfig {
	pub max_idle: Duration,
	pub connect_timeout: Duration,
	pub sweep_interval: Duration,
}

impl Default for SshPoolConfig {
	fn default() -> Self {
		Self {
			max_idle: Duration::from_secs(300),
			connect_timeout: Duration::from_secs(30),
			sweep_interval: Duration::from_secs(60),
		}
	}
}

struct PoolEntry {
	client: Arc<SshClient>,
	last_used: Mutex<Instant>,
}

type PoolMap = Arc<RwLock<HashMap<String, PoolEntry>>>;

/// Connection pool keyed by `user@host:port`. Repeated `get` for the same
/// key returns the same live client; a background sweeper drops clients
/// idle longer than `max_idle`.
pub struct SshPool {
	clients: PoolMap,
	cfg: SshPoolConfig,
	sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SshPool {
	pub fn new(cfg: SshPoolConfig) -> Self {
		let clients: PoolMap = Arc::new(RwLock::new(HashMap::new()));
		let sweeper = {
			let clients = clients.clone();
			let max_idle = cfg.max_idle;
			let interval = cfg.sweep_interval;
			tokio::spawn(async move {
				loop {
					sleep(interval).await;
					let now = Instant::now();
					let mut map = clients.write().await;
					let before = map.len();
					map.retain(|_, entry| {
						now.duration_since(*entry.last_used.lock().unwrap()) < max_idle
					});
					let evicted = before - map.len();
					if evicted > 0 {
						debug!(evicted, "evicted idle ssh clients");
					}
				}
			})
		};
		Self {
			clients,
			cfg,
			sweeper: Mutex::new(Some(sweeper)),
		}
	}

	fn key(host: &Host) -> String {
		format!("{}@{}:{}", host.ssh_user, host.addr, host.port)
	}

	pub async fn get(&self, host: &Host) -> Result<Arc<SshClient>, ExecError> {
		let key = Self::key(host);
		let cached = {
			let map = self.clients.read().await;
			map.get(&key).map(|entry| {
				*entry.last_used.lock().unwrap() = Instant::now();
				entry.client.clone()
			})
		};
		if let Some(client) = cached {
			if client.is_alive().await {
				return Ok(client);
			}
			// Broken clients are never handed out: evict and redial.
			warn!(host = host.name, "cached ssh session failed check, redialing");
			self.clients.write().await.remove(&key);
		}

		let client = Arc::new(SshClient::connect(host, self.cfg.connect_timeout).await?);
		self.clients.write().await.insert(
			key,
			PoolEntry {
				client: client.clone(),
				last_used: Mutex::new(Instant::now()),
			},
		);
		Ok(client)
	}

	/// Drops every pooled client and stops the sweeper.
	pub async fn close(&self) {
		if let Some(handle) = self.sweeper.lock().unwrap().take() {
			handle.abort();
		}
		self.clients.write().await.clear();
	}
}

#[async_trait]
impl ClientProvider for SshPool {
	async fn client(&self, host: &Host) -> Result<Arc<dyn Executor>, ExecError> {
		Ok(self.get(host).await? as Arc<dyn Executor>)
	}
}
