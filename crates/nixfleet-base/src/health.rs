use std::time::{Duration, Instant};

use nixfleet_shared::exec::{quote, ExecOutput, Executor};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCheckKind {
	/// `systemctl is-active <unit>` must print `active`.
	ServiceUnit,
	/// The launchd job must be listed with a numeric PID.
	LaunchdService,
	/// On-host curl must return the expected HTTP status.
	Http,
	/// `/dev/tcp/<host>/<port>` must open within the timeout.
	Tcp,
	/// Arbitrary command, exit 0.
	Command,
}

fn default_timeout() -> u64 {
	10
}
fn default_retries() -> u32 {
	1
}
fn default_retry_delay() -> u64 {
	2
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
	pub name: String,
	pub kind: HealthCheckKind,
	/// Unit name, launchd label, URL, `host:port`, or command line.
	pub target: String,
	#[serde(default)]
	pub expected_status: Option<u16>,
	#[serde(default = "default_timeout")]
	pub timeout_secs: u64,
	#[serde(default = "default_retries")]
	pub retries: u32,
	#[serde(default = "default_retry_delay")]
	pub retry_delay_secs: u64,
}

impl HealthCheckConfig {
	pub fn service_unit(name: impl Into<String>, unit: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			kind: HealthCheckKind::ServiceUnit,
			target: unit.into(),
			expected_status: None,
			timeout_secs: default_timeout(),
			retries: default_retries(),
			retry_delay_secs: default_retry_delay(),
		}
	}

	pub fn command(name: impl Into<String>, cmd: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			kind: HealthCheckKind::Command,
			target: cmd.into(),
			expected_status: None,
			timeout_secs: default_timeout(),
			retries: default_retries(),
			retry_delay_secs: default_retry_delay(),
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
	pub name: String,
	pub passed: bool,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<String>,
	pub latency_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthResults {
	pub passed: bool,
	pub checks: Vec<HealthCheckResult>,
}

impl HealthResults {
	pub fn summary(&self) -> String {
		let passed = self.checks.iter().filter(|c| c.passed).count();
		format!("{passed}/{} health checks passed", self.checks.len())
	}
}

struct Attempt {
	passed: bool,
	message: String,
	details: Option<String>,
}

/// Runs every configured check against the host, retrying each one up to
/// its configured attempt count before reporting failure.
pub async fn run_checks(exec: &dyn Executor, configs: &[HealthCheckConfig]) -> HealthResults {
	let mut results = HealthResults::default();
	for config in configs {
		results.checks.push(run_check(exec, config).await);
	}
	results.passed = results.checks.iter().all(|c| c.passed);
	debug!(host = exec.host_name(), "{}", results.summary());
	results
}

async fn run_check(exec: &dyn Executor, config: &HealthCheckConfig) -> HealthCheckResult {
	let started = Instant::now();
	let attempts = config.retries.max(1);
	let mut last = Attempt {
		passed: false,
		message: "not attempted".to_owned(),
		details: None,
	};
	for attempt in 1..=attempts {
		last = attempt_check(exec, config).await;
		if last.passed {
			break;
		}
		if attempt < attempts {
			sleep(Duration::from_secs(config.retry_delay_secs)).await;
		}
	}
	let message = if last.passed {
		last.message
	} else {
		format!("failed after {attempts} attempt(s): {}", last.message)
	};
	HealthCheckResult {
		name: config.name.clone(),
		passed: last.passed,
		message,
		details: last.details,
		latency_ms: started.elapsed().as_millis() as u64,
	}
}

fn transport_failure(e: impl std::fmt::Display) -> Attempt {
	Attempt {
		passed: false,
		message: format!("transport error: {e}"),
		details: None,
	}
}

async fn attempt_check(exec: &dyn Executor, config: &HealthCheckConfig) -> Attempt {
	match config.kind {
		HealthCheckKind::ServiceUnit => {
			let out = match exec
				.exec(&format!("systemctl is-active {}", quote(&config.target)))
				.await
			{
				Ok(out) => out,
				Err(e) => return transport_failure(e),
			};
			if out.stdout_trimmed() == "active" {
				return Attempt {
					passed: true,
					message: format!("unit {} is active", config.target),
					details: None,
				};
			}
			// Attach the status tail so a failing unit is diagnosable from
			// the report alone.
			let status = exec
				.exec(&format!(
					"systemctl status {} 2>&1 | tail -n 15",
					quote(&config.target)
				))
				.await
				.map(|o| o.stdout)
				.unwrap_or_default();
			Attempt {
				passed: false,
				message: format!("unit {} is {}", config.target, out.stdout_trimmed()),
				details: (!status.is_empty()).then_some(status),
			}
		}
		HealthCheckKind::LaunchdService => {
			let out = match exec
				.exec(&format!("launchctl list | grep {}", quote(&config.target)))
				.await
			{
				Ok(out) => out,
				Err(e) => return transport_failure(e),
			};
			let pid = out
				.stdout_trimmed()
				.split_whitespace()
				.next()
				.unwrap_or("-");
			if pid.chars().all(|c| c.is_ascii_digit()) && !pid.is_empty() {
				Attempt {
					passed: true,
					message: format!("{} running with pid {pid}", config.target),
					details: None,
				}
			} else {
				Attempt {
					passed: false,
					message: format!("{} is not running (pid column {pid:?})", config.target),
					details: None,
				}
			}
		}
		HealthCheckKind::Http => {
			let expected = config.expected_status.unwrap_or(200);
			let out = match exec
				.exec(&format!(
					"curl -s -o /dev/null -w '%{{http_code}}' --max-time {} {}",
					config.timeout_secs,
					quote(&config.target)
				))
				.await
			{
				Ok(out) => out,
				Err(e) => return transport_failure(e),
			};
			let code = out.stdout_trimmed();
			if out.success() && code == expected.to_string() {
				Attempt {
					passed: true,
					message: format!("{} returned {code}", config.target),
					details: None,
				}
			} else {
				Attempt {
					passed: false,
					message: format!("{} returned {code:?}, expected {expected}", config.target),
					details: None,
				}
			}
		}
		HealthCheckKind::Tcp => {
			let Some((host, port)) = config.target.rsplit_once(':') else {
				return Attempt {
					passed: false,
					message: format!("tcp target {:?} is not host:port", config.target),
					details: None,
				};
			};
			let out = match exec
				.exec(&format!(
					"timeout {} bash -c {}",
					config.timeout_secs,
					quote(&format!("cat < /dev/null > /dev/tcp/{host}/{port}"))
				))
				.await
			{
				Ok(out) => out,
				Err(e) => return transport_failure(e),
			};
			Attempt {
				passed: out.success(),
				message: if out.success() {
					format!("tcp {}:{port} accepting connections", host)
				} else {
					format!("tcp {}:{port} connect failed", host)
				},
				details: None,
			}
		}
		HealthCheckKind::Command => {
			let out: ExecOutput = match exec.exec(&config.target).await {
				Ok(out) => out,
				Err(e) => return transport_failure(e),
			};
			Attempt {
				passed: out.success(),
				message: if out.success() {
					"command succeeded".to_owned()
				} else {
					format!("command exited {}", out.exit_code)
				},
				details: (!out.stderr.is_empty()).then(|| out.stderr.clone()),
			}
		}
	}
}
