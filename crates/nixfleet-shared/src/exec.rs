use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

/// Result of one remote command. A non-zero exit code is data at this layer,
/// not an error; only transport failures surface as [`ExecError`].
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
	pub stdout: String,
	pub stderr: String,
	pub exit_code: i32,
}

impl ExecOutput {
	pub fn success(&self) -> bool {
		self.exit_code == 0
	}

	pub fn ok(stdout: impl Into<String>) -> Self {
		Self {
			stdout: stdout.into(),
			stderr: String::new(),
			exit_code: 0,
		}
	}

	pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
		Self {
			stdout: String::new(),
			stderr: stderr.into(),
			exit_code,
		}
	}

	/// Stdout with the trailing newline removed, the common shape for
	/// single-value commands (`readlink`, `stat`, `sha256sum`).
	pub fn stdout_trimmed(&self) -> &str {
		self.stdout.trim_end_matches('\n')
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
	/// The SSH session itself failed: network, auth, closed channel.
	#[error("transport error on {host}: {message}")]
	Transport { host: String, message: String },
	/// `sudo -n` refused to run without a password.
	#[error("host {host} does not grant passwordless escalation")]
	EscalationDenied { host: String },
}

/// Remote command execution contract. Every component above the SSH pool
/// talks through this trait, which is what makes the mock drop-in.
#[async_trait]
pub trait Executor: Send + Sync {
	fn host_name(&self) -> &str;
	async fn exec(&self, cmd: &str) -> Result<ExecOutput, ExecError>;
	/// Runs `cmd` under non-interactive privilege escalation.
	async fn exec_sudo(&self, cmd: &str) -> Result<ExecOutput, ExecError>;
}

/// Shell-quotes a string for safe interpolation into an `sh -c` payload.
pub fn quote(input: &str) -> String {
	const SAFE: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-./=:,@%+";
	if !input.is_empty() && input.chars().all(|c| SAFE.contains(c)) {
		return input.to_owned();
	}
	let mut out = String::with_capacity(input.len() + 2);
	out.push('\'');
	for (i, part) in input.split('\'').enumerate() {
		if i != 0 {
			out.push_str("'\"'\"'");
		}
		out.push_str(part);
	}
	out.push('\'');
	out
}

/// Convenience helpers layered over [`Executor`]. These interpret exit codes,
/// so they return `anyhow::Result` rather than raw outputs.
#[async_trait]
pub trait ExecutorExt: Executor {
	async fn file_exists(&self, path: &str) -> Result<bool> {
		let out = self
			.exec(&format!("test -e {} && echo true || echo false", quote(path)))
			.await?;
		Ok(out.stdout_trimmed() == "true")
	}

	async fn read_file_text(&self, path: &str, sudo: bool) -> Result<String> {
		let cmd = format!("cat {}", quote(path));
		let out = if sudo {
			self.exec_sudo(&cmd).await?
		} else {
			self.exec(&cmd).await?
		};
		if !out.success() {
			return Err(anyhow!(
				"failed to read {path} on {}: {}",
				self.host_name(),
				out.stderr.trim()
			));
		}
		Ok(out.stdout)
	}

	/// Writes `content` atomically (tempfile + `mv -f`) with the given octal
	/// mode string, escalating for root-owned destinations.
	async fn write_file(&self, path: &str, content: &str, mode: &str) -> Result<()> {
		let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("/");
		let script = format!(
			"set -e; mkdir -p {dir}; tmp=$(mktemp {dir}/.nixfleet.XXXXXX); \
			 printf '%s' {content} > \"$tmp\"; chmod {mode} \"$tmp\"; mv -f \"$tmp\" {path}",
			dir = quote(if dir.is_empty() { "/" } else { dir }),
			content = quote(content),
			mode = quote(mode),
			path = quote(path),
		);
		let out = self.exec_sudo(&format!("sh -c {}", quote(&script))).await?;
		if !out.success() {
			return Err(anyhow!(
				"failed to write {path} on {}: {}",
				self.host_name(),
				out.stderr.trim()
			));
		}
		Ok(())
	}

	async fn mkdir_p(&self, path: &str) -> Result<()> {
		let out = self.exec_sudo(&format!("mkdir -p {}", quote(path))).await?;
		if !out.success() {
			return Err(anyhow!("mkdir -p {path} failed: {}", out.stderr.trim()));
		}
		Ok(())
	}

	async fn rm_file(&self, path: &str) -> Result<()> {
		let out = self.exec_sudo(&format!("rm -f {}", quote(path))).await?;
		if !out.success() {
			return Err(anyhow!("rm -f {path} failed: {}", out.stderr.trim()));
		}
		Ok(())
	}

	async fn systemctl(&self, action: &str, unit: &str) -> Result<ExecOutput> {
		Ok(self
			.exec_sudo(&format!("systemctl {action} {}", quote(unit)))
			.await?)
	}
}

impl<T: Executor + ?Sized> ExecutorExt for T {}

enum Matcher {
	Exact(String),
	Prefix(String),
}

struct MockRule {
	matcher: Matcher,
	result: ExecOutput,
}

/// In-memory [`Executor`] for tests: records every executed command, matches
/// registered rules on exact string or prefix, and can fail the whole host
/// with a transport error. Unmatched commands succeed with empty output so
/// tests only script the commands they assert on.
///
/// `exec_sudo` commands are recorded and matched with a `sudo ` prefix.
pub struct MockExecutor {
	host: String,
	rules: Mutex<Vec<MockRule>>,
	commands: Mutex<Vec<String>>,
	fail: Mutex<Option<String>>,
}

impl MockExecutor {
	pub fn new(host: impl Into<String>) -> Self {
		Self {
			host: host.into(),
			rules: Mutex::new(Vec::new()),
			commands: Mutex::new(Vec::new()),
			fail: Mutex::new(None),
		}
	}

	pub fn on_exact(&self, cmd: impl Into<String>, result: ExecOutput) -> &Self {
		self.rules.lock().unwrap().push(MockRule {
			matcher: Matcher::Exact(cmd.into()),
			result,
		});
		self
	}

	pub fn on_prefix(&self, prefix: impl Into<String>, result: ExecOutput) -> &Self {
		self.rules.lock().unwrap().push(MockRule {
			matcher: Matcher::Prefix(prefix.into()),
			result,
		});
		self
	}

	/// Every subsequent exec on this host yields a transport error.
	pub fn fail_with(&self, message: impl Into<String>) {
		*self.fail.lock().unwrap() = Some(message.into());
	}

	pub fn commands(&self) -> Vec<String> {
		self.commands.lock().unwrap().clone()
	}

	pub fn ran(&self, needle: &str) -> bool {
		self.commands
			.lock()
			.unwrap()
			.iter()
			.any(|c| c.contains(needle))
	}

	fn dispatch(&self, cmd: String) -> Result<ExecOutput, ExecError> {
		if let Some(message) = self.fail.lock().unwrap().clone() {
			return Err(ExecError::Transport {
				host: self.host.clone(),
				message,
			});
		}
		self.commands.lock().unwrap().push(cmd.clone());
		let rules = self.rules.lock().unwrap();
		for rule in rules.iter() {
			let hit = match &rule.matcher {
				Matcher::Exact(m) => *m == cmd,
				Matcher::Prefix(p) => cmd.starts_with(p.as_str()),
			};
			if hit {
				return Ok(rule.result.clone());
			}
		}
		Ok(ExecOutput::ok(""))
	}
}

#[async_trait]
impl Executor for MockExecutor {
	fn host_name(&self) -> &str {
		&self.host
	}

	async fn exec(&self, cmd: &str) -> Result<ExecOutput, ExecError> {
		self.dispatch(cmd.to_owned())
	}

	async fn exec_sudo(&self, cmd: &str) -> Result<ExecOutput, ExecError> {
		self.dispatch(format!("sudo {cmd}"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn quote_passes_safe_strings_through() {
		assert_eq!(quote("/var/lib/nixfleet/state.json"), "/var/lib/nixfleet/state.json");
		assert_eq!(quote("a b"), "'a b'");
		assert_eq!(quote("it's"), "'it'\"'\"'s'");
		assert_eq!(quote(""), "''");
	}

	#[tokio::test]
	async fn mock_matches_exact_then_prefix() {
		let mock = MockExecutor::new("web1");
		mock.on_exact("uptime", ExecOutput::ok("up"));
		mock.on_prefix("systemctl is-active", ExecOutput::ok("active\n"));

		assert_eq!(mock.exec("uptime").await.unwrap().stdout, "up");
		let out = mock.exec("systemctl is-active nginx").await.unwrap();
		assert_eq!(out.stdout_trimmed(), "active");
		// Unregistered commands succeed with empty output.
		assert!(mock.exec("true").await.unwrap().success());
		assert!(mock.ran("nginx"));
	}

	#[tokio::test]
	async fn mock_sudo_commands_carry_prefix() {
		let mock = MockExecutor::new("web1");
		mock.on_prefix("sudo mkdir -p", ExecOutput::ok(""));
		mock.exec_sudo("mkdir -p /var/lib/nixfleet").await.unwrap();
		assert_eq!(mock.commands(), vec!["sudo mkdir -p /var/lib/nixfleet"]);
	}

	#[tokio::test]
	async fn mock_failure_is_transport_error() {
		let mock = MockExecutor::new("db1");
		mock.fail_with("connection refused");
		let err = mock.exec("uptime").await.unwrap_err();
		assert!(matches!(err, ExecError::Transport { .. }));
		assert!(err.to_string().contains("db1"));
	}
}
