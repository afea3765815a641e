use std::{future::Future, sync::Arc};

use anyhow::anyhow;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::inventory::Host;

pub const DEFAULT_PARALLEL: usize = 5;

#[derive(Debug)]
pub struct TaskResult<T> {
	pub host: String,
	pub outcome: anyhow::Result<T>,
}

/// Runs `f` over every host with at most `max_parallel` in flight. The
/// result order mirrors the input order. Cancelling the token aborts hosts
/// still waiting for a slot (they yield a cancellation error); work that
/// already started runs to completion.
pub async fn run_bounded<T, F, Fut>(
	hosts: &[Host],
	max_parallel: usize,
	cancel: &CancellationToken,
	f: F,
) -> Vec<TaskResult<T>>
where
	F: Fn(Host) -> Fut,
	Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
	T: Send + 'static,
{
	let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
	let mut handles = Vec::with_capacity(hosts.len());
	for host in hosts {
		let semaphore = semaphore.clone();
		let cancel = cancel.clone();
		let fut = f(host.clone());
		handles.push((
			host.name.clone(),
			tokio::spawn(async move {
				let _permit = tokio::select! {
					biased;
					_ = cancel.cancelled() => return Err(anyhow!("cancelled before start")),
					permit = semaphore.acquire_owned() => permit.expect("semaphore is never closed"),
				};
				fut.await
			}),
		));
	}

	let mut results = Vec::with_capacity(handles.len());
	for (host, handle) in handles {
		let outcome = match handle.await {
			Ok(outcome) => outcome,
			Err(e) => Err(anyhow!("host task panicked: {e}")),
		};
		results.push(TaskResult { host, outcome });
	}
	results
}

pub fn count_success<T>(results: &[TaskResult<T>]) -> usize {
	results.iter().filter(|r| r.outcome.is_ok()).count()
}

pub fn count_errors<T>(results: &[TaskResult<T>]) -> usize {
	results.len() - count_success(results)
}

pub fn filter_failed<T>(results: &[TaskResult<T>]) -> Vec<&TaskResult<T>> {
	results.iter().filter(|r| r.outcome.is_err()).collect()
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicUsize, Ordering},
		time::Duration,
	};

	use tokio::time::sleep;

	use super::*;
	use crate::inventory::Base;

	fn hosts(n: usize) -> Vec<Host> {
		(0..n)
			.map(|i| Host {
				name: format!("host{i}"),
				addr: format!("10.0.0.{i}"),
				port: 22,
				ssh_user: "deploy".to_owned(),
				base: Base::Nixos,
				roles: vec![],
				tags: vec![],
				health_checks: vec![],
				certs: vec![],
			})
			.collect()
	}

	#[tokio::test]
	async fn results_mirror_input_order() {
		let hosts = hosts(4);
		let cancel = CancellationToken::new();
		let results = run_bounded(&hosts, 2, &cancel, |host| async move {
			// Later hosts finish first; order must still match the input.
			if host.name == "host0" {
				sleep(Duration::from_millis(50)).await;
			}
			Ok(host.name)
		})
		.await;
		let names: Vec<_> = results.iter().map(|r| r.host.as_str()).collect();
		assert_eq!(names, ["host0", "host1", "host2", "host3"]);
		assert_eq!(count_success(&results), 4);
		assert_eq!(count_errors(&results), 0);
	}

	#[tokio::test]
	async fn concurrency_is_bounded() {
		let hosts = hosts(8);
		let cancel = CancellationToken::new();
		let running = Arc::new(AtomicUsize::new(0));
		let peak = Arc::new(AtomicUsize::new(0));
		let results = run_bounded(&hosts, 3, &cancel, |_| {
			let running = running.clone();
			let peak = peak.clone();
			async move {
				let now = running.fetch_add(1, Ordering::SeqCst) + 1;
				peak.fetch_max(now, Ordering::SeqCst);
				sleep(Duration::from_millis(20)).await;
				running.fetch_sub(1, Ordering::SeqCst);
				Ok(())
			}
		})
		.await;
		assert_eq!(count_success(&results), 8);
		assert!(peak.load(Ordering::SeqCst) <= 3, "semaphore bound violated");
	}

	#[tokio::test]
	async fn cancellation_aborts_pending_hosts() {
		let hosts = hosts(4);
		let cancel = CancellationToken::new();
		cancel.cancel();
		let results = run_bounded(&hosts, 1, &cancel, |_| async move {
			sleep(Duration::from_millis(10)).await;
			Ok(())
		})
		.await;
		assert_eq!(count_errors(&results), 4);
		let failed = filter_failed(&results);
		assert!(failed[0]
			.outcome
			.as_ref()
			.unwrap_err()
			.to_string()
			.contains("cancelled"));
	}
}
