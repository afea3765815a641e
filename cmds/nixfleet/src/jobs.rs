use std::{
	collections::HashMap,
	future::Future,
	sync::{Arc, RwLock},
	time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
	Pending,
	Running,
	Completed,
	Failed,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Job {
	pub id: String,
	#[serde(rename = "type")]
	pub job_type: String,
	pub status: JobStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub host: Option<String>,
	pub start_time: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub end_time: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// In-process job registry. Jobs are never deleted; a restart clears them,
/// which is acceptable for this API.
#[derive(Clone, Default)]
pub struct JobRegistry {
	jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl JobRegistry {
	/// Time-ordered id, unique within a run.
	fn next_id(job_type: &str) -> String {
		let nanos = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.expect("clock before unix epoch")
			.as_nanos();
		format!("{job_type}-{nanos}")
	}

	pub fn create(&self, job_type: &str, host: Option<String>) -> Job {
		let job = Job {
			id: Self::next_id(job_type),
			job_type: job_type.to_owned(),
			status: JobStatus::Pending,
			host,
			start_time: Utc::now(),
			end_time: None,
			result: None,
			error: None,
		};
		self.jobs
			.write()
			.unwrap()
			.insert(job.id.clone(), job.clone());
		job
	}

	fn update(&self, id: &str, f: impl FnOnce(&mut Job)) {
		if let Some(job) = self.jobs.write().unwrap().get_mut(id) {
			f(job);
		}
	}

	pub fn get(&self, id: &str) -> Option<Job> {
		self.jobs.read().unwrap().get(id).cloned()
	}

	pub fn list(&self) -> Vec<Job> {
		let mut jobs: Vec<Job> = self.jobs.read().unwrap().values().cloned().collect();
		jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
		jobs
	}

	/// Runs the job body on a background task, moving the job through
	/// pending → running → completed/failed.
	pub fn spawn<F>(&self, job: &Job, fut: F)
	where
		F: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
	{
		let registry = self.clone();
		let id = job.id.clone();
		tokio::spawn(async move {
			registry.update(&id, |job| job.status = JobStatus::Running);
			match fut.await {
				Ok(result) => registry.update(&id, |job| {
					job.status = JobStatus::Completed;
					job.end_time = Some(Utc::now());
					job.result = Some(result);
				}),
				Err(e) => {
					error!("job {id} failed: {e:#}");
					registry.update(&id, |job| {
						job.status = JobStatus::Failed;
						job.end_time = Some(Utc::now());
						job.error = Some(format!("{e:#}"));
					});
				}
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn job_lifecycle() {
		let registry = JobRegistry::default();
		let job = registry.create("apply", Some("web1".to_owned()));
		assert_eq!(job.status, JobStatus::Pending);
		assert!(job.id.starts_with("apply-"));

		registry.spawn(&job, async { Ok(serde_json::json!({"ok": true})) });
		// The background task finishes quickly; poll for completion.
		for _ in 0..100 {
			if registry.get(&job.id).unwrap().status == JobStatus::Completed {
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		}
		let done = registry.get(&job.id).unwrap();
		assert_eq!(done.status, JobStatus::Completed);
		assert!(done.end_time.is_some());
		assert_eq!(done.result.unwrap()["ok"], true);
	}

	#[tokio::test]
	async fn failed_job_records_error() {
		let registry = JobRegistry::default();
		let job = registry.create("drift-check", None);
		registry.spawn(&job, async { Err(anyhow::anyhow!("boom")) });
		for _ in 0..100 {
			if registry.get(&job.id).unwrap().status == JobStatus::Failed {
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		}
		let failed = registry.get(&job.id).unwrap();
		assert_eq!(failed.status, JobStatus::Failed);
		assert!(failed.error.unwrap().contains("boom"));
	}

	#[test]
	fn ids_are_unique_and_listing_is_recent_first() {
		let registry = JobRegistry::default();
		let a = registry.create("apply", None);
		let b = registry.create("apply", None);
		assert_ne!(a.id, b.id);
		assert_eq!(registry.list().len(), 2);
	}
}
