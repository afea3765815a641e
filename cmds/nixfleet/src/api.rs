use std::sync::Arc;

use axum::{
	extract::{Path, Query, Request, State},
	http::{header, StatusCode},
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use chrono::{DateTime, Utc};
use nixfleet_base::{
	deploy::{ApplyOptions, Pipeline},
	inventory::Host,
	nix::{self, Builder},
	ssh::ClientProvider,
	state, Inventory,
};
use nixfleet_pki::PkiStore;
use nixfleet_shared::exec::ExecError;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{jobs::JobRegistry, webhook::WebhookNotifier};

pub struct AppState {
	pub inventory: Inventory,
	pub provider: Arc<dyn ClientProvider>,
	pub builder: Arc<dyn Builder>,
	pub pki: Option<Arc<PkiStore>>,
	pub jobs: JobRegistry,
	pub webhooks: Arc<WebhookNotifier>,
	pub auth_token: Option<String>,
	pub started: DateTime<Utc>,
	pub apply_opts: ApplyOptions,
}

pub struct ApiError {
	status: StatusCode,
	message: String,
}

impl ApiError {
	fn new(status: StatusCode, message: impl Into<String>) -> Self {
		Self {
			status,
			message: message.into(),
		}
	}

	fn not_found(what: impl std::fmt::Display) -> Self {
		Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
	}

	fn bad_request(message: impl Into<String>) -> Self {
		Self::new(StatusCode::BAD_REQUEST, message)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		(self.status, Json(json!({ "error": self.message }))).into_response()
	}
}

impl From<anyhow::Error> for ApiError {
	fn from(e: anyhow::Error) -> Self {
		Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
	}
}

/// SSH connection failures surface as 503, everything transport-adjacent
/// stays out of the 5xx-with-stack-trace territory.
impl From<ExecError> for ApiError {
	fn from(e: ExecError) -> Self {
		Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
	}
}

pub(crate) fn authorized(required: &Option<String>, header_value: Option<&str>) -> bool {
	match required {
		None => true,
		Some(token) => header_value == Some(format!("Bearer {token}").as_str()),
	}
}

async fn auth(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
	let header_value = request
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok());
	if !authorized(&state.auth_token, header_value) {
		return ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized").into_response();
	}
	next.run(request).await
}

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/api/health", get(api_health))
		.route("/api/info", get(api_info))
		.route("/api/hosts", get(list_hosts))
		.route("/api/hosts/{name}", get(host_snapshot))
		.route("/api/hosts/{name}/state", get(host_state))
		.route("/api/hosts/{name}/apply", post(apply_one))
		.route("/api/hosts/{name}/rollback", post(rollback_one))
		.route("/api/drift", get(drift_summary))
		.route("/api/drift/check", post(drift_check))
		.route("/api/drift/fix", post(drift_fix))
		.route("/api/jobs", get(list_jobs))
		.route("/api/jobs/{id}", get(get_job))
		.route("/api/plan", get(plan_all))
		.route("/api/plan/{host}", get(plan_one))
		.route("/api/apply", post(apply_fleet))
		.layer(middleware::from_fn_with_state(state.clone(), auth))
		.with_state(state)
}

async fn api_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
	Json(json!({
		"status": "ok",
		"uptimeSecs": (Utc::now() - state.started).num_seconds(),
	}))
}

async fn api_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
	Json(json!({
		"version": env!("CARGO_PKG_VERSION"),
		"startTime": state.started,
		"hostCount": state.inventory.list().len(),
	}))
}

async fn list_hosts(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
	Json(json!(state.inventory.list()))
}

fn lookup(state: &AppState, name: &str) -> Result<Host, ApiError> {
	state
		.inventory
		.get(name)
		.cloned()
		.ok_or_else(|| ApiError::not_found(format!("host {name}")))
}

async fn host_snapshot(
	State(state): State<Arc<AppState>>,
	Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let host = lookup(&state, &name)?;
	let client = state.provider.client(&host).await?;
	let generation = nix::get_current_generation(client.as_ref()).await?;
	let reboot_required = nix::check_reboot_needed(client.as_ref(), host.base)
		.await
		.unwrap_or(false);
	Ok(Json(json!({
		"host": host,
		"generation": generation,
		"rebootRequired": reboot_required,
	})))
}

async fn host_state(
	State(state): State<Arc<AppState>>,
	Path(name): Path<String>,
) -> Result<Json<nixfleet_shared::HostState>, ApiError> {
	let host = lookup(&state, &name)?;
	let client = state.provider.client(&host).await?;
	Ok(Json(state::read_state(client.as_ref()).await?))
}

fn spawn_apply(state: &Arc<AppState>, hosts: Vec<Host>, label: Option<String>) -> crate::jobs::Job {
	let job = state.jobs.create("apply", label);
	let app = state.clone();
	state.jobs.spawn(&job, async move {
		let pipeline = Pipeline::new(
			app.provider.clone(),
			app.builder.clone(),
			app.pki.clone(),
			app.apply_opts.clone(),
		);
		let results = pipeline.apply(&hosts, &CancellationToken::new()).await;
		app.webhooks
			.send(
				"apply",
				json!({
					"summary": results.summary(),
					"successCount": results.success_count,
					"failureCount": results.failure_count,
				}),
			)
			.await;
		if results.failure_count > 0 {
			anyhow::bail!(
				"apply failed on {}/{} hosts: {}",
				results.failure_count,
				results.hosts.len(),
				serde_json::to_string(&results)?
			);
		}
		Ok(serde_json::to_value(&results)?)
	});
	job
}

async fn apply_one(
	State(state): State<Arc<AppState>>,
	Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let host = lookup(&state, &name)?;
	info!(host = name, "apply job requested");
	let job = spawn_apply(&state, vec![host], Some(name));
	Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(serde::Deserialize)]
struct ApplyParams {
	group: Option<String>,
}

async fn apply_fleet(
	State(state): State<Arc<AppState>>,
	Query(params): Query<ApplyParams>,
) -> Result<impl IntoResponse, ApiError> {
	let hosts: Vec<Host> = match &params.group {
		Some(group) => state.inventory.group(group).into_iter().cloned().collect(),
		None => state.inventory.list().to_vec(),
	};
	if hosts.is_empty() {
		return Err(ApiError::bad_request("no hosts selected"));
	}
	info!(count = hosts.len(), "fleet apply job requested");
	let job = spawn_apply(&state, hosts, params.group.clone());
	Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(serde::Deserialize)]
struct RollbackParams {
	generation: Option<String>,
}

async fn rollback_one(
	State(state): State<Arc<AppState>>,
	Path(name): Path<String>,
	Query(params): Query<RollbackParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let host = lookup(&state, &name)?;
	let target = match params.generation.as_deref() {
		None | Some("previous") => None,
		Some(number) => Some(number.parse::<u64>().map_err(|_| {
			ApiError::bad_request("generation must be a number or \"previous\"")
		})?),
	};
	let client = state.provider.client(&host).await?;
	nix::rollback(client.as_ref(), host.base, target).await?;
	let generation = nix::get_current_generation(client.as_ref()).await?;
	state
		.webhooks
		.send_host_event("apply", &name, json!({ "rollback": true, "generation": generation }))
		.await;
	Ok(Json(json!({ "host": name, "generation": generation })))
}

async fn drift_summary(
	State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let mut summary = Vec::new();
	for host in state.inventory.list() {
		let entry = match state.provider.client(host).await {
			Ok(client) => match state::read_state(client.as_ref()).await {
				Ok(host_state) => json!({
					"host": host.name,
					"driftDetected": host_state.drift_detected,
					"driftFiles": host_state.drift_files,
					"lastDriftCheck": host_state.last_drift_check,
				}),
				Err(e) => json!({ "host": host.name, "error": format!("{e:#}") }),
			},
			Err(e) => json!({ "host": host.name, "error": e.to_string() }),
		};
		summary.push(entry);
	}
	Ok(Json(json!(summary)))
}

#[derive(serde::Deserialize)]
struct DriftParams {
	host: Option<String>,
	group: Option<String>,
}

async fn drift_check(
	State(state): State<Arc<AppState>>,
	Query(params): Query<DriftParams>,
) -> Result<impl IntoResponse, ApiError> {
	let hosts: Vec<Host> = match (&params.host, &params.group) {
		(Some(name), _) => vec![lookup(&state, name)?],
		(None, Some(group)) => state.inventory.group(group).into_iter().cloned().collect(),
		(None, None) => state.inventory.list().to_vec(),
	};
	if hosts.is_empty() {
		return Err(ApiError::bad_request("no hosts selected"));
	}
	let job = state.jobs.create("drift-check", params.host.clone());
	let app = state.clone();
	state.jobs.spawn(&job, async move {
		let mut drifted = Vec::new();
		for host in &hosts {
			let client = app.provider.client(host).await?;
			let results = state::check_and_record_drift(client.as_ref()).await?;
			let files: Vec<String> = results
				.iter()
				.filter(|d| d.is_drifted())
				.map(|d| d.path.clone())
				.collect();
			if !files.is_empty() {
				app.webhooks
					.send_host_event("drift", &host.name, json!({ "files": files }))
					.await;
				drifted.push(json!({ "host": host.name, "files": files }));
			}
		}
		Ok(json!({ "drifted": drifted }))
	});
	Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn drift_fix(
	State(state): State<Arc<AppState>>,
	Query(params): Query<DriftParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let name = params
		.host
		.as_deref()
		.ok_or_else(|| ApiError::bad_request("host parameter is required"))?;
	let host = lookup(&state, name)?;
	let client = state.provider.client(&host).await?;
	let exec = client.as_ref();
	let host_state = state::read_state(exec).await?;
	let drift = state::check_drift(exec, &host_state.managed_files).await?;
	let report = state::fix_drift(exec, &host_state.managed_files, &drift).await?;
	Ok(Json(json!({
		"host": name,
		"fixed": report.fixed,
		"refused": report.refused,
	})))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
	Json(json!(state.jobs.list()))
}

async fn get_job(
	State(state): State<Arc<AppState>>,
	Path(id): Path<String>,
) -> Result<Json<crate::jobs::Job>, ApiError> {
	state
		.jobs
		.get(&id)
		.map(Json)
		.ok_or_else(|| ApiError::not_found(format!("job {id}")))
}

/// Builds the host's closure and compares it with the recorded state.
async fn plan_host(state: &AppState, host: &Host) -> serde_json::Value {
	let client = match state.provider.client(host).await {
		Ok(client) => client,
		Err(_) => return json!({ "host": host.name, "status": "unreachable" }),
	};
	let recorded = match state::read_state(client.as_ref()).await {
		Ok(recorded) => recorded,
		Err(e) => return json!({ "host": host.name, "status": "error", "error": format!("{e:#}") }),
	};
	let closure = match state.builder.build_host(&host.name, host.base).await {
		Ok(closure) => closure,
		Err(e) => return json!({ "host": host.name, "status": "error", "error": format!("{e:#}") }),
	};
	let status = if recorded.manifest_hash.is_empty() {
		"new_deployment"
	} else if recorded.manifest_hash == closure.manifest_hash {
		"up_to_date"
	} else {
		"changes_pending"
	};
	json!({
		"host": host.name,
		"status": status,
		"storePath": closure.store_path,
		"manifestHash": closure.manifest_hash,
		"currentManifestHash": recorded.manifest_hash,
	})
}

async fn plan_all(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
	let mut plans = Vec::new();
	for host in state.inventory.list() {
		plans.push(plan_host(&state, host).await);
	}
	Json(json!(plans))
}

async fn plan_one(
	State(state): State<Arc<AppState>>,
	Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let host = lookup(&state, &name)?;
	Ok(Json(plan_host(&state, &host).await))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bearer_auth_matching() {
		let token = Some("s3cret".to_owned());
		assert!(authorized(&token, Some("Bearer s3cret")));
		assert!(!authorized(&token, Some("Bearer wrong")));
		assert!(!authorized(&token, Some("s3cret")));
		assert!(!authorized(&token, None));
		// Absent-token mode allows all.
		assert!(authorized(&None, None));
		assert!(authorized(&None, Some("Bearer anything")));
	}
}
