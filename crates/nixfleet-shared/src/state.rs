use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// On-host state file, persisted at `/var/lib/nixfleet/state.json`.
///
/// The file is owned by the control plane and mutated only through the state
/// store. Unknown fields written by a newer control plane are preserved on
/// read-modify-write via the flattened `extra` map; missing fields default to
/// zero so state files from older deployments keep parsing.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HostState {
	#[serde(default)]
	pub generation: u64,
	#[serde(default)]
	#[serde(skip_serializing_if = "String::is_empty")]
	pub store_path: String,
	#[serde(default)]
	#[serde(skip_serializing_if = "String::is_empty")]
	pub manifest_hash: String,
	#[serde(default)]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_apply: Option<DateTime<Utc>>,
	/// Duration of the last apply, in seconds.
	#[serde(default)]
	pub last_apply_duration_secs: u64,

	#[serde(default)]
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub managed_files: Vec<ManagedFile>,
	#[serde(default)]
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub activated_units: Vec<String>,

	#[serde(default)]
	pub drift_detected: bool,
	#[serde(default)]
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub drift_files: Vec<String>,
	#[serde(default)]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_drift_check: Option<DateTime<Utc>>,

	#[serde(default)]
	pub pending_updates: u64,
	#[serde(default)]
	pub security_updates: u64,
	#[serde(default)]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_update_check: Option<DateTime<Utc>>,
	#[serde(default)]
	pub reboot_required: bool,

	#[serde(default)]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub k0s: Option<K0sState>,

	#[serde(flatten)]
	pub extra: BTreeMap<String, serde_json::Value>,
}

/// A file captured at activation time, later compared for drift.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedFile {
	pub path: String,
	pub sha256: String,
	/// Octal permission string as `stat -c %a` prints it, e.g. "644".
	pub mode: String,
	pub owner: String,
	pub group: String,
}

/// k0s resources recorded at the last reconcile, diffed on the next one.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct K0sState {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	#[serde(skip_serializing_if = "String::is_empty")]
	pub config_hash: String,
	#[serde(default)]
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub helm_charts: Vec<HelmChartRef>,
	#[serde(default)]
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub manifests: Vec<ManifestRef>,
	#[serde(default)]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_reconcile: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartRef {
	pub name: String,
	pub chart: String,
	#[serde(default)]
	#[serde(skip_serializing_if = "String::is_empty")]
	pub version: String,
	pub namespace: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRef {
	pub api_version: String,
	pub kind: String,
	pub name: String,
	#[serde(default)]
	#[serde(skip_serializing_if = "String::is_empty")]
	pub namespace: String,
	#[serde(default)]
	#[serde(skip_serializing_if = "String::is_empty")]
	pub file: String,
	#[serde(default)]
	#[serde(skip_serializing_if = "String::is_empty")]
	pub logical_name: String,
}

impl ManifestRef {
	/// Identity used for orphan diffing: `Kind/namespace/name`.
	pub fn key(&self) -> String {
		format!("{}/{}/{}", self.kind, self.namespace, self.name)
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DriftStatus {
	Unchanged,
	ContentChanged,
	PermissionsChanged,
	Missing,
	/// Present on disk but recorded with an empty hash, i.e. created behind
	/// the control plane's back.
	Added,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriftResult {
	pub path: String,
	pub status: DriftStatus,
	#[serde(default)]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

impl DriftResult {
	pub fn is_drifted(&self) -> bool {
		self.status != DriftStatus::Unchanged
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_fields_default_zero() {
		let state: HostState = serde_json::from_str("{}").unwrap();
		assert_eq!(state.generation, 0);
		assert!(!state.drift_detected);
		assert!(state.k0s.is_none());
	}

	#[test]
	fn unknown_fields_preserved() {
		let state: HostState =
			serde_json::from_str(r#"{"generation": 3, "futureField": {"a": 1}}"#).unwrap();
		assert_eq!(state.generation, 3);
		let out = serde_json::to_value(&state).unwrap();
		assert_eq!(out["futureField"]["a"], 1);
	}

	#[test]
	fn drift_status_wire_names() {
		assert_eq!(
			serde_json::to_string(&DriftStatus::ContentChanged).unwrap(),
			"\"content-changed\""
		);
		assert_eq!(
			serde_json::to_string(&DriftStatus::PermissionsChanged).unwrap(),
			"\"permissions-changed\""
		);
	}

	#[test]
	fn manifest_key_includes_namespace() {
		let m = ManifestRef {
			api_version: "v1".into(),
			kind: "ConfigMap".into(),
			name: "cm1".into(),
			namespace: "default".into(),
			file: String::new(),
			logical_name: String::new(),
		};
		assert_eq!(m.key(), "ConfigMap/default/cm1");
	}
}
