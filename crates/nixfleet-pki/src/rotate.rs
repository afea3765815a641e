use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
	info::parse_cert_info,
	issue::{issue_cert, IssueRequest},
	Issuer, PkiStore,
};

#[derive(Clone, Debug)]
pub struct RotationConfig {
	/// Certificates within this many days of expiry are renewed.
	pub renew_before_days: i64,
	pub force: bool,
	pub dry_run: bool,
}

impl Default for RotationConfig {
	fn default() -> Self {
		Self {
			renew_before_days: 30,
			force: false,
			dry_run: false,
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RotationAction {
	Renewed,
	Skipped,
	Failed,
	WouldRenew,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RotationRecord {
	pub host: String,
	pub name: String,
	pub action: RotationAction,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

/// Walks every issued host certificate and re-issues the ones expiring
/// within `renew_before_days` (or all of them under `force`), preserving the
/// original SANs and the original validity *duration*. A failure on one
/// certificate is recorded and does not stop the rest. Under `dry_run`
/// nothing on disk is touched.
pub fn rotate_certificates(
	store: &PkiStore,
	issuer: &Issuer,
	cfg: &RotationConfig,
) -> anyhow::Result<Vec<RotationRecord>> {
	rotate_filtered(store, issuer, cfg, None)
}

/// Rotation restricted to certificates belonging to the given hosts; used
/// by the apply pipeline to auto-renew just the batch it is deploying.
pub fn rotate_for_hosts(
	store: &PkiStore,
	issuer: &Issuer,
	cfg: &RotationConfig,
	hosts: &[String],
) -> anyhow::Result<Vec<RotationRecord>> {
	rotate_filtered(store, issuer, cfg, Some(hosts))
}

fn rotate_filtered(
	store: &PkiStore,
	issuer: &Issuer,
	cfg: &RotationConfig,
	hosts: Option<&[String]>,
) -> anyhow::Result<Vec<RotationRecord>> {
	let mut records = Vec::new();
	for stored in store.list_host_certs()? {
		if let Some(filter) = hosts {
			if !filter.contains(&stored.host) {
				continue;
			}
		}
		let record = rotate_one(store, issuer, cfg, &stored.host, &stored.name);
		records.push(record);
	}
	Ok(records)
}

fn rotate_one(
	store: &PkiStore,
	issuer: &Issuer,
	cfg: &RotationConfig,
	host: &str,
	name: &str,
) -> RotationRecord {
	let fail = |detail: String| RotationRecord {
		host: host.to_owned(),
		name: name.to_owned(),
		action: RotationAction::Failed,
		detail: Some(detail),
	};

	let cert_pem = match store.load_cert_pem(host, name) {
		Ok(pem) => pem,
		Err(e) => return fail(format!("failed to read certificate: {e}")),
	};
	let parsed = match parse_cert_info(&cert_pem) {
		Ok(info) => info,
		Err(e) => return fail(format!("failed to parse certificate: {e}")),
	};

	let days_left = (parsed.not_after - Utc::now()).num_days();
	if !cfg.force && days_left > cfg.renew_before_days {
		return RotationRecord {
			host: host.to_owned(),
			name: name.to_owned(),
			action: RotationAction::Skipped,
			detail: Some(format!("{days_left} days remaining")),
		};
	}

	if cfg.dry_run {
		return RotationRecord {
			host: host.to_owned(),
			name: name.to_owned(),
			action: RotationAction::WouldRenew,
			detail: Some(format!("expires in {days_left} days")),
		};
	}

	// Preserve the duration the certificate was originally issued with,
	// not its end date.
	let original_days = (parsed.not_after - parsed.not_before).num_days().max(1);
	let req = IssueRequest {
		hostname: if parsed.hostname.is_empty() {
			host.to_owned()
		} else {
			parsed.hostname.clone()
		},
		name: name.to_owned(),
		sans: parsed.sans.clone(),
		validity_days: original_days as u32,
	};

	let issued = match issue_cert(issuer, &req) {
		Ok(cert) => cert,
		Err(e) => {
			warn!(host, name, "renewal failed: {e}");
			return fail(format!("re-issuance failed: {e}"));
		}
	};
	if let Err(e) = store.save_issued(&issued) {
		return fail(format!("failed to persist renewed certificate: {e}"));
	}
	info!(host, name, serial = issued.serial, "renewed certificate");
	RotationRecord {
		host: host.to_owned(),
		name: name.to_owned(),
		action: RotationAction::Renewed,
		detail: Some(format!("new expiry {}", issued.not_after)),
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;
	use std::fs;
	use std::path::Path;

	use super::*;
	use crate::ca::CaConfig;
	use crate::store::tests::test_store;

	fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
		let mut out = BTreeMap::new();
		let mut stack = vec![dir.to_path_buf()];
		while let Some(d) = stack.pop() {
			for entry in fs::read_dir(&d).unwrap() {
				let entry = entry.unwrap();
				if entry.file_type().unwrap().is_dir() {
					stack.push(entry.path());
				} else {
					out.insert(
						entry.path().to_string_lossy().into_owned(),
						fs::read(entry.path()).unwrap(),
					);
				}
			}
		}
		out
	}

	#[test]
	fn dry_run_reports_without_touching_files() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(dir.path());
		store.init_root(&CaConfig::root("Rotation Root")).unwrap();
		let issuer = store.load_issuer().unwrap();

		let mut soon = IssueRequest::new("soon.example");
		soon.validity_days = 10;
		store.save_issued(&issue_cert(&issuer, &soon).unwrap()).unwrap();

		let mut later = IssueRequest::new("later.example");
		later.validity_days = 200;
		store.save_issued(&issue_cert(&issuer, &later).unwrap()).unwrap();

		let before = snapshot(dir.path());
		let records = rotate_certificates(
			&store,
			&issuer,
			&RotationConfig {
				dry_run: true,
				..Default::default()
			},
		)
		.unwrap();

		let by_host: BTreeMap<_, _> = records
			.iter()
			.map(|r| (r.host.as_str(), r.action))
			.collect();
		assert_eq!(by_host["soon.example"], RotationAction::WouldRenew);
		assert_eq!(by_host["later.example"], RotationAction::Skipped);
		assert_eq!(snapshot(dir.path()), before, "dry-run must not modify the store");
	}

	#[test]
	fn renewal_preserves_sans_and_duration() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(dir.path());
		store.init_root(&CaConfig::root("Rotation Root")).unwrap();
		let issuer = store.load_issuer().unwrap();

		let mut req = IssueRequest::new("web.example");
		req.sans = vec!["web.internal".to_owned(), "10.1.2.3".to_owned()];
		req.validity_days = 20;
		store.save_issued(&issue_cert(&issuer, &req).unwrap()).unwrap();

		let records =
			rotate_certificates(&store, &issuer, &RotationConfig::default()).unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].action, RotationAction::Renewed);

		let renewed = parse_cert_info(&store.load_cert_pem("web.example", "host").unwrap())
			.unwrap();
		assert!(renewed.sans.contains(&"web.internal".to_owned()));
		assert!(renewed.sans.contains(&"10.1.2.3".to_owned()));
		let duration = (renewed.not_after - renewed.not_before).num_days();
		assert!((19..=21).contains(&duration), "duration preserved, got {duration}");
	}

	#[test]
	fn force_renews_everything() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(dir.path());
		store.init_root(&CaConfig::root("Rotation Root")).unwrap();
		let issuer = store.load_issuer().unwrap();
		let mut req = IssueRequest::new("fresh.example");
		req.validity_days = 300;
		store.save_issued(&issue_cert(&issuer, &req).unwrap()).unwrap();

		let records = rotate_certificates(
			&store,
			&issuer,
			&RotationConfig {
				force: true,
				..Default::default()
			},
		)
		.unwrap();
		assert_eq!(records[0].action, RotationAction::Renewed);
	}
}
