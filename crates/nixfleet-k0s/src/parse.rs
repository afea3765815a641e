use chrono::Utc;
use nixfleet_shared::{HelmChartRef, K0sState, ManifestRef};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Coarse change detection: any edit to the k0s yaml invalidates the hash.
pub fn config_hash(config_text: &str) -> String {
	hex::encode(Sha256::digest(config_text.as_bytes()))
}

static DOC_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^---\s*$").unwrap());
static API_VERSION: Lazy<Regex> =
	Lazy::new(|| Regex::new(r#"(?m)^apiVersion:\s*["']?([A-Za-z0-9./_-]+)"#).unwrap());
static KIND: Lazy<Regex> =
	Lazy::new(|| Regex::new(r#"(?m)^kind:\s*["']?([A-Za-z0-9]+)"#).unwrap());
static META_NAME: Lazy<Regex> =
	Lazy::new(|| Regex::new(r#"(?m)^\s+name:\s*["']?([A-Za-z0-9._-]+)"#).unwrap());
static META_NAMESPACE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r#"(?m)^\s+namespace:\s*["']?([A-Za-z0-9._-]+)"#).unwrap());

/// Grabs the indented block directly under a top-level `metadata:` key.
fn metadata_block(doc: &str) -> Option<&str> {
	let start = doc
		.lines()
		.scan(0usize, |offset, line| {
			let line_start = *offset;
			*offset += line.len() + 1;
			Some((line_start, line))
		})
		.find(|(_, line)| line.trim_end() == "metadata:")
		.map(|(pos, line)| pos + line.len() + 1)?;
	let rest = doc.get(start..)?;
	let mut end = rest.len();
	let mut offset = 0usize;
	for line in rest.lines() {
		if !line.trim().is_empty() && !line.starts_with([' ', '\t']) {
			end = offset;
			break;
		}
		offset += line.len() + 1;
	}
	rest.get(..end.min(rest.len()))
}

/// Extracts `{apiVersion, kind, name, namespace}` tuples from a multi-document
/// YAML stream. Documents missing kind or name are skipped.
pub fn parse_manifest_docs(file: &str, content: &str) -> Vec<ManifestRef> {
	let mut out = Vec::new();
	for doc in DOC_SPLIT.split(content) {
		if doc.trim().is_empty() {
			continue;
		}
		let Some(kind) = KIND.captures(doc).map(|c| c[1].to_owned()) else {
			continue;
		};
		let api_version = API_VERSION
			.captures(doc)
			.map(|c| c[1].to_owned())
			.unwrap_or_default();
		let Some(meta) = metadata_block(doc) else {
			continue;
		};
		let Some(name) = META_NAME.captures(meta).map(|c| c[1].to_owned()) else {
			continue;
		};
		let namespace = META_NAMESPACE
			.captures(meta)
			.map(|c| c[1].to_owned())
			.unwrap_or_default();
		out.push(ManifestRef {
			logical_name: format!("{}-{}", kind.to_lowercase(), name),
			api_version,
			kind,
			name,
			namespace,
			file: file.to_owned(),
		});
	}
	out
}

fn strip_value(raw: &str) -> String {
	raw.trim()
		.trim_matches(|c| c == '"' || c == '\'')
		.to_owned()
}

#[derive(Default)]
struct PartialChart {
	name: String,
	chart: String,
	version: String,
	namespace: String,
}

impl PartialChart {
	fn take(self) -> Option<HelmChartRef> {
		if self.name.is_empty() {
			return None;
		}
		Some(HelmChartRef {
			name: self.name,
			chart: self.chart,
			version: self.version,
			namespace: if self.namespace.is_empty() {
				"default".to_owned()
			} else {
				self.namespace
			},
		})
	}

	fn set(&mut self, key: &str, value: &str) {
		match key {
			"name" => self.name = strip_value(value),
			"chartname" | "chart" => self.chart = strip_value(value),
			"version" => self.version = strip_value(value),
			"namespace" => self.namespace = strip_value(value),
			_ => {}
		}
	}
}

/// Scans the k0s config for the helm extension's chart list
/// (`spec.extensions.helm.charts`). Line-based and tolerant, like the
/// manifest extraction.
pub fn parse_helm_charts(config_text: &str) -> Vec<HelmChartRef> {
	let mut charts = Vec::new();
	let mut current: Option<PartialChart> = None;
	let mut charts_indent: Option<usize> = None;

	for line in config_text.lines() {
		let trimmed = line.trim();
		if trimmed.is_empty() || trimmed.starts_with('#') {
			continue;
		}
		let indent = line.len() - line.trim_start().len();

		let Some(block_indent) = charts_indent else {
			if trimmed == "charts:" {
				charts_indent = Some(indent);
			}
			continue;
		};

		// Dedenting out of the charts block ends the scan for this block.
		if indent <= block_indent && !trimmed.starts_with("- ") {
			charts.extend(current.take().and_then(PartialChart::take));
			charts_indent = None;
			if trimmed == "charts:" {
				charts_indent = Some(indent);
			}
			continue;
		}

		if let Some(rest) = trimmed.strip_prefix("- ") {
			charts.extend(current.take().and_then(PartialChart::take));
			let mut chart = PartialChart::default();
			if let Some((key, value)) = rest.split_once(':') {
				chart.set(key.trim(), value);
			}
			current = Some(chart);
		} else if let Some(chart) = current.as_mut() {
			if let Some((key, value)) = trimmed.split_once(':') {
				chart.set(key.trim(), value);
			}
		}
	}
	charts.extend(current.take().and_then(PartialChart::take));
	charts
}

/// Builds the persisted k0s record from a config and the auto-apply
/// manifest files, `(file name, content)` pairs.
pub fn parse_state(config_text: &str, manifests: &[(String, String)]) -> K0sState {
	let mut refs = Vec::new();
	for (file, content) in manifests {
		refs.extend(parse_manifest_docs(file, content));
	}
	K0sState {
		enabled: true,
		config_hash: config_hash(config_text),
		helm_charts: parse_helm_charts(config_text),
		manifests: refs,
		last_reconcile: Some(Utc::now()),
	}
}
