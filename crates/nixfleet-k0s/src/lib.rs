//! k0s reconciler: when a deployment drops Helm releases or auto-applied
//! manifests from a host's spec, the corresponding live resources are
//! removed from the cluster too.
//!
//! Parsing is intentionally a shallow, YAML-aware scan: resources that use
//! unusual formatting are omitted rather than erroring.

mod parse;
mod reconcile;

pub use parse::{config_hash, parse_helm_charts, parse_manifest_docs, parse_state};
pub use reconcile::{collect_current, detect, reconcile, ReconcileResult};

/// k0s single-config location read for chart extraction and change hashing.
pub const K0S_CONFIG_PATH: &str = "/etc/k0s/k0s.yaml";
/// Directory k0s auto-applies manifests from.
pub const K0S_MANIFESTS_DIR: &str = "/var/lib/k0s/manifests";
/// Namespaces that are never garbage-collected.
pub const SYSTEM_NAMESPACES: &[&str] = &["kube-system", "default", "cert-manager"];
