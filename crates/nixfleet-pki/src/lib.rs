//! Fleet PKI: a two-tier Ed25519 certificate authority with an encrypted
//! on-disk store, scheduled rotation, and per-host deployment.
//!
//! The root CA signs at most one intermediate; leaves are signed by the
//! intermediate when present, by the root otherwise. Private keys never touch
//! disk unencrypted: they are wrapped in armored age ciphertexts addressed to
//! every configured recipient.

mod ca;
mod deploy;
mod info;
mod issue;
mod rotate;
mod store;

pub use ca::{CaConfig, CertAuthority, Issuer};
pub use deploy::{deploy_certs, CertInstallSpec, PKI_INSTALL_DIR};
pub use info::{parse_cert_info, verify_chain, CertInfo, CertStatus};
pub use issue::{issue_cert, IssueRequest, IssuedCert};
pub use rotate::{
	rotate_certificates, rotate_for_hosts, RotationAction, RotationConfig, RotationRecord,
};
pub use store::PkiStore;

/// Leaf validity must end at least this long before the issuer's own expiry.
pub const ISSUER_EXPIRY_BUFFER_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
	#[error("issuer expires within 24h, refusing to issue a certificate")]
	ValidityWindow,
	#[error("certificate generation failed: {0}")]
	Rcgen(#[from] rcgen::Error),
	#[error("failed to parse certificate: {0}")]
	Parse(String),
	#[error("chain verification failed: {0}")]
	Verify(String),
	#[error("no age recipients configured for key encryption")]
	NoRecipients,
	#[error("failed to decrypt private key: {0}")]
	Decrypt(String),
}
