use chrono::{DateTime, Utc};
use rand::RngCore;
use rcgen::{
	CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
	KeyUsagePurpose, PKCS_ED25519,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
	ca::offset_from_chrono,
	info::{parse_cert_info, thumbprint},
	Issuer, PkiError, ISSUER_EXPIRY_BUFFER_HOURS,
};

pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 365;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
	pub hostname: String,
	/// Distinguishes multiple certificates per host.
	#[serde(default = "default_cert_name")]
	pub name: String,
	#[serde(default)]
	pub sans: Vec<String>,
	#[serde(default = "default_validity")]
	pub validity_days: u32,
}

fn default_cert_name() -> String {
	"host".to_owned()
}

fn default_validity() -> u32 {
	DEFAULT_LEAF_VALIDITY_DAYS
}

impl IssueRequest {
	pub fn new(hostname: impl Into<String>) -> Self {
		Self {
			hostname: hostname.into(),
			name: default_cert_name(),
			sans: Vec::new(),
			validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCert {
	pub cert_pem: String,
	pub key_pem: String,
	/// `leaf || intermediate || root`, only when signed by an intermediate.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub chain_pem: Option<String>,
	pub hostname: String,
	pub name: String,
	pub serial: String,
	pub not_before: DateTime<Utc>,
	pub not_after: DateTime<Utc>,
	pub sans: Vec<String>,
	pub thumbprint: String,
}

/// 128-bit cryptographically random serial. Never reused; collisions are
/// astronomically improbable.
pub(crate) fn random_serial() -> Vec<u8> {
	let mut serial = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut serial);
	serial.to_vec()
}

/// Issues an end-entity certificate, signed by the intermediate when one
/// exists, by the root otherwise. Validity is clamped to the issuer's own
/// expiry minus a one-day buffer; a non-positive remaining window refuses.
pub fn issue_cert(issuer: &Issuer, req: &IssueRequest) -> Result<IssuedCert, PkiError> {
	let authority = issuer.signing_authority();

	let now = Utc::now();
	let ceiling = authority.not_after() - chrono::Duration::hours(ISSUER_EXPIRY_BUFFER_HOURS);
	if ceiling <= now {
		return Err(PkiError::ValidityWindow);
	}
	let not_after = (now + chrono::Duration::days(i64::from(req.validity_days))).min(ceiling);

	// IP-shaped SAN strings are routed to IPAddresses by rcgen; the rest
	// become DNS names. The hostname is always the first SAN.
	let mut sans = vec![req.hostname.clone()];
	for san in &req.sans {
		if !sans.contains(san) {
			sans.push(san.clone());
		}
	}

	let key = KeyPair::generate_for(&PKCS_ED25519)?;
	let mut params = CertificateParams::new(sans.clone())?;
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, req.hostname.as_str());
	params.distinguished_name = dn;
	params.is_ca = IsCa::ExplicitNoCa;
	params.key_usages = vec![
		KeyUsagePurpose::DigitalSignature,
		KeyUsagePurpose::KeyEncipherment,
	];
	params.extended_key_usages = vec![
		ExtendedKeyUsagePurpose::ServerAuth,
		ExtendedKeyUsagePurpose::ClientAuth,
	];
	params.serial_number = Some(rcgen::SerialNumber::from(random_serial()));
	params.not_before = offset_from_chrono(now);
	params.not_after = offset_from_chrono(not_after);

	let cert = params.signed_by(&key, authority.signer(), authority.key())?;
	let cert_pem = cert.pem();
	let info = parse_cert_info(&cert_pem)?;

	let chain_pem = issuer
		.chain_pem()
		.map(|chain| format!("{cert_pem}{chain}"));

	debug!(
		hostname = req.hostname,
		name = req.name,
		serial = info.serial,
		"issued certificate"
	);

	Ok(IssuedCert {
		key_pem: key.serialize_pem(),
		chain_pem,
		hostname: req.hostname.clone(),
		name: req.name.clone(),
		serial: info.serial,
		not_before: info.not_before,
		not_after: info.not_after,
		sans,
		thumbprint: thumbprint(cert.der()),
		cert_pem,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		ca::{CaConfig, CertAuthority},
		info::{split_pem_blocks, verify_chain, CertStatus},
	};

	fn two_tier() -> Issuer {
		let root = CertAuthority::create_root(&CaConfig::root("Test Root")).unwrap();
		let intermediate =
			CertAuthority::create_intermediate(&root, &CaConfig::intermediate("Test Int"))
				.unwrap();
		Issuer {
			root,
			intermediate: Some(intermediate),
		}
	}

	#[test]
	fn two_tier_issue_and_verify() {
		let issuer = two_tier();
		let mut req = IssueRequest::new("api.example");
		req.sans = vec!["api.example.local".to_owned(), "10.0.0.5".to_owned()];
		req.validity_days = 90;
		let cert = issue_cert(&issuer, &req).unwrap();

		let chain = cert.chain_pem.as_deref().expect("two-tier populates chain");
		assert_eq!(split_pem_blocks(chain).len(), 3);

		verify_chain(
			&cert.cert_pem,
			issuer.intermediate.as_ref().map(|i| i.cert_pem()),
			issuer.root.cert_pem(),
		)
		.unwrap();

		let info = parse_cert_info(&cert.cert_pem).unwrap();
		assert!(info.days_left >= 89 && info.days_left <= 90);
		assert_eq!(info.status, CertStatus::Valid);
		assert!(info.sans.contains(&"api.example".to_owned()));
		assert!(info.sans.contains(&"api.example.local".to_owned()));
		assert!(info.sans.contains(&"10.0.0.5".to_owned()));
	}

	#[test]
	fn single_tier_issue_has_no_chain() {
		let issuer = Issuer {
			root: CertAuthority::create_root(&CaConfig::root("Solo Root")).unwrap(),
			intermediate: None,
		};
		let cert = issue_cert(&issuer, &IssueRequest::new("web1.example")).unwrap();
		assert!(cert.chain_pem.is_none());
		verify_chain(&cert.cert_pem, None, issuer.root.cert_pem()).unwrap();
	}

	#[test]
	fn refuses_when_issuer_window_closed() {
		let mut cfg = CaConfig::root("Dying Root");
		cfg.validity_days = 0;
		let issuer = Issuer {
			root: CertAuthority::create_root(&cfg).unwrap(),
			intermediate: None,
		};
		let err = issue_cert(&issuer, &IssueRequest::new("late.example")).unwrap_err();
		assert!(matches!(err, PkiError::ValidityWindow));
	}

	#[test]
	fn leaf_validity_clamped_to_issuer() {
		let mut root_cfg = CaConfig::root("Near Root");
		root_cfg.validity_days = 40;
		let issuer = Issuer {
			root: CertAuthority::create_root(&root_cfg).unwrap(),
			intermediate: None,
		};
		let cert = issue_cert(&issuer, &IssueRequest::new("clamped.example")).unwrap();
		assert!(cert.not_after <= issuer.root.not_after() - chrono::Duration::hours(23));
	}
}
