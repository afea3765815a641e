use chrono::{DateTime, TimeZone, Utc};
use rcgen::{
	BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
	KeyUsagePurpose, PKCS_ED25519,
};

use crate::{info::parse_cert_info, PkiError, ISSUER_EXPIRY_BUFFER_HOURS};

#[derive(Clone, Debug)]
pub struct CaConfig {
	pub common_name: String,
	pub organization: Option<String>,
	pub validity_days: u32,
}

impl CaConfig {
	pub fn root(common_name: impl Into<String>) -> Self {
		Self {
			common_name: common_name.into(),
			organization: None,
			validity_days: 3650,
		}
	}

	pub fn intermediate(common_name: impl Into<String>) -> Self {
		Self {
			common_name: common_name.into(),
			organization: None,
			validity_days: 1825,
		}
	}
}

/// A certificate authority held in memory: the PEM certificate plus its
/// Ed25519 keypair, with an rcgen signer reconstructed for issuance.
pub struct CertAuthority {
	cert_pem: String,
	key: KeyPair,
	signer: Certificate,
	not_after: DateTime<Utc>,
}

impl std::fmt::Debug for CertAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertAuthority")
			.field("cert_pem", &self.cert_pem)
			.field("not_after", &self.not_after)
			.finish()
	}
}

impl CertAuthority {
	pub fn create_root(cfg: &CaConfig) -> Result<Self, PkiError> {
		let key = KeyPair::generate_for(&PKCS_ED25519)?;
		let mut params = ca_params(cfg)?;
		// pathLen 1 leaves room for exactly one intermediate tier.
		params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
		let cert = params.self_signed(&key)?;
		Self::from_parts(cert.pem(), key)
	}

	pub fn create_intermediate(root: &CertAuthority, cfg: &CaConfig) -> Result<Self, PkiError> {
		let key = KeyPair::generate_for(&PKCS_ED25519)?;
		let mut params = ca_params(cfg)?;
		params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));

		// The intermediate must not outlive the root.
		let ceiling = root.not_after - chrono::Duration::hours(ISSUER_EXPIRY_BUFFER_HOURS);
		if ceiling <= Utc::now() {
			return Err(PkiError::ValidityWindow);
		}
		let requested = offset_from_chrono(
			Utc::now() + chrono::Duration::days(i64::from(cfg.validity_days)),
		);
		let ceiling = offset_from_chrono(ceiling);
		params.not_after = requested.min(ceiling);

		let cert = params.signed_by(&key, &root.signer, &root.key)?;
		Self::from_parts(cert.pem(), key)
	}

	/// Reconstructs an authority from its serialized form. Re-serialization
	/// is stable: `cert_pem`/`key_pem` round-trip byte-identically.
	pub fn load(cert_pem: &str, key_pem: &str) -> Result<Self, PkiError> {
		let key = KeyPair::from_pem(key_pem)?;
		Self::from_parts(cert_pem.to_owned(), key)
	}

	fn from_parts(cert_pem: String, key: KeyPair) -> Result<Self, PkiError> {
		let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
		let signer = params.self_signed(&key)?;
		let info = parse_cert_info(&cert_pem)?;
		Ok(Self {
			cert_pem,
			key,
			signer,
			not_after: info.not_after,
		})
	}

	pub fn cert_pem(&self) -> &str {
		&self.cert_pem
	}

	pub fn key_pem(&self) -> String {
		self.key.serialize_pem()
	}

	pub fn not_after(&self) -> DateTime<Utc> {
		self.not_after
	}

	pub(crate) fn key(&self) -> &KeyPair {
		&self.key
	}

	pub(crate) fn signer(&self) -> &Certificate {
		&self.signer
	}
}

/// The signing side of the PKI: always a root, optionally an intermediate
/// which then signs all leaves.
pub struct Issuer {
	pub root: CertAuthority,
	pub intermediate: Option<CertAuthority>,
}

impl Issuer {
	/// The authority that signs end-entity certificates.
	pub fn signing_authority(&self) -> &CertAuthority {
		self.intermediate.as_ref().unwrap_or(&self.root)
	}

	/// `intermediate || root`, present only for two-tier deployments.
	pub fn chain_pem(&self) -> Option<String> {
		self.intermediate
			.as_ref()
			.map(|int| format!("{}{}", int.cert_pem(), self.root.cert_pem()))
	}
}

fn ca_params(cfg: &CaConfig) -> Result<CertificateParams, PkiError> {
	let mut params = CertificateParams::new(Vec::<String>::new())?;
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, cfg.common_name.as_str());
	if let Some(org) = &cfg.organization {
		dn.push(DnType::OrganizationName, org.as_str());
	}
	params.distinguished_name = dn;
	params.key_usages = vec![
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::CrlSign,
		KeyUsagePurpose::DigitalSignature,
	];
	let now = Utc::now();
	params.not_before = offset_from_chrono(now);
	params.not_after =
		offset_from_chrono(now + chrono::Duration::days(i64::from(cfg.validity_days)));
	params.serial_number = Some(rcgen::SerialNumber::from(crate::issue::random_serial()));
	Ok(params)
}

pub(crate) fn offset_from_chrono(dt: DateTime<Utc>) -> time::OffsetDateTime {
	time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
		.expect("chrono timestamps are in range for time")
}

pub(crate) fn chrono_from_timestamp(ts: i64) -> DateTime<Utc> {
	Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}
