use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::{ca::chrono_from_timestamp, PkiError};

/// A certificate within 30 days of expiry is reported as expiring.
pub const EXPIRY_WARNING_DAYS: i64 = 30;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
	Valid,
	Expiring,
	Expired,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CertInfo {
	pub hostname: String,
	pub serial: String,
	pub not_before: DateTime<Utc>,
	pub not_after: DateTime<Utc>,
	pub sans: Vec<String>,
	/// First 16 hex characters of the SHA-256 over the DER encoding.
	pub thumbprint: String,
	pub days_left: i64,
	pub status: CertStatus,
}

fn decode_pem(cert_pem: &str) -> Result<Vec<u8>, PkiError> {
	let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
		.map_err(|e| PkiError::Parse(e.to_string()))?;
	if pem.label != "CERTIFICATE" {
		return Err(PkiError::Parse(format!("unexpected PEM label {}", pem.label)));
	}
	Ok(pem.contents)
}

pub(crate) fn thumbprint(der: &[u8]) -> String {
	let digest = Sha256::digest(der);
	hex::encode(digest)[..16].to_owned()
}

/// Extracts display metadata and an expiry classification from a PEM cert.
pub fn parse_cert_info(cert_pem: &str) -> Result<CertInfo, PkiError> {
	let der = decode_pem(cert_pem)?;
	let (_, cert) =
		X509Certificate::from_der(&der).map_err(|e| PkiError::Parse(e.to_string()))?;

	let hostname = cert
		.subject()
		.iter_common_name()
		.next()
		.and_then(|cn| cn.as_str().ok())
		.map(ToOwned::to_owned)
		.unwrap_or_default();

	let mut sans = Vec::new();
	if let Ok(Some(ext)) = cert.subject_alternative_name() {
		for name in &ext.value.general_names {
			match name {
				GeneralName::DNSName(dns) => sans.push((*dns).to_owned()),
				GeneralName::IPAddress(bytes) => match bytes.len() {
					4 => sans.push(
						std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
							.to_string(),
					),
					16 => {
						let mut octets = [0u8; 16];
						octets.copy_from_slice(bytes);
						sans.push(std::net::Ipv6Addr::from(octets).to_string());
					}
					_ => {}
				},
				_ => {}
			}
		}
	}

	let not_before = chrono_from_timestamp(cert.validity().not_before.timestamp());
	let not_after = chrono_from_timestamp(cert.validity().not_after.timestamp());
	let days_left = (not_after - Utc::now()).num_days();
	let status = if not_after <= Utc::now() {
		CertStatus::Expired
	} else if days_left <= EXPIRY_WARNING_DAYS {
		CertStatus::Expiring
	} else {
		CertStatus::Valid
	};

	Ok(CertInfo {
		hostname,
		serial: cert.raw_serial_as_string().replace(':', ""),
		not_before,
		not_after,
		sans,
		thumbprint: thumbprint(&der),
		days_left,
		status,
	})
}

/// Verifies `cert_pem` against the stored root (and intermediate, when the
/// deployment is two-tier) at the current time: issuer linkage, signatures,
/// and validity windows for every certificate involved.
pub fn verify_chain(
	cert_pem: &str,
	intermediate_pem: Option<&str>,
	root_pem: &str,
) -> Result<(), PkiError> {
	let leaf_der = decode_pem(cert_pem)?;
	let root_der = decode_pem(root_pem)?;
	let int_der = intermediate_pem.map(decode_pem).transpose()?;

	let (_, leaf) =
		X509Certificate::from_der(&leaf_der).map_err(|e| PkiError::Parse(e.to_string()))?;
	let (_, root) =
		X509Certificate::from_der(&root_der).map_err(|e| PkiError::Parse(e.to_string()))?;
	let intermediate = match &int_der {
		Some(der) => Some(
			X509Certificate::from_der(der)
				.map_err(|e| PkiError::Parse(e.to_string()))?
				.1,
		),
		None => None,
	};

	if !leaf.validity().is_valid() {
		return Err(PkiError::Verify("certificate is outside its validity window".into()));
	}
	if !root.validity().is_valid() {
		return Err(PkiError::Verify("root certificate is expired".into()));
	}
	root.verify_signature(None)
		.map_err(|_| PkiError::Verify("root certificate is not self-signed".into()))?;

	// Pick the issuer the leaf actually names.
	let signer = match &intermediate {
		Some(int) if leaf.issuer() == int.subject() => {
			if !int.validity().is_valid() {
				return Err(PkiError::Verify("intermediate certificate is expired".into()));
			}
			int.verify_signature(Some(root.public_key())).map_err(|_| {
				PkiError::Verify("intermediate is not signed by the stored root".into())
			})?;
			int
		}
		_ if leaf.issuer() == root.subject() => &root,
		_ => {
			return Err(PkiError::Verify(
				"certificate issuer matches neither the stored root nor intermediate".into(),
			))
		}
	};

	leaf.verify_signature(Some(signer.public_key()))
		.map_err(|_| PkiError::Verify("signature does not verify against the issuer".into()))?;
	Ok(())
}

/// Splits a PEM bundle into individual PEM blocks.
pub(crate) fn split_pem_blocks(bundle: &str) -> Vec<String> {
	let mut blocks = Vec::new();
	let mut current = String::new();
	for line in bundle.lines() {
		if line.starts_with("-----BEGIN ") {
			current.clear();
		}
		current.push_str(line);
		current.push('\n');
		if line.starts_with("-----END ") {
			blocks.push(std::mem::take(&mut current));
		}
	}
	blocks
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ca::{CaConfig, CertAuthority};

	#[test]
	fn parse_info_of_fresh_root() {
		let root = CertAuthority::create_root(&CaConfig::root("Test Root")).unwrap();
		let info = parse_cert_info(root.cert_pem()).unwrap();
		assert_eq!(info.hostname, "Test Root");
		assert_eq!(info.status, CertStatus::Valid);
		assert_eq!(info.thumbprint.len(), 16);
		assert!(info.days_left > 3000);
	}

	#[test]
	fn split_pem_blocks_counts() {
		let root = CertAuthority::create_root(&CaConfig::root("A")).unwrap();
		let bundle = format!("{}{}", root.cert_pem(), root.cert_pem());
		assert_eq!(split_pem_blocks(&bundle).len(), 2);
	}
}
