use std::{
	fs,
	io::{Read, Write},
	os::unix::fs::PermissionsExt,
	path::{Path, PathBuf},
	str::FromStr,
};

use age::armor::{ArmoredReader, ArmoredWriter, Format};
use anyhow::{anyhow, bail, Context, Result};
use tracing::info;

use crate::{
	ca::{CaConfig, CertAuthority},
	issue::IssuedCert,
	Issuer, PkiError,
};

/// Filesystem-backed certificate store on the control plane.
///
/// ```text
/// <root>/ca/root.crt              public PEM, world-readable
/// <root>/ca/root.key.age          armored age ciphertext
/// <root>/ca/intermediate.crt      two-tier only
/// <root>/ca/intermediate.key.age
/// <root>/ca/chain.crt             intermediate || root
/// <root>/hosts/<host>/<name>.crt
/// <root>/hosts/<host>/<name>.chain.crt
/// <root>/hosts/<host>/<name>.key.age
/// ```
pub struct PkiStore {
	root: PathBuf,
	recipients: Vec<String>,
	identity_files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StoredCert {
	pub host: String,
	pub name: String,
	pub path: PathBuf,
}

impl PkiStore {
	pub fn new(
		root: impl Into<PathBuf>,
		recipients: Vec<String>,
		identity_files: Vec<PathBuf>,
	) -> Self {
		Self {
			root: root.into(),
			recipients,
			identity_files,
		}
	}

	pub fn ca_dir(&self) -> PathBuf {
		self.root.join("ca")
	}

	pub fn hosts_dir(&self) -> PathBuf {
		self.root.join("hosts")
	}

	pub fn has_root(&self) -> bool {
		self.ca_dir().join("root.crt").is_file()
	}

	pub fn has_intermediate(&self) -> bool {
		self.ca_dir().join("intermediate.crt").is_file()
	}

	pub fn init_root(&self, cfg: &CaConfig) -> Result<CertAuthority> {
		if self.has_root() {
			bail!("root CA already exists at {:?}", self.ca_dir());
		}
		let root = CertAuthority::create_root(cfg)?;
		let dir = self.ca_dir();
		write_atomic(&dir.join("root.crt"), root.cert_pem().as_bytes(), 0o644)?;
		write_atomic(
			&dir.join("root.key.age"),
			self.encrypt(root.key_pem().as_bytes())?.as_bytes(),
			0o600,
		)?;
		info!(cn = cfg.common_name, "initialized root CA");
		Ok(root)
	}

	pub fn init_intermediate(&self, cfg: &CaConfig) -> Result<CertAuthority> {
		let root = self.load_authority("root")?;
		if self.has_intermediate() {
			bail!("intermediate CA already exists at {:?}", self.ca_dir());
		}
		let intermediate = CertAuthority::create_intermediate(&root, cfg)?;
		let dir = self.ca_dir();
		write_atomic(
			&dir.join("intermediate.crt"),
			intermediate.cert_pem().as_bytes(),
			0o644,
		)?;
		write_atomic(
			&dir.join("intermediate.key.age"),
			self.encrypt(intermediate.key_pem().as_bytes())?.as_bytes(),
			0o600,
		)?;
		let chain = format!("{}{}", intermediate.cert_pem(), root.cert_pem());
		write_atomic(&dir.join("chain.crt"), chain.as_bytes(), 0o644)?;
		info!(cn = cfg.common_name, "initialized intermediate CA");
		Ok(intermediate)
	}

	fn load_authority(&self, stem: &str) -> Result<CertAuthority> {
		let dir = self.ca_dir();
		let cert_pem = fs::read_to_string(dir.join(format!("{stem}.crt")))
			.with_context(|| format!("missing {stem}.crt, initialize the CA first"))?;
		let armored = fs::read_to_string(dir.join(format!("{stem}.key.age")))?;
		let key_pem = self.decrypt(&armored)?;
		Ok(CertAuthority::load(
			&cert_pem,
			std::str::from_utf8(&key_pem).context("decrypted key is not UTF-8 PEM")?,
		)?)
	}

	pub fn load_issuer(&self) -> Result<Issuer> {
		let root = self.load_authority("root")?;
		let intermediate = if self.has_intermediate() {
			Some(self.load_authority("intermediate")?)
		} else {
			None
		};
		Ok(Issuer { root, intermediate })
	}

	pub fn root_cert_pem(&self) -> Result<String> {
		Ok(fs::read_to_string(self.ca_dir().join("root.crt"))?)
	}

	pub fn intermediate_cert_pem(&self) -> Result<Option<String>> {
		let path = self.ca_dir().join("intermediate.crt");
		if path.is_file() {
			Ok(Some(fs::read_to_string(path)?))
		} else {
			Ok(None)
		}
	}

	/// The trust bundle hosts verify against: `chain.crt` when two-tier,
	/// the bare root otherwise.
	pub fn ca_bundle_pem(&self) -> Result<String> {
		let chain = self.ca_dir().join("chain.crt");
		if chain.is_file() {
			Ok(fs::read_to_string(chain)?)
		} else {
			self.root_cert_pem()
		}
	}

	pub fn host_cert_path(&self, host: &str, name: &str) -> PathBuf {
		self.hosts_dir().join(host).join(format!("{name}.crt"))
	}

	pub fn save_issued(&self, cert: &IssuedCert) -> Result<()> {
		let dir = self.hosts_dir().join(&cert.hostname);
		write_atomic(
			&dir.join(format!("{}.crt", cert.name)),
			cert.cert_pem.as_bytes(),
			0o644,
		)?;
		if let Some(chain) = &cert.chain_pem {
			write_atomic(
				&dir.join(format!("{}.chain.crt", cert.name)),
				chain.as_bytes(),
				0o644,
			)?;
		}
		write_atomic(
			&dir.join(format!("{}.key.age", cert.name)),
			self.encrypt(cert.key_pem.as_bytes())?.as_bytes(),
			0o600,
		)?;
		Ok(())
	}

	pub fn load_cert_pem(&self, host: &str, name: &str) -> Result<String> {
		Ok(fs::read_to_string(self.host_cert_path(host, name))?)
	}

	pub fn load_chain_pem(&self, host: &str, name: &str) -> Result<Option<String>> {
		let path = self.hosts_dir().join(host).join(format!("{name}.chain.crt"));
		if path.is_file() {
			Ok(Some(fs::read_to_string(path)?))
		} else {
			Ok(None)
		}
	}

	pub fn load_key_pem(&self, host: &str, name: &str) -> Result<String> {
		let armored =
			fs::read_to_string(self.hosts_dir().join(host).join(format!("{name}.key.age")))?;
		let plain = self.decrypt(&armored)?;
		String::from_utf8(plain).context("decrypted key is not UTF-8 PEM")
	}

	/// Enumerates every issued host certificate. `.chain.crt` bundles are
	/// not certificates of their own and are skipped.
	pub fn list_host_certs(&self) -> Result<Vec<StoredCert>> {
		let mut out = Vec::new();
		let hosts_dir = self.hosts_dir();
		if !hosts_dir.is_dir() {
			return Ok(out);
		}
		for host_entry in fs::read_dir(&hosts_dir)? {
			let host_entry = host_entry?;
			if !host_entry.file_type()?.is_dir() {
				continue;
			}
			let host = host_entry.file_name().to_string_lossy().into_owned();
			for entry in fs::read_dir(host_entry.path())? {
				let entry = entry?;
				let file_name = entry.file_name().to_string_lossy().into_owned();
				let Some(stem) = file_name.strip_suffix(".crt") else {
					continue;
				};
				if stem.ends_with(".chain") {
					continue;
				}
				out.push(StoredCert {
					host: host.clone(),
					name: stem.to_owned(),
					path: entry.path(),
				});
			}
		}
		out.sort_by(|a, b| (&a.host, &a.name).cmp(&(&b.host, &b.name)));
		Ok(out)
	}

	pub fn encrypt(&self, plain: &[u8]) -> Result<String> {
		if self.recipients.is_empty() {
			return Err(PkiError::NoRecipients.into());
		}
		let recipients = self
			.recipients
			.iter()
			.map(|r| parse_recipient(r))
			.collect::<Result<Vec<_>>>()?;
		let encryptor = age::Encryptor::with_recipients(
			recipients.iter().map(|r| &**r as &dyn age::Recipient),
		)
		.map_err(|e| anyhow!("age encryption setup failed: {e}"))?;
		let mut out = Vec::new();
		let armor = ArmoredWriter::wrap_output(&mut out, Format::AsciiArmor)?;
		let mut writer = encryptor.wrap_output(armor)?;
		writer.write_all(plain)?;
		writer.finish()?.finish()?;
		Ok(String::from_utf8(out).expect("armored age output is ASCII"))
	}

	pub fn decrypt(&self, armored: &str) -> Result<Vec<u8>> {
		let identities = self.load_identities()?;
		let decryptor = age::Decryptor::new(ArmoredReader::new(armored.as_bytes()))
			.map_err(|e| PkiError::Decrypt(e.to_string()))?;
		let mut reader = decryptor
			.decrypt(identities.iter().map(|i| &**i as &dyn age::Identity))
			.map_err(|e| PkiError::Decrypt(e.to_string()))?;
		let mut plain = Vec::new();
		reader.read_to_end(&mut plain)?;
		Ok(plain)
	}

	fn load_identities(&self) -> Result<Vec<Box<dyn age::Identity>>> {
		let mut identities: Vec<Box<dyn age::Identity>> = Vec::new();
		for path in &self.identity_files {
			let content = fs::read(path)
				.with_context(|| format!("failed to read identity file {path:?}"))?;
			let text = String::from_utf8_lossy(&content);
			if text.contains("AGE-SECRET-KEY-") {
				for line in text.lines() {
					let line = line.trim();
					if line.starts_with("AGE-SECRET-KEY-") {
						let identity = age::x25519::Identity::from_str(line)
							.map_err(|e| anyhow!("bad age identity in {path:?}: {e}"))?;
						identities.push(Box::new(identity));
					}
				}
			} else {
				// SSH private keys are valid age identities too.
				let identity = age::ssh::Identity::from_buffer(
					&mut std::io::Cursor::new(content),
					Some(path.to_string_lossy().into_owned()),
				)
				.map_err(|e| anyhow!("bad ssh identity in {path:?}: {e}"))?;
				identities.push(Box::new(identity));
			}
		}
		if identities.is_empty() {
			bail!("no age identities configured, cannot decrypt private keys");
		}
		Ok(identities)
	}
}

fn parse_recipient(s: &str) -> Result<Box<dyn age::Recipient + Send>> {
	if let Ok(r) = age::x25519::Recipient::from_str(s) {
		return Ok(Box::new(r));
	}
	if let Ok(r) = age::ssh::Recipient::from_str(s) {
		return Ok(Box::new(r));
	}
	bail!("unrecognized age recipient: {s}")
}

/// Atomic write: tempfile in the destination directory, then persist.
fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
	let dir = path
		.parent()
		.ok_or_else(|| anyhow!("path {path:?} has no parent"))?;
	fs::create_dir_all(dir)?;
	let mut tmp = tempfile::NamedTempFile::new_in(dir)
		.with_context(|| format!("failed to create tempfile next to {path:?}"))?;
	tmp.write_all(bytes)?;
	tmp.flush()?;
	fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
	tmp.persist(path)
		.with_context(|| format!("failed to persist {path:?}"))?;
	Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
	use age::secrecy::ExposeSecret;

	use super::*;
	use crate::issue::{issue_cert, IssueRequest};

	/// Store in a tempdir with a fresh x25519 identity, used across the
	/// crate's tests.
	pub(crate) fn test_store(dir: &Path) -> PkiStore {
		let identity = age::x25519::Identity::generate();
		let identity_path = dir.join("identity.txt");
		fs::write(
			&identity_path,
			format!("{}\n", identity.to_string().expose_secret()),
		)
		.unwrap();
		PkiStore::new(
			dir.join("secrets/pki"),
			vec![identity.to_public().to_string()],
			vec![identity_path],
		)
	}

	#[test]
	fn encrypt_decrypt_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(dir.path());
		let armored = store.encrypt(b"top secret").unwrap();
		assert!(armored.starts_with("-----BEGIN AGE ENCRYPTED FILE-----"));
		assert_eq!(store.decrypt(&armored).unwrap(), b"top secret");
	}

	#[test]
	fn init_and_reload_two_tier() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(dir.path());
		store.init_root(&CaConfig::root("Test Root")).unwrap();
		store
			.init_intermediate(&CaConfig::intermediate("Test Int"))
			.unwrap();

		let issuer = store.load_issuer().unwrap();
		assert!(issuer.intermediate.is_some());

		let issued = issue_cert(&issuer, &IssueRequest::new("web1.example")).unwrap();
		store.save_issued(&issued).unwrap();

		let listed = store.list_host_certs().unwrap();
		assert_eq!(listed.len(), 1);
		assert_eq!(listed[0].host, "web1.example");
		assert_eq!(listed[0].name, "host");

		// The chain bundle exists but is not enumerated as a cert.
		assert!(store.load_chain_pem("web1.example", "host").unwrap().is_some());
		assert_eq!(
			store.load_key_pem("web1.example", "host").unwrap(),
			issued.key_pem
		);
	}

	#[test]
	fn init_root_refuses_overwrite() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(dir.path());
		store.init_root(&CaConfig::root("Once")).unwrap();
		assert!(store.init_root(&CaConfig::root("Twice")).is_err());
	}
}
