use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use rand::Rng;
use rcgen::{
	BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
	KeyUsagePurpose, SerialNumber,
};
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;

use crate::*;

#[derive(Debug, Clone)]
pub struct CaConfig {
	pub organization: Strng,
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
	/// Validity of the CA certificate itself.
	pub validity: Duration,
	/// Validity of issued leaf certificates.
	pub leaf_validity: Duration,
}

impl Default for CaConfig {
	fn default() -> Self {
		CaConfig {
			organization: strng::literal!("SentinelGate"),
			cert_path: PathBuf::from("sentinelgate-ca.pem"),
			key_path: PathBuf::from("sentinelgate-ca.key"),
			validity: Duration::from_secs(10 * 365 * 24 * 60 * 60),
			leaf_validity: Duration::from_secs(24 * 60 * 60),
		}
	}
}

/// Internal certificate authority used to mint leaf certificates for
/// intercepted domains. Created on first boot and persisted as PEM; loaded
/// and reused afterwards.
pub struct CertificateAuthority {
	ca_cert: Certificate,
	ca_key: KeyPair,
	ca_pem: String,
	leaf_validity: Duration,
}

impl CertificateAuthority {
	pub fn load_or_create(config: &CaConfig) -> anyhow::Result<Self> {
		if config.cert_path.exists() && config.key_path.exists() {
			let cert_pem = std::fs::read_to_string(&config.cert_path)?;
			let key_pem = std::fs::read_to_string(&config.key_path)?;
			let ca_key = KeyPair::from_pem(&key_pem)?;
			let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
			// Re-signing with the persisted key reproduces the same public
			// identity; clients keep trusting the on-disk PEM.
			let ca_cert = params.self_signed(&ca_key)?;
			info!(path = %config.cert_path.display(), "loaded existing certificate authority");
			return Ok(CertificateAuthority {
				ca_cert,
				ca_key,
				ca_pem: cert_pem,
				leaf_validity: config.leaf_validity,
			});
		}

		let ca = Self::generate(config)?;
		persist(&config.cert_path, ca.ca_pem.as_bytes())?;
		persist(&config.key_path, ca.ca_key.serialize_pem().as_bytes())?;
		info!(path = %config.cert_path.display(), "generated new certificate authority");
		Ok(ca)
	}

	/// Build a CA without touching disk. Used for tests and ephemeral runs.
	pub fn generate(config: &CaConfig) -> anyhow::Result<Self> {
		let ca_key = KeyPair::generate()?;
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::OrganizationName, config.organization.as_str());
		dn.push(
			DnType::CommonName,
			format!("{} Root CA", config.organization),
		);
		params.distinguished_name = dn;
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		params.key_usages = vec![
			KeyUsagePurpose::KeyCertSign,
			KeyUsagePurpose::CrlSign,
			KeyUsagePurpose::DigitalSignature,
		];
		params.not_before = OffsetDateTime::now_utc() - time::Duration::minutes(5);
		params.not_after = OffsetDateTime::now_utc() + duration(config.validity);
		let ca_cert = params.self_signed(&ca_key)?;
		let ca_pem = ca_cert.pem();
		Ok(CertificateAuthority {
			ca_cert,
			ca_key,
			ca_pem,
			leaf_validity: config.leaf_validity,
		})
	}

	/// PEM of the CA certificate, for distribution to clients that should
	/// trust intercepted connections.
	pub fn ca_pem(&self) -> &str {
		&self.ca_pem
	}

	/// Issue a leaf for `domain` (DNS name or IP literal) with a random
	/// serial, signed by this CA.
	pub fn generate_cert(&self, domain: &str) -> anyhow::Result<IssuedCert> {
		let leaf_key = KeyPair::generate()?;
		let mut params = CertificateParams::new(vec![domain.to_string()])?;
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, domain);
		params.distinguished_name = dn;
		params.serial_number = Some(SerialNumber::from(
			rand::rng().random::<[u8; 16]>().to_vec(),
		));
		params.not_before = OffsetDateTime::now_utc() - time::Duration::minutes(5);
		params.not_after = OffsetDateTime::now_utc() + duration(self.leaf_validity);
		let cert = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;
		Ok(IssuedCert {
			chain: vec![cert.der().clone(), self.ca_cert.der().clone()],
			key: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()).into(),
		})
	}

	/// Issue a leaf and wrap it as a ready-to-serve TLS configuration.
	pub fn server_config(&self, domain: &str) -> anyhow::Result<Arc<ServerConfig>> {
		let issued = self.generate_cert(domain)?;
		let mut config = ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(issued.chain, issued.key)?;
		config.alpn_protocols = vec![b"http/1.1".to_vec()];
		Ok(Arc::new(config))
	}
}

pub struct IssuedCert {
	pub chain: Vec<CertificateDer<'static>>,
	pub key: PrivateKeyDer<'static>,
}

fn duration(d: Duration) -> time::Duration {
	time::Duration::seconds(d.as_secs() as i64)
}

fn persist(path: &PathBuf, bytes: &[u8]) -> anyhow::Result<()> {
	if let Some(parent) = path.parent()
		&& !parent.as_os_str().is_empty()
	{
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(path, bytes)?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
	}
	Ok(())
}

struct CacheEntry {
	config: Arc<ServerConfig>,
	expires_at: Instant,
}

/// Per-domain leaf cache in front of the CA. Read-locked hit path; misses
/// re-check under the write lock so concurrent requests for one domain
/// produce a single certificate.
pub struct CertCache {
	ca: Arc<CertificateAuthority>,
	ttl: Duration,
	entries: RwLock<HashMap<Strng, CacheEntry>>,
}

impl CertCache {
	pub fn new(ca: Arc<CertificateAuthority>, ttl: Duration) -> Self {
		CertCache {
			ca,
			ttl,
			entries: RwLock::new(HashMap::new()),
		}
	}

	pub fn get_cert(&self, domain: &Strng) -> anyhow::Result<Arc<ServerConfig>> {
		{
			let entries = self.entries.read();
			if let Some(entry) = entries.get(domain)
				&& entry.expires_at > Instant::now()
			{
				return Ok(entry.config.clone());
			}
		}

		let mut entries = self.entries.write();
		if let Some(entry) = entries.get(domain)
			&& entry.expires_at > Instant::now()
		{
			return Ok(entry.config.clone());
		}
		debug!(domain = domain.as_str(), "issuing leaf certificate");
		let config = self.ca.server_config(domain)?;
		entries.insert(
			domain.clone(),
			CacheEntry {
				config: config.clone(),
				expires_at: Instant::now() + self.ttl,
			},
		);
		Ok(config)
	}

	/// Drop every cached leaf. Used when the CA rotates.
	pub fn clear(&self) {
		self.entries.write().clear();
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
#[path = "ca_tests.rs"]
mod tests;
