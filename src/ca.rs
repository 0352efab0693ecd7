//! Certificate Authority (CA) management for MITM interception
//!
//! The root certificate and key are loaded once from PEM files and stay
//! read-only for the lifetime of the process. Leaf certificates are minted on
//! demand for each intercepted host and signed with the root key.

use crate::error::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Organization stamped on the generated root
const ROOT_ORGANIZATION: &str = "Relayjack";
/// Organization stamped on every issued leaf
const LEAF_ORGANIZATION: &str = "Relayjack MITM";
/// Root validity period (10 years)
const ROOT_TTL_DAYS: i64 = 3650;
/// Leaf validity period (10 years)
const LEAF_TTL_DAYS: i64 = 3650;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// Root certificate authority used to sign leaf certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  cert_der: CertificateDer<'static>,
  /// Root CA certificate in PEM format
  cert_pem: String,
  /// SHA-256 over the root certificate and key PEM
  fingerprint: String,
}

impl CertificateAuthority {
  /// Load the root certificate and private key from PEM files.
  ///
  /// Missing or unparseable files are an error; nothing is generated here.
  pub async fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    let cert_pem = fs::read_to_string(cert_path).await.map_err(|e| {
      Error::certificate_error(format!(
        "Failed to read CA cert {}: {}",
        cert_path.display(),
        e
      ))
    })?;
    let key_pem = fs::read_to_string(key_path).await.map_err(|e| {
      Error::certificate_error(format!(
        "Failed to read CA key {}: {}",
        key_path.display(),
        e
      ))
    })?;
    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Build the authority from in-memory PEM text
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    // Parse PEM to DER for rustls
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(cert_pem.as_bytes());
    hasher.update(key_pem.as_bytes());
    let fingerprint = format!("{:x}", hasher.finalize());

    Ok(Self {
      issuer,
      cert_der,
      cert_pem: cert_pem.to_string(),
      fingerprint,
    })
  }

  /// Generate a new self-signed root, write it to disk and load it
  pub async fn generate(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Relayjack Root CA");
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path.as_ref()).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    cert_file.flush().await?;

    let mut key_file = fs::File::create(key_path.as_ref()).await?;
    key_file.write_all(key_pem.as_bytes()).await?;
    key_file.flush().await?;

    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Issue a leaf certificate for `common_name`, valid for ten years.
  ///
  /// IP literals get an IP SAN; TLS clients only accept IP SANs when
  /// verifying IP destinations.
  pub fn issue_leaf(&self, common_name: &str) -> Result<LeafCertificate> {
    let now = OffsetDateTime::now_utc();
    self.issue_leaf_with_validity(
      common_name,
      now - Duration::seconds(NOT_BEFORE_OFFSET),
      now + Duration::days(LEAF_TTL_DAYS),
    )
  }

  pub(crate) fn issue_leaf_with_validity(
    &self,
    common_name: &str,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
  ) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();

    // Time-derived serial, low bits randomized so concurrent issues never collide
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() as u64;
    let serial = (nanos & !0xffff) | u64::from(rand::thread_rng().gen::<u16>());
    params.serial_number = Some(serial.into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    params.subject_alt_names = match common_name.parse::<IpAddr>() {
      Ok(ip) => vec![SanType::IpAddress(ip)],
      Err(_) => vec![SanType::DnsName(common_name.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", common_name))
      })?)],
    };

    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_before = not_before;
    params.not_after = not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign leaf cert: {}", e)))?;

    Ok(LeafCertificate {
      cert_der: cert.der().clone(),
      key_pem: key_pair.serialize_pem(),
      not_after,
    })
  }

  /// Root certificate in PEM format, for installation into client trust stores
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Root certificate in DER format
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Identifies this exact certificate + key pair
  pub fn fingerprint(&self) -> &str {
    &self.fingerprint
  }
}

/// A signed leaf certificate together with its private key
#[derive(Clone, Debug)]
pub struct LeafCertificate {
  cert_der: CertificateDer<'static>,
  key_pem: String,
  not_after: OffsetDateTime,
}

impl LeafCertificate {
  /// Rebuild a leaf from stored bytes, reading the expiry from the certificate itself
  pub fn from_parts(cert_der: Vec<u8>, key_pem: String) -> Result<Self> {
    let not_after = {
      let (_, cert) = x509_parser::parse_x509_certificate(&cert_der)
        .map_err(|e| Error::certificate_error(format!("Failed to parse leaf cert: {}", e)))?;
      OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
        .map_err(|e| Error::certificate_error(format!("Invalid not_after: {}", e)))?
    };
    Ok(Self {
      cert_der: CertificateDer::from(cert_der),
      key_pem,
      not_after,
    })
  }

  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  pub fn key_pem(&self) -> &str {
    &self.key_pem
  }

  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }

  /// True once the certificate's not-valid-after moment has passed
  pub fn is_expired(&self) -> bool {
    self.not_after <= OffsetDateTime::now_utc()
  }

  /// Decode the PEM key into the form rustls expects
  pub fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
      .map_err(|e| Error::certificate_error(format!("Failed to parse leaf key: {}", e)))?
      .ok_or_else(|| Error::certificate_error("No private key found in PEM"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use x509_parser::extensions::GeneralName;
  use x509_parser::parse_x509_certificate;

  async fn authority() -> (tempfile::TempDir, CertificateAuthority) {
    let dir = tempfile::tempdir().unwrap();
    let ca =
      CertificateAuthority::generate(dir.path().join("root.crt"), dir.path().join("root.key"))
        .await
        .unwrap();
    (dir, ca)
  }

  #[tokio::test]
  async fn generated_root_round_trips_through_disk() {
    let (dir, ca) = authority().await;
    let loaded =
      CertificateAuthority::load(dir.path().join("root.crt"), dir.path().join("root.key"))
        .await
        .unwrap();
    assert_eq!(ca.fingerprint(), loaded.fingerprint());
    assert_eq!(ca.cert_der(), loaded.cert_der());
    assert!(loaded.cert_pem().contains("BEGIN CERTIFICATE"));
  }

  #[tokio::test]
  async fn missing_root_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result =
      CertificateAuthority::load(dir.path().join("nope.crt"), dir.path().join("nope.key")).await;
    assert!(matches!(result, Err(Error::CertificateError(_))));
  }

  #[tokio::test]
  async fn garbage_root_is_an_error() {
    let result = CertificateAuthority::from_pem("not a cert", "not a key");
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn leaf_for_hostname_is_signed_by_root() {
    let (_dir, ca) = authority().await;
    let leaf = ca.issue_leaf("example.test").unwrap();

    let (_, root) = parse_x509_certificate(ca.cert_der().as_ref()).unwrap();
    let (_, cert) = parse_x509_certificate(leaf.cert_der().as_ref()).unwrap();

    let cn = cert
      .subject()
      .iter_common_name()
      .next()
      .and_then(|cn| cn.as_str().ok())
      .unwrap();
    assert_eq!(cn, "example.test");

    let san = cert.subject_alternative_name().unwrap().unwrap();
    assert!(san
      .value
      .general_names
      .iter()
      .any(|name| matches!(name, GeneralName::DNSName(value) if *value == "example.test")));

    assert_eq!(cert.issuer(), root.subject());
    cert.verify_signature(Some(root.public_key())).unwrap();
    assert!(cert.validity().is_valid());
    assert!(!leaf.is_expired());
  }

  #[tokio::test]
  async fn leaf_for_ip_literal_carries_ip_san() {
    let (_dir, ca) = authority().await;
    let leaf = ca.issue_leaf("127.0.0.1").unwrap();
    let (_, cert) = parse_x509_certificate(leaf.cert_der().as_ref()).unwrap();
    let san = cert.subject_alternative_name().unwrap().unwrap();
    assert!(san
      .value
      .general_names
      .iter()
      .any(|name| matches!(name, GeneralName::IPAddress(bytes) if *bytes == [127, 0, 0, 1])));
  }

  #[tokio::test]
  async fn leaf_key_matches_rustls_expectations() {
    let (_dir, ca) = authority().await;
    let leaf = ca.issue_leaf("example.test").unwrap();
    let key = leaf.private_key().unwrap();
    crate::tls::server_config(vec![leaf.cert_der().clone(), ca.cert_der().clone()], key).unwrap();
  }

  #[tokio::test]
  async fn stored_parts_restore_expiry() {
    let (_dir, ca) = authority().await;
    let leaf = ca.issue_leaf("example.test").unwrap();
    let restored =
      LeafCertificate::from_parts(leaf.cert_der().to_vec(), leaf.key_pem().to_string()).unwrap();
    assert_eq!(
      restored.not_after().unix_timestamp(),
      leaf.not_after().unix_timestamp()
    );
  }
}
