//! rustls configuration shared by the client-facing and origin-facing sides

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

/// Decrypted traffic is always spoken as HTTP/1.1.
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// The process-wide provider if one was installed, ring otherwise.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(tokio_rustls::rustls::crypto::ring::default_provider()))
}

/// Build the server side configuration presented to an intercepted client.
pub fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}

/// Build a client configuration trusting exactly `roots`.
pub fn client_config_with_roots(roots: RootCertStore) -> Result<ClientConfig> {
  let mut config = ClientConfig::builder_with_provider(crypto_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("Invalid TLS versions: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}

/// Client configuration used when dialing TLS origins.
///
/// Trusts the platform's native roots plus every certificate found in
/// `extra_roots` (PEM files).
pub fn upstream_client_config(extra_roots: &[PathBuf]) -> Result<ClientConfig> {
  let mut roots = RootCertStore::empty();
  let native = rustls_native_certs::load_native_certs();
  for error in &native.errors {
    tracing::warn!("Failed to load a native root certificate: {}", error);
  }
  let (added, ignored) = roots.add_parsable_certificates(native.certs);
  tracing::debug!("Loaded {} native roots ({} ignored)", added, ignored);

  for path in extra_roots {
    let pem = std::fs::read(path).map_err(|e| {
      Error::certificate_error(format!("Failed to read {}: {}", path.display(), e))
    })?;
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
      let cert = cert.map_err(|e| {
        Error::certificate_error(format!("Failed to parse {}: {}", path.display(), e))
      })?;
      roots
        .add(cert)
        .map_err(|e| Error::certificate_error(format!("Rejected root certificate: {}", e)))?;
    }
  }
  client_config_with_roots(roots)
}

/// Strip the brackets `http::Uri` keeps around IPv6 literals.
pub(crate) fn bare_host(host: &str) -> &str {
  host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host)
}

/// SNI / verification name for an origin host.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(bare_host(host).to_string())
    .map_err(|e| Error::invalid_request(format!("Invalid server name {}: {}", host, e)))
}
