//! On-demand leaf certificates for intercepted hosts
//!
//! Lookups go through an in-memory cache first, then the durable store, and
//! only then mint a new certificate. Concurrent requests for the same host
//! share a single issuance.

use crate::ca::{CertificateAuthority, LeafCertificate};
use crate::error::{Error, Result};
use crate::store::CertStore;
use crate::tls;
use moka::future::Cache;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ServerConfig;

/// A ready-to-serve TLS identity for one host
pub struct LeafIdentity {
  config: Arc<ServerConfig>,
  cert_der: CertificateDer<'static>,
  not_after: OffsetDateTime,
}

impl LeafIdentity {
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.config.clone()
  }

  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  fn is_expired(&self) -> bool {
    self.not_after <= OffsetDateTime::now_utc()
  }
}

/// Issues and caches leaf certificates signed by the root CA
#[derive(Clone)]
pub struct CertificateManager {
  ca: Arc<CertificateAuthority>,
  store: CertStore,
  cache: Cache<String, Arc<LeafIdentity>>,
}

impl CertificateManager {
  pub fn new(ca: Arc<CertificateAuthority>, store: CertStore, capacity: u64) -> Self {
    Self {
      ca,
      store,
      cache: Cache::builder().max_capacity(capacity).build(),
    }
  }

  pub fn authority(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }

  /// Get the TLS identity presented to clients connecting to `host`.
  pub async fn server_identity(&self, host: &str) -> Result<Arc<LeafIdentity>> {
    let host = tls::bare_host(host).to_string();

    if let Some(identity) = self.cache.get(&host).await {
      if !identity.is_expired() {
        return Ok(identity);
      }
      self.cache.invalidate(&host).await;
    }

    self
      .cache
      .try_get_with(host.clone(), self.load_or_issue(host.clone()))
      .await
      .map_err(|e| Error::certificate_error(format!("No certificate for {}: {}", host, e)))
  }

  async fn load_or_issue(&self, host: String) -> Result<Arc<LeafIdentity>> {
    let store = self.store.clone();
    let key = host.clone();
    let cached = tokio::task::spawn_blocking(move || store.lookup(&key))
      .await
      .map_err(|e| Error::other(format!("Certificate lookup task failed: {}", e)))?;

    let leaf = match cached {
      Some(leaf) => {
        tracing::debug!("Using stored certificate for {}", host);
        leaf
      }
      None => {
        let ca = self.ca.clone();
        let name = host.clone();
        let leaf = tokio::task::spawn_blocking(move || ca.issue_leaf(&name))
          .await
          .map_err(|e| Error::other(format!("Certificate issue task failed: {}", e)))??;
        tracing::debug!("Issued certificate for {}", host);

        let store = self.store.clone();
        let (key, saved) = (host.clone(), leaf.clone());
        match tokio::task::spawn_blocking(move || store.store(&key, &saved)).await {
          Ok(Ok(())) => {}
          Ok(Err(e)) => tracing::warn!("Failed to persist certificate for {}: {}", host, e),
          Err(e) => tracing::warn!("Certificate persist task failed for {}: {}", host, e),
        }
        leaf
      }
    };

    self.identity(leaf).map(Arc::new)
  }

  fn identity(&self, leaf: LeafCertificate) -> Result<LeafIdentity> {
    let chain = vec![leaf.cert_der().clone(), self.ca.cert_der().clone()];
    let config = tls::server_config(chain, leaf.private_key()?)?;
    Ok(LeafIdentity {
      config: Arc::new(config),
      cert_der: leaf.cert_der().clone(),
      not_after: leaf.not_after(),
    })
  }
}
