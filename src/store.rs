//! Durable leaf certificate cache backed by SQLite
//!
//! Leaf certificates and their keys are kept in two tables keyed by host. The
//! fingerprint of the root that signed them is recorded alongside; opening the
//! store with a different root drops every cached leaf.

use crate::ca::{CertificateAuthority, LeafCertificate};
use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS root_ca (
  id INTEGER PRIMARY KEY CHECK (id = 0),
  fingerprint TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS leaf_certs (
  host TEXT PRIMARY KEY,
  der BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS leaf_keys (
  host TEXT PRIMARY KEY,
  pem TEXT NOT NULL
);
";

/// Persistent host → leaf certificate map
#[derive(Clone)]
pub struct CertStore {
  conn: Arc<Mutex<Connection>>,
}

impl CertStore {
  /// Open (or create) the store at `path` for leaves signed by `ca`.
  pub fn open(path: impl AsRef<Path>, ca: &CertificateAuthority) -> Result<Self> {
    let conn = Connection::open(path.as_ref())?;
    Self::init(conn, ca)
  }

  /// A store that lives only as long as the process
  pub fn in_memory(ca: &CertificateAuthority) -> Result<Self> {
    Self::init(Connection::open_in_memory()?, ca)
  }

  fn init(mut conn: Connection, ca: &CertificateAuthority) -> Result<Self> {
    conn.execute_batch(SCHEMA)?;

    let tx = conn.transaction()?;
    let stored: Option<String> = tx
      .query_row("SELECT fingerprint FROM root_ca WHERE id = 0", [], |row| {
        row.get(0)
      })
      .optional()?;
    if stored.as_deref() != Some(ca.fingerprint()) {
      if stored.is_some() {
        tracing::info!("Root CA changed, dropping cached leaf certificates");
      }
      tx.execute("DELETE FROM leaf_certs", [])?;
      tx.execute("DELETE FROM leaf_keys", [])?;
      tx.execute(
        "INSERT OR REPLACE INTO root_ca (id, fingerprint) VALUES (0, ?1)",
        params![ca.fingerprint()],
      )?;
    }
    tx.commit()?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  fn conn(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Look up a usable leaf for `host`.
  ///
  /// Read failures, undecodable rows and expired certificates are all
  /// reported as a miss.
  pub fn lookup(&self, host: &str) -> Option<LeafCertificate> {
    let row = self
      .conn()
      .query_row(
        "SELECT c.der, k.pem FROM leaf_certs c \
         JOIN leaf_keys k ON c.host = k.host WHERE c.host = ?1",
        params![host],
        |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
      )
      .optional();

    let (der, pem) = match row {
      Ok(Some(row)) => row,
      Ok(None) => return None,
      Err(e) => {
        tracing::warn!("Failed to read cached certificate for {}: {}", host, e);
        return None;
      }
    };

    match LeafCertificate::from_parts(der, pem) {
      Ok(leaf) if leaf.is_expired() => {
        tracing::debug!("Cached certificate for {} has expired", host);
        None
      }
      Ok(leaf) => Some(leaf),
      Err(e) => {
        tracing::warn!("Discarding unreadable cached certificate for {}: {}", host, e);
        None
      }
    }
  }

  /// Persist `leaf` as the certificate for `host`, replacing any previous one.
  pub fn store(&self, host: &str, leaf: &LeafCertificate) -> Result<()> {
    let der: &[u8] = leaf.cert_der();
    let mut conn = self.conn();
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR REPLACE INTO leaf_certs (host, der) VALUES (?1, ?2)",
      params![host, der],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO leaf_keys (host, pem) VALUES (?1, ?2)",
      params![host, leaf.key_pem()],
    )?;
    tx.commit()?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use time::{Duration, OffsetDateTime};

  async fn authority(dir: &tempfile::TempDir, name: &str) -> CertificateAuthority {
    CertificateAuthority::generate(
      dir.path().join(format!("{}.crt", name)),
      dir.path().join(format!("{}.key", name)),
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn stored_leaf_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority(&dir, "root").await;
    let path = dir.path().join("certstore.db");

    let leaf = ca.issue_leaf("example.test").unwrap();
    {
      let store = CertStore::open(&path, &ca).unwrap();
      assert!(store.lookup("example.test").is_none());
      store.store("example.test", &leaf).unwrap();
      // Storing twice is a replace, not an error
      store.store("example.test", &leaf).unwrap();
    }

    let store = CertStore::open(&path, &ca).unwrap();
    let cached = store.lookup("example.test").unwrap();
    assert_eq!(cached.cert_der(), leaf.cert_der());
    assert_eq!(cached.key_pem(), leaf.key_pem());
  }

  #[tokio::test]
  async fn new_root_invalidates_cached_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let first = authority(&dir, "first").await;
    let second = authority(&dir, "second").await;
    let path = dir.path().join("certstore.db");

    let store = CertStore::open(&path, &first).unwrap();
    store
      .store("example.test", &first.issue_leaf("example.test").unwrap())
      .unwrap();
    drop(store);

    let store = CertStore::open(&path, &second).unwrap();
    assert!(store.lookup("example.test").is_none());
    drop(store);

    // Going back to the first root does not resurrect anything either
    let store = CertStore::open(&path, &first).unwrap();
    assert!(store.lookup("example.test").is_none());
  }

  #[tokio::test]
  async fn expired_leaf_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority(&dir, "root").await;
    let store = CertStore::in_memory(&ca).unwrap();

    let now = OffsetDateTime::now_utc();
    let leaf = ca
      .issue_leaf_with_validity("old.test", now - Duration::days(2), now - Duration::days(1))
      .unwrap();
    store.store("old.test", &leaf).unwrap();
    assert!(store.lookup("old.test").is_none());
  }

  #[tokio::test]
  async fn corrupt_row_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority(&dir, "root").await;
    let store = CertStore::in_memory(&ca).unwrap();

    store
      .conn()
      .execute_batch(
        "INSERT INTO leaf_certs (host, der) VALUES ('bad.test', x'00010203');
         INSERT INTO leaf_keys (host, pem) VALUES ('bad.test', 'garbage');",
      )
      .unwrap();
    assert!(store.lookup("bad.test").is_none());
  }

  #[tokio::test]
  async fn certificate_without_key_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let ca = authority(&dir, "root").await;
    let store = CertStore::in_memory(&ca).unwrap();
    let leaf = ca.issue_leaf("half.test").unwrap();
    let der: &[u8] = leaf.cert_der();

    store
      .conn()
      .execute(
        "INSERT INTO leaf_certs (host, der) VALUES (?1, ?2)",
        params!["half.test", der],
      )
      .unwrap();
    assert!(store.lookup("half.test").is_none());
  }
}
