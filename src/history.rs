//! Batched persistence of completed sessions
//!
//! Records are pushed without blocking into a bounded channel. A background
//! task collects them and hands everything received during one flush interval
//! to a [`HistoryWriter`] in a single call. Intervals with nothing to write
//! produce no write at all.

use crate::error::{Error, Result};
use crate::session::{ObservationHook, SessionContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;

/// Flush interval used by the binary
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Summary of one completed request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
  pub host: String,
  pub port: u16,
  pub method: String,
  pub path: String,
  /// Transferred bytes
  pub size: u64,
  pub duration_ms: u64,
  #[serde(with = "time::serde::rfc3339")]
  pub time: OffsetDateTime,
  pub scheme: String,
}

impl From<&SessionContext> for HistoryRecord {
  fn from(session: &SessionContext) -> Self {
    let request = &session.request;
    Self {
      host: request.host.clone(),
      port: request.port,
      method: request.method.to_string(),
      path: request.uri.path().to_string(),
      size: session.transfer_bytes,
      duration_ms: u64::try_from(session.elapsed.as_millis()).unwrap_or(u64::MAX),
      time: session.started_at,
      scheme: if request.tls { "https" } else { "http" }.to_string(),
    }
  }
}

/// Storage backend for history batches
#[async_trait]
pub trait HistoryWriter: Send + 'static {
  async fn write_batch(&mut self, records: &[HistoryRecord]) -> Result<()>;
}

/// Appends one JSON object per record to a file
pub struct JsonLinesWriter {
  file: File,
}

impl JsonLinesWriter {
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(path.as_ref())
      .await?;
    Ok(Self { file })
  }
}

#[async_trait]
impl HistoryWriter for JsonLinesWriter {
  async fn write_batch(&mut self, records: &[HistoryRecord]) -> Result<()> {
    let mut buf = Vec::new();
    for record in records {
      serde_json::to_writer(&mut buf, record)
        .map_err(|e| Error::other(format!("Failed to encode history record: {}", e)))?;
      buf.push(b'\n');
    }
    self.file.write_all(&buf).await?;
    self.file.flush().await?;
    Ok(())
  }
}

/// Handle for pushing records to the background writer
#[derive(Clone)]
pub struct HistorySink {
  tx: mpsc::Sender<HistoryRecord>,
}

impl HistorySink {
  /// Start the batching task. It runs until every handle has been dropped,
  /// then writes whatever is still pending.
  pub fn spawn<W: HistoryWriter>(writer: W, capacity: usize, interval: Duration) -> Self {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(persist(writer, rx, interval));
    Self { tx }
  }

  /// Queue a record; dropped with a warning if the queue is full.
  pub fn push(&self, record: HistoryRecord) {
    match self.tx.try_send(record) {
      Ok(()) => {}
      Err(TrySendError::Full(record)) => {
        tracing::warn!("History queue full, dropping {} {}", record.method, record.host)
      }
      Err(TrySendError::Closed(_)) => tracing::debug!("History writer has stopped"),
    }
  }

  pub fn hook(&self) -> Arc<dyn ObservationHook> {
    Arc::new(self.clone())
  }
}

impl ObservationHook for HistorySink {
  fn on_complete(&self, session: &SessionContext) {
    self.push(HistoryRecord::from(session));
  }
}

async fn persist<W: HistoryWriter>(
  mut writer: W,
  mut rx: mpsc::Receiver<HistoryRecord>,
  interval: Duration,
) {
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // The first tick completes immediately
  ticker.tick().await;

  let mut batch = Vec::new();
  loop {
    tokio::select! {
      record = rx.recv() => match record {
        Some(record) => batch.push(record),
        None => {
          flush(&mut writer, &mut batch).await;
          break;
        }
      },
      _ = ticker.tick() => flush(&mut writer, &mut batch).await,
    }
  }
}

async fn flush<W: HistoryWriter>(writer: &mut W, batch: &mut Vec<HistoryRecord>) {
  if batch.is_empty() {
    return;
  }
  match writer.write_batch(batch).await {
    Ok(()) => tracing::debug!("Persisted {} history records", batch.len()),
    Err(e) => tracing::error!("Failed to persist {} history records: {}", batch.len(), e),
  }
  batch.clear();
}
