//! Per-request session bookkeeping and the observation hook

use http::{HeaderMap, Method, StatusCode, Uri};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Hands out process-unique, monotonically increasing session ids
#[derive(Clone, Debug, Default)]
pub struct SessionCounter(Arc<AtomicU64>);

impl SessionCounter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Next id; the first one handed out is 1
  pub fn next(&self) -> u64 {
    self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }
}

/// What the client asked for
#[derive(Clone, Debug)]
pub struct RequestSnapshot {
  pub method: Method,
  pub uri: Uri,
  pub host: String,
  pub port: u16,
  pub headers: HeaderMap,
  /// Whether the request went to its origin over TLS
  pub tls: bool,
}

/// What the origin answered with
#[derive(Clone, Debug)]
pub struct ResponseSnapshot {
  pub status: StatusCode,
  pub headers: HeaderMap,
}

/// Everything known about one proxied request once it has completed
#[derive(Clone, Debug)]
pub struct SessionContext {
  pub session: u64,
  /// The CONNECT session a decrypted request was carried in
  pub parent: Option<u64>,
  pub request: RequestSnapshot,
  pub response: Option<ResponseSnapshot>,
  /// Body bytes for forwarded requests; tunneled bytes in both directions for CONNECT
  pub transfer_bytes: u64,
  pub started_at: OffsetDateTime,
  pub elapsed: Duration,
  pub error: Option<String>,
}

/// Receives every completed session
pub trait ObservationHook: Send + Sync + 'static {
  fn on_complete(&self, session: &SessionContext);
}

impl<F> ObservationHook for F
where
  F: Fn(&SessionContext) + Send + Sync + 'static,
{
  fn on_complete(&self, session: &SessionContext) {
    self(session)
  }
}

/// Holds a session open until it completes, then reports it exactly once.
///
/// Dropping the guard without calling [`SessionGuard::finish`] reports the
/// session as it stands.
pub struct SessionGuard {
  context: SessionContext,
  started: Instant,
  hook: Option<Arc<dyn ObservationHook>>,
}

impl SessionGuard {
  pub fn new(
    session: u64,
    parent: Option<u64>,
    request: RequestSnapshot,
    hook: Option<Arc<dyn ObservationHook>>,
  ) -> Self {
    Self {
      context: SessionContext {
        session,
        parent,
        request,
        response: None,
        transfer_bytes: 0,
        started_at: OffsetDateTime::now_utc(),
        elapsed: Duration::ZERO,
        error: None,
      },
      started: Instant::now(),
      hook,
    }
  }

  pub fn id(&self) -> u64 {
    self.context.session
  }

  pub fn set_response(&mut self, status: StatusCode, headers: HeaderMap) {
    self.context.response = Some(ResponseSnapshot { status, headers });
  }

  pub fn add_bytes(&mut self, n: u64) {
    self.context.transfer_bytes = self.context.transfer_bytes.saturating_add(n);
  }

  pub fn set_error(&mut self, error: impl ToString) {
    self.context.error = Some(error.to_string());
  }

  pub fn finish(self) {}
}

impl Drop for SessionGuard {
  fn drop(&mut self) {
    if let Some(hook) = self.hook.take() {
      self.context.elapsed = self.started.elapsed();
      hook.on_complete(&self.context);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  fn snapshot() -> RequestSnapshot {
    RequestSnapshot {
      method: Method::GET,
      uri: Uri::from_static("http://example.test/"),
      host: "example.test".into(),
      port: 80,
      headers: HeaderMap::new(),
      tls: false,
    }
  }

  #[test]
  fn counter_is_monotonic_across_clones() {
    let counter = SessionCounter::new();
    let clone = counter.clone();
    assert_eq!(counter.next(), 1);
    assert_eq!(clone.next(), 2);
    assert_eq!(counter.next(), 3);
  }

  #[test]
  fn hook_fires_once_with_final_state() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let hook: Arc<dyn ObservationHook> = Arc::new(move |ctx: &SessionContext| {
      sink.lock().unwrap().push(ctx.clone());
    });

    let mut guard = SessionGuard::new(7, Some(3), snapshot(), Some(hook));
    guard.add_bytes(10);
    guard.add_bytes(5);
    guard.set_response(StatusCode::OK, HeaderMap::new());
    guard.finish();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].session, 7);
    assert_eq!(seen[0].parent, Some(3));
    assert_eq!(seen[0].transfer_bytes, 15);
    assert_eq!(seen[0].response.as_ref().unwrap().status, StatusCode::OK);
  }

  #[test]
  fn missing_hook_is_fine() {
    let mut guard = SessionGuard::new(1, None, snapshot(), None);
    guard.set_error("boom");
    drop(guard);
  }
}
