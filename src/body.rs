//! Response bodies flowing back to the client

use crate::session::SessionGuard;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Body type produced by every handler
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
  Full::new(chunk.into())
    .map_err(|never| match never {})
    .boxed()
}

pub fn empty() -> ProxyBody {
  Empty::<Bytes>::new()
    .map_err(|never| match never {})
    .boxed()
}

/// Streams an origin body through while counting data bytes.
///
/// The session is reported when the body ends, fails, or is dropped by the
/// client.
pub struct CountingBody {
  inner: ProxyBody,
  guard: Option<SessionGuard>,
}

impl CountingBody {
  pub fn new(inner: ProxyBody, guard: SessionGuard) -> Self {
    Self {
      inner,
      guard: Some(guard),
    }
  }
}

impl Body for CountingBody {
  type Data = Bytes;
  type Error = hyper::Error;

  fn poll_frame(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
    let this = &mut *self;
    let polled = Pin::new(&mut this.inner).poll_frame(cx);
    match &polled {
      Poll::Ready(Some(Ok(frame))) => {
        if let (Some(data), Some(guard)) = (frame.data_ref(), this.guard.as_mut()) {
          guard.add_bytes(data.len() as u64);
        }
      }
      Poll::Ready(Some(Err(e))) => {
        if let Some(mut guard) = this.guard.take() {
          guard.set_error(e);
        }
      }
      Poll::Ready(None) => {
        if let Some(guard) = this.guard.take() {
          guard.finish();
        }
      }
      Poll::Pending => {}
    }
    polled
  }

  fn is_end_stream(&self) -> bool {
    self.inner.is_end_stream()
  }

  fn size_hint(&self) -> SizeHint {
    self.inner.size_hint()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::{ObservationHook, RequestSnapshot, SessionContext};
  use http::{HeaderMap, Method, Uri};
  use std::sync::{Arc, Mutex};

  #[tokio::test]
  async fn counts_streamed_bytes_and_reports_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let hook: Arc<dyn ObservationHook> = Arc::new(move |ctx: &SessionContext| {
      sink.lock().unwrap().push(ctx.transfer_bytes);
    });
    let guard = SessionGuard::new(
      1,
      None,
      RequestSnapshot {
        method: Method::GET,
        uri: Uri::from_static("http://example.test/"),
        host: "example.test".into(),
        port: 80,
        headers: HeaderMap::new(),
        tls: false,
      },
      Some(hook),
    );

    let body = CountingBody::new(full("hello world"), guard);
    let collected = body.collect().await.unwrap().to_bytes();
    assert_eq!(&collected[..], b"hello world");
    assert_eq!(*seen.lock().unwrap(), vec![11]);
  }
}
