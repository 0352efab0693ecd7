//! HTTP/1.1 server driving a [`HttpHandler`] over any [`Listener`]

use crate::body::ProxyBody;
use crate::error::Result;
use crate::listener::Listener;
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;

/// Produces a response for every request read off a connection
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
  async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody>;
}

/// Serves HTTP/1.1 connections; cheap to clone and reuse
#[derive(Clone, Debug)]
pub struct HttpServer {
  builder: http1::Builder,
}

impl HttpServer {
  pub fn new(header_read_timeout: Duration) -> Self {
    let mut builder = http1::Builder::new();
    builder
      .timer(TokioTimer::new())
      .header_read_timeout(header_read_timeout)
      .keep_alive(true);
    Self { builder }
  }

  /// Serve every connection `listener` yields until it reports exhaustion,
  /// then wait for the in-flight connections to finish.
  pub async fn serve<L: Listener>(
    &self,
    mut listener: L,
    handler: Arc<dyn HttpHandler>,
  ) -> Result<()> {
    let mut connections = JoinSet::new();
    loop {
      let conn = match listener.accept().await {
        Ok(Some(conn)) => conn,
        Ok(None) => break,
        Err(e) => {
          tracing::error!("Failed to accept connection: {}", e);
          continue;
        }
      };

      let handler = handler.clone();
      let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
      });
      let connection = self
        .builder
        .serve_connection(TokioIo::new(conn), service)
        .with_upgrades();
      connections.spawn(async move {
        if let Err(e) = connection.await {
          tracing::debug!("Connection closed with error: {}", e);
        }
      });

      // Reap finished connections so the set does not grow unbounded
      while connections.try_join_next().is_some() {}
    }

    listener.close();
    while connections.join_next().await.is_some() {}
    Ok(())
  }
}

struct PoolInner {
  idle: Mutex<Vec<HttpServer>>,
  capacity: usize,
  header_read_timeout: Duration,
}

/// Recycles [`HttpServer`] instances used for intercepted connections
#[derive(Clone)]
pub struct ServerPool {
  inner: Arc<PoolInner>,
}

impl ServerPool {
  pub fn new(capacity: usize, header_read_timeout: Duration) -> Self {
    Self {
      inner: Arc::new(PoolInner {
        idle: Mutex::new(Vec::with_capacity(capacity)),
        capacity,
        header_read_timeout,
      }),
    }
  }

  /// Take an idle server, or build one if none are waiting
  pub fn acquire(&self) -> PooledServer {
    let server = self
      .inner
      .idle
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .pop()
      .unwrap_or_else(|| HttpServer::new(self.inner.header_read_timeout));
    PooledServer {
      server: Some(server),
      pool: self.inner.clone(),
    }
  }

  pub fn idle_count(&self) -> usize {
    self
      .inner
      .idle
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }
}

/// A server on loan from a [`ServerPool`]; returned when dropped
pub struct PooledServer {
  server: Option<HttpServer>,
  pool: Arc<PoolInner>,
}

impl Deref for PooledServer {
  type Target = HttpServer;

  fn deref(&self) -> &HttpServer {
    // Only taken in Drop
    match &self.server {
      Some(server) => server,
      None => unreachable!("pooled server used after release"),
    }
  }
}

impl Drop for PooledServer {
  fn drop(&mut self) {
    if let Some(server) = self.server.take() {
      let mut idle = self
        .pool
        .idle
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
      if idle.len() < self.pool.capacity {
        idle.push(server);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::body;
  use crate::listener::SingleShotListener;
  use http::StatusCode;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  struct Hello;

  #[async_trait]
  impl HttpHandler for Hello {
    async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
      let mut response = Response::new(body::full(format!("hello {}", req.uri().path())));
      *response.status_mut() = StatusCode::OK;
      response
    }
  }

  #[test]
  fn pool_recycles_up_to_capacity() {
    let pool = ServerPool::new(1, Duration::from_secs(5));
    let a = pool.acquire();
    let b = pool.acquire();
    assert_eq!(pool.idle_count(), 0);
    drop(a);
    drop(b);
    assert_eq!(pool.idle_count(), 1);
    let _c = pool.acquire();
    assert_eq!(pool.idle_count(), 0);
  }

  #[tokio::test]
  async fn serves_single_shot_connection_to_completion() {
    let (conn, mut client) = tokio::io::duplex(4096);
    let server = HttpServer::new(Duration::from_secs(5));
    let task = tokio::spawn(async move {
      server
        .serve(SingleShotListener::new(conn), Arc::new(Hello))
        .await
    });

    client
      .write_all(b"GET /world HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
      .await
      .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("hello /world"));

    task.await.unwrap().unwrap();
  }
}
