//! Round-trips proxied requests to their origin
//!
//! Plaintext requests share a pooled keep-alive transport. Decrypted requests
//! from an intercepted TLS session dial the origin directly over TLS.

use crate::body::ProxyBody;
use crate::error::{Error, Result};
use crate::tls;
use http::header::{self, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Uri};
use http::HeaderMap;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

/// Headers that only concern the hop between client and proxy
const HOP_HEADERS: [HeaderName; 4] = [
  header::PROXY_AUTHENTICATE,
  header::PROXY_AUTHORIZATION,
  header::CONNECTION,
  header::ACCEPT_ENCODING,
];

/// Remove proxy-hop headers before a request leaves for the origin.
///
/// `Accept-Encoding` goes too, so origins answer with bodies the proxy can
/// observe as-is.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
  for name in HOP_HEADERS.iter() {
    headers.remove(name);
  }
  headers.remove("proxy-connection");
}

/// Sends requests to origin servers
#[derive(Clone)]
pub struct Forwarder {
  client: Client<HttpConnector, ProxyBody>,
  tls: TlsConnector,
  connect_timeout: Duration,
}

impl Forwarder {
  pub fn new(tls_config: Arc<ClientConfig>, connect_timeout: Duration) -> Self {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(connect_timeout));
    connector.set_nodelay(true);
    let client = Client::builder(TokioExecutor::new()).build(connector);
    Self {
      client,
      tls: TlsConnector::from(tls_config),
      connect_timeout,
    }
  }

  /// Forward an absolute-form `http://` request over the pooled transport.
  pub async fn forward(&self, mut req: Request<ProxyBody>) -> Result<Response<Incoming>> {
    strip_hop_headers(req.headers_mut());
    let uri = req.uri().clone();
    self
      .client
      .request(req)
      .await
      .map_err(|e| Error::connection_error(format!("Request to {} failed: {}", uri, e)))
  }

  /// Forward a request to `host:port` over a freshly dialed TLS connection.
  pub async fn forward_tls(
    &self,
    mut req: Request<ProxyBody>,
    host: &str,
    port: u16,
  ) -> Result<Response<Incoming>> {
    strip_hop_headers(req.headers_mut());

    // Origin-form target, Host header naming the real origin
    let path = req
      .uri()
      .path_and_query()
      .cloned()
      .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::from(path);
    if !req.headers().contains_key(header::HOST) {
      let authority = if port == 443 {
        host.to_string()
      } else {
        format!("{}:{}", host, port)
      };
      let value = HeaderValue::from_str(&authority)
        .map_err(|e| Error::invalid_request(format!("Invalid host {}: {}", authority, e)))?;
      req.headers_mut().insert(header::HOST, value);
    }

    let stream = self.dial(host, port).await?;
    let server_name = tls::server_name(host)?;
    let tls_stream = self
      .tls
      .connect(server_name, stream)
      .await
      .map_err(|e| {
        Error::tls_error(format!(
          "TLS handshake with {}:{} failed: {}",
          host, port, e
        ))
      })?;

    let (mut sender, connection) =
      hyper::client::conn::http1::handshake(TokioIo::new(tls_stream)).await?;
    let origin = format!("{}:{}", host, port);
    tokio::spawn(async move {
      if let Err(e) = connection.await {
        tracing::debug!("[tls] origin connection to {} closed: {}", origin, e);
      }
    });

    Ok(sender.send_request(req).await?)
  }

  /// Dial `host:port` within the connect timeout.
  pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
    let target = (tls::bare_host(host), port);
    match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
      Ok(Ok(stream)) => {
        let _ = stream.set_nodelay(true);
        Ok(stream)
      }
      Ok(Err(e)) => Err(Error::connection_error(format!(
        "Failed to connect to {}:{}: {}",
        host, port, e
      ))),
      Err(_) => Err(Error::connection_error(format!(
        "Timed out connecting to {}:{}",
        host, port
      ))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strips_proxy_hop_headers() {
    let mut headers = HeaderMap::new();
    headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
    headers.insert(
      header::PROXY_AUTHORIZATION,
      HeaderValue::from_static("Basic Zm9vOmJhcg=="),
    );
    headers.insert(header::PROXY_AUTHENTICATE, HeaderValue::from_static("Basic"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    headers.insert(header::USER_AGENT, HeaderValue::from_static("test"));

    strip_hop_headers(&mut headers);

    assert_eq!(headers.len(), 1);
    assert!(headers.contains_key(header::USER_AGENT));
  }

  #[tokio::test]
  async fn dial_failure_is_a_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config =
      tls::client_config_with_roots(tokio_rustls::rustls::RootCertStore::empty()).unwrap();
    let forwarder = Forwarder::new(Arc::new(config), Duration::from_secs(1));
    let err = forwarder.dial("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionError(_)));
    assert_eq!(err.status_code(), http::StatusCode::BAD_GATEWAY);
  }
}
