//! Proxy configuration, construction and request dispatch

use crate::body::{self, CountingBody, ProxyBody};
use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::forward::Forwarder;
use crate::listener::{Listener, SingleShotListener, TcpAcceptor};
use crate::manager::CertificateManager;
use crate::relay::{relay, relay_tcp};
use crate::server::{HttpHandler, HttpServer, ServerPool};
use crate::session::{ObservationHook, RequestSnapshot, SessionCounter, SessionGuard};
use crate::store::CertStore;
use crate::tls;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::upgrade::{OnUpgrade, Parts, Upgraded};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// How CONNECT requests are handled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
  /// Relay tunneled bytes without looking at them
  #[default]
  Transparent,
  /// Terminate TLS with a forged leaf certificate and forward decrypted requests
  Mitm,
}

/// Proxy configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// Address the proxy listens on
  pub listen: String,
  /// Tunnel or intercept CONNECT requests
  pub mode: Mode,
  /// Root CA certificate (PEM)
  pub ca_cert_path: PathBuf,
  /// Root CA private key (PEM)
  pub ca_key_path: PathBuf,
  /// Durable leaf certificate cache
  pub cert_cache_path: PathBuf,
  /// Origin dial timeout in seconds
  pub connect_timeout: u64,
  /// End a tunnel direction after this many idle seconds
  pub tunnel_idle_timeout: Option<u64>,
  /// Time allowed for a client to send request headers, in seconds
  pub header_read_timeout: u64,
  /// Idle servers kept for intercepted connections
  pub server_pool_capacity: usize,
  /// Leaf identities kept in memory
  pub leaf_cache_capacity: u64,
  /// Extra PEM roots trusted when dialing TLS origins
  pub upstream_ca_paths: Vec<PathBuf>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: "127.0.0.1:8080".to_string(),
      mode: Mode::Transparent,
      ca_cert_path: PathBuf::from("root.crt"),
      ca_key_path: PathBuf::from("root.key"),
      cert_cache_path: PathBuf::from("certstore.db"),
      connect_timeout: 5,
      tunnel_idle_timeout: None,
      header_read_timeout: 5,
      server_pool_capacity: 64,
      leaf_cache_capacity: 1000,
      upstream_ca_paths: Vec::new(),
    }
  }
}

impl ProxyConfig {
  /// Read a TOML file; missing keys keep their defaults
  pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| Error::other(format!("Failed to read config {}: {}", path.display(), e)))?;
    toml::from_str(&text)
      .map_err(|e| Error::other(format!("Invalid config {}: {}", path.display(), e)))
  }
}

/// Builder for [`Proxy`]
#[derive(Default)]
pub struct ProxyBuilder {
  config: ProxyConfig,
  hook: Option<Arc<dyn ObservationHook>>,
  authority: Option<Arc<CertificateAuthority>>,
  upstream_tls: Option<Arc<ClientConfig>>,
}

impl ProxyBuilder {
  /// Replace the whole configuration
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = config;
    self
  }

  pub fn mode(mut self, mode: Mode) -> Self {
    self.config.mode = mode;
    self
  }

  /// Root CA files loaded when the proxy is built in MITM mode
  pub fn ca_files(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
    self.config.ca_cert_path = cert_path.into();
    self.config.ca_key_path = key_path.into();
    self
  }

  pub fn cert_cache(mut self, path: impl Into<PathBuf>) -> Self {
    self.config.cert_cache_path = path.into();
    self
  }

  /// Called once for every completed session
  pub fn hook(mut self, hook: impl ObservationHook) -> Self {
    self.hook = Some(Arc::new(hook));
    self
  }

  pub fn shared_hook(mut self, hook: Arc<dyn ObservationHook>) -> Self {
    self.hook = Some(hook);
    self
  }

  /// Use an already loaded root CA instead of reading the configured files
  pub fn authority(mut self, authority: Arc<CertificateAuthority>) -> Self {
    self.authority = Some(authority);
    self
  }

  /// TLS client configuration for origin connections
  pub fn upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
    self.upstream_tls = Some(config);
    self
  }

  /// Load CA material and open the certificate cache.
  ///
  /// Both are only needed, and only touched, in MITM mode.
  pub async fn build(self) -> Result<Proxy> {
    let config = self.config;

    let certs = match config.mode {
      Mode::Mitm => {
        let ca = match self.authority {
          Some(ca) => ca,
          None => Arc::new(
            CertificateAuthority::load(&config.ca_cert_path, &config.ca_key_path).await?,
          ),
        };
        let store = CertStore::open(&config.cert_cache_path, &ca)?;
        tracing::info!(
          "Certificate cache at {} (root {})",
          config.cert_cache_path.display(),
          &ca.fingerprint()[..16]
        );
        Some(CertificateManager::new(ca, store, config.leaf_cache_capacity))
      }
      Mode::Transparent => None,
    };

    let upstream = match self.upstream_tls {
      Some(upstream) => upstream,
      None => Arc::new(tls::upstream_client_config(&config.upstream_ca_paths)?),
    };
    let connect_timeout = Duration::from_secs(config.connect_timeout);
    let header_read_timeout = Duration::from_secs(config.header_read_timeout);

    let state = ProxyState {
      sessions: SessionCounter::new(),
      hook: self.hook,
      certs,
      forwarder: Forwarder::new(upstream, connect_timeout),
      servers: ServerPool::new(config.server_pool_capacity, header_read_timeout),
      config,
    };
    Ok(Proxy {
      state: Arc::new(state),
      server: HttpServer::new(header_read_timeout),
    })
  }
}

/// A forward HTTP/HTTPS proxy
#[derive(Clone)]
pub struct Proxy {
  state: Arc<ProxyState>,
  server: HttpServer,
}

impl Proxy {
  pub fn builder() -> ProxyBuilder {
    ProxyBuilder::default()
  }

  pub fn config(&self) -> &ProxyConfig {
    &self.state.config
  }

  /// Root certificate clients must trust in MITM mode
  pub fn ca_cert_pem(&self) -> Option<&str> {
    self
      .state
      .certs
      .as_ref()
      .map(|certs| certs.authority().cert_pem())
  }

  /// Bind `addr` and serve until the process ends
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpAcceptor::bind(addr)
      .await
      .map_err(|e| Error::other(format!("Failed to bind to {}: {}", addr, e)))?;
    if let Some(local) = listener.local_addr() {
      tracing::info!("Proxy ({:?} mode) listening on {}", self.state.config.mode, local);
    }
    self.serve(listener).await
  }

  /// Serve proxy requests on every connection `listener` yields
  pub async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
    let handler = Arc::new(ProxyHandler {
      state: self.state.clone(),
    });
    self.server.serve(listener, handler).await
  }
}

struct ProxyState {
  config: ProxyConfig,
  sessions: SessionCounter,
  hook: Option<Arc<dyn ObservationHook>>,
  certs: Option<CertificateManager>,
  forwarder: Forwarder,
  servers: ServerPool,
}

impl ProxyState {
  fn guard(&self, id: u64, parent: Option<u64>, request: RequestSnapshot) -> SessionGuard {
    SessionGuard::new(id, parent, request, self.hook.clone())
  }

  fn idle_timeout(&self) -> Option<Duration> {
    self.config.tunnel_idle_timeout.map(Duration::from_secs)
  }

  /// Forward an absolute-form request received directly from a client
  async fn forward_plain(&self, req: Request<Incoming>) -> Response<ProxyBody> {
    let id = self.sessions.next();
    let target = match (req.uri().scheme_str(), req.uri().host()) {
      (Some("http"), Some(host)) => Some((host.to_string(), false)),
      (Some("https"), Some(host)) => Some((host.to_string(), true)),
      _ => None,
    };
    let Some((host, tls)) = target else {
      let mut guard = self.guard(id, None, snapshot(&req, "", 0, false));
      tracing::warn!("[{}] Rejecting {} {}", id, req.method(), req.uri());
      guard.set_error("not a recognized proxy request");
      return error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "not a recognized proxy request",
      );
    };
    let port = req
      .uri()
      .port_u16()
      .unwrap_or(if tls { 443 } else { 80 });

    let guard = self.guard(id, None, snapshot(&req, &host, port, tls));
    tracing::info!("[{}] {} {}", id, req.method(), req.uri());

    let req = req.map(|body| body.boxed());
    let result = if tls {
      self.forwarder.forward_tls(req, &host, port).await
    } else {
      self.forwarder.forward(req).await
    };
    respond(guard, result)
  }

  /// Forward a request decrypted from an intercepted TLS session
  async fn forward_decrypted(
    &self,
    req: Request<Incoming>,
    host: &str,
    port: u16,
    parent: u64,
  ) -> Response<ProxyBody> {
    let id = self.sessions.next();
    let guard = self.guard(id, Some(parent), snapshot(&req, host, port, true));
    tracing::info!(
      "[{}][tls] {} https://{}:{}{}",
      id,
      req.method(),
      host,
      port,
      req.uri().path()
    );
    let result = self
      .forwarder
      .forward_tls(req.map(|body| body.boxed()), host, port)
      .await;
    respond(guard, result)
  }

  /// Handle a CONNECT request: prepare the tunnel, answer 200, and take the
  /// connection over once the response has been written.
  async fn connect(
    self: &Arc<Self>,
    mut req: Request<Incoming>,
    parent: Option<u64>,
  ) -> Response<ProxyBody> {
    let id = self.sessions.next();
    let authority = req.uri().authority().cloned();
    let Some(authority) = authority else {
      let guard = self.guard(id, parent, snapshot(&req, "", 0, parent.is_some()));
      return fail(
        guard,
        Error::invalid_request(format!("CONNECT target {} has no authority", req.uri())),
      );
    };
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);
    let mut guard = self.guard(id, parent, snapshot(&req, &host, port, parent.is_some()));
    tracing::info!("[{}] CONNECT {}:{}", id, host, port);

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
      return fail(guard, Error::HijackUnsupported);
    };

    let state = self.clone();
    match self.config.mode {
      Mode::Transparent => {
        let origin = match self.forwarder.dial(&host, port).await {
          Ok(origin) => origin,
          Err(e) => return fail(guard, e),
        };
        tokio::spawn(async move {
          match on_upgrade.await {
            Ok(upgraded) => state.tunnel(upgraded, origin, &mut guard).await,
            Err(e) => {
              tracing::error!("[{}] Upgrade failed: {}", id, e);
              guard.set_error(e);
            }
          }
        });
      }
      Mode::Mitm => {
        let Some(certs) = self.certs.as_ref() else {
          return fail(guard, Error::other("MITM mode without a certificate authority"));
        };
        let identity = match certs.server_identity(&host).await {
          Ok(identity) => identity,
          Err(e) => return fail(guard, e),
        };
        tokio::spawn(async move {
          match on_upgrade.await {
            Ok(upgraded) => {
              state
                .intercept(upgraded, identity.server_config(), host, port, &mut guard)
                .await
            }
            Err(e) => {
              tracing::error!("[{}] Upgrade failed: {}", id, e);
              guard.set_error(e);
            }
          }
        });
      }
    }

    established()
  }

  /// Relay raw bytes between the hijacked client connection and the origin
  async fn tunnel(&self, upgraded: Upgraded, mut origin: TcpStream, guard: &mut SessionGuard) {
    let id = guard.id();
    let idle = self.idle_timeout();
    let stats = match upgraded.downcast::<TokioIo<TcpStream>>() {
      Ok(Parts { io, read_buf, .. }) => {
        // Bytes the client sent right behind the CONNECT request
        if !read_buf.is_empty() {
          if let Err(e) = origin.write_all(&read_buf).await {
            tracing::error!("[{}] Failed to write buffered bytes to origin: {}", id, e);
            guard.set_error(e);
            return;
          }
          guard.add_bytes(read_buf.len() as u64);
        }
        relay_tcp(id, io.into_inner(), origin, idle).await
      }
      Err(upgraded) => {
        tracing::warn!("[{}] Client connection cannot half-close, using fallback relay", id);
        relay(id, TokioIo::new(upgraded), origin, idle).await
      }
    };
    guard.add_bytes(stats.total());
  }

  /// Terminate the client's TLS and serve its decrypted requests
  async fn intercept(
    self: Arc<Self>,
    upgraded: Upgraded,
    config: Arc<ServerConfig>,
    host: String,
    port: u16,
    guard: &mut SessionGuard,
  ) {
    let id = guard.id();
    let acceptor = TlsAcceptor::from(config);
    let stream = match acceptor.accept(TokioIo::new(upgraded)).await {
      Ok(stream) => stream,
      Err(e) => {
        tracing::error!("[{}][tls] Client handshake for {} failed: {}", id, host, e);
        guard.set_error(e);
        return;
      }
    };
    tracing::debug!("[{}][tls] Intercepting {}:{}", id, host, port);

    let handler = Arc::new(InterceptHandler {
      state: self.clone(),
      host,
      port,
      parent: id,
    });
    let server = self.servers.acquire();
    if let Err(e) = server.serve(SingleShotListener::new(stream), handler).await {
      tracing::error!("[{}][tls] Serving intercepted connection failed: {}", id, e);
      guard.set_error(e);
    }
  }
}

/// Dispatches requests arriving on the proxy's own listener
struct ProxyHandler {
  state: Arc<ProxyState>,
}

#[async_trait]
impl HttpHandler for ProxyHandler {
  async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
      self.state.connect(req, None).await
    } else {
      self.state.forward_plain(req).await
    }
  }
}

/// Dispatches requests decrypted from one intercepted CONNECT tunnel
struct InterceptHandler {
  state: Arc<ProxyState>,
  host: String,
  port: u16,
  parent: u64,
}

#[async_trait]
impl HttpHandler for InterceptHandler {
  async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
      self.state.connect(req, Some(self.parent)).await
    } else {
      self
        .state
        .forward_decrypted(req, &self.host, self.port, self.parent)
        .await
    }
  }
}

fn snapshot(req: &Request<Incoming>, host: &str, port: u16, tls: bool) -> RequestSnapshot {
  RequestSnapshot {
    method: req.method().clone(),
    uri: req.uri().clone(),
    host: host.to_string(),
    port,
    headers: req.headers().clone(),
    tls,
  }
}

/// Stream the origin response back, concluding the session when the body ends
fn respond(mut guard: SessionGuard, result: Result<Response<Incoming>>) -> Response<ProxyBody> {
  match result {
    Ok(response) => {
      guard.set_response(response.status(), response.headers().clone());
      response.map(|body| CountingBody::new(body.boxed(), guard).boxed())
    }
    Err(e) => fail(guard, e),
  }
}

fn fail(mut guard: SessionGuard, error: Error) -> Response<ProxyBody> {
  tracing::error!("[{}] {}", guard.id(), error);
  let status = error.status_code();
  let message = error.to_string();
  guard.set_error(&message);
  guard.set_response(status, Default::default());
  error_response(status, message)
}

fn established() -> Response<ProxyBody> {
  let mut response = Response::new(body::empty());
  response
    .extensions_mut()
    .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
  response
}

fn error_response(status: StatusCode, message: impl Into<Bytes>) -> Response<ProxyBody> {
  let mut response = Response::new(body::full(message));
  *response.status_mut() = status;
  response.headers_mut().insert(
    CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  response
}
