//! Forward HTTP/HTTPS proxy with transparent tunneling and MITM interception
//!
//! Plain `http://` requests are forwarded to their origin. `CONNECT` tunnels
//! are either relayed byte-for-byte or, in MITM mode, terminated with a leaf
//! certificate signed by a local root CA so the decrypted requests can be
//! observed before they are forwarded over TLS to the real origin.
//!
//! # Features
//!
//! - Half-close aware tunnel relay
//! - On-demand leaf certificates, cached in memory and in SQLite
//! - Decrypted connections served by the same HTTP engine as the proxy itself
//! - One observation hook call per completed request
//! - Batched history persistence
//!
//! # Example
//!
//! ```no_run
//! use relayjack::{Mode, Proxy, SessionContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = Proxy::builder()
//!         .mode(Mode::Mitm)
//!         .ca_files("root.crt", "root.key")
//!         .cert_cache("certstore.db")
//!         .hook(|session: &SessionContext| {
//!             println!("{} {} bytes", session.request.uri, session.transfer_bytes);
//!         })
//!         .build()
//!         .await?;
//!     proxy.run("127.0.0.1:8080").await?;
//!     Ok(())
//! }
//! ```

mod body;
mod ca;
mod error;
mod forward;
mod history;
mod listener;
mod manager;
mod proxy;
mod relay;
mod server;
mod session;
mod store;
mod tls;

pub use body::{CountingBody, ProxyBody};
pub use ca::{CertificateAuthority, LeafCertificate};
pub use error::{Error, Result};
pub use forward::{strip_hop_headers, Forwarder};
pub use history::{
  HistoryRecord, HistorySink, HistoryWriter, JsonLinesWriter, DEFAULT_FLUSH_INTERVAL,
};
pub use listener::{Listener, SingleShotListener, TcpAcceptor};
pub use manager::{CertificateManager, LeafIdentity};
pub use proxy::{Mode, Proxy, ProxyBuilder, ProxyConfig};
pub use relay::{relay, relay_tcp, RelayStats};
pub use server::{HttpHandler, HttpServer, PooledServer, ServerPool};
pub use session::{
  ObservationHook, RequestSnapshot, ResponseSnapshot, SessionContext, SessionCounter,
  SessionGuard,
};
pub use store::CertStore;
pub use tls::{client_config_with_roots, server_config, upstream_client_config};
