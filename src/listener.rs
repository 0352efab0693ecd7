//! Connection sources for the HTTP server

use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

/// Something that yields connections until it is exhausted
#[async_trait]
pub trait Listener: Send {
  type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

  /// Wait for the next connection; `None` means no more will ever arrive.
  async fn accept(&mut self) -> Result<Option<Self::Conn>>;

  fn close(&mut self) {}

  fn local_addr(&self) -> Option<SocketAddr> {
    None
  }
}

/// Accepts TCP connections from a bound socket
pub struct TcpAcceptor {
  listener: TcpListener,
}

impl TcpAcceptor {
  pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
    Ok(Self {
      listener: TcpListener::bind(addr).await?,
    })
  }
}

impl From<TcpListener> for TcpAcceptor {
  fn from(listener: TcpListener) -> Self {
    Self { listener }
  }
}

#[async_trait]
impl Listener for TcpAcceptor {
  type Conn = TcpStream;

  async fn accept(&mut self) -> Result<Option<TcpStream>> {
    let (stream, peer) = self.listener.accept().await?;
    tracing::trace!("Accepted connection from {}", peer);
    Ok(Some(stream))
  }

  fn local_addr(&self) -> Option<SocketAddr> {
    self.listener.local_addr().ok()
  }
}

enum Slot<C> {
  Armed(C),
  Drained,
  Closed,
}

/// Yields exactly one pre-established connection, then reports exhaustion.
///
/// Used to feed a single decrypted client connection into the HTTP server.
pub struct SingleShotListener<C> {
  slot: Slot<C>,
}

impl<C> SingleShotListener<C> {
  pub fn new(conn: C) -> Self {
    Self {
      slot: Slot::Armed(conn),
    }
  }

  pub fn is_closed(&self) -> bool {
    matches!(self.slot, Slot::Closed)
  }
}

#[async_trait]
impl<C> Listener for SingleShotListener<C>
where
  C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  type Conn = C;

  async fn accept(&mut self) -> Result<Option<C>> {
    match std::mem::replace(&mut self.slot, Slot::Closed) {
      Slot::Armed(conn) => {
        self.slot = Slot::Drained;
        Ok(Some(conn))
      }
      Slot::Drained | Slot::Closed => Ok(None),
    }
  }

  fn close(&mut self) {
    self.slot = Slot::Closed;
  }

  fn local_addr(&self) -> Option<SocketAddr> {
    None
  }
}
