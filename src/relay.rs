//! Bidirectional byte relay for CONNECT tunnels
//!
//! Each direction is copied independently. When one side stops sending, the
//! other side's write half is shut down so end-of-stream propagates, while the
//! opposite direction keeps flowing until it finishes on its own.

use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;

const BUFFER_SIZE: usize = 8192;

/// Idle deadline shared by both directions of one tunnel.
///
/// Traffic either way pushes the deadline out, so a one-way download does not
/// starve the silent direction.
#[derive(Clone)]
struct IdleTimer {
  limit: Duration,
  start: Instant,
  last_activity_ms: Arc<AtomicU64>,
}

impl IdleTimer {
  fn new(limit: Option<Duration>) -> Option<Self> {
    limit.map(|limit| Self {
      limit,
      start: Instant::now(),
      last_activity_ms: Arc::new(AtomicU64::new(0)),
    })
  }

  fn touch(&self) {
    let now = self.start.elapsed().as_millis() as u64;
    self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
  }

  /// Time left before the tunnel counts as idle
  fn remaining(&self) -> Duration {
    let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
    let idle = self.start.elapsed().saturating_sub(last);
    self.limit.saturating_sub(idle)
  }
}

/// Bytes moved through a tunnel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
  pub client_to_origin: u64,
  pub origin_to_client: u64,
}

impl RelayStats {
  pub fn total(&self) -> u64 {
    self.client_to_origin + self.origin_to_client
  }
}

/// Relay between two TCP sockets with per-direction half-close.
///
/// Returns once both directions have finished; both sockets are closed
/// afterwards.
pub async fn relay_tcp(
  session: u64,
  client: TcpStream,
  origin: TcpStream,
  idle_timeout: Option<Duration>,
) -> RelayStats {
  let (client_read, client_write) = client.into_split();
  let (origin_read, origin_write) = origin.into_split();
  let idle = IdleTimer::new(idle_timeout);

  let upstream = tokio::spawn(pipe_tcp(
    session,
    "client->origin",
    client_read,
    origin_write,
    idle.clone(),
  ));
  let downstream = tokio::spawn(pipe_tcp(
    session,
    "origin->client",
    origin_read,
    client_write,
    idle,
  ));

  let (up, down) = tokio::join!(upstream, downstream);
  let stats = RelayStats {
    client_to_origin: up.unwrap_or_default(),
    origin_to_client: down.unwrap_or_default(),
  };
  tracing::debug!(
    "[{}] tunnel closed: {} bytes up, {} bytes down",
    session,
    stats.client_to_origin,
    stats.origin_to_client
  );
  stats
}

async fn pipe_tcp(
  session: u64,
  direction: &'static str,
  mut src: OwnedReadHalf,
  mut dst: OwnedWriteHalf,
  idle: Option<IdleTimer>,
) -> u64 {
  let (copied, result) = copy_until_eof(&mut src, &mut dst, idle.as_ref()).await;
  if let Err(e) = result {
    tracing::debug!("[{}] {} relay error: {}", session, direction, e);
  }
  // Propagate end-of-stream to the peer, and stop reading from the source
  if let Err(e) = dst.shutdown().await {
    tracing::trace!("[{}] {} write shutdown: {}", session, direction, e);
  }
  if let Err(e) = socket2::SockRef::from(src.as_ref()).shutdown(Shutdown::Read) {
    tracing::trace!("[{}] {} read shutdown: {}", session, direction, e);
  }
  copied
}

/// Relay between two arbitrary streams.
///
/// Without separate socket halves a finished direction can only shut down
/// writing; both streams are closed once both directions are done.
pub async fn relay<A, B>(
  session: u64,
  client: A,
  origin: B,
  idle_timeout: Option<Duration>,
) -> RelayStats
where
  A: AsyncRead + AsyncWrite + Send + 'static,
  B: AsyncRead + AsyncWrite + Send + 'static,
{
  let (mut client_read, mut client_write) = tokio::io::split(client);
  let (mut origin_read, mut origin_write) = tokio::io::split(origin);
  let idle = IdleTimer::new(idle_timeout);

  let upstream = async {
    let (n, result) = copy_until_eof(&mut client_read, &mut origin_write, idle.as_ref()).await;
    if let Err(e) = result {
      tracing::debug!("[{}] client->origin relay error: {}", session, e);
    }
    if let Err(e) = origin_write.shutdown().await {
      tracing::trace!("[{}] client->origin write shutdown: {}", session, e);
    }
    n
  };
  let downstream = async {
    let (n, result) = copy_until_eof(&mut origin_read, &mut client_write, idle.as_ref()).await;
    if let Err(e) = result {
      tracing::debug!("[{}] origin->client relay error: {}", session, e);
    }
    if let Err(e) = client_write.shutdown().await {
      tracing::trace!("[{}] origin->client write shutdown: {}", session, e);
    }
    n
  };

  let (client_to_origin, origin_to_client) = tokio::join!(upstream, downstream);
  RelayStats {
    client_to_origin,
    origin_to_client,
  }
}

/// Copy until the source reports end-of-stream, an error occurs, or the
/// tunnel has carried no data in either direction for the idle limit.
async fn copy_until_eof<R, W>(
  src: &mut R,
  dst: &mut W,
  idle: Option<&IdleTimer>,
) -> (u64, io::Result<()>)
where
  R: AsyncRead + Unpin + ?Sized,
  W: AsyncWrite + Unpin + ?Sized,
{
  let mut buf = vec![0u8; BUFFER_SIZE];
  let mut copied = 0u64;
  loop {
    let read = match idle {
      Some(timer) => loop {
        let wait = timer.remaining();
        if wait.is_zero() {
          return (
            copied,
            Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel idle timeout")),
          );
        }
        // The other direction may have been busy meanwhile; re-check before giving up
        if let Ok(read) = tokio::time::timeout(wait, src.read(&mut buf)).await {
          break read;
        }
      },
      None => src.read(&mut buf).await,
    };
    let n = match read {
      Ok(0) => return (copied, Ok(())),
      Ok(n) => n,
      Err(e) => return (copied, Err(e)),
    };
    if let Err(e) = dst.write_all(&buf[..n]).await {
      return (copied, Err(e));
    }
    if let Err(e) = dst.flush().await {
      return (copied, Err(e));
    }
    if let Some(timer) = idle {
      timer.touch();
    }
    copied += n as u64;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn half_close_keeps_other_direction_open() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    // Origin reads until EOF, then answers with what it received
    let origin_task = tokio::spawn(async move {
      let (mut socket, _) = origin_listener.accept().await.unwrap();
      let mut received = Vec::new();
      socket.read_to_end(&mut received).await.unwrap();
      socket.write_all(b"got:").await.unwrap();
      socket.write_all(&received).await.unwrap();
    });

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let relay_task = tokio::spawn(async move {
      let (client, _) = proxy_listener.accept().await.unwrap();
      let origin = TcpStream::connect(origin_addr).await.unwrap();
      relay_tcp(1, client, origin, None).await
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"got:ping");

    origin_task.await.unwrap();
    let stats = relay_task.await.unwrap();
    assert_eq!(stats.client_to_origin, 4);
    assert_eq!(stats.origin_to_client, 8);
    assert_eq!(stats.total(), 12);
  }

  #[tokio::test]
  async fn generic_relay_moves_both_directions() {
    let (client, mut client_peer) = tokio::io::duplex(64);
    let (origin, mut origin_peer) = tokio::io::duplex(64);
    let relay_task = tokio::spawn(relay(2, client, origin, None));

    client_peer.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    origin_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    origin_peer.write_all(b"world!").await.unwrap();
    let mut buf = [0u8; 6];
    client_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world!");

    drop(client_peer);
    drop(origin_peer);
    let stats = relay_task.await.unwrap();
    assert_eq!(stats.total(), 11);
  }

  #[tokio::test]
  async fn generic_relay_half_closes_each_direction() {
    let (client, mut client_peer) = tokio::io::duplex(64);
    let (origin, mut origin_peer) = tokio::io::duplex(64);
    let relay_task = tokio::spawn(relay(4, client, origin, None));

    // Origin reads everything up to EOF, then replies on the still-open path
    let origin_task = tokio::spawn(async move {
      let mut received = Vec::new();
      origin_peer.read_to_end(&mut received).await.unwrap();
      origin_peer.write_all(b"received").await.unwrap();
      origin_peer.shutdown().await.unwrap();
      received.len()
    });

    let upload = vec![7u8; 10_000];
    client_peer.write_all(&upload).await.unwrap();
    client_peer.shutdown().await.unwrap();
    let mut reply = Vec::new();
    client_peer.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"received");

    assert_eq!(origin_task.await.unwrap(), 10_000);
    let stats = relay_task.await.unwrap();
    assert_eq!(stats.client_to_origin, 10_000);
    assert_eq!(stats.origin_to_client, 8);
  }

  #[tokio::test]
  async fn one_way_traffic_keeps_the_tunnel_alive() {
    let (client, mut client_peer) = tokio::io::duplex(64);
    let (origin, mut origin_peer) = tokio::io::duplex(64);
    let limit = Some(Duration::from_millis(100));
    let relay_task = tokio::spawn(relay(5, client, origin, limit));

    // The origin streams for well past the idle limit while the client stays silent
    for _ in 0..15 {
      origin_peer.write_all(b"x").await.unwrap();
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut buf = [0u8; 1];
    let pending =
      tokio::time::timeout(Duration::from_millis(10), origin_peer.read(&mut buf)).await;
    assert!(pending.is_err(), "origin saw end-of-stream during a live download");

    let mut received = [0u8; 15];
    client_peer.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"xxxxxxxxxxxxxxx");

    // Once both directions go quiet the tunnel does end
    let stats = relay_task.await.unwrap();
    assert_eq!(stats.origin_to_client, 15);
    assert_eq!(stats.client_to_origin, 0);
  }

  #[tokio::test]
  async fn one_way_tcp_traffic_keeps_the_tunnel_alive() {
    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
      let (mut socket, _) = origin_listener.accept().await.unwrap();
      for _ in 0..15 {
        socket.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
      }
      let mut buf = [0u8; 1];
      tokio::time::timeout(Duration::from_millis(10), socket.read(&mut buf))
        .await
        .is_err()
    });

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let relay_task = tokio::spawn(async move {
      let (client, _) = proxy_listener.accept().await.unwrap();
      let origin = TcpStream::connect(origin_addr).await.unwrap();
      relay_tcp(6, client, origin, Some(Duration::from_millis(100))).await
    });

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    assert!(
      origin_task.await.unwrap(),
      "origin saw end-of-stream during a live download"
    );
    let mut received = [0u8; 15];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"xxxxxxxxxxxxxxx");

    let stats = relay_task.await.unwrap();
    assert_eq!(stats.origin_to_client, 15);
  }

  #[tokio::test]
  async fn idle_timeout_ends_the_tunnel() {
    let (client, _client_peer) = tokio::io::duplex(64);
    let (origin, _origin_peer) = tokio::io::duplex(64);
    let stats = relay(3, client, origin, Some(Duration::from_millis(50))).await;
    assert_eq!(stats.total(), 0);
  }
}
