use clap::{Parser, Subcommand};
use relayjack::{
  CertificateAuthority, HistorySink, JsonLinesWriter, Mode, Proxy, ProxyConfig, SessionContext,
  DEFAULT_FLUSH_INTERVAL,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Forward HTTP/HTTPS proxy with optional TLS interception
#[derive(Parser, Debug)]
#[command(name = "relayjack", version, about)]
struct Cli {
  #[command(subcommand)]
  command: Command,

  /// Listen address [default: 0.0.0.0]
  #[arg(short, long, global = true)]
  server: Option<String>,

  /// Listen port [default: 8080]
  #[arg(short, long, global = true)]
  port: Option<u16>,

  /// Root CA certificate (PEM)
  #[arg(short = 'c', long, global = true)]
  certpath: Option<PathBuf>,

  /// Root CA private key (PEM)
  #[arg(short = 'k', long, global = true)]
  keypath: Option<PathBuf>,

  /// Leaf certificate cache database
  #[arg(long, global = true)]
  certcache: Option<PathBuf>,

  /// TOML config file; flags override its values
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Log filter used when RUST_LOG is not set
  #[arg(long, global = true, default_value = "info")]
  log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Tunnel CONNECT traffic without interception
  Basic,
  /// Intercept CONNECT traffic and log every request
  Mitm,
  /// Intercept CONNECT traffic and record every request to a history file
  MitmRecord {
    /// JSON-lines history file
    #[arg(long, default_value = "history.jsonl")]
    history: PathBuf,
  },
  /// Generate a new root CA certificate and key
  GenCa,
}

const HISTORY_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let cli = Cli::parse();

  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
  tracing_subscriber::fmt().with_env_filter(env_filter).init();

  let config = load_config(&cli)?;

  match cli.command {
    Command::GenCa => {
      let ca = CertificateAuthority::generate(&config.ca_cert_path, &config.ca_key_path).await?;
      tracing::info!("Wrote root CA to {}", config.ca_cert_path.display());
      tracing::info!("Wrote root key to {}", config.ca_key_path.display());
      tracing::info!("Fingerprint {}", ca.fingerprint());
    }
    Command::Basic => {
      let proxy = Proxy::builder()
        .config(config)
        .mode(Mode::Transparent)
        .build()
        .await?;
      let listen = proxy.config().listen.clone();
      proxy.run(&listen).await?;
    }
    Command::Mitm => {
      let proxy = Proxy::builder()
        .config(config)
        .mode(Mode::Mitm)
        .hook(log_session)
        .build()
        .await?;
      let listen = proxy.config().listen.clone();
      proxy.run(&listen).await?;
    }
    Command::MitmRecord { history } => {
      let writer = JsonLinesWriter::open(&history).await?;
      let sink = HistorySink::spawn(writer, HISTORY_QUEUE, DEFAULT_FLUSH_INTERVAL);
      tracing::info!("Recording history to {}", history.display());
      let proxy = Proxy::builder()
        .config(config)
        .mode(Mode::Mitm)
        .shared_hook(sink.hook())
        .build()
        .await?;
      let listen = proxy.config().listen.clone();
      proxy.run(&listen).await?;
    }
  }
  Ok(())
}

fn load_config(cli: &Cli) -> relayjack::Result<ProxyConfig> {
  let mut config = match &cli.config {
    Some(path) => ProxyConfig::from_toml_file(path)?,
    None => ProxyConfig {
      listen: "0.0.0.0:8080".to_string(),
      ..ProxyConfig::default()
    },
  };

  let (host, port) = match config.listen.rsplit_once(':') {
    Some((host, port)) => (host.to_string(), port.parse().unwrap_or(8080)),
    None => (config.listen.clone(), 8080),
  };
  let host = cli.server.clone().unwrap_or(host);
  let port = cli.port.unwrap_or(port);
  config.listen = if host.contains(':') && !host.starts_with('[') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  };

  if let Some(path) = &cli.certpath {
    config.ca_cert_path = path.clone();
  }
  if let Some(path) = &cli.keypath {
    config.ca_key_path = path.clone();
  }
  if let Some(path) = &cli.certcache {
    config.cert_cache_path = path.clone();
  }
  Ok(config)
}

fn log_session(session: &SessionContext) {
  let request = &session.request;
  let status = session
    .response
    .as_ref()
    .map(|response| response.status.as_u16())
    .unwrap_or_default();
  tracing::debug!(
    "[{}] {} {}:{}{} -> {} ({} bytes in {:?})",
    session.session,
    request.method,
    request.host,
    request.port,
    request.uri.path(),
    status,
    session.transfer_bytes,
    session.elapsed
  );
}
