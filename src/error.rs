//! Error types for the proxy

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate loading, parsing or signing failed
  #[error("Certificate error: {0}")]
  CertificateError(String),

  /// TLS configuration or handshake failed
  #[error("TLS error: {0}")]
  TlsError(String),

  /// HTTP message construction error
  #[error("HTTP error: {0}")]
  HttpError(http::Error),

  /// HTTP engine error
  #[error("Hyper error: {0}")]
  HyperError(hyper::Error),

  /// Certificate cache storage error
  #[error("Store error: {0}")]
  StoreError(rusqlite::Error),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Dialing or talking to the origin failed
  #[error("Connection error: {0}")]
  ConnectionError(String),

  /// The serving connection cannot hand over its raw socket
  #[error("the connection does not support hijacking")]
  HijackUnsupported,

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::CertificateError(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::TlsError(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("Invalid request: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::ConnectionError(msg.into());
    tracing::error!("Connection error: {}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Other error: {}", error);
    error
  }

  /// Status code sent to the client when a request fails with this error.
  ///
  /// Everything that goes wrong between the proxy and the origin is a gateway
  /// failure; only problems with the proxy itself are a plain 500.
  pub fn status_code(&self) -> StatusCode {
    match self {
      Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
      Error::HijackUnsupported | Error::StoreError(_) | Error::Other(_) => {
        StatusCode::INTERNAL_SERVER_ERROR
      }
      Error::Io(_)
      | Error::CertificateError(_)
      | Error::TlsError(_)
      | Error::HttpError(_)
      | Error::HyperError(_)
      | Error::ConnectionError(_) => StatusCode::BAD_GATEWAY,
    }
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::HttpError(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}

impl From<hyper::Error> for Error {
  fn from(value: hyper::Error) -> Self {
    let error = Error::HyperError(value);
    tracing::debug!("Hyper error: {}", error);
    error
  }
}

impl From<rusqlite::Error> for Error {
  fn from(value: rusqlite::Error) -> Self {
    let error = Error::StoreError(value);
    tracing::error!("Store error: {}", error);
    error
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn origin_failures_are_gateway_errors() {
    assert_eq!(
      Error::ConnectionError("refused".into()).status_code(),
      StatusCode::BAD_GATEWAY
    );
    assert_eq!(
      Error::TlsError("handshake".into()).status_code(),
      StatusCode::BAD_GATEWAY
    );
    assert_eq!(
      Error::CertificateError("sign".into()).status_code(),
      StatusCode::BAD_GATEWAY
    );
  }

  #[test]
  fn hijack_unsupported_is_internal_error() {
    assert_eq!(
      Error::HijackUnsupported.status_code(),
      StatusCode::INTERNAL_SERVER_ERROR
    );
  }
}
