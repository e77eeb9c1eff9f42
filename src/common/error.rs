//! Error types for the client transport

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Transport error type
#[derive(Error, Debug)]
pub enum Error {
    /// Cancellation token tripped while acquiring a connection.
    #[error("Connection acquisition cancelled")]
    Cancelled,

    /// Dial or handshake did not complete within the connect timeout.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// I/O error on a connection. `retryable` holds iff the connection was
    /// reused and no response bytes had been observed for the request.
    #[error("Transport error: {source}")]
    Transport {
        #[source]
        source: io::Error,
        retryable: bool,
    },

    /// Proxy CONNECT answered with a non-200 status.
    #[error("Proxy tunnel rejected: {0}")]
    TunnelRejected(StatusCode),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Unexpected bytes on an idle connection or framing error on a fresh one.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation against a disposed pool or manager.
    #[error("Pool is disposed")]
    Disposed,

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn transport(source: io::Error, retryable: bool) -> Self {
        Error::Transport { source, retryable }
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Whether the retry loop may swallow this failure and re-acquire.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { retryable: true, .. })
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport {
            source: e,
            retryable: false,
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::ConnectTimeout
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_flag() {
        let e = Error::transport(io::Error::new(io::ErrorKind::BrokenPipe, "peer reset"), true);
        assert!(e.is_retryable());

        let e = Error::transport(io::Error::new(io::ErrorKind::BrokenPipe, "peer reset"), false);
        assert!(!e.is_retryable());

        assert!(!Error::ConnectTimeout.is_retryable());
    }

    #[test]
    fn test_io_error_is_not_retryable() {
        let e: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let e = Error::protocol("stray bytes on idle connection");
        assert_eq!(
            e.to_string(),
            "Protocol error: stray bytes on idle connection"
        );
    }
}
