//! Error types for the proxy.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while proxying.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// SOCKS5 protocol violation from the client
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Cipher setup or transform failure
    #[error("cipher error: {0}")]
    Crypto(String),

    /// Destination or relay hostname did not resolve
    #[error("resolve failed: {0}")]
    Resolve(String),

    /// Upstream connect did not complete within the timeout
    #[error("connect timed out")]
    ConnectTimeout,

    /// No upstream bytes arrived for a full idle window
    #[error("idle timeout expired")]
    IdleTimeout,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Bypass ACL file could not be loaded
    #[error("acl error: {0}")]
    Acl(String),
}

impl Error {
    /// Create a new protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new cipher error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new resolution error
    pub fn resolve(msg: impl Into<String>) -> Self {
        Error::Resolve(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error is one of the two session timers firing
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout | Error::IdleTimeout)
    }

    /// Check if this error is the remote end going away mid-stream
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Network(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::protocol("unsupported command: 2");
        assert_eq!(err.to_string(), "protocol violation: unsupported command: 2");

        let err = Error::IdleTimeout;
        assert_eq!(err.to_string(), "idle timeout expired");
    }

    #[test]
    fn test_error_timeout() {
        assert!(Error::ConnectTimeout.is_timeout());
        assert!(Error::IdleTimeout.is_timeout());
        assert!(!Error::protocol("bad version").is_timeout());
    }

    #[test]
    fn test_error_disconnect() {
        let reset = Error::Network(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_disconnect());
        assert!(!Error::ConnectTimeout.is_disconnect());
    }
}
