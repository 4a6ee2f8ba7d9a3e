//! Error types for the proxy

use std::io;
use thiserror::Error;

/// Proxy error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authorization required")]
    AuthRequired,

    #[error("authorization rejected")]
    AuthReject,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("probe failed: {0}")]
    ProbeFailed(String),

    #[error("header missing: {0}")]
    HeaderMissing(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedRequest(msg.into())
    }

    pub fn upstream_unreachable<S: Into<String>>(msg: S) -> Self {
        Error::UpstreamUnreachable(msg.into())
    }

    pub fn probe_failed<S: Into<String>>(msg: S) -> Self {
        Error::ProbeFailed(msg.into())
    }

    pub fn header_missing<S: Into<String>>(name: S) -> Self {
        Error::HeaderMissing(name.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("bad flag");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::malformed("no newline in first 4096 bytes");
        assert_eq!(
            e.to_string(),
            "malformed request: no newline in first 4096 bytes"
        );
    }
}
