//! Pooled HTTP client error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for pooled HTTP client operations.
pub type Result<T> = std::result::Result<T, HttpPoolError>;

/// Pooled HTTP client errors.
///
/// Initialization errors (`Configuration`, `KeyMaterial`, `TrustMaterial`)
/// are fatal: the client must not be used when one of them is returned.
/// Everything else is a per-request outcome.
#[derive(Debug, Error)]
pub enum HttpPoolError {
    /// Missing or inconsistent configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Client key store could not be read or decrypted.
    #[error("Key material error: {0}")]
    KeyMaterial(String),

    /// A trusted certificate file could not be read or parsed.
    #[error("Trust material error: {0}")]
    TrustMaterial(String),

    /// No pooled connection became available within the connect timeout.
    #[error("Connection pool exhausted for {destination} after waiting {waited:?}")]
    PoolExhausted {
        /// Destination the caller asked for.
        destination: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The pool has been shut down.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The client was used before `initialize()`.
    #[error("HTTP client is not initialized")]
    NotInitialized,

    /// Transient network failure.
    #[error("I/O error: {message}")]
    Io {
        /// Error description.
        message: String,
        /// Whether the failure happened before any request bytes were written.
        before_send: bool,
    },

    /// Connect or socket timeout elapsed.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-2xx response or malformed HTTP exchange.
    #[error("Protocol error: {status} - {body}")]
    Protocol {
        /// HTTP status code (0 when no valid status line was received).
        status: u16,
        /// Decoded response body.
        body: String,
    },

    /// Response body could not be decoded with the requested charset.
    #[error("Failed to decode response body as {charset}: {message}")]
    Decode {
        /// Charset label used for decoding.
        charset: String,
        /// Error description.
        message: String,
    },

    /// TLS handshake with the server failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Request could not be assembled (bad header name or value).
    #[error("Failed to build request: {0}")]
    RequestBuild(String),

    /// Invalid request URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl HttpPoolError {
    /// I/O failure that happened before any request bytes were written.
    pub fn io_before_send(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            before_send: true,
        }
    }

    /// I/O failure after the request was (partially) transmitted.
    pub fn io_after_send(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            before_send: false,
        }
    }

    /// Check if the request may be retried automatically.
    ///
    /// Only I/O failures that occurred before any bytes were sent qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io {
                before_send: true,
                ..
            }
        )
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if this error aborts initialization.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::KeyMaterial(_) | Self::TrustMaterial(_)
        )
    }

    /// Get the HTTP status code if this is a protocol error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Protocol { status, .. } if *status != 0 => Some(*status),
            _ => None,
        }
    }

    /// Get the response body carried by a protocol error.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Protocol { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HttpPoolError {
    fn from(err: std::io::Error) -> Self {
        Self::io_after_send(err.to_string())
    }
}
