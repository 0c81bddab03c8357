//! # Armature HTTP Pool
//!
//! An HTTP/1.1 client that executes every request through a bounded pool of
//! reusable connections, with per-request timeout overrides, a fixed-count
//! retry primitive and custom TLS trust material.
//!
//! ## Features
//!
//! - **Connection Pooling**: per-destination and global caps, idle time-to-live,
//!   liveness checks on connections idle for more than a second
//! - **Timeouts**: client-wide defaults, overridable per request (`<= 0` means unset)
//! - **Retry**: requests that failed before any bytes were sent are retried on a
//!   fresh connection
//! - **TLS Trust Material**: certificate directories, PKCS#12 client identity,
//!   hostname allow-lists
//! - **Charsets**: request bodies encoded and responses decoded with any WHATWG label
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use armature_http_pool::{ClientConfig, PooledHttpClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = PooledHttpClient::new(ClientConfig::default())?;
//!
//!     let body = client.get("https://api.example.com/users").await?;
//!     println!("{body}");
//!     Ok(())
//! }
//! ```
//!
//! ## Trust Material and Overrides
//!
//! ```rust,no_run
//! use armature_http_pool::{ClientConfig, PooledHttpClient, RequestTimeouts, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ClientConfig::from_file("http-pool.toml")?;
//!     config.retry = RetryPolicy::fixed(2);
//!     config.tls.trusted_hosts = Some(vec!["api.example.com".to_string()]);
//!
//!     let client = PooledHttpClient::new(config)?;
//!     let body = client
//!         .post_json_with(
//!             "https://api.example.com/orders",
//!             r#"{"item":"widget"}"#,
//!             RequestTimeouts::new(10_000, -1),
//!             "UTF-8",
//!         )
//!         .await?;
//!     println!("{body}");
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod decode;
mod destination;
mod error;
mod pool;
mod request;
mod response;
mod retry;
mod tls;
mod transport;

pub use client::PooledHttpClient;
pub use config::{
    ClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_CONNECTION_TTL, DEFAULT_MAX_PER_ROUTE,
    DEFAULT_MAX_TOTAL, DEFAULT_SOCKET_TIMEOUT, PoolConfig, TimeoutPolicy, TrustMaterial,
    VerificationMode,
};
pub use decode::{DEFAULT_CHARSET, ResponseDecoder};
pub use destination::{Destination, Scheme};
pub use error::{HttpPoolError, Result};
pub use pool::{ConnectionPool, PoolStats, PooledConnection, RouteStats, VALIDATE_AFTER_INACTIVITY};
pub use request::{
    APPLICATION_FORM, APPLICATION_JSON, APPLICATION_XML, RequestBody, RequestDescriptor,
    RequestTimeouts,
};
pub use response::Response;
pub use retry::RetryPolicy;
pub use tls::{HostnameVerifier, KeyMaterial, TlsContext, TrustFactory, TrustStore};
pub use transport::{Connection, Connector, HttpConnector};

// Re-export common types
pub use bytes::Bytes;
pub use http::{HeaderMap, Method, StatusCode, header};
pub use url::Url;

/// Prelude for common imports.
///
/// ```
/// use armature_http_pool::prelude::*;
/// ```
pub mod prelude {
    pub use crate::client::PooledHttpClient;
    pub use crate::config::{ClientConfig, PoolConfig, TimeoutPolicy, TrustMaterial, VerificationMode};
    pub use crate::error::{HttpPoolError, Result};
    pub use crate::request::{RequestBody, RequestDescriptor, RequestTimeouts};
    pub use crate::response::Response;
    pub use crate::retry::RetryPolicy;
    pub use http::{Method, StatusCode};
}
