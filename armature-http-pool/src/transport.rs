//! Transport connections.
//!
//! The pool only deals in [`Connection`]s produced by a [`Connector`]. The
//! default [`HttpConnector`] opens TCP sockets (TLS for `https`) and speaks
//! HTTP/1.1 through hyper's client connection API.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::destination::{Destination, Scheme};
use crate::tls::TlsContext;
use crate::{HttpPoolError, Result};

/// One open transport connection able to carry sequential requests.
#[async_trait]
pub trait Connection: Send {
    /// Send a request and read the complete response.
    ///
    /// Failures before any request bytes reach the wire must be reported with
    /// [`HttpPoolError::io_before_send`]; anything later is not retryable.
    async fn send(&mut self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>>;

    /// Cheap liveness check.
    fn is_open(&self) -> bool;
}

/// Opens new connections for a destination.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection. `timeout` is the whole budget for every setup
    /// step (TCP connect, TLS handshake).
    async fn connect(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>>;
}

/// TCP/TLS connector speaking HTTP/1.1.
#[derive(Clone)]
pub struct HttpConnector {
    tls: TlsConnector,
}

impl HttpConnector {
    /// Create a connector that secures `https` destinations with `tls`.
    pub fn new(tls: &TlsContext) -> Self {
        Self {
            tls: TlsConnector::from(tls.client_config()),
        }
    }

    async fn open_tcp(
        &self,
        destination: &Destination,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<TcpStream> {
        let stream = tokio::time::timeout_at(
            deadline,
            TcpStream::connect((destination.host(), destination.port())),
        )
        .await
        .map_err(|_| HttpPoolError::Timeout(timeout))?
        .map_err(|e| HttpPoolError::io_before_send(format!("connect to {destination} failed: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| HttpPoolError::io_before_send(format!("failed to set TCP_NODELAY: {e}")))?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        // TCP connect and TLS handshake share one deadline.
        let deadline = Instant::now() + timeout;
        let tcp = self.open_tcp(destination, deadline, timeout).await?;

        match destination.scheme() {
            Scheme::Http => handshake(TokioIo::new(tcp), destination).await,
            Scheme::Https => {
                let name = ServerName::try_from(destination.host().to_string()).map_err(|e| {
                    HttpPoolError::InvalidUrl(format!("invalid TLS server name: {e}"))
                })?;
                let tls = tokio::time::timeout_at(deadline, self.tls.connect(name, tcp))
                    .await
                    .map_err(|_| HttpPoolError::Timeout(timeout))?
                    .map_err(|e| {
                        HttpPoolError::Tls(format!("handshake with {destination} failed: {e}"))
                    })?;
                handshake(TokioIo::new(tls), destination).await
            }
        }
    }
}

async fn handshake<T>(io: T, destination: &Destination) -> Result<Box<dyn Connection>>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake::<_, Full<Bytes>>(io)
        .await
        .map_err(|e| HttpPoolError::io_before_send(format!("HTTP handshake failed: {e}")))?;

    let target = destination.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(destination = %target, error = %e, "Connection closed with error");
        }
    });

    debug!(destination = %destination, "Opened connection");
    Ok(Box::new(HyperConnection { sender }))
}

struct HyperConnection {
    sender: http1::SendRequest<Full<Bytes>>,
}

#[async_trait]
impl Connection for HyperConnection {
    async fn send(&mut self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>> {
        self.sender
            .ready()
            .await
            .map_err(|e| HttpPoolError::io_before_send(format!("connection not ready: {e}")))?;

        let response = match self.sender.try_send_request(request.map(Full::new)).await {
            Ok(response) => response,
            Err(mut e) => {
                return Err(if e.take_message().is_some() {
                    HttpPoolError::io_before_send(format!("request not sent: {}", e.error()))
                } else {
                    HttpPoolError::io_after_send(format!("request failed: {}", e.error()))
                });
            }
        };

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| HttpPoolError::io_after_send(format!("failed to read response body: {e}")))?
            .to_bytes();
        Ok(http::Response::from_parts(parts, body))
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
