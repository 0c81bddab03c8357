//! Pooled HTTP client implementation.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, TimeoutPolicy};
use crate::decode::{DEFAULT_CHARSET, ResponseDecoder};
use crate::destination::Destination;
use crate::pool::{ConnectionPool, PoolStats};
use crate::request::{APPLICATION_JSON, APPLICATION_XML, RequestBody, RequestDescriptor, RequestTimeouts};
use crate::response::{Response, requests_close};
use crate::tls::{TlsContext, TrustFactory};
use crate::transport::{Connector, HttpConnector};
use crate::{HttpPoolError, Result};

struct ClientState {
    pool: ConnectionPool,
    tls: TlsContext,
}

struct ClientInner {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    state: OnceLock<ClientState>,
    init_lock: Mutex<()>,
}

/// HTTP client executing every request through a bounded connection pool.
///
/// Cloning is cheap; clones share the pool and TLS context.
#[derive(Clone)]
pub struct PooledHttpClient {
    inner: Arc<ClientInner>,
}

impl PooledHttpClient {
    /// Validate `config`, build the TLS context and the pool.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Self::uninitialized(config);
        client.initialize()?;
        Ok(client)
    }

    /// Create a client that opens connections with `connector` instead of
    /// plain TCP/TLS sockets.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                connector: Some(connector),
                state: OnceLock::new(),
                init_lock: Mutex::new(()),
            }),
        };
        client.initialize()?;
        Ok(client)
    }

    /// Create a client without initializing it.
    ///
    /// Every request fails with [`HttpPoolError::NotInitialized`] until
    /// [`PooledHttpClient::initialize`] succeeds.
    pub fn uninitialized(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector: None,
                state: OnceLock::new(),
                init_lock: Mutex::new(()),
            }),
        }
    }

    /// Build the TLS context and the pool. Calling this again after a
    /// successful initialization does nothing.
    pub fn initialize(&self) -> Result<()> {
        if self.inner.state.get().is_some() {
            return Ok(());
        }

        let _guard = self.inner.init_lock.lock();
        if self.inner.state.get().is_some() {
            debug!("HTTP client already initialized");
            return Ok(());
        }

        let config = &self.inner.config;
        config.validate()?;

        let (tls, hostnames) = TrustFactory::build(&config.tls)?;
        let connector = match &self.inner.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(HttpConnector::new(&tls)) as Arc<dyn Connector>,
        };
        let pool = ConnectionPool::new(config.pool.clone(), connector);

        info!(
            max_per_route = config.pool.max_per_route,
            max_total = config.pool.max_total,
            socket_timeout = ?config.timeouts.socket_timeout,
            connect_timeout = ?config.timeouts.connect_timeout,
            retry_enabled = config.retry.enabled,
            retry_count = config.retry.max_attempts,
            hostname_verification = %hostnames.mode(),
            "HTTP client initialized"
        );

        // The init lock makes this the only writer.
        let _ = self.inner.state.set(ClientState { pool, tls });
        Ok(())
    }

    /// Whether [`PooledHttpClient::initialize`] has completed.
    pub fn is_initialized(&self) -> bool {
        self.inner.state.get().is_some()
    }

    fn state(&self) -> Result<&ClientState> {
        self.inner.state.get().ok_or(HttpPoolError::NotInitialized)
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Get the TLS context shared by all secure connections.
    pub fn tls_context(&self) -> Result<&TlsContext> {
        Ok(&self.state()?.tls)
    }

    /// Get the connection pool.
    pub fn pool(&self) -> Result<&ConnectionPool> {
        Ok(&self.state()?.pool)
    }

    /// Pool usage snapshot.
    pub fn stats(&self) -> Result<PoolStats> {
        Ok(self.state()?.pool.stats())
    }

    /// Drop idle connections past their time-to-live.
    pub fn purge_expired(&self) -> Result<usize> {
        Ok(self.state()?.pool.purge_expired())
    }

    /// Close the pool. Later requests fail with [`HttpPoolError::PoolClosed`].
    pub fn shutdown(&self) {
        if let Some(state) = self.inner.state.get() {
            state.pool.close();
        }
    }

    /// Execute a request and decode its response.
    ///
    /// Attempts that fail before sending are retried on a fresh connection as
    /// the retry policy allows. The leased connection is released on every
    /// path; it goes back to the pool only when the exchange completed, the
    /// server did not ask to close, and neither the request nor the client
    /// asked for eager release.
    pub async fn execute(&self, descriptor: &RequestDescriptor) -> Result<Response> {
        let state = self.state()?;
        let config = &self.inner.config;

        let destination = descriptor.destination()?;
        let decoder = ResponseDecoder::for_charset(&descriptor.charset)?;
        let timeouts = descriptor.timeouts.resolve(&config.timeouts);
        let abort = descriptor.abort_on_completion || config.release_connection_eagerly;

        let mut retries = 0;
        loop {
            let request = descriptor.to_http(&destination, &decoder, &config.user_agent)?;
            match self
                .attempt(&state.pool, &destination, request, timeouts, retries > 0, abort)
                .await
            {
                Ok(raw) => {
                    debug!(
                        method = %descriptor.method,
                        destination = %destination,
                        status = raw.status().as_u16(),
                        "Request completed"
                    );
                    return Response::from_http(raw, &decoder);
                }
                Err(e) if config.retry.should_retry(retries, &e) => {
                    retries += 1;
                    debug!(
                        attempt = retries + 1,
                        destination = %destination,
                        error = %e,
                        "Retrying request on a fresh connection"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        pool: &ConnectionPool,
        destination: &Destination,
        request: http::Request<bytes::Bytes>,
        timeouts: TimeoutPolicy,
        fresh: bool,
        abort: bool,
    ) -> Result<http::Response<bytes::Bytes>> {
        let mut conn = if fresh {
            pool.acquire_new(destination, timeouts.connect_timeout).await?
        } else {
            pool.acquire(destination, timeouts.connect_timeout).await?
        };

        let outcome = tokio::time::timeout(timeouts.socket_timeout, conn.send(request))
            .await
            .unwrap_or(Err(HttpPoolError::Timeout(timeouts.socket_timeout)));

        let reusable = !abort && matches!(&outcome, Ok(response) if !requests_close(response.headers()));
        conn.release(reusable);
        outcome
    }

    /// GET `url` and return the decoded body.
    pub async fn execute_get(&self, url: &str, timeouts: RequestTimeouts) -> Result<String> {
        let descriptor = RequestDescriptor::get(url)?.timeouts(timeouts);
        Ok(self.execute(&descriptor).await?.into_text())
    }

    /// POST a text body of type `content_type`, encoded with `charset`, and
    /// return the body decoded with the same charset.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_post(
        &self,
        url: &str,
        body: &str,
        content_type: &str,
        charset: &str,
        headers: &[(&str, &str)],
        timeouts: RequestTimeouts,
        abort_on_completion: bool,
    ) -> Result<String> {
        let mut descriptor = RequestDescriptor::post(url, RequestBody::text(body, content_type))?
            .charset(charset)
            .timeouts(timeouts)
            .abort_on_completion(abort_on_completion);
        for (name, value) in headers {
            descriptor = descriptor.header(*name, *value);
        }
        Ok(self.execute(&descriptor).await?.into_text())
    }

    /// GET with default timeouts.
    pub async fn get(&self, url: &str) -> Result<String> {
        self.execute_get(url, RequestTimeouts::UNSET).await
    }

    /// POST a JSON document with default timeouts.
    pub async fn post_json(&self, url: &str, json: &str) -> Result<String> {
        self.post_json_with(url, json, RequestTimeouts::UNSET, DEFAULT_CHARSET)
            .await
    }

    /// POST a JSON document with explicit timeouts and charset.
    pub async fn post_json_with(
        &self,
        url: &str,
        json: &str,
        timeouts: RequestTimeouts,
        charset: &str,
    ) -> Result<String> {
        self.execute_post(url, json, APPLICATION_JSON, charset, &[], timeouts, false)
            .await
    }

    /// POST a JSON document with extra headers.
    pub async fn post_json_with_headers(
        &self,
        url: &str,
        json: &str,
        headers: &[(&str, &str)],
    ) -> Result<String> {
        self.execute_post(
            url,
            json,
            APPLICATION_JSON,
            DEFAULT_CHARSET,
            headers,
            RequestTimeouts::UNSET,
            false,
        )
        .await
    }

    /// POST a serializable value as JSON.
    pub async fn post_json_value<T: Serialize + ?Sized>(&self, url: &str, value: &T) -> Result<String> {
        let descriptor = RequestDescriptor::post(url, RequestBody::json_value(value)?)?;
        Ok(self.execute(&descriptor).await?.into_text())
    }

    /// POST an XML document.
    pub async fn post_xml(
        &self,
        url: &str,
        xml: &str,
        timeouts: RequestTimeouts,
        charset: &str,
        headers: &[(&str, &str)],
    ) -> Result<String> {
        self.execute_post(
            url,
            xml,
            APPLICATION_XML,
            charset,
            headers,
            timeouts,
            false,
        )
        .await
    }

    /// POST URL-encoded form parameters.
    pub async fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
        timeouts: RequestTimeouts,
        abort_on_completion: bool,
    ) -> Result<String> {
        let descriptor = RequestDescriptor::post(url, RequestBody::form(params)?)?
            .timeouts(timeouts)
            .abort_on_completion(abort_on_completion);
        Ok(self.execute(&descriptor).await?.into_text())
    }

    /// Issue a GET on `handle` without waiting for it.
    ///
    /// Failures are logged; the returned handle still yields the result.
    pub fn spawn_get(&self, handle: &Handle, url: impl Into<String>) -> JoinHandle<Result<String>> {
        let client = self.clone();
        let url = url.into();
        handle.spawn(async move {
            let result = client.get(&url).await;
            if let Err(e) = &result {
                warn!(url = %url, error = %e, "Background GET failed");
            }
            result
        })
    }
}

impl std::fmt::Debug for PooledHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHttpClient")
            .field("config", &self.inner.config)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
