//! Request descriptors.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{HeaderName, HeaderValue, Method};
use serde::Serialize;
use std::time::Duration;
use url::Url;

use crate::config::TimeoutPolicy;
use crate::decode::{DEFAULT_CHARSET, ResponseDecoder};
use crate::destination::Destination;
use crate::{HttpPoolError, Result};

/// JSON media type.
pub const APPLICATION_JSON: &str = "application/json";
/// XML media type.
pub const APPLICATION_XML: &str = "application/xml";
/// URL-encoded form media type.
pub const APPLICATION_FORM: &str = "application/x-www-form-urlencoded";

/// Per-request timeout overrides in milliseconds.
///
/// A value `<= 0` means "unset": the client-wide default applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    /// Socket (read) timeout override.
    pub socket_timeout_ms: i64,
    /// Connect timeout override.
    pub connect_timeout_ms: i64,
}

impl RequestTimeouts {
    /// Both timeouts fall back to the client defaults.
    pub const UNSET: Self = Self {
        socket_timeout_ms: -1,
        connect_timeout_ms: -1,
    };

    /// Override both timeouts.
    pub const fn new(socket_timeout_ms: i64, connect_timeout_ms: i64) -> Self {
        Self {
            socket_timeout_ms,
            connect_timeout_ms,
        }
    }

    /// Effective timeouts. The result never contains a zero duration.
    pub fn resolve(&self, defaults: &TimeoutPolicy) -> TimeoutPolicy {
        TimeoutPolicy {
            socket_timeout: resolve_ms(self.socket_timeout_ms, defaults.socket_timeout),
            connect_timeout: resolve_ms(self.connect_timeout_ms, defaults.connect_timeout),
        }
    }
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self::UNSET
    }
}

fn resolve_ms(value: i64, default: Duration) -> Duration {
    if value > 0 {
        Duration::from_millis(value as u64)
    } else {
        default
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Raw(Bytes),
    Text(String),
}

/// Request body with its declared media type.
///
/// Text bodies are encoded with the request charset when the request is built.
#[derive(Debug, Clone)]
pub struct RequestBody {
    payload: Payload,
    content_type: Option<String>,
}

impl RequestBody {
    /// Raw bytes sent as-is.
    pub fn bytes(bytes: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            payload: Payload::Raw(bytes.into()),
            content_type,
        }
    }

    /// Text with a media type; `charset=` is appended on the wire.
    pub fn text(text: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            payload: Payload::Text(text.into()),
            content_type: Some(mime.into()),
        }
    }

    /// A JSON document that is already serialized.
    pub fn json(json: impl Into<String>) -> Self {
        Self::text(json, APPLICATION_JSON)
    }

    /// Serialize a value as JSON.
    pub fn json_value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let json = serde_json::to_string(value)
            .map_err(|e| HttpPoolError::RequestBuild(format!("JSON serialization failed: {e}")))?;
        Ok(Self::json(json))
    }

    /// An XML document.
    pub fn xml(xml: impl Into<String>) -> Self {
        Self::text(xml, APPLICATION_XML)
    }

    /// URL-encoded form parameters, in order.
    pub fn form<K, V>(params: &[(K, V)]) -> Result<Self>
    where
        K: Serialize,
        V: Serialize,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|e| HttpPoolError::RequestBuild(format!("form encoding failed: {e}")))?;
        Ok(Self::text(encoded, APPLICATION_FORM))
    }

    /// Declared media type, without charset.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn encode(&self, decoder: &ResponseDecoder) -> (Bytes, Option<String>) {
        match &self.payload {
            Payload::Raw(bytes) => (bytes.clone(), self.content_type.clone()),
            Payload::Text(text) => (
                Bytes::from(decoder.encode(text)),
                self.content_type
                    .as_ref()
                    .map(|mime| format!("{mime}; charset={}", decoder.charset())),
            ),
        }
    }
}

/// Everything needed to issue one request.
///
/// Owned by the caller; the client only borrows it for the duration of a call.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Target URL (`http` or `https`).
    pub url: Url,
    /// HTTP method.
    pub method: Method,
    /// Optional body.
    pub body: Option<RequestBody>,
    /// Headers in send order; duplicates are sent as separate fields.
    pub headers: Vec<(String, String)>,
    /// Timeout overrides.
    pub timeouts: RequestTimeouts,
    /// Charset for text bodies and for decoding the response.
    pub charset: String,
    /// Discard the connection after this request, whatever the outcome.
    pub abort_on_completion: bool,
}

impl RequestDescriptor {
    /// A request with no body, default timeouts and UTF-8.
    pub fn new(method: Method, url: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            url: Url::parse(url.as_ref())?,
            method,
            body: None,
            headers: Vec::new(),
            timeouts: RequestTimeouts::UNSET,
            charset: DEFAULT_CHARSET.to_string(),
            abort_on_completion: false,
        })
    }

    /// A GET request.
    pub fn get(url: impl AsRef<str>) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    /// A POST request with a body.
    pub fn post(url: impl AsRef<str>, body: RequestBody) -> Result<Self> {
        let mut descriptor = Self::new(Method::POST, url)?;
        descriptor.body = Some(body);
        Ok(descriptor)
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set timeout overrides.
    pub fn timeouts(mut self, timeouts: RequestTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the charset.
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// Discard the connection once the request completes.
    pub fn abort_on_completion(mut self, abort: bool) -> Self {
        self.abort_on_completion = abort;
        self
    }

    /// Pool partition for this request.
    pub fn destination(&self) -> Result<Destination> {
        Destination::from_url(&self.url)
    }

    /// Assemble the wire request.
    ///
    /// The URI is sent in origin form. `Host` and `User-Agent` are set unless
    /// the caller supplied them; `Content-Type` comes from the body.
    pub(crate) fn to_http(
        &self,
        destination: &Destination,
        decoder: &ResponseDecoder,
        user_agent: &str,
    ) -> Result<http::Request<Bytes>> {
        let path = match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_string(),
        };

        let mut builder = http::Request::builder().method(self.method.clone()).uri(path);
        let (body, content_type) = match &self.body {
            Some(body) => body.encode(decoder),
            None => (Bytes::new(), None),
        };

        let headers = builder
            .headers_mut()
            .ok_or_else(|| HttpPoolError::RequestBuild("invalid method or URI".to_string()))?;
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| HttpPoolError::RequestBuild(format!("header name '{name}': {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| HttpPoolError::RequestBuild(format!("header value for {name}: {e}")))?;
            headers.append(name, value);
        }
        if !headers.contains_key(HOST) {
            headers.insert(HOST, header_value(&destination.authority())?);
        }
        if !headers.contains_key(USER_AGENT) && !user_agent.is_empty() {
            headers.insert(USER_AGENT, header_value(user_agent)?);
        }
        if let Some(content_type) = content_type
            && !headers.contains_key(CONTENT_TYPE)
        {
            headers.insert(CONTENT_TYPE, header_value(&content_type)?);
        }

        builder
            .body(body)
            .map_err(|e| HttpPoolError::RequestBuild(e.to_string()))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::try_from(value).map_err(|e| HttpPoolError::RequestBuild(format!("'{value}': {e}")))
}
