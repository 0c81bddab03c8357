//! HTTP response wrapper.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::decode::ResponseDecoder;
use crate::{HttpPoolError, Result};

/// A fully read response whose body has been decoded with the request charset.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    text: String,
}

impl Response {
    /// Decode a raw response.
    ///
    /// Any non-2xx status, or a 2xx body that does not decode with the
    /// requested charset, becomes [`HttpPoolError::Protocol`] carrying the
    /// status and the lossily decoded body.
    pub(crate) fn from_http(response: http::Response<Bytes>, decoder: &ResponseDecoder) -> Result<Self> {
        let (parts, body) = response.into_parts();

        if !parts.status.is_success() {
            return Err(HttpPoolError::Protocol {
                status: parts.status.as_u16(),
                body: decoder.decode_lossy(&body),
            });
        }

        let text = match decoder.decode(&body) {
            Ok(text) => text,
            Err(e) => {
                debug!(status = parts.status.as_u16(), error = %e, "Undecodable response body");
                return Err(HttpPoolError::Protocol {
                    status: parts.status.as_u16(),
                    body: decoder.decode_lossy(&body),
                });
            }
        };
        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body,
            text,
        })
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
    }

    /// Get the raw response body.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Get the decoded body.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consume the response and return the decoded body.
    pub fn into_text(self) -> String {
        self.text
    }

    /// Parse the decoded body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.text).map_err(|e| HttpPoolError::Decode {
            charset: "json".to_string(),
            message: e.to_string(),
        })
    }

    /// Get the content length if available.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// Get the content type if available.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Whether the server asked for the connection to be closed.
pub(crate) fn requests_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: u16, body: &'static [u8]) -> http::Response<Bytes> {
        http::Response::builder()
            .status(status)
            .header("content-type", "text/plain")
            .body(Bytes::from_static(body))
            .unwrap()
    }

    #[test]
    fn test_success_is_decoded() {
        let response = Response::from_http(raw(200, b"hello"), &ResponseDecoder::default()).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text(), "hello");
        assert_eq!(response.content_type(), Some("text/plain"));
    }

    #[test]
    fn test_error_status_keeps_body() {
        let err = Response::from_http(raw(503, b"try later"), &ResponseDecoder::default()).unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.body(), Some("try later"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_redirect_is_protocol_error() {
        let err = Response::from_http(raw(302, b""), &ResponseDecoder::default()).unwrap_err();
        assert_eq!(err.status_code(), Some(302));
    }

    #[test]
    fn test_undecodable_success_body() {
        let err = Response::from_http(raw(200, &[0xff, 0xfe, 0x41]), &ResponseDecoder::default())
            .unwrap_err();
        assert!(matches!(err, HttpPoolError::Protocol { .. }));
        assert_eq!(err.status_code(), Some(200));
        assert_eq!(err.body(), Some("\u{fffd}\u{fffd}A"));
    }

    #[test]
    fn test_json() {
        let response =
            Response::from_http(raw(200, br#"{"id":7}"#), &ResponseDecoder::default()).unwrap();
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn test_connection_close_detection() {
        let mut headers = HeaderMap::new();
        assert!(!requests_close(&headers));
        headers.insert(http::header::CONNECTION, "keep-alive".parse().unwrap());
        assert!(!requests_close(&headers));
        headers.insert(http::header::CONNECTION, "Upgrade, Close".parse().unwrap());
        assert!(requests_close(&headers));
    }
}
