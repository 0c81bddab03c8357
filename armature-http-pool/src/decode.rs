//! Response body decoding.

use encoding_rs::Encoding;
use tracing::debug;

use crate::{HttpPoolError, Result};

/// Charset used when a request does not name one.
pub const DEFAULT_CHARSET: &str = "UTF-8";

/// Decodes raw response bytes with a caller-chosen charset.
#[derive(Debug, Clone, Copy)]
pub struct ResponseDecoder {
    encoding: &'static Encoding,
}

impl ResponseDecoder {
    /// Create a decoder for a WHATWG charset label (`"UTF-8"`, `"GBK"`, `"iso-8859-1"`, ...).
    pub fn for_charset(charset: &str) -> Result<Self> {
        Encoding::for_label(charset.trim().as_bytes())
            .map(|encoding| Self { encoding })
            .ok_or_else(|| HttpPoolError::Decode {
                charset: charset.to_string(),
                message: "unknown charset".to_string(),
            })
    }

    /// Canonical name of the resolved encoding.
    pub fn charset(&self) -> &'static str {
        self.encoding.name()
    }

    /// Decode, failing on malformed input.
    pub fn decode(&self, body: &[u8]) -> Result<String> {
        self.encoding
            .decode_without_bom_handling_and_without_replacement(body)
            .map(|text| text.into_owned())
            .ok_or_else(|| HttpPoolError::Decode {
                charset: self.charset().to_string(),
                message: "malformed byte sequence".to_string(),
            })
    }

    /// Decode, substituting U+FFFD for malformed sequences.
    pub fn decode_lossy(&self, body: &[u8]) -> String {
        let (text, _) = self.encoding.decode_without_bom_handling(body);
        text.into_owned()
    }

    /// Encode text for a request body. Unmappable characters become numeric
    /// character references, which is what `encoding_rs` does for legacy encodings.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let (bytes, _, had_unmappable) = self.encoding.encode(text);
        if had_unmappable {
            debug!(
                charset = self.charset(),
                "Unmappable characters replaced with numeric character references"
            );
        }
        bytes.into_owned()
    }
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self {
            encoding: encoding_rs::UTF_8,
        }
    }
}
