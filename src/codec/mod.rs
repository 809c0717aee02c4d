//! Codec module - typed encoding of payload data.
//!
//! Payload data is opaque to the connection engine. These codecs are a
//! convenience for handlers that exchange structured values:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`)
//! - [`JsonCodec`] - JSON using `serde_json`
//!
//! [`DataCodec`] picks one from the data MIME type announced in SETUP.
//!
//! # Example
//!
//! ```
//! use rsocket_engine::codec::{DataCodec, MsgPackCodec};
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! assert_eq!(DataCodec::from_mime_type("application/json"), DataCodec::Json);
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::error::{RSocketError, Result};

/// MIME type for MessagePack data.
pub const MIME_MSGPACK: &str = "application/x-msgpack";
/// MIME type for JSON data.
pub const MIME_JSON: &str = "application/json";
/// MIME type for opaque binary data.
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Codec selected by a data MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCodec {
    /// `application/x-msgpack` (also `application/msgpack`).
    MsgPack,
    /// `application/json`.
    Json,
    /// Anything else: bytes pass through untouched.
    Raw,
}

impl DataCodec {
    /// Map a MIME type string to a codec.
    pub fn from_mime_type(mime_type: &str) -> Self {
        match mime_type.trim().to_ascii_lowercase().as_str() {
            MIME_MSGPACK | "application/msgpack" => DataCodec::MsgPack,
            MIME_JSON => DataCodec::Json,
            _ => DataCodec::Raw,
        }
    }

    /// The canonical MIME type for this codec.
    pub fn mime_type(self) -> &'static str {
        match self {
            DataCodec::MsgPack => MIME_MSGPACK,
            DataCodec::Json => MIME_JSON,
            DataCodec::Raw => MIME_OCTET_STREAM,
        }
    }

    /// Encode a value with this codec.
    ///
    /// # Errors
    ///
    /// `Raw` has no structured representation and always fails.
    pub fn encode<T: serde::Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            DataCodec::MsgPack => MsgPackCodec::encode(value),
            DataCodec::Json => JsonCodec::encode(value),
            DataCodec::Raw => Err(RSocketError::Protocol(
                "raw data codec cannot encode structured values".to_string(),
            )),
        }
    }

    /// Decode a value with this codec.
    pub fn decode<T: serde::de::DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            DataCodec::MsgPack => MsgPackCodec::decode(bytes),
            DataCodec::Json => JsonCodec::decode(bytes),
            DataCodec::Raw => Err(RSocketError::Protocol(
                "raw data codec cannot decode structured values".to_string(),
            )),
        }
    }
}
