//! Application-level payload: optional data plus optional metadata.
//!
//! # Example
//!
//! ```
//! use rsocket_engine::Payload;
//!
//! let payload = Payload::from("hello").with_metadata("route.echo");
//! assert_eq!(payload.data_utf8(), Some("hello"));
//! assert_eq!(payload.metadata().map(|m| &m[..]), Some(&b"route.echo"[..]));
//! ```

use bytes::Bytes;

use crate::codec::{JsonCodec, MsgPackCodec};
use crate::error::Result;

/// Immutable data + metadata pair passed into and out of handlers.
///
/// Empty data is normalized to `None` so a payload survives a trip over the
/// wire unchanged. Empty metadata stays `Some`, because the metadata flag
/// itself is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    data: Option<Bytes>,
    metadata: Option<Bytes>,
}

impl Payload {
    /// Create a payload from optional parts.
    pub fn new(data: Option<Bytes>, metadata: Option<Bytes>) -> Self {
        Self {
            data: data.filter(|d| !d.is_empty()),
            metadata,
        }
    }

    /// Payload with neither data nor metadata.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Payload carrying only data.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self::new(Some(data.into()), None)
    }

    /// Payload carrying only metadata.
    pub fn from_metadata(metadata: impl Into<Bytes>) -> Self {
        Self::new(None, Some(metadata.into()))
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Data bytes, if any.
    #[inline]
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// Metadata bytes, if any.
    #[inline]
    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Data as a slice (empty when absent).
    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// Data as UTF-8 text, if present and valid.
    pub fn data_utf8(&self) -> Option<&str> {
        self.data.as_deref().and_then(|d| std::str::from_utf8(d).ok())
    }

    /// True when neither data nor metadata is present.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.metadata.is_none()
    }

    /// Split into `(data, metadata)`.
    pub fn into_parts(self) -> (Option<Bytes>, Option<Bytes>) {
        (self.data, self.metadata)
    }

    /// Encode a value as MsgPack data.
    pub fn from_msgpack<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self::from_data(MsgPackCodec::encode(value)?))
    }

    /// Decode the data as MsgPack.
    pub fn decode_msgpack<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(self.data_bytes())
    }

    /// Encode a value as JSON data.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self::from_data(JsonCodec::encode(value)?))
    }

    /// Decode the data as JSON.
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        JsonCodec::decode(self.data_bytes())
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::from_data(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Self::from_data(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::from_data(data)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::from_data(data)
    }
}
