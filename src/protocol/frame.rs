//! Frame struct, parser and serializer.
//!
//! A [`Frame`] is the structured form of one length-prefixed message: the
//! header, the type-specific fixed fields, and the optional metadata and
//! data blocks. Data and metadata are `bytes::Bytes` slices of the received
//! buffer, so parsing does not copy them.
//!
//! # Example
//!
//! ```
//! use rsocket_engine::protocol::{Frame, FrameType};
//! use rsocket_engine::Payload;
//!
//! let frame = Frame::next(1, Payload::from("hello"), true);
//! let bytes = frame.serialize().unwrap();
//!
//! let parsed = Frame::parse(&bytes).unwrap();
//! assert_eq!(parsed.frame_type(), FrameType::Payload);
//! assert!(parsed.is_complete());
//! assert_eq!(parsed, frame);
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::wire_format::{
    encode_u24, error_codes, flags, read_u24, FrameType, Header, CONNECTION_STREAM_ID,
    FRAME_LENGTH_SIZE, HEADER_SIZE, MAX_FRAME_LENGTH, MAX_METADATA_LENGTH, MAX_REQUEST_N,
    PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION,
};
use crate::codec::{DataCodec, MIME_OCTET_STREAM};
use crate::error::{RSocketError, Result};
use crate::payload::Payload;

/// Default keepalive interval announced in SETUP.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Default max lifetime announced in SETUP.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(90);

/// Fixed fields of a SETUP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
    /// Major protocol version.
    pub major_version: u16,
    /// Minor protocol version.
    pub minor_version: u16,
    /// Keepalive interval in milliseconds.
    pub keepalive_interval_ms: u32,
    /// Max lifetime in milliseconds.
    pub max_lifetime_ms: u32,
    /// Resume token (present iff RESUME_ENABLE is set).
    pub resume_token: Option<Bytes>,
    /// MIME type of metadata.
    pub metadata_mime_type: String,
    /// MIME type of data.
    pub data_mime_type: String,
}

impl Setup {
    /// SETUP parameters for this protocol version.
    pub fn new(keepalive_interval: Duration, max_lifetime: Duration) -> Self {
        Self {
            major_version: PROTOCOL_MAJOR_VERSION,
            minor_version: PROTOCOL_MINOR_VERSION,
            keepalive_interval_ms: duration_to_ms(keepalive_interval),
            max_lifetime_ms: duration_to_ms(max_lifetime),
            resume_token: None,
            metadata_mime_type: MIME_OCTET_STREAM.to_string(),
            data_mime_type: MIME_OCTET_STREAM.to_string(),
        }
    }

    /// Set the data MIME type.
    pub fn with_data_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.data_mime_type = mime_type.into();
        self
    }

    /// Set the metadata MIME type.
    pub fn with_metadata_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.metadata_mime_type = mime_type.into();
        self
    }

    /// Keepalive interval as a `Duration`.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.keepalive_interval_ms))
    }

    /// Max lifetime as a `Duration`.
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_lifetime_ms))
    }

    /// Codec matching the announced data MIME type.
    pub fn data_codec(&self) -> DataCodec {
        DataCodec::from_mime_type(&self.data_mime_type)
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.major_version);
        buf.put_u16(self.minor_version);
        buf.put_u32(self.keepalive_interval_ms & MAX_REQUEST_N);
        buf.put_u32(self.max_lifetime_ms & MAX_REQUEST_N);
        if let Some(token) = &self.resume_token {
            let len = u16::try_from(token.len()).map_err(|_| {
                RSocketError::Protocol(format!("Resume token too long: {}", token.len()))
            })?;
            buf.put_u16(len);
            buf.put_slice(token);
        }
        for mime_type in [&self.metadata_mime_type, &self.data_mime_type] {
            let len = u8::try_from(mime_type.len()).map_err(|_| {
                RSocketError::Protocol(format!("MIME type too long: {}", mime_type))
            })?;
            buf.put_u8(len);
            buf.put_slice(mime_type.as_bytes());
        }
        Ok(())
    }

    fn decode(rest: &mut Bytes, frame_flags: u16) -> Option<Self> {
        let major_version = take_u16(rest)?;
        let minor_version = take_u16(rest)?;
        let keepalive_interval_ms = take_u32(rest)? & MAX_REQUEST_N;
        let max_lifetime_ms = take_u32(rest)? & MAX_REQUEST_N;
        let resume_token = if flags::has_flag(frame_flags, flags::RESUME_ENABLE) {
            let len = take_u16(rest)? as usize;
            Some(take_bytes(rest, len)?)
        } else {
            None
        };
        let len = take_u8(rest)? as usize;
        let metadata_mime_type = take_string(rest, len)?;
        let len = take_u8(rest)? as usize;
        let data_mime_type = take_string(rest, len)?;
        Some(Self {
            major_version,
            minor_version,
            keepalive_interval_ms,
            max_lifetime_ms,
            resume_token,
            metadata_mime_type,
            data_mime_type,
        })
    }
}

impl Default for Setup {
    fn default() -> Self {
        Self::new(DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_LIFETIME)
    }
}

/// Type-specific fixed fields that sit between the header and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFields {
    /// No fixed fields.
    None,
    /// SETUP parameters.
    Setup(Setup),
    /// LEASE grant.
    Lease {
        /// Validity of the lease in milliseconds.
        ttl_ms: u32,
        /// Number of requests granted.
        number_of_requests: u32,
    },
    /// KEEPALIVE position.
    Keepalive {
        /// Resume position of the sender (0 when resumption is unused).
        last_received_position: u64,
    },
    /// REQUEST_STREAM / REQUEST_CHANNEL initial demand.
    InitialRequestN(u32),
    /// REQUEST_N grant.
    RequestN(u32),
    /// ERROR code.
    Error {
        /// Error code (see `error_codes`).
        code: u32,
    },
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Type-specific fixed fields.
    pub fields: FrameFields,
    /// Metadata block (zero-copy).
    pub metadata: Option<Bytes>,
    /// Data block (zero-copy, never empty).
    pub data: Option<Bytes>,
}

impl Frame {
    /// Assemble a frame, keeping flags consistent with its contents.
    ///
    /// The METADATA flag follows `metadata`, RESUME_ENABLE follows the SETUP
    /// resume token, and empty data becomes `None`.
    pub fn new(
        header: Header,
        fields: FrameFields,
        metadata: Option<Bytes>,
        data: Option<Bytes>,
    ) -> Self {
        let mut header = header;
        let mut metadata = metadata;
        let frame_type = header.frame_type;

        if frame_type == FrameType::MetadataPush {
            metadata = Some(metadata.unwrap_or_default());
            header.flags |= flags::METADATA;
        } else if frame_type.can_have_metadata() {
            if metadata.is_some() {
                header.flags |= flags::METADATA;
            } else {
                header.flags &= !flags::METADATA;
            }
        } else {
            metadata = None;
        }

        if let FrameFields::Setup(setup) = &fields {
            if setup.resume_token.is_some() {
                header.flags |= flags::RESUME_ENABLE;
            } else {
                header.flags &= !flags::RESUME_ENABLE;
            }
        }

        Self {
            header,
            fields,
            metadata,
            data: data.filter(|d| !d.is_empty()),
        }
    }

    /// SETUP frame (stream 0).
    pub fn setup(setup: Setup, payload: Payload) -> Self {
        let (data, metadata) = payload.into_parts();
        Self::new(
            Header::new(CONNECTION_STREAM_ID, FrameType::Setup, 0),
            FrameFields::Setup(setup),
            metadata,
            data,
        )
    }

    /// LEASE frame (stream 0).
    pub fn lease(ttl_ms: u32, number_of_requests: u32, metadata: Option<Bytes>) -> Self {
        Self::new(
            Header::new(CONNECTION_STREAM_ID, FrameType::Lease, 0),
            FrameFields::Lease {
                ttl_ms: ttl_ms & MAX_REQUEST_N,
                number_of_requests: number_of_requests & MAX_REQUEST_N,
            },
            metadata,
            None,
        )
    }

    /// KEEPALIVE frame (stream 0).
    pub fn keepalive(last_received_position: u64, respond: bool, data: Option<Bytes>) -> Self {
        let frame_flags = if respond { flags::RESPOND } else { 0 };
        Self::new(
            Header::new(CONNECTION_STREAM_ID, FrameType::Keepalive, frame_flags),
            FrameFields::Keepalive {
                last_received_position: last_received_position & (u64::MAX >> 1),
            },
            None,
            data,
        )
    }

    /// REQUEST_RESPONSE frame.
    pub fn request_response(stream_id: u32, payload: Payload) -> Self {
        Self::request(stream_id, FrameType::RequestResponse, FrameFields::None, 0, payload)
    }

    /// REQUEST_FNF frame.
    pub fn request_fnf(stream_id: u32, payload: Payload) -> Self {
        Self::request(stream_id, FrameType::RequestFnf, FrameFields::None, 0, payload)
    }

    /// REQUEST_STREAM frame with initial demand.
    pub fn request_stream(stream_id: u32, initial_request_n: u32, payload: Payload) -> Self {
        Self::request(
            stream_id,
            FrameType::RequestStream,
            FrameFields::InitialRequestN(initial_request_n.min(MAX_REQUEST_N)),
            0,
            payload,
        )
    }

    /// REQUEST_CHANNEL frame with initial demand and the first outbound value.
    pub fn request_channel(
        stream_id: u32,
        initial_request_n: u32,
        payload: Payload,
        complete: bool,
    ) -> Self {
        let frame_flags = if complete { flags::COMPLETE } else { 0 };
        Self::request(
            stream_id,
            FrameType::RequestChannel,
            FrameFields::InitialRequestN(initial_request_n.min(MAX_REQUEST_N)),
            frame_flags,
            payload,
        )
    }

    fn request(
        stream_id: u32,
        frame_type: FrameType,
        fields: FrameFields,
        frame_flags: u16,
        payload: Payload,
    ) -> Self {
        let (data, metadata) = payload.into_parts();
        Self::new(
            Header::new(stream_id, frame_type, frame_flags),
            fields,
            metadata,
            data,
        )
    }

    /// REQUEST_N frame.
    pub fn request_n(stream_id: u32, n: u32) -> Self {
        Self::new(
            Header::new(stream_id, FrameType::RequestN, 0),
            FrameFields::RequestN(n.min(MAX_REQUEST_N)),
            None,
            None,
        )
    }

    /// CANCEL frame.
    pub fn cancel(stream_id: u32) -> Self {
        Self::new(
            Header::new(stream_id, FrameType::Cancel, 0),
            FrameFields::None,
            None,
            None,
        )
    }

    /// PAYLOAD frame carrying a value (NEXT), optionally completing the stream.
    pub fn next(stream_id: u32, payload: Payload, complete: bool) -> Self {
        let mut frame_flags = flags::NEXT;
        if complete {
            frame_flags |= flags::COMPLETE;
        }
        let (data, metadata) = payload.into_parts();
        Self::new(
            Header::new(stream_id, FrameType::Payload, frame_flags),
            FrameFields::None,
            metadata,
            data,
        )
    }

    /// PAYLOAD frame carrying only the COMPLETE flag.
    pub fn complete(stream_id: u32) -> Self {
        Self::new(
            Header::new(stream_id, FrameType::Payload, flags::COMPLETE),
            FrameFields::None,
            None,
            None,
        )
    }

    /// ERROR frame with a textual message.
    pub fn error(stream_id: u32, code: u32, message: &str) -> Self {
        Self::new(
            Header::new(stream_id, FrameType::Error, 0),
            FrameFields::Error { code },
            None,
            Some(Bytes::copy_from_slice(message.as_bytes())),
        )
    }

    /// ERROR frame describing a failed stream.
    pub fn application_error(stream_id: u32, error: &RSocketError) -> Self {
        Self::error(stream_id, error.error_code(), &error.to_string())
    }

    /// METADATA_PUSH frame (stream 0).
    pub fn metadata_push(metadata: Bytes) -> Self {
        Self::new(
            Header::new(CONNECTION_STREAM_ID, FrameType::MetadataPush, flags::METADATA),
            FrameFields::None,
            Some(metadata),
            None,
        )
    }

    /// Get the stream ID.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    /// Get the frame type.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    /// Get the flag bits.
    #[inline]
    pub fn flags(&self) -> u16 {
        self.header.flags
    }

    /// Check if a flag is set.
    #[inline]
    pub fn has_flag(&self, flag: u16) -> bool {
        self.header.has(flag)
    }

    /// Check if this frame completes its stream.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.has_flag(flags::COMPLETE)
    }

    /// Check if this PAYLOAD frame carries a value.
    #[inline]
    pub fn is_next(&self) -> bool {
        self.has_flag(flags::NEXT)
    }

    /// Check if this KEEPALIVE asks for an echo.
    #[inline]
    pub fn is_respond(&self) -> bool {
        self.frame_type() == FrameType::Keepalive && self.has_flag(flags::RESPOND)
    }

    /// Demand carried by REQUEST_N, REQUEST_STREAM or REQUEST_CHANNEL.
    pub fn request_n_value(&self) -> Option<u32> {
        match self.fields {
            FrameFields::InitialRequestN(n) | FrameFields::RequestN(n) => Some(n),
            _ => None,
        }
    }

    /// ERROR code, if this is an ERROR frame.
    pub fn error_code(&self) -> Option<u32> {
        match self.fields {
            FrameFields::Error { code } => Some(code),
            _ => None,
        }
    }

    /// ERROR data as text (lossy UTF-8).
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(self.data.as_deref().unwrap_or_default()).into_owned()
    }

    /// Convert an ERROR frame into the matching remote error.
    pub fn to_remote_error(&self) -> RSocketError {
        RSocketError::Remote {
            code: self.error_code().unwrap_or(error_codes::APPLICATION_ERROR),
            message: self.error_message(),
        }
    }

    /// SETUP parameters, if this is a SETUP frame.
    pub fn setup_fields(&self) -> Option<&Setup> {
        match &self.fields {
            FrameFields::Setup(setup) => Some(setup),
            _ => None,
        }
    }

    /// Data and metadata as a payload (cheap clone).
    pub fn payload(&self) -> Payload {
        Payload::new(self.data.clone(), self.metadata.clone())
    }

    /// Data and metadata as a payload.
    pub fn into_payload(self) -> Payload {
        Payload::new(self.data, self.metadata)
    }

    /// Same frame with one flag cleared.
    pub fn without_flag(&self, flag: u16) -> Self {
        let mut frame = self.clone();
        frame.header.flags &= !flag;
        frame
    }

    /// Parse a frame from bytes that start with the 3-byte length prefix.
    ///
    /// Returns `None` for input that is too short or structurally invalid.
    /// Bytes past the declared length are never read.
    pub fn parse(bytes: &Bytes) -> Option<Self> {
        let length = read_u24(bytes)? as usize;
        let end = FRAME_LENGTH_SIZE + length;
        if length < HEADER_SIZE || bytes.len() < end {
            return None;
        }
        Self::parse_body(bytes.slice(FRAME_LENGTH_SIZE..end))
    }

    /// Parse a frame body (header onwards, without the length prefix).
    pub fn parse_body(body: Bytes) -> Option<Self> {
        let header = Header::decode(&body)?;
        let mut rest = body.slice(HEADER_SIZE..);

        let fields = match header.frame_type {
            FrameType::Setup => FrameFields::Setup(Setup::decode(&mut rest, header.flags)?),
            FrameType::Lease => FrameFields::Lease {
                ttl_ms: take_u32(&mut rest)? & MAX_REQUEST_N,
                number_of_requests: take_u32(&mut rest)? & MAX_REQUEST_N,
            },
            FrameType::Keepalive => FrameFields::Keepalive {
                last_received_position: take_u64(&mut rest)? & (u64::MAX >> 1),
            },
            FrameType::RequestStream | FrameType::RequestChannel => {
                FrameFields::InitialRequestN(take_u32(&mut rest)? & MAX_REQUEST_N)
            }
            FrameType::RequestN => FrameFields::RequestN(take_u32(&mut rest)? & MAX_REQUEST_N),
            FrameType::Error => FrameFields::Error {
                code: take_u32(&mut rest)?,
            },
            _ => FrameFields::None,
        };

        let metadata = if header.frame_type == FrameType::MetadataPush {
            Some(std::mem::take(&mut rest))
        } else if header.frame_type.can_have_metadata() && header.has(flags::METADATA) {
            let len = read_u24(&rest)? as usize;
            rest.advance(3);
            Some(take_bytes(&mut rest, len)?)
        } else {
            None
        };

        let data = if rest.is_empty() { None } else { Some(rest) };
        Some(Self::new(header, fields, metadata, data))
    }

    /// Encode into `(head, data)` for vectored writes.
    ///
    /// `head` holds the length prefix, header, fixed fields and metadata;
    /// `data` is the (possibly empty) data block, shared without copying.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the frame does not fit the 3-byte length prefix.
    pub fn encode_parts(&self) -> Result<(Bytes, Bytes)> {
        let metadata_len = self.metadata.as_ref().map_or(0, |m| m.len());
        let mut head = BytesMut::with_capacity(FRAME_LENGTH_SIZE + HEADER_SIZE + 16 + metadata_len);
        head.put_slice(&[0u8; FRAME_LENGTH_SIZE]);
        head.put_slice(&self.header.encode());

        match &self.fields {
            FrameFields::None => {}
            FrameFields::Setup(setup) => setup.encode_into(&mut head)?,
            FrameFields::Lease {
                ttl_ms,
                number_of_requests,
            } => {
                head.put_u32(*ttl_ms);
                head.put_u32(*number_of_requests);
            }
            FrameFields::Keepalive {
                last_received_position,
            } => head.put_u64(*last_received_position),
            FrameFields::InitialRequestN(n) | FrameFields::RequestN(n) => head.put_u32(*n),
            FrameFields::Error { code } => head.put_u32(*code),
        }

        if let Some(metadata) = &self.metadata {
            if self.frame_type() == FrameType::MetadataPush {
                head.put_slice(metadata);
            } else {
                if metadata.len() > MAX_METADATA_LENGTH {
                    return Err(RSocketError::Protocol(format!(
                        "Metadata size {} exceeds maximum {}",
                        metadata.len(),
                        MAX_METADATA_LENGTH
                    )));
                }
                head.put_slice(&encode_u24(metadata.len() as u32));
                head.put_slice(metadata);
            }
        }

        let data = self.data.clone().unwrap_or_default();
        let body_len = head.len() - FRAME_LENGTH_SIZE + data.len();
        if body_len > MAX_FRAME_LENGTH as usize {
            return Err(RSocketError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                body_len, MAX_FRAME_LENGTH
            )));
        }
        head[..FRAME_LENGTH_SIZE].copy_from_slice(&encode_u24(body_len as u32));

        Ok((head.freeze(), data))
    }

    /// Serialize into one contiguous buffer, length prefix included.
    pub fn serialize(&self) -> Result<Bytes> {
        let (head, data) = self.encode_parts()?;
        if data.is_empty() {
            return Ok(head);
        }
        let mut buf = BytesMut::with_capacity(head.len() + data.len());
        buf.put_slice(&head);
        buf.put_slice(&data);
        Ok(buf.freeze())
    }
}

fn duration_to_ms(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis())
        .unwrap_or(MAX_REQUEST_N)
        .min(MAX_REQUEST_N)
}

fn take_u8(buf: &mut Bytes) -> Option<u8> {
    (buf.remaining() >= 1).then(|| buf.get_u8())
}

fn take_u16(buf: &mut Bytes) -> Option<u16> {
    (buf.remaining() >= 2).then(|| buf.get_u16())
}

fn take_u32(buf: &mut Bytes) -> Option<u32> {
    (buf.remaining() >= 4).then(|| buf.get_u32())
}

fn take_u64(buf: &mut Bytes) -> Option<u64> {
    (buf.remaining() >= 8).then(|| buf.get_u64())
}

fn take_bytes(buf: &mut Bytes, len: usize) -> Option<Bytes> {
    (buf.remaining() >= len).then(|| buf.split_to(len))
}

fn take_string(buf: &mut Bytes, len: usize) -> Option<String> {
    let bytes = take_bytes(buf, len)?;
    String::from_utf8(bytes.to_vec()).ok()
}
