//! Wire format encoding and decoding.
//!
//! Every frame on the transport is prefixed by a 3-byte length and starts
//! with a 6-byte header:
//! ```text
//! ┌──────────┬──────────────┬──────────────────────┐
//! │ Length   │ Stream ID    │ Type  │ Flags        │
//! │ 3 bytes  │ 4 bytes      │ 6 bits│ 10 bits      │
//! │ uint24 BE│ uint32 BE    │    uint16 BE         │
//! └──────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The length counts the bytes that follow the prefix. All multi-byte
//! integers are Big Endian.

/// Size of the frame length prefix in bytes.
pub const FRAME_LENGTH_SIZE: usize = 3;

/// Header size in bytes (stream id + type/flags).
pub const HEADER_SIZE: usize = 6;

/// Largest frame body representable by the length prefix.
pub const MAX_FRAME_LENGTH: u32 = 0x00FF_FFFF;

/// Largest metadata block representable by the metadata length field.
pub const MAX_METADATA_LENGTH: usize = 0x00FF_FFFF;

/// Floor a caller may use to skip parsing obviously short buffers.
///
/// The reassembler does not enforce it: a CANCEL frame is 9 bytes long.
pub const MIN_FRAME_SIZE: usize = 12;

/// Stream id reserved for connection-level frames.
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Largest valid stream id (the top bit is reserved).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Request N value meaning "unbounded demand".
pub const MAX_REQUEST_N: u32 = 0x7FFF_FFFF;

/// Protocol version sent in SETUP frames.
pub const PROTOCOL_MAJOR_VERSION: u16 = 1;
/// Minor protocol version sent in SETUP frames.
pub const PROTOCOL_MINOR_VERSION: u16 = 0;

/// Flag constants for the protocol.
///
/// Bit meaning depends on the frame type; some bits are shared.
pub mod flags {
    /// Frame may be ignored if not understood.
    pub const IGNORE: u16 = 0b10_0000_0000;
    /// Metadata present.
    pub const METADATA: u16 = 0b01_0000_0000;
    /// More fragments follow.
    pub const FOLLOWS: u16 = 0b00_1000_0000;
    /// Stream completion (PAYLOAD, REQUEST_CHANNEL).
    pub const COMPLETE: u16 = 0b00_0100_0000;
    /// Payload carries a value (PAYLOAD).
    pub const NEXT: u16 = 0b00_0010_0000;

    /// KEEPALIVE: the receiver must echo the frame.
    pub const RESPOND: u16 = 0b00_1000_0000;
    /// SETUP: the client will honor LEASE.
    pub const LEASE: u16 = 0b00_0100_0000;
    /// SETUP: a resume token is present.
    pub const RESUME_ENABLE: u16 = 0b00_1000_0000;

    /// Mask of the 10 flag bits.
    pub const MASK: u16 = 0b11_1111_1111;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u16, flag: u16) -> bool {
        flags & flag != 0
    }

    /// NEXT + COMPLETE, used for single-value responses.
    pub const NEXT_COMPLETE: u16 = NEXT | COMPLETE;
}

/// ERROR frame codes.
pub mod error_codes {
    /// SETUP frame is invalid.
    pub const INVALID_SETUP: u32 = 0x0000_0001;
    /// Some SETUP parameter is not supported.
    pub const UNSUPPORTED_SETUP: u32 = 0x0000_0002;
    /// SETUP was rejected by the server.
    pub const REJECTED_SETUP: u32 = 0x0000_0003;
    /// RESUME was rejected by the server.
    pub const REJECTED_RESUME: u32 = 0x0000_0004;
    /// Connection is being terminated.
    pub const CONNECTION_ERROR: u32 = 0x0000_0101;
    /// Connection is being closed gracefully.
    pub const CONNECTION_CLOSE: u32 = 0x0000_0102;
    /// Application layer logic failure.
    pub const APPLICATION_ERROR: u32 = 0x0000_0201;
    /// Responder refused the request.
    pub const REJECTED: u32 = 0x0000_0202;
    /// Responder cancelled the request.
    pub const CANCELED: u32 = 0x0000_0203;
    /// Request is invalid.
    pub const INVALID: u32 = 0x0000_0204;
}

/// Frame type carried in the top 6 bits of the type/flags field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Connection setup (client to server, stream 0).
    Setup,
    /// Lease grant.
    Lease,
    /// Connection keepalive (stream 0).
    Keepalive,
    /// Single request, single response.
    RequestResponse,
    /// Fire-and-forget request.
    RequestFnf,
    /// Request a finite or infinite stream.
    RequestStream,
    /// Bidirectional stream.
    RequestChannel,
    /// Grant additional demand.
    RequestN,
    /// Cancel an outstanding request.
    Cancel,
    /// Value and/or completion on a stream.
    Payload,
    /// Stream or connection error.
    Error,
    /// Connection-level metadata (stream 0).
    MetadataPush,
    /// Resumption request.
    Resume,
    /// Resumption acknowledgement.
    ResumeOk,
    /// Extension frame.
    Ext,
    /// Any code this engine does not recognize.
    Unknown(u8),
}

impl FrameType {
    /// Decode a 6-bit frame type code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => FrameType::Setup,
            0x02 => FrameType::Lease,
            0x03 => FrameType::Keepalive,
            0x04 => FrameType::RequestResponse,
            0x05 => FrameType::RequestFnf,
            0x06 => FrameType::RequestStream,
            0x07 => FrameType::RequestChannel,
            0x08 => FrameType::RequestN,
            0x09 => FrameType::Cancel,
            0x0A => FrameType::Payload,
            0x0B => FrameType::Error,
            0x0C => FrameType::MetadataPush,
            0x0D => FrameType::Resume,
            0x0E => FrameType::ResumeOk,
            0x3F => FrameType::Ext,
            other => FrameType::Unknown(other),
        }
    }

    /// The 6-bit code for this frame type.
    pub fn code(self) -> u8 {
        match self {
            FrameType::Setup => 0x01,
            FrameType::Lease => 0x02,
            FrameType::Keepalive => 0x03,
            FrameType::RequestResponse => 0x04,
            FrameType::RequestFnf => 0x05,
            FrameType::RequestStream => 0x06,
            FrameType::RequestChannel => 0x07,
            FrameType::RequestN => 0x08,
            FrameType::Cancel => 0x09,
            FrameType::Payload => 0x0A,
            FrameType::Error => 0x0B,
            FrameType::MetadataPush => 0x0C,
            FrameType::Resume => 0x0D,
            FrameType::ResumeOk => 0x0E,
            FrameType::Ext => 0x3F,
            FrameType::Unknown(code) => code & 0x3F,
        }
    }

    /// Whether frames of this type may carry a length-prefixed metadata block.
    #[inline]
    pub fn can_have_metadata(self) -> bool {
        matches!(
            self,
            FrameType::Setup
                | FrameType::Lease
                | FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::Payload
                | FrameType::Ext
        )
    }

    /// Whether this type opens a new stream on the responder.
    #[inline]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
                | FrameType::MetadataPush
        )
    }
}

/// Decoded frame header (the 6 bytes after the length prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Stream identifier (0 = connection level).
    pub stream_id: u32,
    /// Frame type.
    pub frame_type: FrameType,
    /// 10 flag bits (see `flags` module).
    pub flags: u16,
}

impl Header {
    /// Create a new header.
    pub fn new(stream_id: u32, frame_type: FrameType, flags: u16) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: flags & flags::MASK,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use rsocket_engine::protocol::{flags, FrameType, Header};
    ///
    /// let header = Header::new(1, FrameType::Payload, flags::NEXT_COMPLETE);
    /// let bytes = header.encode();
    /// assert_eq!(bytes, [0, 0, 0, 1, 0x28, 0x60]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (6 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&(self.stream_id & MAX_STREAM_ID).to_be_bytes());
        let type_and_flags =
            (u16::from(self.frame_type.code()) << 10) | (self.flags & flags::MASK);
        buf[4..6].copy_from_slice(&type_and_flags.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let stream_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) & MAX_STREAM_ID;
        let type_and_flags = u16::from_be_bytes([buf[4], buf[5]]);
        Some(Self {
            stream_id,
            frame_type: FrameType::from_code((type_and_flags >> 10) as u8),
            flags: type_and_flags & flags::MASK,
        })
    }

    /// Check if a flag is set.
    #[inline]
    pub fn has(&self, flag: u16) -> bool {
        flags::has_flag(self.flags, flag)
    }

    /// Check if this header belongs to a connection-level frame.
    #[inline]
    pub fn is_connection_level(&self) -> bool {
        self.stream_id == CONNECTION_STREAM_ID
    }
}

/// Read a big-endian 24-bit unsigned integer.
#[inline]
pub fn read_u24(buf: &[u8]) -> Option<u32> {
    if buf.len() < 3 {
        return None;
    }
    Some((u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]))
}

/// Encode a 24-bit unsigned integer (Big Endian).
#[inline]
pub fn encode_u24(value: u32) -> [u8; 3] {
    debug_assert!(value <= MAX_FRAME_LENGTH);
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}
