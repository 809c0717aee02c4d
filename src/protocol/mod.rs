//! Protocol module - wire format, framing, and frame types.
//!
//! - 3-byte length prefix and 6-byte header encoding/decoding
//! - Frame buffer for reassembling frames from partial reads
//! - Frame struct with constructors, parser and serializer

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{Frame, FrameFields, Setup, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_LIFETIME};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    encode_u24, error_codes, flags, read_u24, FrameType, Header, CONNECTION_STREAM_ID,
    FRAME_LENGTH_SIZE, HEADER_SIZE, MAX_FRAME_LENGTH, MAX_METADATA_LENGTH, MAX_REQUEST_N,
    MAX_STREAM_ID, MIN_FRAME_SIZE, PROTOCOL_MAJOR_VERSION, PROTOCOL_MINOR_VERSION,
};
