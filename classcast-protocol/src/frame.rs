//! Binary frame format.
//!
//! Frame layout (16 bytes header + payload):
//!
//! ```text
//! +--------+---------+--------+-------------+--------+
//! | magic  | version | flags  | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |   4 bytes   | 4 bytes|
//! +--------+---------+--------+-------------+--------+
//! | payload (payload_len bytes of UTF-8 JSON)        |
//! +--------------------------------------------------+
//! ```
//!
//! All integers are big-endian.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes opening every binary frame: "CCST".
pub const MAGIC: [u8; 4] = *b"CCST";

/// Size of the fixed frame header in bytes (4+2+2+4+4 = 16).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum of the payload is present.
    pub const CRC_PRESENT: u16 = 1 << 0;
    /// Frame was pushed by the server without a matching request.
    pub const PUSH: u16 = 1 << 1;

    const VALID_V1_MASK: u16 = 0x0003;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn with_push(mut self) -> Self {
        self.0 |= Self::PUSH;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn is_push(&self) -> bool {
        self.0 & Self::PUSH != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_V1_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    /// JSON payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a checksummed frame around `payload`.
    pub fn new(payload: Bytes) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            payload,
        }
    }

    /// Creates a frame from a JSON-serializable value.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(Bytes::from(payload)))
    }

    /// Deserializes the payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let text = std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = self.payload.len() as u32;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(payload_len);
        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        buf.put_u32(crc);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes are only consumed
    /// once a complete frame is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        if buf.len() < FRAME_HEADER_SIZE + payload_len as usize {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len as usize).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            payload,
        }))
    }
}
