//! Encoders and decoders for both wire modes.
//!
//! A peer speaks either binary frames or line-delimited JSON for the whole
//! life of a connection. The [`Decoder`] detects which one from the first
//! byte it sees: binary frames always open with the magic `C`, JSON lines
//! open with `{` (or whitespace).

use crate::error::ProtocolError;
use crate::frame::{Frame, MAGIC};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Framing used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMode {
    /// Binary framing with JSON payload.
    #[default]
    Binary,
    /// Line-delimited JSON (debug clients, netcat).
    Jsonl,
}

impl WireMode {
    /// Serializes `value` in this mode, ready to be written to the socket.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, ProtocolError> {
        match self {
            WireMode::Binary => Ok(Encoder::encode(value)?.freeze()),
            WireMode::Jsonl => Ok(Bytes::from(jsonl::encode(value)?)),
        }
    }

    /// Like [`WireMode::encode`], marking binary frames as server push.
    pub fn encode_push<T: Serialize>(&self, value: &T) -> Result<Bytes, ProtocolError> {
        match self {
            WireMode::Binary => Ok(Encoder::encode_push(value)?.freeze()),
            WireMode::Jsonl => Ok(Bytes::from(jsonl::encode(value)?)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WireMode::Binary => "binary",
            WireMode::Jsonl => "jsonl",
        }
    }
}

/// Encodes values into binary frames.
pub struct Encoder;

impl Encoder {
    /// Encodes any JSON-serializable value into a frame.
    pub fn encode<T: Serialize>(value: &T) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(value)?.encode()
    }

    /// Encodes a value into a frame flagged as server push.
    pub fn encode_push<T: Serialize>(value: &T) -> Result<BytesMut, ProtocolError> {
        let mut frame = Frame::from_json(value)?;
        frame.flags = frame.flags.with_push();
        frame.encode()
    }
}

/// Incremental decoder for a single connection.
pub struct Decoder {
    buffer: BytesMut,
    mode: Option<WireMode>,
}

impl Decoder {
    /// Creates a decoder that detects the wire mode from the first byte.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            mode: None,
        }
    }

    /// Creates a decoder fixed to `mode`.
    pub fn with_mode(mode: WireMode) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            mode: Some(mode),
        }
    }

    /// Returns the wire mode, once known.
    pub fn mode(&self) -> Option<WireMode> {
        self.mode
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next message from the buffer.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        let mode = match self.mode {
            Some(mode) => mode,
            None => match self.detect() {
                Some(mode) => {
                    self.mode = Some(mode);
                    mode
                }
                None => return Ok(None),
            },
        };

        match mode {
            WireMode::Binary => match Frame::decode(&mut self.buffer)? {
                Some(frame) => Ok(Some(frame.json()?)),
                None => Ok(None),
            },
            WireMode::Jsonl => self.decode_line(),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn detect(&self) -> Option<WireMode> {
        let first = *self.buffer.first()?;
        if first == MAGIC[0] {
            Some(WireMode::Binary)
        } else {
            Some(WireMode::Jsonl)
        }
    }

    fn decode_line<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > MAX_PAYLOAD_SIZE as usize {
                    return Err(ProtocolError::LineTooLong(self.buffer.len()));
                }
                return Ok(None);
            };

            let line = self.buffer.split_to(pos + 1);
            let text =
                std::str::from_utf8(&line[..pos]).map_err(|_| ProtocolError::InvalidUtf8)?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(text)?));
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Line-delimited JSON encoding.
pub mod jsonl {
    use super::*;

    /// Encodes a value as a JSON line (no framing).
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Handshake, Inbound};
    use serde_json::json;

    #[test]
    fn test_detects_binary_mode() {
        let inbound = Inbound::new("join", json!({"room": "class:math-101"}));
        let encoded = Encoder::encode(&inbound).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);
        let decoded: Inbound = decoder.decode().unwrap().unwrap();

        assert_eq!(decoder.mode(), Some(WireMode::Binary));
        assert_eq!(decoded.command, "join");
        assert_eq!(decoded.payload["room"], "class:math-101");
    }

    #[test]
    fn test_detects_jsonl_mode() {
        let mut decoder = Decoder::new();
        decoder.extend(b"{\"token\":\"abc\",\"namespace\":\"/messaging\"}\n");
        let handshake: Handshake = decoder.decode().unwrap().unwrap();

        assert_eq!(decoder.mode(), Some(WireMode::Jsonl));
        assert_eq!(handshake.namespace, "/messaging");
    }

    #[test]
    fn test_partial_binary_frame() {
        let encoded = Encoder::encode(&Inbound::new("heartbeat", json!({}))).unwrap();
        let mut decoder = Decoder::new();

        decoder.extend(&encoded[..10]);
        assert!(decoder.decode::<Inbound>().unwrap().is_none());

        decoder.extend(&encoded[10..]);
        let decoded: Inbound = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded.command, "heartbeat");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_jsonl_skips_blank_lines_and_handles_crlf() {
        let mut decoder = Decoder::with_mode(WireMode::Jsonl);
        decoder.extend(b"\r\n\n{\"command\":\"a\",\"payload\":{}}\r\n{\"command\":\"b\"");

        let first: Inbound = decoder.decode().unwrap().unwrap();
        assert_eq!(first.command, "a");
        assert!(decoder.decode::<Inbound>().unwrap().is_none());

        decoder.extend(b",\"payload\":{}}\n");
        let second: Inbound = decoder.decode().unwrap().unwrap();
        assert_eq!(second.command, "b");
    }

    #[test]
    fn test_jsonl_line_limit() {
        let mut decoder = Decoder::with_mode(WireMode::Jsonl);
        decoder.extend(&vec![b'a'; MAX_PAYLOAD_SIZE as usize + 1]);
        assert!(matches!(
            decoder.decode::<Inbound>(),
            Err(ProtocolError::LineTooLong(_))
        ));
    }

    #[test]
    fn test_wire_mode_encode() {
        let value = json!({"event": "typing"});
        let line = WireMode::Jsonl.encode(&value).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));

        let framed = WireMode::Binary.encode_push(&value).unwrap();
        let mut buf = BytesMut::from(&framed[..]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(frame.flags.is_push());
    }

    mod split_reads {
        use super::*;
        use proptest::prelude::*;

        fn decode_in_chunks(mode: WireMode, stream: &[u8], chunk: usize) -> Vec<String> {
            let mut decoder = Decoder::new();
            let mut commands = Vec::new();
            for piece in stream.chunks(chunk) {
                decoder.extend(piece);
                while let Some(inbound) = decoder.decode::<Inbound>().unwrap() {
                    commands.push(inbound.command);
                }
            }
            assert_eq!(decoder.mode(), Some(mode));
            assert_eq!(decoder.buffered(), 0);
            commands
        }

        proptest! {
            #[test]
            fn reads_split_anywhere_decode_the_same(
                commands in prop::collection::vec("[a-z_]{1,16}", 1..8),
                chunk in 1usize..64,
                binary in any::<bool>(),
            ) {
                let mode = if binary { WireMode::Binary } else { WireMode::Jsonl };
                let mut stream = Vec::new();
                for command in &commands {
                    let inbound = Inbound::new(command.clone(), json!({"n": command.len()}));
                    stream.extend_from_slice(&mode.encode(&inbound).unwrap());
                }

                prop_assert_eq!(decode_in_chunks(mode, &stream, chunk), commands);
            }
        }
    }
}
