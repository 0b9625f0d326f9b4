//! Binary frame codec for the Volcano TTS websocket protocol.
//!
//! Protocol format:
//! - Header (4 bytes, `header_size` words in total):
//!   - (4bits) version + (4bits) header_size
//!   - (4bits) message_type + (4bits) message_type_flags
//!   - (4bits) serialization + (4bits) compression
//!   - (8bits) reserved
//!
//! - Audio response payload:
//!   - [optional] sequence (4 bytes, present when flags & 0b0001)
//!   - payload_size (4 bytes) + payload_data
//!
//! - Error response payload: raw UTF-8 text right after the header.
//!
//! Decoding is pure: everything needed to interpret a frame is carried in
//! the frame itself.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::error::{DecodeError, Result};

/// Length of the fixed part of every header.
pub const HEADER_LEN: usize = 4;

// ================== Protocol Constants ==================

/// Protocol version.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    V1 = 0b0001,
}

/// Message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    FullClient,
    AudioOnlyClient,
    FullServer,
    AudioOnlyServer,
    FrontEndResult,
    Error,
    /// Any nibble the protocol does not define.
    Reserved(u8),
}

impl MessageType {
    /// Returns the 4-bit wire value.
    pub fn nibble(self) -> u8 {
        match self {
            MessageType::FullClient => 0b0001,
            MessageType::AudioOnlyClient => 0b0010,
            MessageType::FullServer => 0b1001,
            MessageType::AudioOnlyServer => 0b1011,
            MessageType::FrontEndResult => 0b1100,
            MessageType::Error => 0b1111,
            MessageType::Reserved(v) => v & 0x0f,
        }
    }
}

impl From<u8> for MessageType {
    fn from(v: u8) -> Self {
        match v & 0x0f {
            0b0001 => MessageType::FullClient,
            0b0010 => MessageType::AudioOnlyClient,
            0b1001 => MessageType::FullServer,
            0b1011 => MessageType::AudioOnlyServer,
            0b1100 => MessageType::FrontEndResult,
            0b1111 => MessageType::Error,
            other => MessageType::Reserved(other),
        }
    }
}

/// Message type flags (4-bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// No flags.
    pub const NONE: MessageFlags = MessageFlags(0b0000);
    /// A 4-byte sequence number follows the header.
    pub const HAS_SEQUENCE: MessageFlags = MessageFlags(0b0001);
    /// Last frame of the response.
    pub const FINAL: MessageFlags = MessageFlags(0b0010);

    /// Builds flags from the low nibble of `v`.
    pub fn from_bits(v: u8) -> Self {
        MessageFlags(v & 0x0f)
    }

    /// Returns the raw 4-bit value.
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn has_sequence(self) -> bool {
        self.0 & Self::HAS_SEQUENCE.0 != 0
    }

    pub fn is_final(self) -> bool {
        self.0 & Self::FINAL.0 != 0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        MessageFlags(self.0 | rhs.0)
    }
}

/// Serialization type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationType {
    #[default]
    None = 0b0000,
    Json = 0b0001,
    Thrift = 0b0011,
}

impl From<u8> for SerializationType {
    fn from(v: u8) -> Self {
        match v {
            0b0001 => SerializationType::Json,
            0b0011 => SerializationType::Thrift,
            _ => SerializationType::None,
        }
    }
}

/// Compression type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None = 0b0000,
    Gzip = 0b0001,
}

impl From<u8> for CompressionType {
    fn from(v: u8) -> Self {
        match v {
            0b0001 => CompressionType::Gzip,
            _ => CompressionType::None,
        }
    }
}

// ================== Decoded Frame ==================

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    /// Header length in 4-byte words.
    pub header_size_words: u8,
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub serialization: SerializationType,
    pub compression: CompressionType,
}

impl Header {
    /// Header length in bytes, as declared by the size nibble.
    ///
    /// A zero-word header is taken literally: the body starts at offset 0
    /// even though the fixed fields were already read from those bytes.
    pub fn byte_len(&self) -> usize {
        self.header_size_words as usize * 4
    }
}

/// Body of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// Audio bytes, already decompressed.
    Audio {
        sequence: Option<i32>,
        audio: Bytes,
        is_final: bool,
    },
    /// Vendor-reported error text.
    Error(String),
    /// Any other message type; size-prefixed payload, decompressed.
    Other { payload: Bytes },
}

/// A decoded vendor frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: FrameBody,
}

// ================== Outbound Message ==================

/// A message to be marshaled onto the wire.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub msg_type: MessageType,
    pub flags: MessageFlags,
    /// Written only when `flags` has a sequence.
    pub sequence: i32,
    /// Uncompressed payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a full client request message.
    pub fn full_client(payload: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::FullClient,
            payload,
            ..Default::default()
        }
    }

    /// Creates an audio-only server message.
    pub fn audio(sequence: Option<i32>, audio: Vec<u8>, is_final: bool) -> Self {
        let mut flags = MessageFlags::NONE;
        if sequence.is_some() {
            flags = flags | MessageFlags::HAS_SEQUENCE;
        }
        if is_final {
            flags = flags | MessageFlags::FINAL;
        }
        Self {
            msg_type: MessageType::AudioOnlyServer,
            flags,
            sequence: sequence.unwrap_or_default(),
            payload: audio,
        }
    }

    /// Creates an error message carrying raw text.
    pub fn error(text: &str) -> Self {
        Self {
            msg_type: MessageType::Error,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        }
    }
}

// ================== Binary Protocol ==================

/// Binary protocol encoder.
#[derive(Debug, Clone)]
pub struct BinaryProtocol {
    version: ProtocolVersion,
    header_size: u8,
    compression: CompressionType,
    serialization: SerializationType,
}

impl Default for BinaryProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryProtocol {
    /// Creates a new encoder: v1, one header word, JSON, uncompressed.
    pub fn new() -> Self {
        Self {
            version: ProtocolVersion::V1,
            header_size: 1,
            compression: CompressionType::None,
            serialization: SerializationType::Json,
        }
    }

    /// Sets compression type.
    pub fn set_compression(&mut self, compression: CompressionType) {
        self.compression = compression;
    }

    /// Marshals a message to bytes.
    pub fn marshal(&self, msg: &Message) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 8 + msg.payload.len());

        // Error frames carry raw text and are never compressed.
        let compression = if msg.msg_type == MessageType::Error {
            CompressionType::None
        } else {
            self.compression
        };

        buf.put_u8((self.version as u8) << 4 | self.header_size);
        buf.put_u8(msg.msg_type.nibble() << 4 | msg.flags.bits());
        buf.put_u8((self.serialization as u8) << 4 | (compression as u8));
        buf.put_u8(0x00); // reserved

        if self.header_size > 1 {
            buf.put_bytes(0, (self.header_size as usize - 1) * 4);
        }

        if msg.msg_type == MessageType::Error {
            buf.put_slice(&msg.payload);
            return Ok(buf.to_vec());
        }

        if msg.flags.has_sequence() {
            buf.put_i32(msg.sequence);
        }

        let payload = if compression == CompressionType::Gzip && !msg.payload.is_empty() {
            gzip_compress(&msg.payload)?
        } else {
            msg.payload.clone()
        };

        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.to_vec())
    }
}

/// Serializes `request` as JSON and frames it as a full client request.
pub fn encode<T>(request: &T, compression: CompressionType) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let json = serde_json::to_vec(request)?;
    let mut proto = BinaryProtocol::new();
    proto.set_compression(compression);
    proto.marshal(&Message::full_client(json))
}

/// Decodes one vendor frame.
///
/// Never panics: every malformed or truncated buffer is reported as a
/// [`DecodeError`].
pub fn decode(data: &[u8]) -> std::result::Result<Frame, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            need: HEADER_LEN,
            have: data.len(),
        });
    }

    let header = Header {
        version: data[0] >> 4,
        header_size_words: data[0] & 0x0f,
        message_type: MessageType::from(data[1] >> 4),
        flags: MessageFlags::from_bits(data[1]),
        serialization: SerializationType::from(data[2] >> 4),
        compression: CompressionType::from(data[2] & 0x0f),
    };

    let header_len = header.byte_len();
    if data.len() < header_len {
        return Err(DecodeError::Truncated {
            need: header_len,
            have: data.len(),
        });
    }

    let body = match header.message_type {
        MessageType::AudioOnlyServer => decode_audio(&header, data)?,
        MessageType::Error => {
            // Error text never includes the fixed header fields.
            let start = header_len.max(HEADER_LEN);
            FrameBody::Error(String::from_utf8_lossy(&data[start..]).into_owned())
        }
        _ => decode_other(&header, data)?,
    };

    Ok(Frame { header, body })
}

fn decode_audio(header: &Header, data: &[u8]) -> std::result::Result<FrameBody, DecodeError> {
    let mut offset = header.byte_len();
    let mut sequence = None;

    if header.flags.has_sequence() {
        if offset + 4 <= data.len() {
            sequence = Some((&data[offset..]).get_i32());
        }
        offset += 4;
    }

    // Mandatory payload-size field. The audio itself runs to the end of the
    // frame regardless of the declared size.
    offset += 4;
    if offset > data.len() {
        return Err(DecodeError::OffsetOverflow {
            offset,
            len: data.len(),
        });
    }

    let raw = &data[offset..];
    let audio = if header.compression == CompressionType::Gzip && !raw.is_empty() {
        gzip_decompress(raw)?
    } else {
        raw.to_vec()
    };

    Ok(FrameBody::Audio {
        sequence,
        audio: Bytes::from(audio),
        is_final: header.flags.is_final(),
    })
}

fn decode_other(header: &Header, data: &[u8]) -> std::result::Result<FrameBody, DecodeError> {
    let mut offset = header.byte_len();
    if header.flags.has_sequence() {
        offset += 4;
    }

    if offset + 4 > data.len() {
        return Err(DecodeError::OffsetOverflow {
            offset: offset + 4,
            len: data.len(),
        });
    }
    let size = (&data[offset..]).get_u32() as usize;
    offset += 4;

    let end = offset.saturating_add(size);
    if end > data.len() {
        return Err(DecodeError::OffsetOverflow {
            offset: end,
            len: data.len(),
        });
    }

    let raw = &data[offset..end];
    let payload = if header.compression == CompressionType::Gzip && !raw.is_empty() {
        gzip_decompress(raw)?
    } else {
        raw.to_vec()
    };

    Ok(FrameBody::Other {
        payload: Bytes::from(payload),
    })
}

/// Gzip compress data.
fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Gzip decompress data.
fn gzip_decompress(data: &[u8]) -> std::result::Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| DecodeError::BadCompression(e.to_string()))?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn audio_frame(flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x11, 0xB0 | flags, 0x10, 0x00];
        data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_encode_header_layout() {
        let data = encode(&json!({"a": 1}), CompressionType::Gzip).unwrap();
        assert_eq!(&data[..4], &[0x11, 0x10, 0x11, 0x00]);

        let size = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        assert_eq!(size, data.len() - 8);
        // gzip magic
        assert_eq!(&data[8..10], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_request_round_trip() {
        let request = json!({
            "app": {"appid": "123", "token": "t", "cluster": "volcano_tts"},
            "request": {"reqid": "r-1", "text": "你好，世界", "operation": "submit"},
        });
        let original = serde_json::to_vec(&request).unwrap();

        for compression in [CompressionType::Gzip, CompressionType::None] {
            let data = encode(&request, compression).unwrap();
            let frame = decode(&data).unwrap();
            assert_eq!(frame.header.message_type, MessageType::FullClient);
            assert_eq!(frame.header.compression, compression);
            match frame.body {
                FrameBody::Other { payload } => assert_eq!(payload.as_ref(), &original[..]),
                other => panic!("unexpected body: {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_plain_audio() {
        let frame = decode(&audio_frame(0x0, b"ABC")).unwrap();
        assert_eq!(frame.header.message_type, MessageType::AudioOnlyServer);
        assert_eq!(
            frame.body,
            FrameBody::Audio {
                sequence: None,
                audio: Bytes::from_static(b"ABC"),
                is_final: false,
            }
        );

        let frame = decode(&audio_frame(0x2, b"ABC")).unwrap();
        match frame.body {
            FrameBody::Audio {
                audio, is_final, ..
            } => {
                assert_eq!(audio.as_ref(), b"ABC");
                assert!(is_final);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_decode_audio_with_sequence() {
        let proto = BinaryProtocol::new();
        let data = proto
            .marshal(&Message::audio(Some(-7), b"tail".to_vec(), true))
            .unwrap();
        assert_eq!(data[1], 0xB3);

        let frame = decode(&data).unwrap();
        assert_eq!(
            frame.body,
            FrameBody::Audio {
                sequence: Some(-7),
                audio: Bytes::from_static(b"tail"),
                is_final: true,
            }
        );
    }

    #[test]
    fn test_decode_gzip_audio() {
        let mut proto = BinaryProtocol::new();
        proto.set_compression(CompressionType::Gzip);
        let data = proto
            .marshal(&Message::audio(Some(1), vec![9u8; 512], false))
            .unwrap();

        let frame = decode(&data).unwrap();
        match frame.body {
            FrameBody::Audio { audio, .. } => assert_eq!(audio.as_ref(), &[9u8; 512][..]),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_audio() {
        let frame = decode(&audio_frame(0x2, b"")).unwrap();
        match frame.body {
            FrameBody::Audio {
                audio, is_final, ..
            } => {
                assert!(audio.is_empty());
                assert!(is_final);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_frame() {
        let data = BinaryProtocol::new()
            .marshal(&Message::error("quota exceeded"))
            .unwrap();
        assert_eq!(data[1] >> 4, 0x0F);

        let frame = decode(&data).unwrap();
        assert_eq!(frame.body, FrameBody::Error("quota exceeded".to_string()));
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(
            decode(&[0x11, 0xB0]),
            Err(DecodeError::Truncated { need: 4, have: 2 })
        );
        // header claims two words
        assert_eq!(
            decode(&[0x12, 0xB0, 0x10, 0x00, 0x00]),
            Err(DecodeError::Truncated { need: 8, have: 5 })
        );
    }

    #[test]
    fn test_decode_zero_word_header() {
        // size field overlaps bytes 0..4, audio starts at 4
        let frame = decode(&[0x10, 0xB0, 0x10, 0x00, b'A', b'B', b'C', b'D', b'E']).unwrap();
        assert_eq!(frame.header.byte_len(), 0);
        assert_eq!(
            frame.body,
            FrameBody::Audio {
                sequence: None,
                audio: Bytes::from_static(b"ABCDE"),
                is_final: false,
            }
        );

        let frame = decode(&[0x10, 0xF0, 0x00, 0x00, b'o', b'o', b'p', b's']).unwrap();
        assert_eq!(frame.body, FrameBody::Error("oops".to_string()));
    }

    #[test]
    fn test_decode_offset_overflow() {
        // sequence flag set but only the size field fits
        let data = [0x11, 0xB1, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(
            decode(&data),
            Err(DecodeError::OffsetOverflow { offset: 12, len: 8 })
        );

        // missing size field
        assert_eq!(
            decode(&[0x11, 0xB0, 0x10, 0x00]),
            Err(DecodeError::OffsetOverflow { offset: 8, len: 4 })
        );
    }

    #[test]
    fn test_decode_bad_compression() {
        let mut data = vec![0x11, 0xB0, 0x11, 0x00];
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(b"junk");
        assert!(matches!(decode(&data), Err(DecodeError::BadCompression(_))));
    }

    #[test]
    fn test_decode_random_buffers_never_panic() {
        // xorshift; deterministic so failures reproduce
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        for len in 0..256usize {
            let mut data = Vec::with_capacity(len);
            for _ in 0..len {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                data.push(state as u8);
            }
            let _ = decode(&data);
            for cut in 0..data.len() {
                let _ = decode(&data[..cut]);
            }
        }
    }

    #[test]
    fn test_reserved_message_type() {
        let mut data = vec![0x11, 0x70, 0x10, 0x00];
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(b"hi");
        let frame = decode(&data).unwrap();
        assert_eq!(frame.header.message_type, MessageType::Reserved(0x7));
        assert_eq!(
            frame.body,
            FrameBody::Other {
                payload: Bytes::from_static(b"hi")
            }
        );
    }
}
