//! Binary wire format for Bullet protocol messages.
//!
//! A message is a fixed 8-byte header followed by a JSON payload and an
//! integrity tag:
//!
//! ```text
//! offset 0            type            1 byte   0x1A | 0x1B | 0x2A | 0x2B
//! offset 1            sender          1 byte   acceptor id
//! offset 2            term            4 bytes  big-endian u32
//! offset 6            payload length  2 bytes  big-endian u16
//! offset 8            payload         JSON array of values
//! offset 8 + len      integrity tag   8 ASCII hex chars of SHA-256(payload)
//! ```
//!
//! Over TCP every message travels inside a frame: a 4-byte big-endian length
//! prefix followed by exactly that many message bytes.
//!
//! The tag catches corruption in transit. It is not a MAC and offers no
//! protection against a peer that lies on purpose.

use std::fmt;
use std::io::{self, Read, Write};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::CodecError;
use crate::state::{AcceptorId, Term};

/// An opaque log value. Anything JSON can express.
pub type Value = serde_json::Value;

pub const HEADER_LEN: usize = 8;
pub const TAG_LEN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;
/// Largest message `decode` can accept, and so the largest legal frame body.
pub const MAX_MESSAGE_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN + TAG_LEN;

/// Phase tag of a message, named after the Paxos phase it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MessageKind {
    /// 1a: a candidate asks acceptors to promise a term.
    Prepare,
    /// 1b: an acceptor's promise, carrying its log.
    Promise,
    /// 2a: the leader pushes its log to the quorum.
    Accept,
    /// 2b: an acceptor confirms it took the leader's log.
    Accepted,
}

impl MessageKind {
    pub fn as_byte(self) -> u8 {
        match self {
            MessageKind::Prepare => 0x1A,
            MessageKind::Promise => 0x1B,
            MessageKind::Accept => 0x2A,
            MessageKind::Accepted => 0x2B,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x1A => Ok(MessageKind::Prepare),
            0x1B => Ok(MessageKind::Promise),
            0x2A => Ok(MessageKind::Accept),
            0x2B => Ok(MessageKind::Accepted),
            other => Err(CodecError::Malformed(format!(
                "unknown message type {other:#04x}"
            ))),
        }
    }
}

/// Truncated SHA-256 of a payload, as 8 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntegrityTag([u8; TAG_LEN]);

impl IntegrityTag {
    pub fn compute(payload: &[u8]) -> Self {
        let digest = Sha256::digest(payload);
        let encoded = hex::encode(&digest[..TAG_LEN / 2]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(encoded.as_bytes());
        Self(tag)
    }

    pub fn as_bytes(&self) -> &[u8; TAG_LEN] {
        &self.0
    }
}

impl fmt::Display for IntegrityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// A protocol message.
///
/// Messages built with [`Message::new`] carry a tag computed over their own
/// values. Messages produced by [`decode`] carry whatever tag arrived on the
/// wire, so check them with [`Message::verify`] before acting on them.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: AcceptorId,
    pub term: Term,
    pub values: Vec<Value>,
    tag: IntegrityTag,
}

impl Message {
    pub fn new(kind: MessageKind, sender: AcceptorId, term: Term, values: Vec<Value>) -> Self {
        let tag = IntegrityTag::compute(&payload_bytes(&values));
        Self {
            kind,
            sender,
            term,
            values,
            tag,
        }
    }

    pub fn prepare(sender: AcceptorId, term: Term) -> Self {
        Self::new(MessageKind::Prepare, sender, term, Vec::new())
    }

    pub fn promise(sender: AcceptorId, term: Term, log: Vec<Value>) -> Self {
        Self::new(MessageKind::Promise, sender, term, log)
    }

    pub fn accept(sender: AcceptorId, term: Term, values: Vec<Value>) -> Self {
        Self::new(MessageKind::Accept, sender, term, values)
    }

    pub fn accepted(sender: AcceptorId, term: Term, values: Vec<Value>) -> Self {
        Self::new(MessageKind::Accepted, sender, term, values)
    }

    pub fn tag(&self) -> IntegrityTag {
        self.tag
    }

    /// Recomputes the tag over `values` and compares it with the carried one.
    pub fn verify(&self) -> bool {
        IntegrityTag::compute(&payload_bytes(&self.values)) == self.tag
    }
}

/// Serializes `values` as a compact JSON array.
///
/// `Value`'s `Display` output is compact JSON, and a parsed value prints back
/// to the same bytes, so `verify` on a decoded message hashes exactly what the
/// sender hashed.
fn payload_bytes(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + values.len() * 8);
    out.push(b'[');
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        out.extend_from_slice(value.to_string().as_bytes());
    }
    out.push(b']');
    out
}

/// Encodes a message, computing a fresh integrity tag over its payload.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let payload = payload_bytes(&message.values);
    let payload_len = u16::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge {
        size: payload.len(),
        max: MAX_PAYLOAD_LEN,
    })?;
    let tag = IntegrityTag::compute(&payload);

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + TAG_LEN);
    buf.push(message.kind.as_byte());
    buf.push(message.sender);
    buf.extend_from_slice(&message.term.to_be_bytes());
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(tag.as_bytes());
    Ok(buf)
}

/// Decodes a message without checking its tag.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Malformed(format!(
            "{} bytes is shorter than the {HEADER_LEN} byte header",
            bytes.len()
        )));
    }

    let kind = MessageKind::try_from(bytes[0])?;
    let sender = bytes[1];
    let term = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let payload_len = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;

    let payload_end = HEADER_LEN + payload_len;
    let expected = payload_end + TAG_LEN;
    if bytes.len() < expected {
        return Err(CodecError::Malformed(format!(
            "truncated message: header announces {expected} bytes, got {}",
            bytes.len()
        )));
    }
    if bytes.len() > expected {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes after integrity tag",
            bytes.len() - expected
        )));
    }

    let payload = &bytes[HEADER_LEN..payload_end];
    let values = if payload.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice::<Vec<Value>>(payload)
            .map_err(|err| CodecError::Malformed(format!("payload is not a JSON array: {err}")))?
    };

    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&bytes[payload_end..expected]);

    Ok(Message {
        kind,
        sender,
        term,
        values,
        tag: IntegrityTag(tag),
    })
}

/// Writes `bytes` behind a 4-byte big-endian length prefix.
pub fn write_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame length overflows u32"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(bytes)?;
    writer.flush()
}

/// Reads one length-prefixed frame.
///
/// The announced length is checked against [`MAX_MESSAGE_LEN`] before any
/// buffer is allocated.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            CodecError::FrameTooLarge {
                size: len,
                max: MAX_MESSAGE_LEN,
            },
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn sample() -> Message {
        Message::accept(2, 7, vec![json!("v1"), json!({"omega": 3}), json!([1, 2])])
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(bytes[0], 0x2A);
        assert_eq!(bytes[1], 2);
        assert_eq!(&bytes[2..6], &7u32.to_be_bytes());
        let payload_len = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;
        assert_eq!(bytes.len(), HEADER_LEN + payload_len + TAG_LEN);
        assert_eq!(&bytes[8..8 + payload_len], br#"["v1",{"omega":3},[1,2]]"#);
        assert!(bytes[8 + payload_len..]
            .iter()
            .all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_roundtrip_verifies() {
        let message = sample();
        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.verify());
    }

    #[test]
    fn test_prepare_has_empty_values() {
        let decoded = decode(&encode(&Message::prepare(1, 4)).unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Prepare);
        assert!(decoded.values.is_empty());
        assert!(decoded.verify());
    }

    #[test]
    fn test_zero_length_payload_decodes_as_empty() {
        let mut bytes = vec![0x1A, 3, 0, 0, 0, 1, 0, 0];
        bytes.extend_from_slice(b"00000000");
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.values.is_empty());
        assert_eq!(decoded.sender, 3);
        assert_eq!(decoded.term, 1);
    }

    #[test]
    fn test_corrupt_tag_fails_verify() {
        let mut bytes = encode(&sample()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'0' { b'1' } else { b'0' };
        let decoded = decode(&bytes).unwrap();
        assert!(!decoded.verify());
    }

    #[test]
    fn test_corrupt_payload_is_caught() {
        let mut bytes = encode(&Message::accept(0, 1, vec![json!("v1")])).unwrap();
        // "v1" -> "v3"
        let pos = bytes.iter().position(|&b| b == b'1').unwrap();
        bytes[pos] = b'3';
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.values, vec![json!("v3")]);
        assert!(!decoded.verify());
    }

    #[test]
    fn test_every_truncation_is_malformed() {
        let bytes = encode(&sample()).unwrap();
        for cut in 0..bytes.len() {
            assert!(
                matches!(decode(&bytes[..cut]), Err(CodecError::Malformed(_))),
                "cut at {cut} should be malformed"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut bytes = encode(&sample()).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0] = 0x3A;
        assert!(matches!(decode(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_non_array_payload_is_malformed() {
        let payload = br#"{"a":1}"#;
        let mut bytes = vec![0x2A, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(IntegrityTag::compute(payload).as_bytes());
        assert!(matches!(decode(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let big = "x".repeat(MAX_PAYLOAD_LEN);
        let message = Message::accept(0, 0, vec![Value::String(big)]);
        assert!(matches!(
            encode(&message),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_roundtrip() {
        let bytes = encode(&sample()).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &bytes).unwrap();
        assert_eq!(&wire[..4], &(bytes.len() as u32).to_be_bytes());

        let read = read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(read, bytes);
    }

    #[test]
    fn test_oversized_frame_is_rejected_before_reading() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_MESSAGE_LEN + 1) as u32).to_be_bytes());
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_short_frame_is_an_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&10u32.to_be_bytes());
        wire.extend_from_slice(&[1, 2, 3]);
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
