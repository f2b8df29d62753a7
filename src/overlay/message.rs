//! Overlay wire frame (spec §6 "Overlay frame") and message types (spec §3
//! "Overlay Message", §6 message type codes).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ident::{Identifier, IDENTIFIER_LEN};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("frame too short")]
    Truncated,
    #[error("declared content_size does not match remaining bytes")]
    LengthMismatch,
    #[error("id field length {0} does not match Identifier size")]
    BadIdLength(usize),
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
}

/// Message type codes (spec §6). The 0x80 bit marks a *routable* type: one
/// whose `destination` field is meaningful and subject to overlay routing
/// rather than being purely link-local.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Dummy = 0x00,
    Offer = 0x01,
    Suggest = 0x02,
    Retrieve = 0x03,
    Store = 0x04,
    Value = 0x05,
    Call = 0x81,
    Data = 0x82,
    Tunnel = 0x83,
    Ping = 0x84,
    Pong = 0x85,
}

impl MessageType {
    pub fn is_routable(self) -> bool {
        (self as u8) & 0x80 != 0
    }

    pub fn from_u8(b: u8) -> Result<Self, MessageError> {
        Ok(match b {
            0x00 => MessageType::Dummy,
            0x01 => MessageType::Offer,
            0x02 => MessageType::Suggest,
            0x03 => MessageType::Retrieve,
            0x04 => MessageType::Store,
            0x05 => MessageType::Value,
            0x81 => MessageType::Call,
            0x82 => MessageType::Data,
            0x83 => MessageType::Tunnel,
            0x84 => MessageType::Ping,
            0x85 => MessageType::Pong,
            other => return Err(MessageError::UnknownType(other)),
        })
    }
}

pub const CURRENT_VERSION: u8 = 1;
pub const DEFAULT_TTL: u8 = 32;

/// `{ version, flags, ttl, type, source, destination, content }` (spec §3).
/// `source`/`destination` are variable-length on the wire (`source_size`,
/// `destination_size` bytes) but in practice are always a full
/// [`Identifier`] or empty (link-local messages with no meaningful source).
#[derive(Clone, Debug)]
pub struct OverlayMessage {
    pub version: u8,
    pub flags: u8,
    pub ttl: u8,
    pub message_type: MessageType,
    pub source: Option<Identifier>,
    pub destination: Option<Identifier>,
    pub content: Vec<u8>,
}

impl OverlayMessage {
    pub fn new(message_type: MessageType, source: Identifier, destination: Identifier, content: Vec<u8>) -> Self {
        OverlayMessage {
            version: CURRENT_VERSION,
            flags: 0,
            ttl: DEFAULT_TTL,
            message_type,
            source: Some(source),
            destination: Some(destination),
            content,
        }
    }

    /// A link-local message with no meaningful destination (dummy, ping-like
    /// link traffic, tunnel datagrams once delivered to the right handler).
    pub fn link_local(message_type: MessageType, content: Vec<u8>) -> Self {
        OverlayMessage {
            version: CURRENT_VERSION,
            flags: 0,
            ttl: DEFAULT_TTL,
            message_type,
            source: None,
            destination: None,
            content,
        }
    }

    pub fn decrement_ttl(&mut self) -> bool {
        if self.ttl == 0 {
            return false;
        }
        self.ttl -= 1;
        true
    }

    pub fn encode(&self) -> Vec<u8> {
        let source = self.source.map(|id| id.as_bytes().to_vec()).unwrap_or_default();
        let destination = self.destination.map(|id| id.as_bytes().to_vec()).unwrap_or_default();
        let mut out = Vec::with_capacity(8 + source.len() + destination.len() + self.content.len());
        out.push(self.version);
        out.push(self.flags);
        out.push(self.ttl);
        out.push(self.message_type as u8);
        out.push(source.len() as u8);
        out.push(destination.len() as u8);
        out.extend_from_slice(&(self.content.len() as u16).to_be_bytes());
        out.extend_from_slice(&source);
        out.extend_from_slice(&destination);
        out.extend_from_slice(&self.content);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < 8 {
            return Err(MessageError::Truncated);
        }
        let version = bytes[0];
        let flags = bytes[1];
        let ttl = bytes[2];
        let message_type = MessageType::from_u8(bytes[3])?;
        let source_size = bytes[4] as usize;
        let destination_size = bytes[5] as usize;
        let content_size = u16::from_be_bytes([bytes[6], bytes[7]]) as usize;

        let mut offset = 8;
        let source = read_id_field(bytes, &mut offset, source_size)?;
        let destination = read_id_field(bytes, &mut offset, destination_size)?;

        if bytes.len() - offset != content_size {
            return Err(MessageError::LengthMismatch);
        }
        let content = bytes[offset..offset + content_size].to_vec();

        Ok(OverlayMessage { version, flags, ttl, message_type, source, destination, content })
    }
}

fn read_id_field(bytes: &[u8], offset: &mut usize, size: usize) -> Result<Option<Identifier>, MessageError> {
    if *offset + size > bytes.len() {
        return Err(MessageError::Truncated);
    }
    let field = &bytes[*offset..*offset + size];
    *offset += size;
    if size == 0 {
        return Ok(None);
    }
    if size != IDENTIFIER_LEN {
        return Err(MessageError::BadIdLength(size));
    }
    Ok(Identifier::from_slice(field))
}

// ─── Typed content payloads ───────────────────────────────────────────────
//
// The wire frame's `content` field is opaque bytes; each message type has
// its own small bincode-encoded payload, mirroring the `IndexRecord`
// encoding convention used by the resource layer.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfferPayload {
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuggestPayload {
    pub source: Identifier,
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorePayload {
    pub key: Identifier,
    pub value: Identifier,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievePayload {
    pub key: Identifier,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValuePayload {
    pub key: Identifier,
    pub value: Identifier,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallPayload {
    pub target: Identifier,
    pub tokens: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingPongPayload {
    pub payload: Vec<u8>,
}

pub fn encode_payload<T: Serialize>(payload: &T) -> Vec<u8> {
    bincode::serialize(payload).expect("payload types are always serializable")
}

pub fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, MessageError> {
    bincode::deserialize(bytes).map_err(|_| MessageError::LengthMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routable_bit_matches_spec_table() {
        assert!(!MessageType::Store.is_routable());
        assert!(!MessageType::Value.is_routable());
        assert!(MessageType::Call.is_routable());
        assert!(MessageType::Ping.is_routable());
        assert!(!MessageType::Dummy.is_routable());
    }

    #[test]
    fn encode_decode_roundtrip_with_ids() {
        let src = Identifier([1u8; 32]);
        let dst = Identifier([2u8; 32]);
        let msg = OverlayMessage::new(MessageType::Retrieve, src, dst, b"payload".to_vec());
        let bytes = msg.encode();
        let back = OverlayMessage::decode(&bytes).unwrap();
        assert_eq!(back.source, Some(src));
        assert_eq!(back.destination, Some(dst));
        assert_eq!(back.content, b"payload");
        assert_eq!(back.message_type, MessageType::Retrieve);
    }

    #[test]
    fn encode_decode_roundtrip_link_local() {
        let msg = OverlayMessage::link_local(MessageType::Dummy, vec![]);
        let bytes = msg.encode();
        let back = OverlayMessage::decode(&bytes).unwrap();
        assert_eq!(back.source, None);
        assert_eq!(back.destination, None);
        assert!(back.content.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        assert!(matches!(OverlayMessage::decode(&[1, 2, 3]), Err(MessageError::Truncated)));
    }

    #[test]
    fn ttl_decrements_and_stops_at_zero() {
        let mut msg = OverlayMessage::link_local(MessageType::Ping, vec![]);
        msg.ttl = 1;
        assert!(msg.decrement_ttl());
        assert_eq!(msg.ttl, 0);
        assert!(!msg.decrement_ttl());
    }
}
