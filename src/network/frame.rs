//! Per-link wire frame (spec §4.6 "Frame format"): carries at most one
//! fountain combination plus flow/side channel acks.

use thiserror::Error;

use crate::fountain::Combination;
use crate::ident::{Identifier, IDENTIFIER_LEN};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short")]
    Truncated,
    #[error("target_size must be 0 (flow) or 32 (side channel), got {0}")]
    BadTargetSize(u8),
    #[error("coefficient bit count does not fit the declared window")]
    BadWindow,
}

/// Bit 0x01 of `version`: side-channel ack extension present (spec §4.6).
const SIDE_ACK_FLAG: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Flow,
    Side(Identifier),
}

#[derive(Clone, Debug)]
pub struct HandlerFrame {
    pub channel: Channel,
    pub sequence: u32,
    pub next_seen: u32,
    pub next_decoded: u32,
    pub side_ack: Option<(u32, u32)>, // (side_seen, side_count)
    pub combination: Combination,
}

impl HandlerFrame {
    pub fn encode(&self) -> Vec<u8> {
        let target: Vec<u8> = match self.channel {
            Channel::Flow => Vec::new(),
            Channel::Side(digest) => digest.as_bytes().to_vec(),
        };
        let version = if self.side_ack.is_some() { SIDE_ACK_FLAG } else { 0 };
        let coded_payload = &self.combination.payload;

        let mut out = Vec::with_capacity(16 + target.len() + coded_payload.len() + 64);
        out.push(version);
        out.push(target.len() as u8);
        out.extend_from_slice(&(coded_payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.next_seen.to_be_bytes());
        out.extend_from_slice(&self.next_decoded.to_be_bytes());
        if let Some((side_seen, side_count)) = self.side_ack {
            out.extend_from_slice(&side_seen.to_be_bytes());
            out.extend_from_slice(&side_count.to_be_bytes());
        }
        encode_combination_header(&self.combination, &mut out);
        out.extend_from_slice(&target);
        out.extend_from_slice(coded_payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 14 {
            return Err(FrameError::Truncated);
        }
        let version = bytes[0];
        let target_size = bytes[1];
        if target_size != 0 && target_size as usize != IDENTIFIER_LEN {
            return Err(FrameError::BadTargetSize(target_size));
        }
        let data_size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let sequence = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let next_seen = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let next_decoded = u32::from_be_bytes(bytes[12..16].try_into().unwrap());

        let mut offset = 16;
        let side_ack = if version & SIDE_ACK_FLAG != 0 {
            if bytes.len() < offset + 8 {
                return Err(FrameError::Truncated);
            }
            let side_seen = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap());
            let side_count = u32::from_be_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
            offset += 8;
            Some((side_seen, side_count))
        } else {
            None
        };

        let (combination_header, consumed) = decode_combination_header(&bytes[offset..])?;
        offset += consumed;

        if bytes.len() < offset + target_size as usize {
            return Err(FrameError::Truncated);
        }
        let channel = if target_size == 0 {
            Channel::Flow
        } else {
            let digest = Identifier::from_slice(&bytes[offset..offset + target_size as usize])
                .ok_or(FrameError::BadTargetSize(target_size))?;
            Channel::Side(digest)
        };
        offset += target_size as usize;

        if bytes.len() != offset + data_size {
            return Err(FrameError::Truncated);
        }
        let payload = bytes[offset..].to_vec();

        let mut combination = combination_header;
        combination.payload = payload;

        Ok(HandlerFrame { channel, sequence, next_seen, next_decoded, side_ack, combination })
    }
}

/// `{ first_component: u32, last_component: u32, coefficients: bitvec }`.
fn encode_combination_header(combination: &Combination, out: &mut Vec<u8>) {
    out.extend_from_slice(&combination.first_component.to_be_bytes());
    out.extend_from_slice(&combination.last_component.to_be_bytes());
    out.extend_from_slice(&combination.total_length.to_be_bytes());
    let byte_len = (combination.coefficients.len() + 7) / 8;
    out.push(byte_len as u8);
    let mut byte = 0u8;
    for (i, bit) in combination.coefficients.iter().enumerate() {
        if *bit {
            byte |= 1 << (i % 8);
        }
        if i % 8 == 7 {
            out.push(byte);
            byte = 0;
        }
    }
    if combination.coefficients.len() % 8 != 0 {
        out.push(byte);
    }
}

fn decode_combination_header(bytes: &[u8]) -> Result<(Combination, usize), FrameError> {
    if bytes.len() < 17 {
        return Err(FrameError::Truncated);
    }
    let first_component = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let last_component = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    let total_length = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
    let byte_len = bytes[16] as usize;
    if bytes.len() < 17 + byte_len {
        return Err(FrameError::Truncated);
    }
    let window = (last_component.saturating_sub(first_component) as usize) + 1;
    if (window + 7) / 8 != byte_len {
        return Err(FrameError::BadWindow);
    }
    let mut coefficients = Vec::with_capacity(window);
    for i in 0..window {
        let byte = bytes[17 + i / 8];
        coefficients.push(byte & (1 << (i % 8)) != 0);
    }
    let consumed = 17 + byte_len;
    Ok((
        Combination { first_component, last_component, coefficients, total_length, payload: Vec::new() },
        consumed,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_combination() -> Combination {
        Combination {
            first_component: 0,
            last_component: 2,
            coefficients: vec![true, false, true],
            total_length: 42,
            payload: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn flow_frame_roundtrips() {
        let frame = HandlerFrame {
            channel: Channel::Flow,
            sequence: 7,
            next_seen: 3,
            next_decoded: 2,
            side_ack: None,
            combination: sample_combination(),
        };
        let bytes = frame.encode();
        let back = HandlerFrame::decode(&bytes).unwrap();
        assert_eq!(back.channel, Channel::Flow);
        assert_eq!(back.sequence, 7);
        assert_eq!(back.combination.coefficients, vec![true, false, true]);
        assert_eq!(back.combination.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn side_frame_with_ack_roundtrips() {
        let digest = Identifier([5u8; 32]);
        let frame = HandlerFrame {
            channel: Channel::Side(digest),
            sequence: 1,
            next_seen: 1,
            next_decoded: 1,
            side_ack: Some((10, 12)),
            combination: sample_combination(),
        };
        let bytes = frame.encode();
        let back = HandlerFrame::decode(&bytes).unwrap();
        assert_eq!(back.channel, Channel::Side(digest));
        assert_eq!(back.side_ack, Some((10, 12)));
    }
}
