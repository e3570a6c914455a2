//! RFC 6455 frame encoding and decoding. No I/O.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024;

/// Status sent when none was given.
pub const CLOSE_NORMAL: u16 = 1000;
/// Status reported for a close frame without a body.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved bits set")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes")]
    ControlTooLong(u64),
    #[error("payload of {0} bytes exceeds limit")]
    TooLarge(u64),
    #[error("client frame is not masked")]
    Unmasked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Self, FrameError> {
        Ok(match bits {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => return Err(FrameError::UnknownOpcode(other)),
        })
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, fin: bool, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn close(status: u16, reason: &str) -> Self {
        let mut payload = status.to_be_bytes().to_vec();
        // Control payloads are capped at 125 bytes.
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        payload.extend_from_slice(&reason.as_bytes()[..end]);
        Self::new(Opcode::Close, true, payload)
    }

    /// Status and reason of a close frame. Reasons that are not UTF-8 are
    /// converted lossily.
    pub fn close_payload(&self) -> (u16, String) {
        match self.payload.as_slice() {
            [hi, lo, reason @ ..] => (
                u16::from_be_bytes([*hi, *lo]),
                String::from_utf8_lossy(reason).into_owned(),
            ),
            _ => (CLOSE_NO_STATUS, String::new()),
        }
    }

    /// Serialize. Server frames go out unmasked.
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);
        out.push((if self.fin { 0x80 } else { 0 }) | self.opcode.bits());
        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        match mask {
            Some(key) => {
                out.extend_from_slice(&key);
                out.extend(self.payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
            }
            None => out.extend_from_slice(&self.payload),
        }
        out
    }

    /// Take one frame off the front of `buf`. `None` until it is complete.
    pub fn decode(buf: &mut Vec<u8>) -> Result<Option<Frame>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let (b0, b1) = (buf[0], buf[1]);
        if b0 & 0x70 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_bits(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;

        let mut offset = 2;
        let len = match b1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                offset = 4;
                u16::from_be_bytes([buf[2], buf[3]]) as u64
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                offset = 10;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&buf[2..10]);
                u64::from_be_bytes(bytes)
            }
            short => short as u64,
        };
        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControl);
            }
            if len > 125 {
                return Err(FrameError::ControlTooLong(len));
            }
        }
        if len > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge(len));
        }

        // Frames decoded here come from clients, which must mask.
        if !masked {
            return Err(FrameError::Unmasked);
        }
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        let end = offset + len as usize;
        if buf.len() < end {
            return Ok(None);
        }

        let mut payload = buf[offset..end].to_vec();
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
        buf.drain(..end);
        Ok(Some(Frame { fin, opcode, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn masked_client_frame_decodes() {
        // "Hello" from RFC 6455 section 5.7.
        let mut buf = vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::new(Opcode::Text, true, b"Hello".to_vec()));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let encoded = Frame::new(Opcode::Binary, true, vec![7u8; 300]).encode(Some([1, 2, 3, 4]));
        let mut buf = encoded[..3].to_vec();
        assert_eq!(Frame::decode(&mut buf), Ok(None));
        buf = encoded[..encoded.len() - 1].to_vec();
        assert_eq!(Frame::decode(&mut buf), Ok(None));
        buf = encoded;
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, vec![7u8; 300]);
    }

    #[test]
    fn back_to_back_frames_are_split() {
        let mut buf = Frame::new(Opcode::Ping, true, b"a".to_vec()).encode(Some([9, 8, 7, 6]));
        buf.extend(Frame::new(Opcode::Text, false, b"bc".to_vec()).encode(Some([1, 1, 1, 1])));
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().opcode, Opcode::Ping);
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(!second.fin);
        assert_eq!(second.payload, b"bc");
    }

    #[test]
    fn invalid_control_frames_are_rejected() {
        let mut fragmented_ping = vec![0x09, 0x00];
        assert_eq!(Frame::decode(&mut fragmented_ping), Err(FrameError::FragmentedControl));
        let mut rsv = vec![0xC1, 0x00];
        assert_eq!(Frame::decode(&mut rsv), Err(FrameError::ReservedBits));
        let mut opcode = vec![0x83, 0x00];
        assert_eq!(Frame::decode(&mut opcode), Err(FrameError::UnknownOpcode(3)));
    }

    #[test]
    fn unmasked_client_frames_are_rejected() {
        let mut buf = Frame::new(Opcode::Text, true, b"hi".to_vec()).encode(None);
        assert_eq!(Frame::decode(&mut buf), Err(FrameError::Unmasked));
        let mut header_only = vec![0x82, 0x05];
        assert_eq!(Frame::decode(&mut header_only), Err(FrameError::Unmasked));
    }

    #[test]
    fn close_payload_round_trip_and_lossy_reason() {
        let frame = Frame::close(1001, "going away");
        assert_eq!(frame.close_payload(), (1001, "going away".to_string()));

        let raw = Frame::new(Opcode::Close, true, vec![0x03, 0xE8, 0xFF, b'x']);
        assert_eq!(raw.close_payload(), (1000, "\u{FFFD}x".to_string()));
        assert_eq!(Frame::new(Opcode::Close, true, Vec::new()).close_payload().0, CLOSE_NO_STATUS);
    }
}
