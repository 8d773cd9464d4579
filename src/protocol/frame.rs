//! WebSocket frame codec for the client role.
//!
//! Outbound frames are always FIN-set, never fragmented, and always masked
//! with a fresh random key. Inbound frames from the server are decoded
//! incrementally from a byte buffer.
//!
//! # Wire Format
//!
//! ```text
//! ┌─────────┬───────────────┬────────────────────┬──────────┬──────────────┐
//! │ FIN|op  │ MASK|len7     │ ext len (0/2/8 B)  │ mask 4 B │ payload      │
//! └─────────┴───────────────┴────────────────────┴──────────┴──────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use rand::RngCore;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// FIN bit of the first header byte.
const FIN: u8 = 0x80;

/// Reserved bits of the first header byte. No extensions are negotiated.
const RSV: u8 = 0x70;

/// MASK bit of the second header byte.
const MASKED: u8 = 0x80;

/// Largest payload length encoded in the 7-bit field.
const MAX_SHORT_LEN: usize = 125;

/// Largest control frame payload allowed by RFC 6455.
const MAX_CONTROL_LEN: usize = 125;

/// Upper bound on an inbound payload before the peer is considered hostile.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

// ============================================================================
// OpCode
// ============================================================================

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation of a fragmented message (never produced, rejected inbound).
    Continuation,
    /// UTF-8 text message.
    Text,
    /// Binary message.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
}

impl OpCode {
    /// Returns the 4-bit wire value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Parses a 4-bit wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Returns `true` for close, ping and pong.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame opcode.
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Vec<u8>,
}

// ============================================================================
// Masking
// ============================================================================

/// XORs `buf` in place with the repeating 4-byte `mask`.
///
/// Works on 8-byte words and falls back to single bytes for the tail.
/// The output is byte-identical to [`apply_mask_bytewise`].
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let word = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(bytes) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // Word boundaries are multiples of the mask length, so the tail restarts at mask[0].
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Reference byte-at-a-time masking.
pub fn apply_mask_bytewise(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a masked, FIN-set client frame with a fresh random mask.
#[must_use]
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut mask = [0u8; 4];
    rand::rng().fill_bytes(&mut mask);
    encode_frame_with_mask(opcode, payload, mask)
}

/// Encodes a masked, FIN-set client frame with the given mask.
#[must_use]
pub fn encode_frame_with_mask(opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(14 + len);

    frame.push(FIN | opcode.as_u8());
    match len {
        0..=MAX_SHORT_LEN => frame.push(MASKED | len as u8),
        126..=0xFFFF => {
            frame.push(MASKED | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            frame.push(MASKED | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(&mask);

    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], mask);
    frame
}

/// Builds the payload of a close frame.
#[must_use]
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let reason = truncate_reason(reason);
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Splits a close frame payload into code and reason.
#[must_use]
pub fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), reason)
}

/// Keeps a close reason within the control frame limit on a char boundary.
fn truncate_reason(reason: &str) -> &str {
    let max = MAX_CONTROL_LEN - 2;
    if reason.len() <= max {
        return reason;
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` if more bytes are needed, otherwise the frame and the
/// number of bytes it occupied.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for reserved bits, unknown opcodes,
/// fragmented or continuation frames, oversized control frames, and
/// payloads larger than [`MAX_PAYLOAD_LEN`].
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    if b0 & RSV != 0 {
        return Err(Error::protocol("reserved bits set"));
    }
    let opcode = OpCode::from_u8(b0 & 0x0F)
        .ok_or_else(|| Error::protocol(format!("unknown opcode 0x{:x}", b0 & 0x0F)))?;
    if b0 & FIN == 0 || opcode == OpCode::Continuation {
        return Err(Error::protocol("fragmented messages are not supported"));
    }

    let masked = b1 & MASKED != 0;
    let mut offset = 2;
    let len = match b1 & 0x7F {
        126 => {
            if buf.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            offset += 2;
            len
        }
        127 => {
            if buf.len() < offset + 8 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            offset += 8;
            u64::from_be_bytes(bytes)
        }
        short => u64::from(short),
    };

    if len > MAX_PAYLOAD_LEN as u64 {
        return Err(Error::protocol(format!("payload too large: {len} bytes")));
    }
    let len = len as usize;
    if opcode.is_control() && len > MAX_CONTROL_LEN {
        return Err(Error::protocol("control frame too large"));
    }

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let mask = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(mask)
    } else {
        None
    };

    let total = offset + len;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[offset..total].to_vec();
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Some((Frame { opcode, payload }, total)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn server_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![FIN | opcode.as_u8()];
        match payload.len() {
            0..=125 => frame.push(payload.len() as u8),
            126..=0xFFFF => {
                frame.push(126);
                frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            }
            _ => {
                frame.push(127);
                frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            }
        }
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 section 5.7, single-frame masked text message.
        let frame = encode_frame_with_mask(OpCode::Text, b"Hello", MASK);
        assert_eq!(
            frame,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_short_length_encoding() {
        let frame = encode_frame(OpCode::Binary, &[7u8; 100]);
        assert_eq!(frame[0], 0x82);
        assert_eq!(frame[1], 0x80 | 100);
        assert_eq!(frame.len(), 2 + 4 + 100);
    }

    #[test]
    fn test_extended_16_length_encoding() {
        let frame = encode_frame(OpCode::Binary, &[7u8; 1000]);
        assert_eq!(frame[1], 0x80 | 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 1000);
        assert_eq!(frame.len(), 4 + 4 + 1000);
    }

    #[test]
    fn test_extended_64_length_encoding() {
        let frame = encode_frame(OpCode::Binary, &vec![7u8; 100_000]);
        assert_eq!(frame[1], 0x80 | 127);
        let mut len = [0u8; 8];
        len.copy_from_slice(&frame[2..10]);
        assert_eq!(u64::from_be_bytes(len), 100_000);
        assert_eq!(frame.len(), 10 + 4 + 100_000);
    }

    #[test]
    fn test_length_boundaries() {
        assert_eq!(encode_frame(OpCode::Binary, &[0u8; 125])[1], 0x80 | 125);
        assert_eq!(encode_frame(OpCode::Binary, &[0u8; 126])[1], 0x80 | 126);
        assert_eq!(encode_frame(OpCode::Binary, &vec![0u8; 65535])[1], 0x80 | 126);
        assert_eq!(encode_frame(OpCode::Binary, &vec![0u8; 65536])[1], 0x80 | 127);
    }

    #[test]
    fn test_client_frame_decodes_to_original_payload() {
        let payload = b"GET / HTTP/1.1\r\n\r\n".to_vec();
        let frame = encode_frame(OpCode::Binary, &payload);
        let (decoded, used) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(decoded.opcode, OpCode::Binary);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_decode_unmasked_server_frames() {
        let mut buf = server_frame(OpCode::Text, b"unbind");
        buf.extend(server_frame(OpCode::Binary, &[1u8; 300]));

        let (first, used) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(first.opcode, OpCode::Text);
        assert_eq!(first.payload, b"unbind");

        let (second, rest) = decode_frame(&buf[used..]).unwrap().unwrap();
        assert_eq!(second.opcode, OpCode::Binary);
        assert_eq!(second.payload.len(), 300);
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn test_decode_needs_more_bytes() {
        let frame = server_frame(OpCode::Binary, &[9u8; 70_000]);
        assert!(decode_frame(&frame[..1]).unwrap().is_none());
        assert!(decode_frame(&frame[..5]).unwrap().is_none());
        assert!(decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());
        assert!(decode_frame(&frame).unwrap().is_some());
    }

    #[test]
    fn test_decode_rejects_fragments() {
        let mut frame = server_frame(OpCode::Text, b"part");
        frame[0] &= !FIN;
        assert!(decode_frame(&frame).is_err());

        let continuation = server_frame(OpCode::Continuation, b"rest");
        assert!(decode_frame(&continuation).is_err());
    }

    #[test]
    fn test_decode_rejects_reserved_bits_and_unknown_opcodes() {
        let mut frame = server_frame(OpCode::Binary, b"x");
        frame[0] |= 0x40;
        assert!(decode_frame(&frame).is_err());

        let unknown = vec![FIN | 0x3, 0];
        assert!(decode_frame(&unknown).is_err());
    }

    #[test]
    fn test_decode_rejects_large_control_frames() {
        let ping = server_frame(OpCode::Ping, &[0u8; 200]);
        assert!(decode_frame(&ping).is_err());
    }

    #[test]
    fn test_close_payload() {
        let payload = close_payload(1000, "purge");
        assert_eq!(parse_close_payload(&payload), (Some(1000), "purge".to_string()));
        assert_eq!(parse_close_payload(&[]), (None, String::new()));
    }

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let payload = close_payload(4000, &reason);
        assert!(payload.len() <= MAX_CONTROL_LEN);
        let (_, parsed) = parse_close_payload(&payload);
        assert!(parsed.chars().all(|c| c == 'é'));
    }

    proptest! {
        #[test]
        fn prop_mask_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..2048), mask in any::<[u8; 4]>()) {
            let mut buf = payload.clone();
            apply_mask(&mut buf, mask);
            apply_mask(&mut buf, mask);
            prop_assert_eq!(buf, payload);
        }

        #[test]
        fn prop_word_mask_matches_bytewise(payload in proptest::collection::vec(any::<u8>(), 0..2048), mask in any::<[u8; 4]>()) {
            let mut fast = payload.clone();
            let mut slow = payload;
            apply_mask(&mut fast, mask);
            apply_mask_bytewise(&mut slow, mask);
            prop_assert_eq!(fast, slow);
        }
    }
}
