//! Custom MAVLink message: `SESSION_HEARTBEAT` (id 42999).
//!
//! The router learns a drone's UDP 5-tuple from this message, so it must
//! travel on the same socket as the forwarded MAVLink data. Payload:
//! `[token:32][expires_at:u32 LE][sequence:u16 LE]` where the token is the
//! binary form of the first 64 hex characters of the session token string.
//!
//! The `mavlink` crate generates its dialects at build time and cannot carry
//! a runtime-added message id, so this module frames the message by hand
//! following the MAVLink v2 rules: start byte 0xFD, trailing-zero payload
//! truncation, X.25 checksum seeded with the message's CRC_EXTRA.

use std::sync::OnceLock;

use crate::protocol::CodecError;

/// MAVLink message id of SESSION_HEARTBEAT.
pub const SESSION_HEARTBEAT_ID: u32 = 42999;

/// MAVLink v2 start-of-frame byte.
const MAGIC_V2: u8 = 0xFD;

/// Full payload length before v2 trailing-zero truncation.
const PAYLOAD_LEN: usize = 32 + 4 + 2;

/// SESSION_HEARTBEAT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeartbeat {
    /// Session token, 32 bytes binary
    pub token: [u8; 32],
    /// Session expiration timestamp (unix seconds, truncated to u32)
    pub expires_at: u32,
    /// Monotonically increasing emission counter
    pub sequence: u16,
}

/// Header fields of a decoded SESSION_HEARTBEAT frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// MAVLink packet sequence
    pub sequence: u8,
    /// Sender system id
    pub system_id: u8,
    /// Sender component id
    pub component_id: u8,
}

/// X.25 checksum accumulation (MCRF4XX), as used by MAVLink.
#[inline]
fn crc_accumulate(crc: u16, byte: u8) -> u16 {
    let mut tmp = byte ^ (crc & 0xFF) as u8;
    tmp ^= tmp << 4;
    (crc >> 8) ^ ((tmp as u16) << 8) ^ ((tmp as u16) << 3) ^ ((tmp as u16) >> 4)
}

fn crc_accumulate_slice(mut crc: u16, data: &[u8]) -> u16 {
    for &b in data {
        crc = crc_accumulate(crc, b);
    }
    crc
}

/// CRC_EXTRA for SESSION_HEARTBEAT, seeded per the MAVLink rules from the
/// message name and its fields in wire order.
pub fn crc_extra() -> u8 {
    static CRC_EXTRA: OnceLock<u8> = OnceLock::new();
    *CRC_EXTRA.get_or_init(|| {
        let mut crc = 0xFFFFu16;
        crc = crc_accumulate_slice(crc, b"SESSION_HEARTBEAT ");
        // (type, name, array length) per field, wire order
        for (ty, name, array_len) in [
            ("uint8_t", "token", 32u8),
            ("uint32_t", "expires_at", 0),
            ("uint16_t", "sequence", 0),
        ] {
            crc = crc_accumulate_slice(crc, ty.as_bytes());
            crc = crc_accumulate(crc, b' ');
            crc = crc_accumulate_slice(crc, name.as_bytes());
            crc = crc_accumulate(crc, b' ');
            if array_len > 0 {
                crc = crc_accumulate(crc, array_len);
            }
        }
        ((crc & 0xFF) ^ (crc >> 8)) as u8
    })
}

impl SessionHeartbeat {
    /// Builds the heartbeat from a session token string.
    ///
    /// Returns `None` when the token is shorter than 64 hex characters or not
    /// valid hex; a heartbeat without a full binary token is useless to the
    /// router.
    pub fn from_session(token_hex: &str, expires_at: u64, sequence: u16) -> Option<Self> {
        let prefix = token_hex.get(..64)?;
        let bytes = hex::decode(prefix).ok()?;
        let mut token = [0u8; 32];
        token.copy_from_slice(&bytes);
        Some(Self {
            token,
            expires_at: expires_at as u32,
            sequence,
        })
    }

    fn payload(&self) -> [u8; PAYLOAD_LEN] {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..32].copy_from_slice(&self.token);
        payload[32..36].copy_from_slice(&self.expires_at.to_le_bytes());
        payload[36..38].copy_from_slice(&self.sequence.to_le_bytes());
        payload
    }

    /// Frames the message as a MAVLink v2 packet.
    pub fn encode(&self, system_id: u8, component_id: u8, packet_seq: u8) -> Vec<u8> {
        let payload = self.payload();

        // v2 truncates trailing zero payload bytes, keeping at least one.
        let mut len = PAYLOAD_LEN;
        while len > 1 && payload[len - 1] == 0 {
            len -= 1;
        }

        let id = SESSION_HEARTBEAT_ID.to_le_bytes();
        let mut frame = Vec::with_capacity(12 + len);
        frame.push(MAGIC_V2);
        frame.push(len as u8);
        frame.push(0); // incompat flags
        frame.push(0); // compat flags
        frame.push(packet_seq);
        frame.push(system_id);
        frame.push(component_id);
        frame.extend_from_slice(&id[..3]);
        frame.extend_from_slice(&payload[..len]);

        // Checksum covers everything after the start byte, plus CRC_EXTRA.
        let mut crc = crc_accumulate_slice(0xFFFF, &frame[1..]);
        crc = crc_accumulate(crc, crc_extra());
        frame.extend_from_slice(&crc.to_le_bytes());

        frame
    }

    /// Parses a framed SESSION_HEARTBEAT packet, verifying the checksum.
    pub fn decode(data: &[u8]) -> Result<(FrameHeader, Self), CodecError> {
        if data.len() < 12 {
            return Err(CodecError::Truncated("mavlink v2 header"));
        }
        if data[0] != MAGIC_V2 {
            return Err(CodecError::UnexpectedType {
                expected: MAGIC_V2,
                got: data[0],
            });
        }
        let payload_len = data[1] as usize;
        let total = 10 + payload_len + 2;
        if data.len() < total {
            return Err(CodecError::Truncated("mavlink v2 payload"));
        }

        let msg_id = u32::from_le_bytes([data[7], data[8], data[9], 0]);
        if msg_id != SESSION_HEARTBEAT_ID {
            return Err(CodecError::UnexpectedMessageId {
                expected: SESSION_HEARTBEAT_ID,
                got: msg_id,
            });
        }

        let mut crc = crc_accumulate_slice(0xFFFF, &data[1..10 + payload_len]);
        crc = crc_accumulate(crc, crc_extra());
        let wire_crc = u16::from_le_bytes([data[10 + payload_len], data[11 + payload_len]]);
        if crc != wire_crc {
            return Err(CodecError::CrcMismatch);
        }

        // Zero-extend the truncated payload back to full length.
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..payload_len.min(PAYLOAD_LEN)]
            .copy_from_slice(&data[10..10 + payload_len.min(PAYLOAD_LEN)]);

        let mut token = [0u8; 32];
        token.copy_from_slice(&payload[..32]);
        let expires_at = u32::from_le_bytes([payload[32], payload[33], payload[34], payload[35]]);
        let sequence = u16::from_le_bytes([payload[36], payload[37]]);

        Ok((
            FrameHeader {
                sequence: data[4],
                system_id: data[5],
                component_id: data[6],
            },
            Self {
                token,
                expires_at,
                sequence,
            },
        ))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn sample() -> SessionHeartbeat {
        let mut token = [0u8; 32];
        for (i, b) in token.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        SessionHeartbeat {
            token,
            expires_at: 1_800_000_000,
            sequence: 7,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let hb = sample();
        let frame = hb.encode(1, 1, 42);
        assert_eq!(frame[0], MAGIC_V2);
        assert_eq!(frame[5], 1);

        let (header, decoded) = SessionHeartbeat::decode(&frame).expect("decode");
        assert_eq!(header.sequence, 42);
        assert_eq!(header.system_id, 1);
        assert_eq!(header.component_id, 1);
        assert_eq!(decoded, hb);
    }

    #[test]
    fn test_message_id_bytes() {
        let frame = sample().encode(1, 1, 0);
        // 42999 = 0x00A7F7 little-endian in the 3-byte id field
        assert_eq!(&frame[7..10], &[0xF7, 0xA7, 0x00]);
    }

    #[test]
    fn test_trailing_zero_truncation() {
        // A zero sequence and small expires_at leave trailing zero bytes that
        // v2 framing strips.
        let hb = SessionHeartbeat {
            token: [0xAA; 32],
            expires_at: 1,
            sequence: 0,
        };
        let frame = hb.encode(1, 1, 0);
        assert!((frame[1] as usize) < PAYLOAD_LEN);

        let (_, decoded) = SessionHeartbeat::decode(&frame).expect("decode");
        assert_eq!(decoded, hb);
    }

    #[test]
    fn test_corrupted_frame_fails_crc() {
        let mut frame = sample().encode(1, 1, 0);
        let payload_start = 10;
        frame[payload_start] ^= 0xFF;
        assert_eq!(
            SessionHeartbeat::decode(&frame),
            Err(CodecError::CrcMismatch)
        );
    }

    #[test]
    fn test_wrong_message_id_rejected() {
        let mut frame = sample().encode(1, 1, 0);
        frame[7] = 0x00;
        frame[8] = 0x00;
        frame[9] = 0x00;
        assert!(matches!(
            SessionHeartbeat::decode(&frame),
            Err(CodecError::UnexpectedMessageId { .. })
        ));
    }

    #[test]
    fn test_from_session_token_hex() {
        let token_hex = "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20";
        let hb = SessionHeartbeat::from_session(token_hex, 1_800_000_000, 3).expect("hb");
        assert_eq!(hb.token[0], 0x01);
        assert_eq!(hb.token[31], 0x20);
        assert_eq!(hb.sequence, 3);

        // Longer tokens use only the first 64 hex characters.
        let longer = format!("{}ffff", token_hex);
        let hb2 = SessionHeartbeat::from_session(&longer, 1_800_000_000, 3).expect("hb2");
        assert_eq!(hb2.token, hb.token);

        assert!(SessionHeartbeat::from_session("deadbeef", 0, 0).is_none());
        assert!(SessionHeartbeat::from_session(&"zz".repeat(32), 0, 0).is_none());
    }

    #[test]
    fn test_crc_extra_is_stable() {
        assert_eq!(crc_extra(), crc_extra());
    }
}
