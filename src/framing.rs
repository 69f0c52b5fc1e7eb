//! MAVLink framing and parsing utilities.
//!
//! This module extracts complete MAVLink messages from received UDP datagrams,
//! handling both MAVLink v1 and v2 formats. A datagram may carry several
//! frames back to back; `FrameParser` reconstructs each one and keeps the raw
//! frame bytes alongside the decoded message so the forwarder can pass frames
//! through without re-serializing them (preserving the original sequence
//! number and CRC).

use bytes::{Buf, Bytes, BytesMut};
use mavlink::peek_reader::PeekReader;
use mavlink::{MavHeader, MavlinkVersion};
use std::io::Cursor;
use tracing::warn;

// Maximum buffer size to prevent OOM from malformed input
const MAX_BUFFER_SIZE: usize = 1024 * 1024; // 1MB

/// A completely parsed MAVLink message with its raw wire bytes.
pub struct MavlinkFrame {
    /// The MAVLink message header.
    pub header: MavHeader,
    /// The decoded MAVLink message payload.
    pub message: mavlink::common::MavMessage,
    /// The MAVLink protocol version (v1 or v2).
    pub version: MavlinkVersion,
    /// The exact bytes of the frame as received.
    pub raw: Bytes,
}

/// A stateful parser for extracting MAVLink frames from received datagrams.
///
/// The parser accumulates incoming bytes and reconstructs valid MAVLink v1 or
/// v2 messages, skipping garbage between frames. Partial frames are kept
/// until the remainder arrives.
pub struct FrameParser {
    buffer: BytesMut,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Creates a new `FrameParser` with an empty internal buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Appends new data to the internal buffer.
    ///
    /// If adding the new data would exceed `MAX_BUFFER_SIZE`, the oldest
    /// bytes are dropped to make room.
    pub fn push(&mut self, data: &[u8]) {
        let new_len = self.buffer.len() + data.len();
        if new_len > MAX_BUFFER_SIZE {
            let overflow = new_len - MAX_BUFFER_SIZE;
            warn!(
                "FrameParser buffer full, dropping {} oldest bytes to make room",
                overflow
            );

            if overflow <= self.buffer.len() {
                self.buffer.advance(overflow);
            } else {
                self.buffer.clear();
            }
        }
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to parse the next complete MAVLink frame from the buffer.
    ///
    /// Searches for a start-of-frame byte (0xFD for v2, 0xFE for v1) and
    /// tries to decode a full message. Returns `None` when no complete
    /// message is available yet; malformed bytes are skipped.
    pub fn parse_next(&mut self) -> Option<MavlinkFrame> {
        loop {
            if self.buffer.is_empty() {
                return None;
            }

            // 1. Seek to the next STX byte
            let start_idx = self.buffer.iter().position(|&b| b == 0xFD || b == 0xFE);
            if let Some(idx) = start_idx {
                if idx > 0 {
                    self.buffer.advance(idx);
                }
            } else {
                self.buffer.clear();
                return None;
            }

            // 2. Try to parse a message at the current position
            let mut peek_reader_v2 = PeekReader::new(Cursor::new(&self.buffer[..]));

            let res_v2 =
                mavlink::read_v2_msg::<mavlink::common::MavMessage, _>(&mut peek_reader_v2);

            match res_v2 {
                Ok((header, message)) => {
                    let len = peek_reader_v2.reader_ref().position() as usize;
                    let raw = self.buffer.split_to(len).freeze();
                    return Some(MavlinkFrame {
                        header,
                        message,
                        version: MavlinkVersion::V2,
                        raw,
                    });
                }
                Err(e) => {
                    let mut peek_reader_v1 = PeekReader::new(Cursor::new(&self.buffer[..]));
                    let res_v1 = mavlink::read_v1_msg::<mavlink::common::MavMessage, _>(
                        &mut peek_reader_v1,
                    );

                    match res_v1 {
                        Ok((header, message)) => {
                            let len = peek_reader_v1.reader_ref().position() as usize;
                            let raw = self.buffer.split_to(len).freeze();
                            return Some(MavlinkFrame {
                                header,
                                message,
                                version: MavlinkVersion::V1,
                                raw,
                            });
                        }
                        Err(e_v1) => {
                            // UnexpectedEof means we need more data; anything
                            // else is a bad frame, skip the STX and continue.
                            if is_eof(&e) || is_eof(&e_v1) {
                                return None;
                            }
                            self.buffer.advance(1);
                            continue;
                        }
                    }
                }
            }
        }
    }
}

/// Checks if a `mavlink::error::MessageReadError` indicates an UnexpectedEof.
fn is_eof(e: &mavlink::error::MessageReadError) -> bool {
    match e {
        mavlink::error::MessageReadError::Io(io_err) => {
            io_err.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use mavlink::common::MavMessage;
    use mavlink::Message;

    #[test]
    fn test_partial_packet() {
        let mut parser = FrameParser::new();
        let header = MavHeader::default();
        let msg = MavMessage::HEARTBEAT(mavlink::common::HEARTBEAT_DATA::default());

        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, header, &msg).expect("Failed to write test message");

        let split_idx = buf.len() / 2;
        parser.push(&buf[..split_idx]);
        assert!(parser.parse_next().is_none());

        parser.push(&buf[split_idx..]);
        let res = parser.parse_next();
        assert!(res.is_some());
        assert_eq!(
            res.expect("Should have parsed packet").message.message_id(),
            0
        );
    }

    #[test]
    fn test_raw_bytes_match_input() {
        let mut parser = FrameParser::new();
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 42,
        };
        let msg = MavMessage::HEARTBEAT(mavlink::common::HEARTBEAT_DATA::default());

        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, header, &msg).expect("write");

        parser.push(&buf);
        let frame = parser.parse_next().expect("parse");
        assert_eq!(&frame.raw[..], &buf[..]);
        assert_eq!(frame.header.sequence, 42);
    }

    #[test]
    fn test_v1_packet_parsing() {
        let mut parser = FrameParser::new();
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        };
        let msg = MavMessage::HEARTBEAT(mavlink::common::HEARTBEAT_DATA::default());

        let mut buf = Vec::new();
        mavlink::write_v1_msg(&mut buf, header, &msg).expect("Failed to write V1 message");

        parser.push(&buf);
        let res = parser.parse_next();
        assert!(res.is_some());
        let frame = res.expect("Should parse V1 packet");
        assert_eq!(frame.version, MavlinkVersion::V1);
        assert_eq!(frame.header.system_id, 1);
    }

    #[test]
    fn test_garbage_before_packet() {
        let mut parser = FrameParser::new();
        let header = MavHeader::default();
        let msg = MavMessage::HEARTBEAT(mavlink::common::HEARTBEAT_DATA::default());

        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, header, &msg).expect("Failed to write message");

        let mut garbage = vec![0x00, 0x11, 0x22, 0x33, 0x44];
        garbage.extend_from_slice(&buf);

        parser.push(&garbage);
        let res = parser.parse_next();
        assert!(res.is_some(), "Should skip garbage and find packet");
    }

    #[test]
    fn test_multiple_packets_in_one_datagram() {
        let mut parser = FrameParser::new();
        let header = MavHeader::default();
        let msg = MavMessage::HEARTBEAT(mavlink::common::HEARTBEAT_DATA::default());

        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, header, &msg).expect("write msg 1");
        mavlink::write_v2_msg(&mut buf, header, &msg).expect("write msg 2");
        mavlink::write_v2_msg(&mut buf, header, &msg).expect("write msg 3");

        parser.push(&buf);

        assert!(parser.parse_next().is_some());
        assert!(parser.parse_next().is_some());
        assert!(parser.parse_next().is_some());
        assert!(parser.parse_next().is_none());
    }

    #[test]
    fn test_empty_buffer_returns_none() {
        let mut parser = FrameParser::new();
        assert!(parser.parse_next().is_none());
    }

    #[test]
    fn test_no_stx_clears_buffer() {
        let mut parser = FrameParser::new();
        parser.push(&[0x00, 0x11, 0x22, 0x33]);
        assert!(parser.parse_next().is_none());
        assert!(parser.buffer.is_empty());
    }
}
