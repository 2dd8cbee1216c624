use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::direction::{xor_fold, Direction};
use crate::error::{FrameError, Result};
use crate::{MARKER, MAX_PAYLOAD};

/// Envelope header: marker (2) + direction (1) + length (1) + id (1)
/// + code (1) + priority (1).
pub const ENVELOPE_HEADER_SIZE: usize = 7;

/// A decoded network-side frame.
///
/// Envelopes carry the correlation id and priority flag that the serial
/// wire format has no room for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeFrame {
    /// Correlation id, allocated by the caller's pending-request table.
    pub id: u8,
    /// Command code.
    pub code: u8,
    /// Whether the request should jump the normal outbound lane.
    pub priority: bool,
    /// The frame payload.
    pub payload: Bytes,
}

impl EnvelopeFrame {
    /// The total wire size of this frame (header + payload + checksum).
    pub fn wire_size(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.payload.len() + 1
    }
}

/// Encode an envelope frame into the wire format.
///
/// ```text
/// ┌─────────┬─────┬─────┬────┬──────┬─────┬───────────────┬─────┐
/// │ '$' 'M' │ dir │ len │ id │ code │ pri │ payload[len]  │ crc │
/// └─────────┴─────┴─────┴────┴──────┴─────┴───────────────┴─────┘
/// crc = id ^ code ^ len ^ pri ^ XOR(payload)
/// ```
pub fn encode_envelope_frame(
    direction: Direction,
    id: u8,
    code: u8,
    priority: bool,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let len = payload.len() as u8;
    let pri = u8::from(priority);
    dst.reserve(ENVELOPE_HEADER_SIZE + payload.len() + 1);
    dst.put_slice(&MARKER);
    dst.put_u8(direction.byte());
    dst.put_u8(len);
    dst.put_u8(id);
    dst.put_u8(code);
    dst.put_u8(pri);
    dst.put_slice(payload);
    dst.put_u8(xor_fold(id ^ code ^ len ^ pri, payload));
    Ok(())
}

/// Incremental decoder for envelope frames.
///
/// Same parse-buffer discipline as [`crate::LinkDecoder`]: garbage is
/// skipped byte by byte, partial frames are retained, and a checksum
/// mismatch skips the declared span.
pub struct EnvelopeDecoder {
    direction: Direction,
    buf: BytesMut,
    corrupt_frames: u64,
}

impl EnvelopeDecoder {
    /// Create a decoder that accepts frames travelling in `direction`.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            buf: BytesMut::new(),
            corrupt_frames: 0,
        }
    }

    /// Append newly received bytes to the parse buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract at most one complete valid frame from the parse buffer.
    pub fn decode(&mut self) -> Option<EnvelopeFrame> {
        loop {
            if self.buf.is_empty() {
                return None;
            }
            if self.buf[0] != MARKER[0] {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != MARKER[1] {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < 3 {
                return None;
            }
            if self.buf[2] != self.direction.byte() {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < ENVELOPE_HEADER_SIZE {
                return None;
            }

            let len = self.buf[3] as usize;
            if self.buf.len() < ENVELOPE_HEADER_SIZE + len + 1 {
                return None;
            }

            let id = self.buf[4];
            let code = self.buf[5];
            let pri = self.buf[6];
            let crc = xor_fold(
                id ^ code ^ len as u8 ^ pri,
                &self.buf[ENVELOPE_HEADER_SIZE..ENVELOPE_HEADER_SIZE + len],
            );
            if crc != self.buf[ENVELOPE_HEADER_SIZE + len] {
                self.corrupt_frames += 1;
                debug!(id, code, len, "envelope checksum mismatch, resyncing");
                self.buf.advance(ENVELOPE_HEADER_SIZE + len);
                continue;
            }

            self.buf.advance(ENVELOPE_HEADER_SIZE);
            let payload = self.buf.split_to(len).freeze();
            self.buf.advance(1);
            return Some(EnvelopeFrame {
                id,
                code,
                priority: pri != 0,
                payload,
            });
        }
    }

    /// Number of frames dropped on checksum mismatch since creation.
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }

    /// Bytes currently retained in the parse buffer.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(id: u8, code: u8, priority: bool, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_envelope_frame(Direction::Request, id, code, priority, payload, &mut buf)
            .expect("payload should fit");
        buf
    }

    #[test]
    fn roundtrip() {
        let wire = encode(7, 101, false, b"status-req");
        let mut decoder = EnvelopeDecoder::new(Direction::Request);
        decoder.extend(&wire);

        let frame = decoder.decode().expect("frame should decode");
        assert_eq!(frame.id, 7);
        assert_eq!(frame.code, 101);
        assert!(!frame.priority);
        assert_eq!(frame.payload.as_ref(), b"status-req");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn roundtrip_priority() {
        let wire = encode(12, 200, true, b"\x01\x02");
        let mut decoder = EnvelopeDecoder::new(Direction::Request);
        decoder.extend(&wire);

        let frame = decoder.decode().expect("frame should decode");
        assert_eq!(frame.id, 12);
        assert!(frame.priority);
    }

    #[test]
    fn priority_flag_is_checksummed() {
        let mut wire = encode(3, 105, false, b"rc");
        // Flip the priority byte without fixing the checksum.
        wire[6] = 1;

        let mut decoder = EnvelopeDecoder::new(Direction::Request);
        decoder.extend(&wire);
        assert!(decoder.decode().is_none());
        assert_eq!(decoder.corrupt_frames(), 1);
    }

    #[test]
    fn direction_filtering() {
        let mut request = BytesMut::new();
        encode_envelope_frame(Direction::Request, 1, 100, false, b"", &mut request)
            .expect("payload should fit");

        let mut response_decoder = EnvelopeDecoder::new(Direction::Response);
        response_decoder.extend(&request);
        assert!(response_decoder.decode().is_none());

        let mut response = BytesMut::new();
        encode_envelope_frame(Direction::Response, 1, 100, false, b"ok", &mut response)
            .expect("payload should fit");
        response_decoder.extend(&response);
        let frame = response_decoder.decode().expect("response should decode");
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn garbage_prefix_then_valid_frame() {
        let mut wire = BytesMut::from(&[0xDE, 0xAD, 0xBE, 0xEF][..]);
        wire.extend_from_slice(&encode(9, 102, false, b"imu"));

        let mut decoder = EnvelopeDecoder::new(Direction::Request);
        decoder.extend(&wire);

        let frame = decoder.decode().expect("frame after garbage should decode");
        assert_eq!(frame.id, 9);
        assert_eq!(frame.code, 102);
    }

    #[test]
    fn burst_of_frames_drains_in_order() {
        let mut wire = BytesMut::new();
        for id in 0..4u8 {
            wire.extend_from_slice(&encode(id, 101, false, &[id]));
        }

        let mut decoder = EnvelopeDecoder::new(Direction::Request);
        decoder.extend(&wire);

        for id in 0..4u8 {
            let frame = decoder.decode().expect("burst frame should decode");
            assert_eq!(frame.id, id);
            assert_eq!(frame.payload.as_ref(), &[id]);
        }
        assert!(decoder.decode().is_none());
    }

    #[test]
    fn checksum_mismatch_skips_declared_span() {
        let mut corrupt = encode(5, 106, false, b"gps-payload");
        corrupt[8] ^= 0x40; // payload byte
        corrupt.extend_from_slice(&encode(6, 107, false, b"comp"));

        let mut decoder = EnvelopeDecoder::new(Direction::Request);
        decoder.extend(&corrupt);

        let frame = decoder.decode().expect("frame after corruption should decode");
        assert_eq!(frame.id, 6);
        assert_eq!(frame.code, 107);
        assert_eq!(decoder.corrupt_frames(), 1);
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let wire = encode(17, 110, true, b"analog");
        for byte in 0..wire.len() - 1 {
            for bit in 0..8 {
                let mut flipped = wire.clone();
                flipped[byte] ^= 1 << bit;

                let mut decoder = EnvelopeDecoder::new(Direction::Request);
                decoder.extend(&flipped);
                assert!(
                    decoder.decode().is_none(),
                    "flip at byte {byte} bit {bit} should invalidate the frame"
                );
            }
        }
    }

    #[test]
    fn partial_header_is_retained() {
        let wire = encode(2, 108, false, b"attitude");

        let mut decoder = EnvelopeDecoder::new(Direction::Request);
        decoder.extend(&wire[..4]);
        assert!(decoder.decode().is_none());
        assert_eq!(decoder.buffered(), 4);

        decoder.extend(&wire[4..]);
        let frame = decoder.decode().expect("completed frame should decode");
        assert_eq!(frame.code, 108);
    }
}
