use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::direction::{xor_fold, Direction};
use crate::error::{FrameError, Result};
use crate::{MARKER, MAX_PAYLOAD};

/// Link frame header: marker (2) + direction (1) + length (1) + code (1).
pub const LINK_HEADER_SIZE: usize = 5;

/// A decoded serial-side frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    /// Command code.
    pub code: u8,
    /// The frame payload.
    pub payload: Bytes,
}

impl LinkFrame {
    /// The total wire size of this frame (header + payload + checksum).
    pub fn wire_size(&self) -> usize {
        LINK_HEADER_SIZE + self.payload.len() + 1
    }
}

/// Encode a link frame into the wire format.
///
/// ```text
/// ┌─────────┬─────┬─────┬──────┬───────────────┬─────┐
/// │ '$' 'M' │ dir │ len │ code │ payload[len]  │ crc │
/// └─────────┴─────┴─────┴──────┴───────────────┴─────┘
/// crc = code ^ len ^ XOR(payload)
/// ```
pub fn encode_link_frame(
    direction: Direction,
    code: u8,
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
    dst.reserve(LINK_HEADER_SIZE + payload.len() + 1);
    dst.put_slice(&MARKER);
    dst.put_u8(direction.byte());
    dst.put_u8(len);
    dst.put_u8(code);
    dst.put_slice(payload);
    dst.put_u8(xor_fold(code ^ len, payload));
    Ok(())
}

/// Incremental decoder for link frames.
///
/// Bytes accumulate in an internal parse buffer; `decode` scans forward
/// and consumes what it examines, so a byte is never looked at twice.
/// Call `decode` repeatedly after one `extend` to drain bursts where
/// several frames arrived together.
pub struct LinkDecoder {
    direction: Direction,
    buf: BytesMut,
    corrupt_frames: u64,
}

impl LinkDecoder {
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
    ///
    /// Returns `None` when no complete valid frame is currently
    /// extractable; the partial tail stays buffered for the next call.
    pub fn decode(&mut self) -> Option<LinkFrame> {
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
            if self.buf.len() < LINK_HEADER_SIZE {
                return None;
            }

            let len = self.buf[3] as usize;
            if self.buf.len() < LINK_HEADER_SIZE + len + 1 {
                // Partial frame; wait for more bytes.
                return None;
            }

            let code = self.buf[4];
            let crc = xor_fold(
                code ^ len as u8,
                &self.buf[LINK_HEADER_SIZE..LINK_HEADER_SIZE + len],
            );
            if crc != self.buf[LINK_HEADER_SIZE + len] {
                self.corrupt_frames += 1;
                debug!(code, len, "link frame checksum mismatch, resyncing");
                // Skip the declared span; the trailing byte is rescanned.
                self.buf.advance(LINK_HEADER_SIZE + len);
                continue;
            }

            self.buf.advance(LINK_HEADER_SIZE);
            let payload = self.buf.split_to(len).freeze();
            self.buf.advance(1);
            return Some(LinkFrame { code, payload });
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

    fn encode(code: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_link_frame(Direction::Response, code, payload, &mut buf)
            .expect("payload should fit");
        buf
    }

    #[test]
    fn roundtrip() {
        let wire = encode(101, b"telemetry");
        let mut decoder = LinkDecoder::new(Direction::Response);
        decoder.extend(&wire);

        let frame = decoder.decode().expect("frame should decode");
        assert_eq!(frame.code, 101);
        assert_eq!(frame.payload.as_ref(), b"telemetry");
        assert!(decoder.decode().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let wire = encode(205, b"");
        let mut decoder = LinkDecoder::new(Direction::Response);
        decoder.extend(&wire);

        let frame = decoder.decode().expect("frame should decode");
        assert_eq!(frame.code, 205);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn roundtrip_max_payload() {
        let payload = vec![0x5A; 255];
        let wire = encode(110, &payload);
        let mut decoder = LinkDecoder::new(Direction::Response);
        decoder.extend(&wire);

        let frame = decoder.decode().expect("frame should decode");
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn roundtrip_all_lengths() {
        for len in 0..=255usize {
            let payload = vec![len as u8; len];
            let wire = encode(100, &payload);
            let mut decoder = LinkDecoder::new(Direction::Response);
            decoder.extend(&wire);
            let frame = decoder.decode().expect("frame should decode");
            assert_eq!(frame.code, 100);
            assert_eq!(frame.payload.as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut buf = BytesMut::new();
        let err = encode_link_frame(Direction::Request, 100, &[0u8; 256], &mut buf)
            .expect_err("oversized payload should fail");
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 256, .. }));
    }

    #[test]
    fn garbage_prefix_is_skipped() {
        let mut wire = BytesMut::from(&[0x00, 0xFF, 0x13, 0x37, 0x99][..]);
        wire.extend_from_slice(&encode(105, b"rc"));

        let mut decoder = LinkDecoder::new(Direction::Response);
        decoder.extend(&wire);

        let frame = decoder.decode().expect("frame after garbage should decode");
        assert_eq!(frame.code, 105);
        assert_eq!(frame.payload.as_ref(), b"rc");
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let wire = encode(102, b"imu-payload");
        let (head, tail) = wire.split_at(7);

        let mut decoder = LinkDecoder::new(Direction::Response);
        decoder.extend(head);
        assert!(decoder.decode().is_none());

        decoder.extend(tail);
        let frame = decoder.decode().expect("completed frame should decode");
        assert_eq!(frame.code, 102);
        assert_eq!(frame.payload.as_ref(), b"imu-payload");
    }

    #[test]
    fn burst_drains_frame_by_frame() {
        let mut wire = BytesMut::new();
        for code in [101u8, 102, 103] {
            wire.extend_from_slice(&encode(code, &[code]));
        }

        let mut decoder = LinkDecoder::new(Direction::Response);
        decoder.extend(&wire);

        for code in [101u8, 102, 103] {
            let frame = decoder.decode().expect("burst frame should decode");
            assert_eq!(frame.code, code);
        }
        assert!(decoder.decode().is_none());
    }

    #[test]
    fn checksum_mismatch_skips_span_and_recovers() {
        let mut corrupt = encode(101, b"bad");
        let crc_index = corrupt.len() - 1;
        corrupt[crc_index] ^= 0xFF;
        corrupt.extend_from_slice(&encode(102, b"good"));

        let mut decoder = LinkDecoder::new(Direction::Response);
        decoder.extend(&corrupt);

        let frame = decoder.decode().expect("frame after corruption should decode");
        assert_eq!(frame.code, 102);
        assert_eq!(frame.payload.as_ref(), b"good");
        assert_eq!(decoder.corrupt_frames(), 1);
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let wire = encode(108, b"attitude");
        // Flip every bit of every byte except the trailing checksum.
        for byte in 0..wire.len() - 1 {
            for bit in 0..8 {
                let mut flipped = wire.clone();
                flipped[byte] ^= 1 << bit;

                let mut decoder = LinkDecoder::new(Direction::Response);
                decoder.extend(&flipped);
                assert!(
                    decoder.decode().is_none(),
                    "flip at byte {byte} bit {bit} should invalidate the frame"
                );
            }
        }
    }

    #[test]
    fn wrong_direction_is_not_decoded() {
        let mut wire = BytesMut::new();
        encode_link_frame(Direction::Request, 100, b"ident", &mut wire)
            .expect("payload should fit");

        let mut decoder = LinkDecoder::new(Direction::Response);
        decoder.extend(&wire);
        assert!(decoder.decode().is_none());
    }
}
