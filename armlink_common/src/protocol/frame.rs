//! Frame encoding, decoding and stream resynchronization.
//!
//! Instruction packets (host → servo) and status packets (servo → host)
//! share one layout, so a single [`Frame`] type covers both directions:
//! `code` carries the instruction byte on the way out and the servo
//! error byte on the way back.

use thiserror::Error;
use tracing::debug;

use crate::consts::BROADCAST_ID;

/// Two-byte frame header.
pub const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Smallest possible frame: header + id + length + code + checksum.
pub const MIN_FRAME_LEN: usize = 6;

/// Largest parameter block the one-byte length field can describe.
pub const MAX_PARAMS: usize = u8::MAX as usize - 2;

/// Instruction codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    /// Presence check; the servo answers with an empty status packet.
    Ping = 0x01,
    /// Read `len` bytes starting at `addr`.
    Read = 0x02,
    /// Write bytes starting at `addr`.
    Write = 0x03,
    /// Buffered write, applied on `Action`.
    RegWrite = 0x04,
    /// Apply buffered writes.
    Action = 0x05,
    /// Read the same register block from several servos.
    SyncRead = 0x82,
    /// Write per-servo data to the same register block in one frame.
    SyncWrite = 0x83,
}

impl Instruction {
    /// Decode an instruction byte.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::Read),
            0x03 => Some(Self::Write),
            0x04 => Some(Self::RegWrite),
            0x05 => Some(Self::Action),
            0x82 => Some(Self::SyncRead),
            0x83 => Some(Self::SyncWrite),
            _ => None,
        }
    }
}

/// Codec errors. None of these are fatal for the stream: the decoder
/// skips the offending bytes and resynchronizes on the next header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer ends before the frame does.
    #[error("incomplete frame: {needed} more byte(s) required")]
    Incomplete {
        /// Bytes still missing.
        needed: usize,
    },

    /// Buffer does not start with `FF FF`.
    #[error("header mismatch: expected FF FF, got {0:02X?}")]
    HeaderMismatch([u8; 2]),

    /// Length field too small to hold code + checksum.
    #[error("invalid length field {0}")]
    InvalidLength(u8),

    /// Checksum byte does not match the frame body.
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the received body.
        computed: u8,
        /// Checksum byte found on the wire.
        received: u8,
    },

    /// Parameter block does not fit the one-byte length field.
    #[error("frame too long: {0} parameter bytes (max {MAX_PARAMS})")]
    TooLong(usize),

    /// Value cannot be represented in the register.
    #[error("value {value} out of range for register {register}")]
    ValueOutOfRange {
        /// Register name.
        register: &'static str,
        /// Rejected value.
        value: i32,
    },

    /// Payload width does not match the register.
    #[error("register {register} expects {expected} byte(s), got {actual}")]
    PayloadSize {
        /// Register name.
        register: &'static str,
        /// Register width.
        expected: usize,
        /// Received width.
        actual: usize,
    },
}

/// Checksum over the frame body (everything after the header, excluding
/// the checksum byte itself).
#[inline]
pub fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Servo ID (or broadcast).
    pub id: u8,
    /// Instruction byte (host → servo) or error byte (servo → host).
    pub code: u8,
    /// Parameter bytes.
    pub params: Vec<u8>,
}

impl Frame {
    /// Total encoded length of this frame.
    #[inline]
    pub fn wire_len(&self) -> usize {
        MIN_FRAME_LEN + self.params.len()
    }

    /// Encode into wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_raw(self.id, self.code, &self.params)
    }
}

fn encode_raw(id: u8, code: u8, params: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if params.len() > MAX_PARAMS {
        return Err(ProtocolError::TooLong(params.len()));
    }
    let length = (params.len() + 2) as u8;
    let mut packet = Vec::with_capacity(MIN_FRAME_LEN + params.len());
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(code);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    Ok(packet)
}

/// Build an instruction packet.
pub fn encode(id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    encode_raw(id, instruction as u8, params)
}

/// Build a status packet (servo side; used by the simulated bus).
pub fn encode_status(id: u8, error: u8, params: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    encode_raw(id, error, params)
}

/// `PING` packet.
pub fn encode_ping(id: u8) -> Vec<u8> {
    // Empty params always fit.
    encode_raw(id, Instruction::Ping as u8, &[]).unwrap_or_default()
}

/// `READ addr len` packet.
pub fn encode_read(id: u8, address: u8, len: u8) -> Vec<u8> {
    encode_raw(id, Instruction::Read as u8, &[address, len]).unwrap_or_default()
}

/// `WRITE addr data...` packet.
pub fn encode_write(id: u8, address: u8, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut params = Vec::with_capacity(1 + data.len());
    params.push(address);
    params.extend_from_slice(data);
    encode(id, Instruction::Write, &params)
}

/// `SYNC_READ addr len id...` packet (broadcast).
pub fn encode_sync_read(address: u8, len: u8, ids: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut params = Vec::with_capacity(2 + ids.len());
    params.push(address);
    params.push(len);
    params.extend_from_slice(ids);
    encode(BROADCAST_ID, Instruction::SyncRead, &params)
}

/// `SYNC_WRITE addr len [id data...]...` packet (broadcast).
///
/// Every entry must carry exactly `data_len` bytes.
pub fn encode_sync_write(
    address: u8,
    data_len: u8,
    entries: &[(u8, &[u8])],
) -> Result<Vec<u8>, ProtocolError> {
    let mut params = Vec::with_capacity(2 + entries.len() * (1 + data_len as usize));
    params.push(address);
    params.push(data_len);
    for (id, data) in entries {
        if data.len() != data_len as usize {
            return Err(ProtocolError::PayloadSize {
                register: "sync_write",
                expected: data_len as usize,
                actual: data.len(),
            });
        }
        params.push(*id);
        params.extend_from_slice(data);
    }
    encode(BROADCAST_ID, Instruction::SyncWrite, &params)
}

/// Sync write of 2-byte little-endian positions:
/// `[A][2][id1][lo][hi]...[idN][lo][hi]`.
pub fn encode_sync_write_positions(
    address: u8,
    positions: &[(u8, u16)],
) -> Result<Vec<u8>, ProtocolError> {
    let mut params = Vec::with_capacity(2 + positions.len() * 3);
    params.push(address);
    params.push(2);
    for &(id, pos) in positions {
        params.push(id);
        params.extend_from_slice(&pos.to_le_bytes());
    }
    encode(BROADCAST_ID, Instruction::SyncWrite, &params)
}

/// Decode one frame from the start of `buf`.
///
/// Returns the frame and the number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    if buf.len() < 2 {
        return Err(ProtocolError::Incomplete {
            needed: MIN_FRAME_LEN - buf.len(),
        });
    }
    if buf[..2] != HEADER {
        return Err(ProtocolError::HeaderMismatch([buf[0], buf[1]]));
    }
    if buf.len() < 4 {
        return Err(ProtocolError::Incomplete {
            needed: MIN_FRAME_LEN - buf.len(),
        });
    }

    let length = buf[3];
    if length < 2 {
        return Err(ProtocolError::InvalidLength(length));
    }
    let total = 4 + length as usize;
    if buf.len() < total {
        return Err(ProtocolError::Incomplete {
            needed: total - buf.len(),
        });
    }

    let computed = checksum(&buf[2..total - 1]);
    let received = buf[total - 1];
    if computed != received {
        return Err(ProtocolError::ChecksumMismatch { computed, received });
    }

    let frame = Frame {
        id: buf[2],
        code: buf[4],
        params: buf[5..total - 1].to_vec(),
    };
    Ok((frame, total))
}

/// Incremental decoder over a byte stream.
///
/// Bytes are appended with [`push`](Self::push); [`next_frame`](Self::next_frame)
/// scans for the header, discards leading garbage, and yields complete
/// frames. A frame that fails validation is reported once and skipped
/// one byte at a time until the next plausible header.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet consumed bytes.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Try to extract the next complete frame.
    ///
    /// - `Ok(Some(frame))` - a valid frame was consumed
    /// - `Ok(None)` - more bytes are needed
    /// - `Err(_)` - a corrupt frame was found and skipped
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            let Some(start) = self.buf.windows(2).position(|w| w == HEADER) else {
                // Keep a trailing 0xFF: it may be the first half of a header.
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let discard = self.buf.len() - keep;
                if discard > 0 {
                    debug!("Discarding {} byte(s) without frame header", discard);
                    self.buf.drain(..discard);
                }
                return Ok(None);
            };
            if start > 0 {
                debug!("Discarding {} byte(s) before frame header", start);
                self.buf.drain(..start);
            }

            // FF FF FF ...: the first 0xFF is line noise, 0xFF is never a valid id.
            if self.buf.len() > 2 && self.buf[2] == 0xFF {
                self.buf.drain(..1);
                continue;
            }

            return match decode(&self.buf) {
                Ok((frame, consumed)) => {
                    self.buf.drain(..consumed);
                    Ok(Some(frame))
                }
                Err(ProtocolError::Incomplete { .. }) => Ok(None),
                Err(e) => {
                    self.buf.drain(..1);
                    Err(e)
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Status packet answering a 2-byte position read: position 2000.
    fn position_status(id: u8, pos: u16) -> Vec<u8> {
        let [lo, hi] = pos.to_le_bytes();
        encode_status(id, 0, &[lo, hi]).unwrap()
    }

    #[test]
    fn test_checksum_known_ping() {
        // FF FF 01 02 01 FB is the canonical ping for servo 1.
        assert_eq!(encode_ping(1), vec![0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB]);
    }

    #[test]
    fn test_read_packet_layout() {
        let pkt = encode_read(3, 56, 2);
        assert_eq!(&pkt[..5], &[0xFF, 0xFF, 3, 4, Instruction::Read as u8]);
        assert_eq!(&pkt[5..7], &[56, 2]);
        assert_eq!(pkt[7], checksum(&pkt[2..7]));
    }

    #[test]
    fn test_sync_write_positions_layout() {
        let pkt = encode_sync_write_positions(42, &[(1, 0x0102), (2, 0x0A0B)]).unwrap();
        assert_eq!(pkt[2], BROADCAST_ID);
        assert_eq!(pkt[3] as usize, 2 + 2 + 2 * 3);
        assert_eq!(pkt[4], Instruction::SyncWrite as u8);
        assert_eq!(&pkt[5..13], &[42, 2, 1, 0x02, 0x01, 2, 0x0B, 0x0A]);
    }

    #[test]
    fn test_sync_write_rejects_wrong_payload_width() {
        let data: &[u8] = &[1, 2, 3];
        let result = encode_sync_write(42, 2, &[(1, data)]);
        assert!(matches!(result, Err(ProtocolError::PayloadSize { .. })));
    }

    #[test]
    fn test_encode_rejects_oversized_params() {
        let params = vec![0u8; MAX_PARAMS + 1];
        assert_eq!(
            encode(1, Instruction::Write, &params),
            Err(ProtocolError::TooLong(MAX_PARAMS + 1))
        );
    }

    #[test]
    fn test_decode_valid_status() {
        let pkt = position_status(2, 2000);
        let (frame, used) = decode(&pkt).unwrap();
        assert_eq!(used, pkt.len());
        assert_eq!(frame.id, 2);
        assert_eq!(frame.code, 0);
        assert_eq!(u16::from_le_bytes([frame.params[0], frame.params[1]]), 2000);
    }

    #[test]
    fn test_decode_truncated_is_incomplete() {
        let pkt = position_status(1, 1234);
        for cut in 0..pkt.len() {
            let result = decode(&pkt[..cut]);
            assert!(
                matches!(result, Err(ProtocolError::Incomplete { .. })),
                "cut at {cut}: {result:?}"
            );
        }
    }

    #[test]
    fn test_decode_bad_header() {
        let mut pkt = position_status(1, 1234);
        pkt[1] = 0xFE;
        assert!(matches!(decode(&pkt), Err(ProtocolError::HeaderMismatch(_))));
    }

    #[test]
    fn test_decode_invalid_length() {
        let pkt = [0xFF, 0xFF, 0x01, 0x01, 0x00, 0x00];
        assert_eq!(decode(&pkt), Err(ProtocolError::InvalidLength(1)));
    }

    #[test]
    fn test_any_single_bit_flip_after_header_is_rejected() {
        let pkt = position_status(1, 2000);
        for pos in 2..pkt.len() {
            for bit in 0..8 {
                let mut corrupt = pkt.clone();
                corrupt[pos] ^= 1 << bit;
                let result = decode(&corrupt);
                assert!(result.is_err(), "flip byte {pos} bit {bit} accepted");
                if pos != 3 {
                    assert!(
                        matches!(result, Err(ProtocolError::ChecksumMismatch { .. })),
                        "flip byte {pos} bit {bit}: {result:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_decoder_skips_leading_garbage() {
        let mut dec = FrameDecoder::new();
        dec.push(&[0x00, 0x13, 0x37]);
        dec.push(&position_status(4, 100));
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.id, 4);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_decoder_waits_for_split_frame() {
        let pkt = position_status(5, 3000);
        let mut dec = FrameDecoder::new();
        dec.push(&pkt[..1]);
        assert_eq!(dec.next_frame(), Ok(None));
        dec.push(&pkt[1..5]);
        assert_eq!(dec.next_frame(), Ok(None));
        dec.push(&pkt[5..]);
        assert_eq!(dec.next_frame().unwrap().unwrap().id, 5);
    }

    #[test]
    fn test_decoder_resyncs_after_corrupt_frame() {
        let mut bad = position_status(1, 2000);
        bad[5] ^= 0x10;
        let good = position_status(2, 2500);

        let mut dec = FrameDecoder::new();
        dec.push(&bad);
        dec.push(&good);

        assert!(matches!(
            dec.next_frame(),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
        let frame = loop {
            match dec.next_frame() {
                Ok(Some(frame)) => break frame,
                Ok(None) => panic!("good frame lost"),
                Err(_) => continue,
            }
        };
        assert_eq!(frame.id, 2);
    }

    #[test]
    fn test_decoder_handles_padding_ff() {
        let mut dec = FrameDecoder::new();
        dec.push(&[0xFF]);
        dec.push(&position_status(3, 7));
        assert_eq!(dec.next_frame().unwrap().unwrap().id, 3);
    }
}
