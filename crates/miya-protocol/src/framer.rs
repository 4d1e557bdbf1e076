//! Frame reassembly for the RS-485 bridge byte stream
//!
//! The TCP bridge forwards whatever the bus produced, so one read may hold
//! half a frame, several frames, or line noise. Frames are self-delimiting
//! by their header: `C7 12` starts a 20-byte standard frame, `AA` or any
//! other `C7` starts a 7-byte address frame.
//!
//! A lost tail makes the header-derived length run into the next frame. A
//! candidate that fails its own check (bad CRC, or a `C7` short frame
//! without the query marker) and holds a `C7 12` header past its first byte
//! is treated as a truncated frame: the bytes before that header are
//! dropped. Candidates with no better alignment are still emitted.

use crate::crc;
use crate::frame::{
    ADDRESS_QUERY_MARKER, ADDRESS_RESPONSE_HEADER, CRC_OFFSET, HEADER, PAYLOAD_LEN,
    SHORT_FRAME_LEN, STANDARD_FRAME_LEN,
};
use crate::hexfmt::encode_hex;

/// Incremental frame assembler for incoming bytes
pub struct FrameAssembler {
    buffer: Vec<u8>,
    discarded: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    /// Create a new assembler
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64),
            discarded: 0,
        }
    }

    /// Feed bytes into the assembler and extract complete frames
    ///
    /// Returns frames in arrival order (may be empty if no frame is complete yet)
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            self.resync();
            let Some(len) = self.expected_len() else {
                break;
            };
            if self.buffer.len() < len {
                break;
            }
            if let Some(skip) = self.realign(len) {
                tracing::debug!(
                    "Dropping {} bytes of truncated frame: {}",
                    skip,
                    encode_hex(&self.buffer[..skip])
                );
                self.drop_front(skip);
                continue;
            }
            frames.push(self.buffer.drain(..len).collect());
        }

        frames
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes dropped because they did not start a frame
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drop leading bytes that cannot start a frame
    fn resync(&mut self) {
        let start = self
            .buffer
            .iter()
            .position(|&b| b == HEADER || b == ADDRESS_RESPONSE_HEADER)
            .unwrap_or(self.buffer.len());
        if start > 0 {
            tracing::debug!(
                "Discarding {} bytes of noise: {}",
                start,
                encode_hex(&self.buffer[..start])
            );
            self.drop_front(start);
        }
    }

    fn drop_front(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.discarded += count as u64;
    }

    /// Offset of a standard header inside a `len`-byte candidate that is not
    /// a well-formed frame on its own
    fn realign(&self, len: usize) -> Option<usize> {
        let candidate = &self.buffer[..len];
        let malformed = match len {
            STANDARD_FRAME_LEN => {
                let expected = crc::crc16(&candidate[..CRC_OFFSET]);
                u16::from_be_bytes([candidate[CRC_OFFSET], candidate[CRC_OFFSET + 1]]) != expected
            }
            _ => candidate[0] == HEADER && candidate[2] != ADDRESS_QUERY_MARKER,
        };
        if !malformed {
            return None;
        }

        // The header pair may straddle the candidate's last byte
        let window = &self.buffer[1..self.buffer.len().min(len + 1)];
        window
            .windows(2)
            .position(|pair| pair == [HEADER, PAYLOAD_LEN])
            .map(|at| at + 1)
    }

    /// Length of the frame at the head of the buffer, if it can be told yet
    fn expected_len(&self) -> Option<usize> {
        match self.buffer.first()? {
            &ADDRESS_RESPONSE_HEADER => Some(SHORT_FRAME_LEN),
            _ => match self.buffer.get(1)? {
                &PAYLOAD_LEN => Some(STANDARD_FRAME_LEN),
                _ => Some(SHORT_FRAME_LEN),
            },
        }
    }
}
