//! Frame synchronization over an undelimited byte stream.
//!
//! The gauge sends frames back to back with no delimiter. A candidate frame
//! starts wherever the byte pair `[7, 5]` appears; the checksum decides whether
//! the candidate is real. A rejected candidate costs exactly one byte, so a
//! marker pair that happens to occur inside a payload is skipped on the next
//! scan.
//!
//! Because any `[7, 5]` pair qualifies, a payload containing those bytes can
//! in principle produce a false frame if its checksum also matches. The
//! protocol offers nothing stronger to synchronize on.

use bytes::{Buf, BytesMut};
use log::{debug, trace};

use crate::codec::{self, Reading, FRAME_LEN, LENGTH_MARKER, PAGE_MARKER};

/// Accumulates chunks from one link and extracts decoded readings.
///
/// Each transport owns its own synchronizer; it is never shared.
#[derive(Debug, Default)]
pub struct FrameSynchronizer {
    buffer: BytesMut,
    rejected: u64,
}

impl FrameSynchronizer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * FRAME_LEN),
            rejected: 0,
        }
    }

    /// Append `data` and return every reading that can now be decoded, in
    /// stream order. Bytes that may still start a frame are kept for the next
    /// call.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Reading> {
        self.buffer.extend_from_slice(data);

        let mut readings = Vec::new();
        while self.buffer.len() >= FRAME_LEN {
            let Some(start) = find_marker(&self.buffer) else {
                // Keep a tail that could be the first part of a frame.
                let keep = FRAME_LEN - 1;
                let drop = self.buffer.len() - keep;
                self.buffer.advance(drop);
                trace!("no frame marker, dropped {} bytes", drop);
                break;
            };

            if start > 0 {
                trace!("skipping {} bytes before frame marker", start);
                self.buffer.advance(start);
            }

            if self.buffer.len() < FRAME_LEN {
                break;
            }

            match codec::decode_frame(&self.buffer[..FRAME_LEN]) {
                Some(reading) => {
                    self.buffer.advance(FRAME_LEN);
                    readings.push(reading);
                }
                None => {
                    self.rejected += 1;
                    debug!(
                        "rejected candidate frame {:02X?}",
                        &self.buffer[..FRAME_LEN]
                    );
                    self.buffer.advance(1);
                }
            }
        }

        readings
    }

    /// Drop all buffered bytes. Called whenever the link is (re)acquired so
    /// bytes from before and after a discontinuity are never stitched together.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently waiting for the rest of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Candidate frames rejected since creation.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w[0] == LENGTH_MARKER && w[1] == PAGE_MARKER)
}
