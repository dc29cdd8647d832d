//! Telemetry stream decoder
//!
//! Telemetry frames carry no start marker, so the decoder works on a byte
//! buffer: it waits until a whole frame is buffered, validates it, and on
//! failure slides forward one byte and tries again. The number of slides
//! per exchange is bounded; past the bound the caller must treat the link
//! as out of sync.

use tracing::{debug, warn};

use super::frame::{Checksum, TelemetryFrame};
use super::{ProtocolError, TELEMETRY_FRAME_LEN};

/// Result of asking the decoder for the next frame
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeStatus {
    /// A valid frame was extracted from the buffer
    Frame(TelemetryFrame),
    /// Not enough bytes buffered for a full frame
    NeedMore,
    /// Resync attempts for this exchange ran out
    ResyncExhausted,
}

/// Cumulative decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Frames decoded successfully
    pub frames: u64,
    /// Frames rejected by the checksum
    pub checksum_failures: u64,
    /// Frames rejected for unknown state/error codes
    pub invalid_frames: u64,
    /// Single-byte resynchronisation steps
    pub resyncs: u64,
}

/// Buffers partial reads and extracts validated telemetry frames
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    checksum: Checksum,
    max_resync_attempts: usize,
    attempts: usize,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new(checksum: Checksum, max_resync_attempts: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(TELEMETRY_FRAME_LEN * 2),
            checksum,
            max_resync_attempts,
            attempts: 0,
            stats: DecoderStats::default(),
        }
    }

    /// Drop buffered bytes and start a new exchange
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Discarding {} stale telemetry bytes", self.buffer.len());
        }
        self.buffer.clear();
        self.attempts = 0;
    }

    /// Append bytes read from the link
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes waiting for a full frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Resync attempts spent in the current exchange
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Extract the next valid frame, resynchronising over corrupt bytes
    pub fn next_frame(&mut self) -> DecodeStatus {
        while self.buffer.len() >= TELEMETRY_FRAME_LEN {
            match TelemetryFrame::from_bytes(&self.buffer[..TELEMETRY_FRAME_LEN], self.checksum) {
                Ok(frame) => {
                    self.buffer.drain(..TELEMETRY_FRAME_LEN);
                    self.stats.frames += 1;
                    return DecodeStatus::Frame(frame);
                }
                Err(err) => {
                    match err {
                        ProtocolError::Checksum { .. } => self.stats.checksum_failures += 1,
                        _ => self.stats.invalid_frames += 1,
                    }
                    if self.attempts >= self.max_resync_attempts {
                        warn!(
                            "Resync limit of {} reached, dropping {} buffered bytes",
                            self.max_resync_attempts,
                            self.buffer.len()
                        );
                        self.buffer.clear();
                        return DecodeStatus::ResyncExhausted;
                    }
                    warn!("Rejected telemetry frame ({}), resyncing by one byte", err);
                    self.buffer.remove(0);
                    self.attempts += 1;
                    self.stats.resyncs += 1;
                }
            }
        }
        DecodeStatus::NeedMore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rig::{Fault, Mode};

    fn frame(cycle: f32) -> TelemetryFrame {
        TelemetryFrame {
            cycle,
            max_cycle: 10.0,
            mode: Mode::Running,
            error: Fault::NoError,
            ..Default::default()
        }
    }

    #[test]
    fn test_partial_reads_are_buffered() {
        let bytes = frame(3.0).to_bytes(Checksum::Additive);
        let mut decoder = FrameDecoder::new(Checksum::Additive, 8);

        decoder.push(&bytes[..20]);
        assert_eq!(decoder.next_frame(), DecodeStatus::NeedMore);
        decoder.push(&bytes[20..]);
        assert_eq!(decoder.next_frame(), DecodeStatus::Frame(frame(3.0)));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_leading_garbage_is_skipped() {
        let mut decoder = FrameDecoder::new(Checksum::Additive, 8);
        decoder.push(&[0xde, 0xad, 0xbe]);
        decoder.push(&frame(5.0).to_bytes(Checksum::Additive));

        assert_eq!(decoder.next_frame(), DecodeStatus::Frame(frame(5.0)));
        assert_eq!(decoder.attempts(), 3);
        assert_eq!(decoder.stats().resyncs, 3);
    }

    #[test]
    fn test_corrupt_frame_counts_resync() {
        let mut bytes = frame(1.0).to_bytes(Checksum::Additive);
        bytes[51] = bytes[51].wrapping_add(1);
        let mut decoder = FrameDecoder::new(Checksum::Additive, 8);
        decoder.push(&bytes);

        assert_eq!(decoder.next_frame(), DecodeStatus::NeedMore);
        assert_eq!(decoder.stats().checksum_failures, 1);
        assert_eq!(decoder.stats().resyncs, 1);
        assert_eq!(decoder.buffered(), TELEMETRY_FRAME_LEN - 1);
    }

    #[test]
    fn test_resync_is_bounded() {
        let mut decoder = FrameDecoder::new(Checksum::Additive, 4);
        decoder.push(&[0x55; TELEMETRY_FRAME_LEN + 10]);

        assert_eq!(decoder.next_frame(), DecodeStatus::ResyncExhausted);
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.stats().resyncs, 4);
    }

    #[test]
    fn test_reset_clears_attempts() {
        let mut decoder = FrameDecoder::new(Checksum::Additive, 4);
        decoder.push(&[0x00]);
        decoder.push(&frame(2.0).to_bytes(Checksum::Xor));
        let _ = decoder.next_frame();
        decoder.reset();
        assert_eq!(decoder.attempts(), 0);
        assert_eq!(decoder.buffered(), 0);
    }
}
