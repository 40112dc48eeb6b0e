use ambe_packet::Packet;

use crate::error::Result;

/// The chip's fixed sampling rate.
pub const SAMPLE_RATE: u32 = 8_000;

/// Duration of one audio frame in milliseconds.
pub const FRAME_DURATION_MS: u32 = 20;

/// Samples per audio frame: 20 ms of 16-bit mono at 8 kHz.
pub const FRAME_SIZE: usize = 160;

/// One frame of AMBE-compressed bits.
///
/// The bit count depends on the configured rate and never exceeds 255; the
/// bits occupy `ceil(bits / 8)` bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmbeFrame {
    data: Vec<u8>,
    bits: usize,
}

impl AmbeFrame {
    /// Bytes needed to hold `bits` compressed bits.
    pub fn byte_len(bits: usize) -> usize {
        bits.div_ceil(8)
    }

    /// Wrap compressed bits. Only the first `byte_len(bits)` bytes of `data`
    /// are kept.
    pub fn new(data: &[u8], bits: usize) -> Self {
        AmbeFrame {
            data: data[..Self::byte_len(bits).min(data.len())].to_vec(),
            bits,
        }
    }

    /// Extract the compressed frame from a CHANNEL response packet.
    pub fn from_response(packet: &Packet) -> Result<Self> {
        let (data, bits) = packet.bits()?;
        Ok(AmbeFrame::new(data, bits))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    /// A frame with no bits; used as an end-of-stream marker between
    /// pipeline stages.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}
