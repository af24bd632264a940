//! Audio format constants for the recognition uplink.
//!
//! The uplink is 16 kHz, mono, 16-bit little-endian PCM. At that rate one
//! 40 ms frame is 16_000 * 2 * 0.040 = 1280 bytes.

use std::time::Duration;

/// Uplink sample rate in Hz.
pub const SAMPLE_RATE_HZ: u32 = 16_000;

/// Bytes per uplink frame.
pub const FRAME_BYTES: usize = 1280;

/// Delay between consecutive uplink frames.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(40);

/// One slice of an audio buffer, ready to be sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Position of the frame within the buffer it was cut from.
    pub index: usize,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_matches_format() {
        let bytes_per_ms = SAMPLE_RATE_HZ as usize * 2 / 1000;
        assert_eq!(FRAME_BYTES, bytes_per_ms * FRAME_INTERVAL.as_millis() as usize);
    }
}
