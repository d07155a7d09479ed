//! Decoding of DI-718B sample rows.
//!
//! Every wire word carries two sync bits (bit 0 and bit 8) and 14 bits of
//! offset-binary magnitude spread over bits 1..=7 and 9..=15. The first word
//! of a row has only bit 8 set, every following word has both set.

/// Sync bits of a wire word.
pub const SYNC_MASK: u16 = 0x0101;
/// Sync pattern of the first word in a row.
pub const SYNC_FIRST: u16 = 0x0100;
/// Sync pattern of every other word in a row.
pub const SYNC_REST: u16 = 0x0101;

/// Raw value of a zero reading.
const MID_SCALE: f64 = (1 << 13) as f64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("sync bit mismatch on channel {channel}: {word:04X}")]
    SyncBitViolation { channel: usize, word: u16 },

    #[error("row holds {actual} words, expected {expected}")]
    ShortRow { expected: usize, actual: usize },
}

/// Conversion from raw counts to engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Full-scale range of the installed input amplifier module.
    pub full_scale: f32,
    /// Empirical correction factor, 1.0 for none.
    pub fudge: f32,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            full_scale: 20.0,
            fudge: 1.0,
        }
    }
}

impl Calibration {
    pub fn new(full_scale: f32, fudge: f32) -> Self {
        Calibration { full_scale, fudge }
    }

    /// Scale a 14-bit magnitude, mid-scale (8192) being zero.
    pub fn scale(&self, raw14: u16) -> f32 {
        let gain = (self.fudge * self.full_scale) as f64;
        (gain * (raw14 as f64 / MID_SCALE - 1.0)) as f32
    }
}

fn expected_sync(channel: usize) -> u16 {
    if channel == 0 { SYNC_FIRST } else { SYNC_REST }
}

/// Drop the sync bits and pack the remaining 14 bits contiguously.
pub fn magnitude(word: u16) -> u16 {
    ((word & 0xFE00) >> 2) | ((word & 0x00FE) >> 1)
}

/// Decode one row of `channel_count` words into calibrated values.
pub fn decode_row(
    row: &[u16],
    channel_count: usize,
    calibration: &Calibration,
) -> Result<Vec<f32>, DecodeError> {
    if row.len() < channel_count {
        return Err(DecodeError::ShortRow {
            expected: channel_count,
            actual: row.len(),
        });
    }

    row[..channel_count]
        .iter()
        .enumerate()
        .map(|(channel, &word)| {
            if word & SYNC_MASK != expected_sync(channel) {
                return Err(DecodeError::SyncBitViolation { channel, word });
            }
            Ok(calibration.scale(magnitude(word)))
        })
        .collect()
}

/// Build the wire word for a 14-bit magnitude at the given row position.
///
/// Inverse of [`magnitude`], used by fake devices and tests.
pub fn encode_word(raw14: u16, channel: usize) -> u16 {
    let raw14 = raw14 & 0x3FFF;
    ((raw14 << 2) & 0xFE00) | ((raw14 << 1) & 0x00FE) | expected_sync(channel)
}
