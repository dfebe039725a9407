//! Note to frequency mapping.

use vesta_core::Frequency;

/// Number of MIDI notes.
pub const NOTES: usize = 128;

/// MIDI note of the reference pitch.
pub const A4_NOTE: u8 = 69;

/// Standard reference pitch.
pub const A4_FREQUENCY: Frequency = 440.0;

/// Source of note frequencies.
///
/// The synth asks the table once per note event, so an implementation may
/// retune between notes (per channel, for MPE setups) without affecting
/// notes already sounding.
pub trait FrequencyTable {
    /// Frequency of `note` on `channel` in Hz.
    fn frequency(&self, note: u8, channel: u8) -> Frequency;
}

/// Twelve-tone equal temperament around a configurable A4.
#[derive(Debug, Clone)]
pub struct EqualTemperament {
    a4: Frequency,
    frequencies: [Frequency; NOTES],
}

impl EqualTemperament {
    /// Table with A4 at `a4` Hz.
    pub fn new(a4: Frequency) -> Self {
        let frequencies = core::array::from_fn(|note| {
            a4 * libm::exp2((note as f64 - f64::from(A4_NOTE)) / 12.0)
        });

        Self { a4, frequencies }
    }

    /// Frequency of A4.
    pub fn a4(&self) -> Frequency {
        self.a4
    }
}

impl Default for EqualTemperament {
    fn default() -> Self {
        Self::new(A4_FREQUENCY)
    }
}

impl FrequencyTable for EqualTemperament {
    fn frequency(&self, note: u8, _channel: u8) -> Frequency {
        self.frequencies[note as usize % NOTES]
    }
}

/// Convert MIDI note number to frequency in Hz.
///
/// Uses standard tuning: A4 (note 69) = 440 Hz.
#[inline]
pub fn midi_to_freq(note: u8) -> Frequency {
    A4_FREQUENCY * libm::exp2((f64::from(note) - f64::from(A4_NOTE)) / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midi_to_freq() {
        assert!((midi_to_freq(69) - 440.0).abs() < 1e-9);
        assert!((midi_to_freq(81) - 880.0).abs() < 1e-9);
        assert!((midi_to_freq(60) - 261.625_565).abs() < 1e-5);
    }

    #[test]
    fn octaves_double_the_frequency() {
        let table = EqualTemperament::default();

        for note in 0..116 {
            let ratio = table.frequency(note + 12, 0) / table.frequency(note, 0);
            assert!((ratio - 2.0).abs() < 1e-9, "note {note}: {ratio}");
        }
    }

    #[test]
    fn reference_pitch_is_configurable() {
        let table = EqualTemperament::new(432.0);

        assert_eq!(table.a4(), 432.0);
        assert!((table.frequency(A4_NOTE, 3) - 432.0).abs() < 1e-9);
        assert!((table.frequency(57, 0) - 216.0).abs() < 1e-9);
    }

    #[test]
    fn default_table_matches_midi_to_freq() {
        let table = EqualTemperament::default();

        for note in 0..=127 {
            assert!((table.frequency(note, 0) - midi_to_freq(note)).abs() < 1e-9);
        }
    }
}
