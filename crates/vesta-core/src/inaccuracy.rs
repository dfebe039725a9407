//! Analog-style oscillator imprecision.
//!
//! Every voice owns an [`OscillatorInaccuracy`]. On each note it draws a new
//! per-note value from its seeded generator, which detunes the note by a
//! fixed amount, and while the note plays the pitch wanders between random
//! targets. Voices may instead share one synced instance so that a chord
//! drifts as a whole.

use crate::{Number, Seconds};

/// Shortest time the drift takes to reach its next target.
pub const MIN_DRIFT_DURATION: Seconds = 0.3;
/// Random extension of the drift time.
pub const DRIFT_DURATION_DELTA: Seconds = 1.7;

/// Per-note detune at full inaccuracy, in cents.
pub const MAX_DETUNE_CENTS: Number = 12.0;
/// Drift excursion at full instability, in cents.
pub const MAX_DRIFT_CENTS: Number = 15.0;

/// Lowest per-note inaccuracy value.
pub const MIN_VALUE: Number = 0.1;

/// Seeded drift generator of one voice.
#[derive(Debug, Clone)]
pub struct OscillatorInaccuracy {
    rng_state: u32,
    seed_state: u32,
    value: Number,
    drift_from: Number,
    drift_to: Number,
    drift_elapsed: Seconds,
    drift_duration: Seconds,
}

impl OscillatorInaccuracy {
    /// Generator whose sequence is determined by `seed` in `[0, 1)`.
    pub fn new(seed: Number) -> Self {
        let seed_state = (seed.clamp(0.0, 1.0) * Number::from(u32::MAX)) as u32;
        let mut inaccuracy = Self {
            rng_state: seed_state,
            seed_state,
            value: 0.0,
            drift_from: 0.0,
            drift_to: 0.0,
            drift_elapsed: 0.0,
            drift_duration: MIN_DRIFT_DURATION,
        };

        inaccuracy.update();
        inaccuracy
    }

    /// Deterministic, well-spread seed of the voice at `index`.
    pub fn calculate_seed(index: usize) -> Number {
        const GOLDEN_RATIO_CONJUGATE: Number = 0.618_033_988_749_895;

        (0.5 + index as Number * GOLDEN_RATIO_CONJUGATE).fract()
    }

    /// Per-note value in `[MIN_VALUE, 1]`.
    pub fn value(&self) -> Number {
        self.value
    }

    /// Draw the value of the next note.
    pub fn update(&mut self) {
        self.value = MIN_VALUE + (1.0 - MIN_VALUE) * self.next_random();
    }

    /// Fixed detune of the current note in cents at inaccuracy `level`.
    pub fn detune_cents(&self, level: Number) -> Number {
        let spread = (self.value - MIN_VALUE) / (1.0 - MIN_VALUE);

        (spread * 2.0 - 1.0) * level * MAX_DETUNE_CENTS
    }

    /// Advance the drift by `elapsed` seconds and return the current drift in
    /// cents at instability `level`.
    pub fn drift(&mut self, level: Number, elapsed: Seconds) -> Number {
        self.drift_elapsed += elapsed;

        while self.drift_elapsed >= self.drift_duration {
            self.drift_elapsed -= self.drift_duration;
            self.drift_from = self.drift_to;
            self.drift_to = self.next_random() * 2.0 - 1.0;
            self.drift_duration = MIN_DRIFT_DURATION + self.next_random() * DRIFT_DURATION_DELTA;
        }

        let progress = self.drift_elapsed / self.drift_duration;
        let position = self.drift_from + (self.drift_to - self.drift_from) * progress;

        position * level * MAX_DRIFT_CENTS
    }

    /// Restart the sequence from the seed.
    pub fn reset(&mut self) {
        self.rng_state = self.seed_state;
        self.drift_from = 0.0;
        self.drift_to = 0.0;
        self.drift_elapsed = 0.0;
        self.drift_duration = MIN_DRIFT_DURATION;
        self.update();
    }

    /// Numerical Recipes LCG; the upper 16 bits are used.
    fn next_random(&mut self) -> Number {
        self.rng_state = self
            .rng_state
            .wrapping_mul(1_664_525)
            .wrapping_add(1_013_904_223);

        Number::from((self.rng_state >> 16) as u16) / 65_536.0
    }
}
