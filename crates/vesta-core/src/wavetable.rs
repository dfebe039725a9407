//! Band-limited wavetables.
//!
//! A [`Wavetable`] stores one pre-summed table per partial count: table `k`
//! holds the first `k + 1` harmonics of the waveform. Lookups pick the two
//! tables around the highest partial count that stays below Nyquist at the
//! requested frequency and crossfade between them, so sweeping a note
//! upwards sheds harmonics smoothly instead of aliasing.
//!
//! Each table spans two periods of the fundamental; the second period exists
//! for the optional subharmonic, which runs at half the frequency.

use std::f64::consts::PI;
use std::sync::LazyLock;

use crate::math;
use crate::{Frequency, Number, Sample, Seconds};

/// Harmonics of the standard band-limited waveforms.
pub const PARTIALS: usize = 384;
/// Harmonics of the softened waveform variants.
pub const SOFT_PARTIALS: usize = 192;

/// Samples per table; two periods of the fundamental.
pub const SIZE: usize = 0x800;
const MASK: usize = SIZE - 1;
const SIZE_FLOAT: Number = SIZE as Number;

/// Samples per period of the fundamental.
pub const PERIOD_SIZE: usize = SIZE / 2;
const PERIOD_MASK: usize = PERIOD_SIZE - 1;
const PERIOD_SIZE_FLOAT: Number = PERIOD_SIZE as Number;

/// Below `nyquist × INTERPOLATION_LIMIT_SCALE` consecutive lookups land close
/// enough together that linear interpolation audibly buzzes; Lagrange
/// interpolation is used there instead.
const INTERPOLATION_LIMIT_SCALE: Number = 1.0 / (2.0 * PERIOD_SIZE_FLOAT);

const ZERO_FREQUENCY: Frequency = 0.000_000_1;

struct Sines {
    fundamental: Vec<Sample>,
    subharmonic: Vec<Sample>,
}

static SINES: LazyLock<Sines> = LazyLock::new(|| {
    let fundamental = (0..SIZE)
        .map(|j| libm::sin(j as Number / PERIOD_SIZE_FLOAT * 2.0 * PI))
        .collect();
    let subharmonic = (0..SIZE)
        .map(|j| libm::sin(j as Number / SIZE_FLOAT * 2.0 * PI))
        .collect();

    Sines {
        fundamental,
        subharmonic,
    }
});

/// Per-oscillator lookup state: phase position and the partial tables chosen
/// for the current frequency.
#[derive(Debug, Clone, Default)]
pub struct WavetableState {
    scale: Number,
    sample_index: Number,
    fewer_partials_weight: Number,
    nyquist_frequency: Frequency,
    interpolation_limit: Frequency,
    more_partials: usize,
    fewer_partials: usize,
}

impl WavetableState {
    /// Phase position in table samples.
    pub fn sample_index(&self) -> Number {
        self.sample_index
    }
}

/// A stack of band-limited tables built from harmonic coefficients.
#[derive(Debug, Clone)]
pub struct Wavetable {
    partials: usize,
    samples: Vec<Sample>,
}

impl Wavetable {
    /// Build the tables for `coefficients[i]` as the amplitude of harmonic
    /// `i + 1`, normalized so the loudest table peaks at 1.
    pub fn new(coefficients: &[Number]) -> Self {
        let mut wavetable = Self {
            partials: coefficients.len(),
            samples: vec![0.0; coefficients.len() * SIZE],
        };

        wavetable.update_coefficients(coefficients);
        wavetable.normalize();

        wavetable
    }

    /// Number of partials of the richest table.
    pub fn partials(&self) -> usize {
        self.partials
    }

    /// Rebuild the tables from new coefficients; `coefficients` must have
    /// [`partials`](Self::partials) entries. Unlike [`new`](Self::new) this
    /// does not normalize, so harmonic amplitudes stay as given.
    pub fn update_coefficients(&mut self, coefficients: &[Number]) {
        debug_assert_eq!(coefficients.len(), self.partials);

        let sines = &SINES.fundamental;

        for j in 0..SIZE {
            let mut sum = 0.0;

            for (i, coefficient) in coefficients.iter().enumerate() {
                sum += coefficient * sines[(j * (i + 1)) & MASK];
                self.samples[i * SIZE + j] = sum;
            }
        }
    }

    fn normalize(&mut self) {
        let max = self
            .samples
            .iter()
            .fold(0.0_f64, |max, sample| max.max(sample.abs()));

        if max > 0.0 {
            let scale = 1.0 / max;

            for sample in &mut self.samples {
                *sample *= scale;
            }
        }
    }

    fn table(&self, partials_index: usize) -> &[Sample] {
        let start = partials_index * SIZE;

        &self.samples[start..start + SIZE]
    }

    /// Convert a phase offset in periods into table samples.
    #[inline]
    pub fn scale_phase_offset(phase_offset: Number) -> Number {
        phase_offset * PERIOD_SIZE_FLOAT
    }

    /// Prepare `state` for a note that started `start_time_offset` seconds
    /// ago at `frequency`.
    pub fn reset_state(
        state: &mut WavetableState,
        sampling_period: Seconds,
        nyquist_frequency: Frequency,
        frequency: Frequency,
        start_time_offset: Seconds,
    ) {
        state.sample_index = PERIOD_SIZE_FLOAT * start_time_offset * frequency;
        state.scale = PERIOD_SIZE_FLOAT * sampling_period;
        state.nyquist_frequency = nyquist_frequency;
        state.interpolation_limit = nyquist_frequency * INTERPOLATION_LIMIT_SCALE;
        state.more_partials = 0;
        state.fewer_partials = 0;
        state.fewer_partials_weight = 0.0;
    }

    /// Current sample at `frequency`, then advance the phase by one sample.
    /// Returns `(fundamental, subharmonic)`; the subharmonic is zero unless
    /// `with_subharmonic` is set.
    pub fn lookup(
        &self,
        state: &mut WavetableState,
        frequency: Frequency,
        phase_offset: Number,
        with_subharmonic: bool,
    ) -> (Sample, Sample) {
        let abs_frequency = frequency.abs();

        if abs_frequency > state.nyquist_frequency {
            return (0.0, 0.0);
        }

        let index = state.sample_index + phase_offset;

        if abs_frequency < ZERO_FREQUENCY {
            // A standing wave: hold the value at the current phase.
            state.more_partials = self.partials.saturating_sub(1);
            state.fewer_partials = state.more_partials;
            state.fewer_partials_weight = 0.0;

            return self.interpolate(state, index, false, with_subharmonic);
        }

        state.sample_index = wrap_index(state.sample_index + state.scale * frequency);
        self.update_partials(state, abs_frequency);

        let use_lagrange = abs_frequency < state.interpolation_limit;

        self.interpolate(state, index, use_lagrange, with_subharmonic)
    }

    fn update_partials(&self, state: &mut WavetableState, frequency: Frequency) {
        let max_partials = state.nyquist_frequency / frequency;
        let last = self.partials.saturating_sub(1);
        let more = (libm::floor(max_partials) as usize)
            .min(self.partials)
            .saturating_sub(1)
            .min(last);

        state.more_partials = more;
        state.fewer_partials = more.saturating_sub(1);
        state.fewer_partials_weight = if more == 0 {
            0.0
        } else {
            1.0 - (max_partials - libm::floor(max_partials))
        };

        // Plenty of headroom above the richest table: no crossfade.
        if max_partials >= self.partials as Number + 1.0 {
            state.fewer_partials_weight = 0.0;
        }
    }

    fn interpolate(
        &self,
        state: &WavetableState,
        index: Number,
        use_lagrange: bool,
        with_subharmonic: bool,
    ) -> (Sample, Sample) {
        let floor = libm::floor(index);
        let t = index - floor;
        let base = floor as i64;
        let mask = if with_subharmonic { MASK } else { PERIOD_MASK };

        let more = self.table(state.more_partials);
        let fewer = self.table(state.fewer_partials);
        let weight = state.fewer_partials_weight;

        let mixed = |i: usize| {
            let i = i & mask;
            math::combine(weight, fewer[i], more[i])
        };

        let sample = if use_lagrange {
            lagrange(t, |offset| mixed(offset_index(base, offset)))
        } else {
            linear(t, |offset| mixed(offset_index(base, offset)))
        };

        if !with_subharmonic {
            return (sample, 0.0);
        }

        let subharmonic = &SINES.subharmonic;
        let sub = linear(t, |offset| subharmonic[offset_index(base, offset) & MASK]);

        (sample, sub)
    }
}

#[inline]
fn offset_index(base: i64, offset: i64) -> usize {
    (base + offset).rem_euclid(SIZE as i64) as usize
}

#[inline]
fn wrap_index(index: Number) -> Number {
    if (0.0..SIZE_FLOAT).contains(&index) {
        index
    } else {
        index - libm::floor(index / SIZE_FLOAT) * SIZE_FLOAT
    }
}

#[inline]
fn linear(t: Number, sample_at: impl Fn(i64) -> Sample) -> Sample {
    math::combine(t, sample_at(1), sample_at(0))
}

/// Three-point Lagrange interpolation centred on the current sample.
#[inline]
fn lagrange(t: Number, sample_at: impl Fn(i64) -> Sample) -> Sample {
    let t_sqr = t * t;
    let a1 = 0.5 * (t_sqr - t);
    let a2 = 1.0 - t_sqr;
    let a3 = 0.5 * (t_sqr + t);

    a1 * sample_at(-1) + a2 * sample_at(0) + a3 * sample_at(1)
}

/// The built-in waveforms, computed on first use.
#[derive(Debug)]
pub struct StandardWaveforms {
    sine: Wavetable,
    sawtooth: Wavetable,
    soft_sawtooth: Wavetable,
    inverse_sawtooth: Wavetable,
    soft_inverse_sawtooth: Wavetable,
    triangle: Wavetable,
    soft_triangle: Wavetable,
    square: Wavetable,
    soft_square: Wavetable,
}

static STANDARD_WAVEFORMS: LazyLock<StandardWaveforms> = LazyLock::new(StandardWaveforms::build);

impl StandardWaveforms {
    /// The shared instance.
    pub fn get() -> &'static Self {
        &STANDARD_WAVEFORMS
    }

    fn build() -> Self {
        let sawtooth = coefficients(PARTIALS, |i, i_pi, sign| sign * 2.0 / i_pi * softener(i, false));
        let soft_sawtooth =
            coefficients(SOFT_PARTIALS, |i, i_pi, sign| sign * 2.0 / i_pi * softener(i, true));
        let inverse = |coefficients: &[Number]| coefficients.iter().map(|c| -c).collect::<Vec<_>>();
        let triangle = |partials, soft| {
            coefficients(partials, |i, i_pi, _| {
                8.0 * libm::sin(i_pi / 2.0) / (i_pi * i_pi) * softener(i, soft)
            })
        };
        let square = |partials, soft| {
            coefficients(partials, |i, i_pi, sign| {
                (1.0 + sign) * 2.0 / i_pi * softener(i, soft)
            })
        };

        Self {
            sine: Wavetable::new(&[1.0]),
            inverse_sawtooth: Wavetable::new(&inverse(&sawtooth)),
            soft_inverse_sawtooth: Wavetable::new(&inverse(&soft_sawtooth)),
            sawtooth: Wavetable::new(&sawtooth),
            soft_sawtooth: Wavetable::new(&soft_sawtooth),
            triangle: Wavetable::new(&triangle(PARTIALS, false)),
            soft_triangle: Wavetable::new(&triangle(SOFT_PARTIALS, true)),
            square: Wavetable::new(&square(PARTIALS, false)),
            soft_square: Wavetable::new(&square(SOFT_PARTIALS, true)),
        }
    }

    /// Pure sine.
    pub fn sine(&self) -> &Wavetable {
        &self.sine
    }

    /// Rising sawtooth.
    pub fn sawtooth(&self) -> &Wavetable {
        &self.sawtooth
    }

    /// Rising sawtooth with attenuated upper harmonics.
    pub fn soft_sawtooth(&self) -> &Wavetable {
        &self.soft_sawtooth
    }

    /// Falling sawtooth.
    pub fn inverse_sawtooth(&self) -> &Wavetable {
        &self.inverse_sawtooth
    }

    /// Falling sawtooth with attenuated upper harmonics.
    pub fn soft_inverse_sawtooth(&self) -> &Wavetable {
        &self.soft_inverse_sawtooth
    }

    /// Triangle.
    pub fn triangle(&self) -> &Wavetable {
        &self.triangle
    }

    /// Triangle with attenuated upper harmonics.
    pub fn soft_triangle(&self) -> &Wavetable {
        &self.soft_triangle
    }

    /// Square.
    pub fn square(&self) -> &Wavetable {
        &self.square
    }

    /// Square with attenuated upper harmonics.
    pub fn soft_square(&self) -> &Wavetable {
        &self.soft_square
    }
}

fn softener(i: usize, soft: bool) -> Number {
    if soft { 5.0 / (i as Number + 5.0) } else { 1.0 }
}

/// `f(i, (i + 1)π, (-1)^i)` for each partial index.
fn coefficients(partials: usize, f: impl Fn(usize, Number, Number) -> Number) -> Vec<Number> {
    (0..partials)
        .map(|i| {
            let i_pi = (i + 1) as Number * PI;
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };

            f(i, i_pi, sign)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: Frequency = 44100.0;

    fn state_for(frequency: Frequency) -> WavetableState {
        let mut state = WavetableState::default();
        Wavetable::reset_state(&mut state, 1.0 / SAMPLE_RATE, SAMPLE_RATE / 2.0, frequency, 0.0);
        state
    }

    #[test]
    fn sine_table_follows_sin() {
        let sine = StandardWaveforms::get().sine();
        let frequency = 110.0;
        let mut state = state_for(frequency);

        for i in 0..400 {
            let expected = libm::sin(2.0 * PI * frequency * i as Number / SAMPLE_RATE);
            let (sample, _) = sine.lookup(&mut state, frequency, 0.0, false);

            assert!((sample - expected).abs() < 1e-3, "sample {i}: {sample} vs {expected}");
        }
    }

    #[test]
    fn frequencies_above_nyquist_are_silent() {
        let saw = StandardWaveforms::get().sawtooth();
        let mut state = state_for(30000.0);

        assert_eq!(saw.lookup(&mut state, 30000.0, 0.0, true), (0.0, 0.0));
    }

    #[test]
    fn standard_tables_are_normalized() {
        let waveforms = StandardWaveforms::get();

        for table in [waveforms.sawtooth(), waveforms.triangle(), waveforms.soft_square()] {
            let peak = table.samples.iter().fold(0.0_f64, |max, s| max.max(s.abs()));
            assert!((peak - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn high_notes_use_fewer_partials() {
        let square = StandardWaveforms::get().square();
        let mut low = state_for(50.0);
        let mut high = state_for(5000.0);

        square.lookup(&mut low, 50.0, 0.0, false);
        square.lookup(&mut high, 5000.0, 0.0, false);

        assert_eq!(low.more_partials, PARTIALS - 1);
        assert!(high.more_partials < 5);
    }

    #[test]
    fn phase_offset_shifts_the_waveform() {
        let sine = StandardWaveforms::get().sine();
        let mut state = state_for(100.0);
        let (quarter, _) =
            sine.lookup(&mut state, 100.0, Wavetable::scale_phase_offset(0.25), false);

        assert!((quarter - 1.0).abs() < 1e-6);
    }

    #[test]
    fn subharmonic_runs_at_half_the_frequency() {
        let sine = StandardWaveforms::get().sine();
        let frequency = 1000.0;
        let mut state = state_for(frequency);
        let mut last_sub = 0.0;

        // Half a period of the fundamental is a quarter of the subharmonic.
        for _ in 0..=(SAMPLE_RATE / frequency / 4.0) as usize * 2 {
            let (_, sub) = sine.lookup(&mut state, frequency, 0.0, true);
            assert!(sub >= last_sub - 1e-9);
            last_sub = sub;
        }

        assert!(last_sub > 0.5);
    }

    #[test]
    fn custom_tables_are_not_renormalized_on_update() {
        let mut custom = Wavetable::new(&[1.0, 0.0]);
        custom.update_coefficients(&[0.5, 0.0]);
        let mut state = state_for(100.0);
        let (peak, _) =
            custom.lookup(&mut state, 100.0, Wavetable::scale_phase_offset(0.25), false);

        assert!((peak - 0.5).abs() < 1e-6);
    }
}
