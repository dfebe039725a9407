//! Side-chain compression: the dry input of an effect ducks its wet signal.

use vesta_core::math::{db_to_magnitude, linear_to_db};
use vesta_core::{
    Buffer, FloatParam, Number, Round, Sample, Seconds, SignalProducer, constant_or_rendered,
    produce,
};

/// Ratio at which the compressor does nothing.
pub const NO_OP_RATIO: Number = 1.0;
/// Wet gain while nothing is compressed.
pub const BYPASS_GAIN: Number = 1.0;
/// How long a lower peak takes to replace a higher one.
pub const RING_DOWN: Seconds = 0.015;

const GAIN_TOLERANCE: Number = 0.005;

/// Block peak that falls back linearly over [`RING_DOWN`] seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeakTracker {
    peak: Sample,
    samples_since_peak: usize,
}

impl PeakTracker {
    /// Tracked peak.
    pub fn peak(&self) -> Sample {
        self.peak
    }

    /// Forget the tracked peak.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Account for a block of `sample_count` samples whose peak is `peak` at
    /// `peak_index`.
    pub fn update(&mut self, peak: Sample, peak_index: usize, sample_count: usize, sampling_period: Seconds) {
        if peak < self.peak {
            let elapsed = sampling_period * (self.samples_since_peak + peak_index) as Seconds;

            self.peak = if elapsed >= RING_DOWN {
                peak
            } else {
                (RING_DOWN - elapsed) / RING_DOWN * (self.peak - peak) + peak
            };
        } else {
            self.peak = peak;
        }

        self.samples_since_peak = sample_count.saturating_sub(peak_index);
    }
}

/// Largest magnitude among the first `sample_count` samples of every
/// channel, and its sample index.
pub fn find_peak(buffer: &Buffer, sample_count: usize) -> (Sample, usize) {
    let mut peak = 0.0;
    let mut peak_index = 0;

    for c in 0..buffer.channels() {
        for (i, sample) in buffer.channel(c)[..sample_count].iter().enumerate() {
            if sample.abs() > peak {
                peak = sample.abs();
                peak_index = i;
            }
        }
    }

    (peak, peak_index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    BypassOrRelease,
    Compress,
}

/// Computes the wet gain of an [`Effect`](crate::Effect) from the peaks of
/// its dry input.
///
/// Above the threshold the gain ramps over the attack time towards the level
/// that compresses the excess by the ratio; once the peaks fall below, it
/// ramps back to [`BYPASS_GAIN`] over the release time.
pub struct SideChainCompressor {
    /// Input peak above which the wet signal is compressed, in dB.
    pub threshold: FloatParam,
    /// Duration of the ramp towards a lower gain.
    pub attack_time: FloatParam,
    /// Duration of the ramp back to unity gain.
    pub release_time: FloatParam,
    /// Compression ratio; [`NO_OP_RATIO`] disables the compressor.
    pub ratio: FloatParam,

    gain: FloatParam,
    peak_tracker: PeakTracker,
    previous_action: Action,
    is_bypassing: bool,
}

impl core::fmt::Debug for SideChainCompressor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SideChainCompressor")
            .field("threshold", &self.threshold.value())
            .field("ratio", &self.ratio.value())
            .field("gain", &self.gain.value())
            .field("is_bypassing", &self.is_bypassing)
            .finish_non_exhaustive()
    }
}

impl SideChainCompressor {
    /// Compressor whose parameters are named `<name>CTH`, `<name>CAT`,
    /// `<name>CRL` and `<name>CR`.
    pub fn new(name: &str) -> Self {
        Self {
            threshold: FloatParam::block(format!("{name}CTH"), -120.0, 0.0, -18.0),
            attack_time: FloatParam::block(format!("{name}CAT"), 0.001, 3.0, 0.02),
            release_time: FloatParam::block(format!("{name}CRL"), 0.001, 3.0, 0.2),
            ratio: FloatParam::block(format!("{name}CR"), NO_OP_RATIO, 120.0, NO_OP_RATIO),
            gain: FloatParam::new(format!("{name}G"), 0.0, 1.0, BYPASS_GAIN),
            peak_tracker: PeakTracker::default(),
            previous_action: Action::BypassOrRelease,
            is_bypassing: true,
        }
    }

    /// Wet gain of the last round.
    pub fn gain(&self) -> &FloatParam {
        &self.gain
    }

    /// Whether the last round left the wet signal untouched.
    pub fn is_bypassing(&self) -> bool {
        self.is_bypassing
    }

    pub(crate) fn visit_params(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.threshold);
        visitor(&mut self.attack_time);
        visitor(&mut self.release_time);
        visitor(&mut self.ratio);
        visitor(&mut self.gain);
    }

    pub(crate) fn reset(&mut self) {
        self.peak_tracker.reset();
        self.fast_bypass();
    }

    /// Advance the clocks of a round in which the effect skipped processing.
    pub(crate) fn bypass(&mut self, round: Round, sample_count: usize) {
        self.produce_settings(round, sample_count);
        self.fast_bypass();
        self.gain.skip_round(round, sample_count);
    }

    /// Track the peak of `side_chain` and schedule the wet gain of this
    /// round. Returns the gain while it is constant; otherwise it is in the
    /// buffer of [`gain`](Self::gain).
    pub(crate) fn update(
        &mut self,
        is_dry: bool,
        side_chain: &Buffer,
        round: Round,
        sample_count: usize,
    ) -> Option<Number> {
        self.produce_settings(round, sample_count);

        let ratio = self.ratio.value();

        if is_dry || (ratio - NO_OP_RATIO).abs() < 0.000001 {
            self.fast_bypass();
        } else {
            let threshold = self.threshold.value();
            let (peak, peak_index) = find_peak(side_chain, sample_count);
            let sampling_period = self.gain.state().sampling_period();

            self.peak_tracker
                .update(peak, peak_index, sample_count, sampling_period);

            let peak = self.peak_tracker.peak();
            let excess = linear_to_db(peak) - threshold;

            if excess > 0.0 {
                self.compress(peak, threshold, excess, ratio);
            } else if self.previous_action == Action::Compress {
                self.release();
            } else if (self.gain.value() - BYPASS_GAIN).abs() < 0.000001 {
                self.fast_bypass();
            }
        }

        if self.is_bypassing {
            self.gain.skip_round(round, sample_count);
            return Some(BYPASS_GAIN);
        }

        constant_or_rendered(&mut self.gain, round, sample_count)
    }

    fn produce_settings(&mut self, round: Round, sample_count: usize) {
        for param in [
            &mut self.threshold,
            &mut self.attack_time,
            &mut self.release_time,
            &mut self.ratio,
        ] {
            produce(param, round, sample_count);
        }
    }

    fn fast_bypass(&mut self) {
        if self.gain.state().has_events() {
            self.gain.cancel_events();
        }

        self.gain.set_value(BYPASS_GAIN);
        self.previous_action = Action::BypassOrRelease;
        self.is_bypassing = true;
    }

    fn compress(&mut self, peak: Sample, threshold: Number, excess: Number, ratio: Number) {
        let target = if peak > 0.000001 {
            (db_to_magnitude(threshold + excess / ratio) / peak).min(BYPASS_GAIN)
        } else {
            BYPASS_GAIN
        };

        self.gain.cancel_events_at(0.0);

        if (self.gain.value() - target).abs() > GAIN_TOLERANCE {
            let attack_time = self.attack_time.value();
            self.gain.schedule_linear_ramp(attack_time, target);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(name = self.threshold.name(), gain = target, "side-chain compression");

        self.previous_action = Action::Compress;
        self.is_bypassing = false;
    }

    fn release(&mut self) {
        let release_time = self.release_time.value();

        self.gain.cancel_events_at(0.0);
        self.gain.schedule_linear_ramp(release_time, BYPASS_GAIN);
        self.previous_action = Action::BypassOrRelease;
        self.is_bypassing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLING_PERIOD: Seconds = 1.0 / 1000.0;

    #[test]
    fn higher_peaks_replace_the_tracked_one() {
        let mut tracker = PeakTracker::default();
        tracker.update(0.5, 3, 10, SAMPLING_PERIOD);
        tracker.update(0.8, 9, 10, SAMPLING_PERIOD);

        assert_eq!(tracker.peak(), 0.8);
    }

    #[test]
    fn lower_peaks_ring_down() {
        let mut tracker = PeakTracker::default();
        tracker.update(1.0, 9, 10, SAMPLING_PERIOD);

        // 1 sample left in the first block and 5 into the second: 6 ms of 15.
        tracker.update(0.0, 5, 10, SAMPLING_PERIOD);

        assert!((tracker.peak() - 0.6).abs() < 1e-9, "{}", tracker.peak());
    }

    #[test]
    fn lower_peaks_win_after_the_ring_down() {
        let mut tracker = PeakTracker::default();
        tracker.update(1.0, 0, 10, SAMPLING_PERIOD);
        tracker.update(0.25, 9, 10, SAMPLING_PERIOD);

        assert_eq!(tracker.peak(), 0.25);
    }

    #[test]
    fn peak_is_found_across_channels() {
        let mut buffer = Buffer::new(2, 4);
        buffer.channel_mut(0)[1] = 0.5;
        buffer.channel_mut(1)[3] = -0.75;

        assert_eq!(find_peak(&buffer, 4), (0.75, 3));
        assert_eq!(find_peak(&buffer, 3), (0.5, 1));
    }

    #[test]
    fn parameters_are_named_after_the_effect() {
        let compressor = SideChainCompressor::new("FXE");

        assert_eq!(compressor.threshold.name(), "FXECTH");
        assert_eq!(compressor.attack_time.name(), "FXECAT");
        assert_eq!(compressor.release_time.name(), "FXECRL");
        assert_eq!(compressor.ratio.name(), "FXECR");
        assert_eq!(compressor.ratio.value(), NO_OP_RATIO);
    }
}
