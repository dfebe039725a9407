//! Comb-filter reverb.
//!
//! The high-passed input feeds a bank of [`COMB_FILTERS`] damped, panned
//! delays tuned to mutually prime lengths. Each comb feeds its own damped
//! output back into its line through a soft clipper, and the bank is summed
//! with equal weights.

use std::rc::Rc;

use vesta_core::biquad::{FREQUENCY_MAX, FREQUENCY_MIN, Q_DEFAULT, Q_MAX, Q_MIN};
use vesta_core::{
    BiquadFilter, BiquadFilterSharedBuffers, Buffer, Delay, Feed, FixedHighPass, FloatParam,
    HighShelfPannedDelay, Mixer, Number, OFF, PanningMode, ProducerState, Rendering, Round,
    Seconds, Shared, SignalProducer, ToggleParam, produce, shared, toggle,
};

use crate::chorus::frequency_log_scale;
use crate::distortion::{Distortion, Shape};
use crate::echo::FEEDBACK_MAX;
use crate::effect::Processor;

/// Number of parallel combs.
pub const COMB_FILTERS: usize = 8;
/// Largest room size; scales every comb length.
pub const ROOM_SIZE_MAX: Number = 5.0;
/// Longest comb at the largest room size fits in this many seconds.
pub const COMB_TIME_MAX: Seconds = 0.2;
/// Level of each comb in the output.
pub const COMB_WEIGHT: Number = 0.25;

/// Length and stereo spread of one comb.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    /// Comb length in seconds at unit room size.
    pub delay_time: Seconds,
    /// Portion of `width` applied to this comb.
    pub panning_scale: Number,
}

/// Comb tunings; the lengths are the classic 44.1 kHz sample counts.
pub const TUNINGS: [Tuning; COMB_FILTERS] = [
    Tuning { delay_time: 1557.0 / 44100.0, panning_scale: 1.0 },
    Tuning { delay_time: 1617.0 / 44100.0, panning_scale: 0.85 },
    Tuning { delay_time: 1491.0 / 44100.0, panning_scale: 0.7 },
    Tuning { delay_time: 1422.0 / 44100.0, panning_scale: 0.55 },
    Tuning { delay_time: 1277.0 / 44100.0, panning_scale: 0.55 },
    Tuning { delay_time: 1356.0 / 44100.0, panning_scale: 0.7 },
    Tuning { delay_time: 1188.0 / 44100.0, panning_scale: 0.85 },
    Tuning { delay_time: 1116.0 / 44100.0, panning_scale: 1.0 },
];

type HighPassed = BiquadFilter<Feed, FixedHighPass>;
/// One damped, panned comb of the bank.
pub type Comb = HighShelfPannedDelay<Feed>;

/// Reverb over the blocks fed to it through [`Processor::feed`].
pub struct Reverb {
    state: ProducerState,

    /// Multiplier of every comb length.
    pub room_size: Shared<FloatParam>,
    /// Feedback of the combs; longer tails as it approaches one.
    pub room_reflectivity: Shared<FloatParam>,
    /// Corner frequency of the damping high-shelf filters.
    pub damping_frequency: Shared<FloatParam>,
    /// Gain of the damping filters in dB.
    pub damping_gain: Shared<FloatParam>,
    /// Stereo spread of the combs.
    pub width: Shared<FloatParam>,
    /// Cutoff of the input high-pass filter.
    pub high_pass_frequency: Shared<FloatParam>,
    /// Q of the input high-pass filter.
    pub high_pass_q: Shared<FloatParam>,
    /// Amount of soft clipping on the feedback paths.
    pub distortion_level: Shared<FloatParam>,
    /// Map frequency ratios exponentially.
    pub log_scale_frequencies: Shared<ToggleParam>,

    high_pass: HighPassed,
    combs: Mixer<Comb>,
    feedback: Vec<Distortion<Feed>>,
}

impl core::fmt::Debug for Reverb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reverb")
            .field("high_pass", &self.high_pass)
            .field("combs", &self.combs.len())
            .finish_non_exhaustive()
    }
}

impl Reverb {
    /// Reverb with `channels` channels; parameter names start with `name`.
    pub fn new(name: &str, channels: usize) -> Self {
        let log_scale_frequencies = shared(toggle(format!("{name}LOG"), OFF));
        let log_scale = frequency_log_scale();

        let room_size = shared(FloatParam::new(format!("{name}RSZ"), 0.0, ROOM_SIZE_MAX, 1.0));
        let room_reflectivity =
            shared(FloatParam::new(format!("{name}RS"), 0.0, FEEDBACK_MAX, 0.75));
        let damping_frequency = shared(
            FloatParam::new(format!("{name}DF"), FREQUENCY_MIN, FREQUENCY_MAX, FREQUENCY_MAX)
                .with_log_scale(Rc::clone(&log_scale), Rc::clone(&log_scale_frequencies)),
        );
        let damping_gain = shared(FloatParam::new(format!("{name}DG"), -36.0, -0.01, -6.0));
        let width = shared(FloatParam::new(format!("{name}WID"), -1.0, 1.0, 0.0));
        let high_pass_frequency = shared(
            FloatParam::new(format!("{name}HPF"), FREQUENCY_MIN, FREQUENCY_MAX, 20.0)
                .with_log_scale(log_scale, Rc::clone(&log_scale_frequencies)),
        );
        let high_pass_q = shared(FloatParam::new(format!("{name}HPQ"), Q_MIN, Q_MAX, Q_DEFAULT));
        let distortion_level = shared(FloatParam::new(format!("{name}DST"), 0.0, 1.0, 0.0));

        let mut high_pass: HighPassed = BiquadFilter::fixed("", Feed::new(channels));
        high_pass.frequency = FloatParam::follower(&high_pass_frequency);
        high_pass.q = FloatParam::follower(&high_pass_q);

        let damping_buffers = shared(BiquadFilterSharedBuffers::new());
        let distortion_shape = shared(Shape::param(format!("{name}DSTTYP"), Shape::DelayFeedback));
        let mut combs = Mixer::new(channels);
        let mut feedback = Vec::with_capacity(COMB_FILTERS);

        for (i, tuning) in TUNINGS.iter().enumerate() {
            let mode = if i % 2 == 0 {
                PanningMode::Normal
            } else {
                PanningMode::Flipped
            };
            let mut delay = Delay::with_fixed_time(
                Feed::new(channels),
                &room_reflectivity,
                tuning.delay_time,
                COMB_TIME_MAX,
            );
            delay.set_time_scale_param(FloatParam::follower(&room_size));

            let mut comb = HighShelfPannedDelay::high_shelf(delay, mode, &width);
            comb.set_panning_scale(tuning.panning_scale);

            let filter = comb.high_shelf_filter_mut();
            filter.frequency = FloatParam::follower(&damping_frequency);
            filter.gain = FloatParam::follower(&damping_gain);
            filter.share_coefficients(Rc::clone(&damping_buffers));

            let mut clipper = Distortion::with_leaders(
                Feed::new(channels),
                Rc::clone(&distortion_shape),
                &distortion_level,
            );
            comb.delay_mut()
                .set_feedback_tap(clipper.state_mut().attach_tap());

            combs.add_weighted(comb, COMB_WEIGHT);
            feedback.push(clipper);
        }

        Self {
            state: ProducerState::new(channels),
            room_size,
            room_reflectivity,
            damping_frequency,
            damping_gain,
            width,
            high_pass_frequency,
            high_pass_q,
            distortion_level,
            log_scale_frequencies,
            high_pass,
            combs,
            feedback,
        }
    }

    /// The comb bank.
    pub fn combs(&self) -> &Mixer<Comb> {
        &self.combs
    }

    fn leaders(&self) -> [&Shared<FloatParam>; 8] {
        [
            &self.room_size,
            &self.room_reflectivity,
            &self.damping_frequency,
            &self.damping_gain,
            &self.width,
            &self.high_pass_frequency,
            &self.high_pass_q,
            &self.distortion_level,
        ]
    }
}

impl Processor for Reverb {
    fn feed(&mut self, round: Round, input: &Buffer, sample_count: usize) {
        self.high_pass.input_mut().feed(round, input, sample_count);
    }
}

impl SignalProducer for Reverb {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        for leader in self.leaders() {
            if let Ok(mut leader) = leader.try_borrow_mut() {
                visitor(&mut *leader);
            }
        }

        visitor(&mut self.high_pass);
        visitor(&mut self.combs);

        for clipper in &mut self.feedback {
            visitor(clipper);
        }
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        let high_passed = produce(&mut self.high_pass, round, sample_count);

        for comb in self.combs.inputs_mut() {
            comb.delay_mut()
                .input_mut()
                .feed(round, high_passed, sample_count);
        }

        produce(&mut self.combs, round, sample_count);

        for (comb, clipper) in self.combs.inputs().iter().zip(&mut self.feedback) {
            clipper
                .input_mut()
                .feed(round, comb.high_shelf_filter().state().buffer(), sample_count);
            produce(clipper, round, sample_count);
        }

        if self.combs.is_silent(round, sample_count) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        let output = self.combs.state().buffer();
        self.state.buffer_mut().copy_from(output, sample_count);

        Rendering::Ready
    }

    fn render(&mut self, _round: Round, _first: usize, _last: usize, _buffer: &mut Buffer) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunings_fit_the_largest_room() {
        for tuning in TUNINGS {
            assert!(tuning.delay_time * ROOM_SIZE_MAX < COMB_TIME_MAX);
            assert!((0.0..=1.0).contains(&tuning.panning_scale));
        }
    }

    #[test]
    fn comb_bank_is_built_from_the_tunings() {
        let reverb = Reverb::new("R", 2);

        assert_eq!(reverb.combs().len(), COMB_FILTERS);
        assert!(
            reverb
                .combs()
                .inputs()
                .iter()
                .all(|comb| comb.delay().time.max() == COMB_TIME_MAX)
        );
        assert!((0..COMB_FILTERS).all(|i| reverb.combs().weight(i) == COMB_WEIGHT));
    }

    #[test]
    fn parameters_are_prefixed() {
        let reverb = Reverb::new("FXR", 2);

        assert_eq!(reverb.room_size.borrow().name(), "FXRRSZ");
        assert_eq!(reverb.room_reflectivity.borrow().name(), "FXRRS");
        assert_eq!(reverb.damping_gain.borrow().name(), "FXRDG");
        assert_eq!(reverb.log_scale_frequencies.borrow().name(), "FXRLOG");
    }
}
