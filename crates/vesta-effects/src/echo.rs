//! Stereo feedback echo.
//!
//! Two damped, panned delays in series: the second one delays the damped
//! output of the first with the opposite stereo orientation, and its damped
//! output is fed back into the first one through a soft clipper. The echo
//! outputs the sum of both, so repeats alternate between the sides while
//! `width` is non-zero.

use std::rc::Rc;

use vesta_core::biquad::{FREQUENCY_MAX, FREQUENCY_MIN, Q_DEFAULT, Q_MAX, Q_MIN};
use vesta_core::delay::{TIME_DEFAULT, TIME_MAX, TIME_MIN};
use vesta_core::{
    BiquadFilter, Buffer, Delay, Feed, FixedHighPass, FloatParam, Gain, HighShelfPannedDelay, OFF,
    PanningMode, ProducerState, Rendering, Round, Shared, SignalProducer, ToggleParam, produce,
    shared, toggle,
};

use crate::chorus::frequency_log_scale;
use crate::distortion::{Distortion, Shape};
use crate::effect::Processor;

/// Highest feedback.
pub const FEEDBACK_MAX: f64 = 0.999;

type HighPassed = BiquadFilter<Gain<Feed>, FixedHighPass>;

/// Echo over the blocks fed to it through [`Processor::feed`].
pub struct Echo {
    state: ProducerState,

    /// Time between repeats in seconds, or beats with tempo sync.
    pub delay_time: Shared<FloatParam>,
    /// Level of the input before it enters the delay line.
    pub input_volume: Shared<FloatParam>,
    /// Level of each repeat relative to the previous one.
    pub feedback: Shared<FloatParam>,
    /// Corner frequency of the damping high-shelf filters.
    pub damping_frequency: Shared<FloatParam>,
    /// Gain of the damping filters in dB.
    pub damping_gain: Shared<FloatParam>,
    /// Stereo spread of the repeats.
    pub width: Shared<FloatParam>,
    /// Cutoff of the input high-pass filter.
    pub high_pass_frequency: Shared<FloatParam>,
    /// Q of the input high-pass filter.
    pub high_pass_q: Shared<FloatParam>,
    /// Amount of soft clipping on the feedback path.
    pub distortion_level: Shared<FloatParam>,
    /// Interpret the delay time in beats.
    pub tempo_sync: Shared<ToggleParam>,
    /// Map frequency ratios exponentially.
    pub log_scale_frequencies: Shared<ToggleParam>,
    /// Play the repeats of the first delay backwards.
    pub reversed_1: Shared<ToggleParam>,
    /// Play the repeats of the second delay backwards.
    pub reversed_2: Shared<ToggleParam>,

    comb_1: HighShelfPannedDelay<HighPassed>,
    comb_2: HighShelfPannedDelay<Feed>,
    feedback_distortion: Distortion<Feed>,
}

impl core::fmt::Debug for Echo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Echo")
            .field("comb_1", &self.comb_1)
            .field("comb_2", &self.comb_2)
            .finish_non_exhaustive()
    }
}

fn damp<I: SignalProducer>(
    comb: &mut HighShelfPannedDelay<I>,
    frequency: &Shared<FloatParam>,
    gain: &Shared<FloatParam>,
) {
    let filter = comb.high_shelf_filter_mut();
    filter.frequency = FloatParam::follower(frequency);
    filter.gain = FloatParam::follower(gain);
}

impl Echo {
    /// Echo with `channels` channels; parameter names start with `name`.
    pub fn new(name: &str, channels: usize) -> Self {
        let log_scale_frequencies = shared(toggle(format!("{name}LOG"), OFF));
        let log_scale = frequency_log_scale();

        let delay_time = shared(FloatParam::new(
            format!("{name}DEL"),
            TIME_MIN,
            TIME_MAX,
            TIME_DEFAULT,
        ));
        let input_volume = shared(FloatParam::new(format!("{name}IN"), 0.0, 2.0, 1.0));
        let feedback = shared(FloatParam::new(format!("{name}FB"), 0.0, FEEDBACK_MAX, 0.75));
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
        let tempo_sync = shared(toggle(format!("{name}SYN"), OFF));
        let reversed_1 = shared(toggle(format!("{name}RV1"), OFF));
        let reversed_2 = shared(toggle(format!("{name}RV2"), OFF));

        let mut high_pass: HighPassed =
            BiquadFilter::fixed("", Gain::with_leader(Feed::new(channels), &input_volume));
        high_pass.frequency = FloatParam::follower(&high_pass_frequency);
        high_pass.q = FloatParam::follower(&high_pass_q);

        let delay_1 = Delay::with_leaders(high_pass, &feedback, &delay_time)
            .with_tempo_sync(Rc::clone(&tempo_sync))
            .with_reverse(Rc::clone(&reversed_1));
        let delay_2 = Delay::with_leaders(Feed::new(channels), &feedback, &delay_time)
            .with_tempo_sync(Rc::clone(&tempo_sync))
            .with_reverse(Rc::clone(&reversed_2));

        let mut comb_1 = HighShelfPannedDelay::high_shelf(delay_1, PanningMode::Normal, &width);
        let mut comb_2 = HighShelfPannedDelay::high_shelf(delay_2, PanningMode::Flipped, &width);

        damp(&mut comb_1, &damping_frequency, &damping_gain);
        damp(&mut comb_2, &damping_frequency, &damping_gain);

        let mut feedback_distortion = Distortion::with_leaders(
            Feed::new(channels),
            shared(Shape::param(format!("{name}DSTTYP"), Shape::DelayFeedback)),
            &distortion_level,
        );
        comb_1
            .delay_mut()
            .set_feedback_tap(feedback_distortion.state_mut().attach_tap());

        Self {
            state: ProducerState::new(channels),
            delay_time,
            input_volume,
            feedback,
            damping_frequency,
            damping_gain,
            width,
            high_pass_frequency,
            high_pass_q,
            distortion_level,
            tempo_sync,
            log_scale_frequencies,
            reversed_1,
            reversed_2,
            comb_1,
            comb_2,
            feedback_distortion,
        }
    }

    fn leaders(&self) -> [&Shared<FloatParam>; 9] {
        [
            &self.delay_time,
            &self.input_volume,
            &self.feedback,
            &self.damping_frequency,
            &self.damping_gain,
            &self.width,
            &self.high_pass_frequency,
            &self.high_pass_q,
            &self.distortion_level,
        ]
    }
}

impl Processor for Echo {
    fn feed(&mut self, round: Round, input: &Buffer, sample_count: usize) {
        self.comb_1
            .delay_mut()
            .input_mut()
            .input_mut()
            .input_mut()
            .feed(round, input, sample_count);
    }
}

impl SignalProducer for Echo {
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

        visitor(&mut self.comb_1);
        visitor(&mut self.comb_2);
        visitor(&mut self.feedback_distortion);
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.comb_1, round, sample_count);

        let first_repeats = self.comb_1.high_shelf_filter().state().buffer();
        self.comb_2
            .delay_mut()
            .input_mut()
            .feed(round, first_repeats, sample_count);
        produce(&mut self.comb_2, round, sample_count);

        let second_repeats = self.comb_2.high_shelf_filter().state().buffer();
        self.feedback_distortion
            .input_mut()
            .feed(round, second_repeats, sample_count);
        produce(&mut self.feedback_distortion, round, sample_count);

        if self.comb_1.is_silent(round, sample_count) && self.comb_2.is_silent(round, sample_count) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let comb_1 = self.comb_1.state().buffer();
        let comb_2 = self.comb_2.state().buffer();

        for (c, output) in buffer.channels_mut().iter_mut().enumerate() {
            let (comb_1, comb_2) = (comb_1.channel(c), comb_2.channel(c));

            for i in first..last {
                output[i] = comb_1[i] + comb_2[i];
            }
        }
    }
}
