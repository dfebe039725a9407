//! Seven-voice chorus.
//!
//! Every voice is a panned delay reading one shared delay line, its delay
//! time swept by a centered sine LFO. The voices are mixed, damped by a
//! high-shelf filter, and the damped mix is fed back into the line through
//! a gain. An entry of [`TUNINGS`] decides how loud each voice is, how far
//! it is panned and where its LFO starts in its period.

use std::rc::Rc;

use vesta_core::biquad::{FREQUENCY_MAX, FREQUENCY_MIN};
use vesta_core::{
    BiquadFilter, BlockTap, Buffer, ByteParam, Delay, DelayBuffer, Feed, FixedHighPass,
    FixedHighShelf, FloatParam, Gain, Lfo, LogScale, Mixer, Number, OFF, PannedDelay, PanningMode,
    ProducerState, Rendering, Round, Seconds, Shared, SignalProducer, Silence, ToggleParam, produce,
    shared, toggle,
};

use crate::effect::Processor;

/// Number of voices.
pub const VOICES: usize = 7;
/// Longest center delay time in seconds.
pub const DELAY_TIME_MAX: Seconds = 0.1;
/// Default center delay time in seconds.
pub const DELAY_TIME_DEFAULT: Seconds = 0.025;
/// Highest feedback.
pub const FEEDBACK_MAX: Number = 0.999;

/// Level, stereo spread and LFO phase of one voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceTuning {
    /// Relative level; levels are normalized to sum up to one.
    pub weight: Number,
    /// Multiplier of the width parameter.
    pub panning: Number,
    /// LFO phase offset in periods.
    pub phase: Number,
}

const fn voice(weight: Number, panning: Number, phase: Number) -> VoiceTuning {
    VoiceTuning {
        weight,
        panning,
        phase,
    }
}

const MUTED: VoiceTuning = voice(0.0, 0.0, 0.0);

/// Per-voice settings of every tuning.
///
/// Odd voices are panned in the opposite direction, so voices `2k + 1` and
/// `2k + 2` with the same panning form mirrored pairs.
pub const TUNINGS: [[VoiceTuning; VOICES]; 15] = [
    // 7 voices, evenly spread phases
    [
        voice(1.0, 0.0, 0.0 / 7.0),
        voice(1.0, 1.0, 1.0 / 7.0),
        voice(1.0, 1.0, 2.0 / 7.0),
        voice(1.0, 0.67, 3.0 / 7.0),
        voice(1.0, 0.67, 4.0 / 7.0),
        voice(1.0, 0.33, 5.0 / 7.0),
        voice(1.0, 0.33, 6.0 / 7.0),
    ],
    // 7 voices, golden ratio phases, fading towards the center
    [
        voice(1.0, 0.0, 0.0),
        voice(0.9, 1.0, 0.618),
        voice(0.9, 1.0, 0.236),
        voice(0.8, 0.6, 0.854),
        voice(0.8, 0.6, 0.472),
        voice(0.7, 0.3, 0.090),
        voice(0.7, 0.3, 0.708),
    ],
    // 7 voices, wide
    [
        voice(1.0, 0.2, 0.0),
        voice(1.0, 1.0, 0.5),
        voice(1.0, 1.0, 0.0),
        voice(1.0, 0.9, 0.25),
        voice(1.0, 0.9, 0.75),
        voice(1.0, 0.8, 0.125),
        voice(1.0, 0.8, 0.625),
    ],
    // 7 voices, narrow
    [
        voice(1.0, 0.0, 0.0 / 7.0),
        voice(1.0, 0.4, 1.0 / 7.0),
        voice(1.0, 0.4, 2.0 / 7.0),
        voice(1.0, 0.3, 3.0 / 7.0),
        voice(1.0, 0.3, 4.0 / 7.0),
        voice(1.0, 0.2, 5.0 / 7.0),
        voice(1.0, 0.2, 6.0 / 7.0),
    ],
    // 7 voices, clustered phases
    [
        voice(1.0, 0.0, 0.0),
        voice(0.8, 0.8, 0.05),
        voice(0.8, 0.8, 0.1),
        voice(0.6, 0.5, 0.15),
        voice(0.6, 0.5, 0.2),
        voice(0.4, 0.2, 0.25),
        voice(0.4, 0.2, 0.3),
    ],
    // 6 voices, evenly spread phases
    [
        MUTED,
        voice(1.0, 1.0, 0.0 / 6.0),
        voice(1.0, 1.0, 1.0 / 6.0),
        voice(1.0, 0.6, 2.0 / 6.0),
        voice(1.0, 0.6, 3.0 / 6.0),
        voice(1.0, 0.3, 4.0 / 6.0),
        voice(1.0, 0.3, 5.0 / 6.0),
    ],
    // 6 voices, opposing pairs
    [
        MUTED,
        voice(1.0, 1.0, 0.0),
        voice(1.0, 1.0, 0.5),
        voice(0.8, 0.7, 1.0 / 3.0),
        voice(0.8, 0.7, 5.0 / 6.0),
        voice(0.6, 0.4, 2.0 / 3.0),
        voice(0.6, 0.4, 1.0 / 6.0),
    ],
    // 5 voices, evenly spread phases
    [
        voice(1.0, 0.0, 0.0 / 5.0),
        voice(1.0, 1.0, 1.0 / 5.0),
        voice(1.0, 1.0, 2.0 / 5.0),
        voice(1.0, 0.5, 3.0 / 5.0),
        voice(1.0, 0.5, 4.0 / 5.0),
        MUTED,
        MUTED,
    ],
    // 5 voices, wide
    [
        voice(1.0, 0.3, 0.0),
        voice(1.0, 1.0, 0.3),
        voice(1.0, 1.0, 0.7),
        voice(0.9, 0.8, 0.15),
        voice(0.9, 0.8, 0.55),
        MUTED,
        MUTED,
    ],
    // 4 voices, quadrature phases
    [
        MUTED,
        voice(1.0, 1.0, 0.0),
        voice(1.0, 1.0, 0.25),
        voice(1.0, 0.5, 0.5),
        voice(1.0, 0.5, 0.75),
        MUTED,
        MUTED,
    ],
    // 4 voices, narrow
    [
        MUTED,
        voice(1.0, 0.5, 0.0),
        voice(1.0, 0.5, 0.5),
        voice(1.0, 0.25, 0.25),
        voice(1.0, 0.25, 0.75),
        MUTED,
        MUTED,
    ],
    // 3 voices, evenly spread phases
    [
        voice(1.0, 0.0, 0.0 / 3.0),
        voice(1.0, 1.0, 1.0 / 3.0),
        voice(1.0, 1.0, 2.0 / 3.0),
        MUTED,
        MUTED,
        MUTED,
        MUTED,
    ],
    // 3 voices, wide
    [
        voice(1.0, 0.5, 0.0),
        voice(1.0, 1.0, 0.5),
        voice(1.0, 1.0, 0.25),
        MUTED,
        MUTED,
        MUTED,
        MUTED,
    ],
    // 2 voices, opposite phases
    [
        MUTED,
        voice(1.0, 1.0, 0.0),
        voice(1.0, 1.0, 0.5),
        MUTED,
        MUTED,
        MUTED,
        MUTED,
    ],
    // 1 voice
    [
        voice(1.0, 0.0, 0.0),
        MUTED,
        MUTED,
        MUTED,
        MUTED,
        MUTED,
        MUTED,
    ],
];

/// Highest tuning index.
pub const TUNING_MAX: u8 = TUNINGS.len() as u8 - 1;

type Voice = PannedDelay<Silence>;
type HighPassed = BiquadFilter<Feed, FixedHighPass>;
type Damped = BiquadFilter<Mixer<Voice>, FixedHighShelf>;

/// Log scale shared by the frequency parameters of the effects.
pub(crate) fn frequency_log_scale() -> Rc<LogScale> {
    Rc::new(LogScale::new(FREQUENCY_MIN, FREQUENCY_MAX, 0.0))
}

/// Chorus over the blocks fed to it through [`Processor::feed`].
///
/// The public parameters are leaders shared with the inner nodes; the
/// chorus configures them along with itself.
pub struct Chorus {
    state: ProducerState,

    /// Center delay time of the voices in seconds, or beats with tempo sync.
    pub delay_time: Shared<FloatParam>,
    /// LFO frequency in Hz, or cycles per beat with tempo sync.
    pub frequency: Shared<FloatParam>,
    /// Depth of the delay time sweep relative to the center delay time.
    pub depth: Shared<FloatParam>,
    /// Level of the damped mix fed back into the line.
    pub feedback: Shared<FloatParam>,
    /// Corner frequency of the damping high-shelf filter.
    pub damping_frequency: Shared<FloatParam>,
    /// Gain of the damping filter in dB.
    pub damping_gain: Shared<FloatParam>,
    /// Stereo width; negative values swap the sides.
    pub width: Shared<FloatParam>,
    /// Cutoff of the input high-pass filter.
    pub high_pass_frequency: Shared<FloatParam>,
    /// Interpret times and frequencies in beats.
    pub tempo_sync: Shared<ToggleParam>,
    /// Map frequency ratios exponentially.
    pub log_scale_frequencies: Shared<ToggleParam>,
    /// Index into [`TUNINGS`].
    pub tuning: Shared<ByteParam>,

    lfos: Vec<Shared<Lfo>>,
    high_pass: HighPassed,
    delay_buffer: Shared<DelayBuffer>,
    feedback_gain: Gain<Damped>,
    feedback_tap: Shared<BlockTap>,
    tuning_change_index: Option<u32>,
}

impl core::fmt::Debug for Chorus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Chorus")
            .field("tuning", &self.tuning.try_borrow().map(|tuning| tuning.value()).ok())
            .field("lfos", &self.lfos.len())
            .finish_non_exhaustive()
    }
}

impl Chorus {
    /// Chorus with `channels` channels; parameter names start with `name`.
    pub fn new(name: &str, channels: usize) -> Self {
        let log_scale_frequencies = shared(toggle(format!("{name}LOG"), OFF));
        let log_scale = frequency_log_scale();

        let delay_time = shared(FloatParam::new(
            format!("{name}DEL"),
            0.0,
            DELAY_TIME_MAX,
            DELAY_TIME_DEFAULT,
        ));
        let frequency = shared(FloatParam::new(format!("{name}FRQ"), 0.001, 20.0, 0.15));
        let depth = shared(FloatParam::new(format!("{name}DPT"), 0.0, 0.5, 0.075));
        let feedback = shared(FloatParam::new(format!("{name}FB"), 0.0, FEEDBACK_MAX, 0.0));
        let damping_frequency = shared(
            FloatParam::new(format!("{name}DF"), FREQUENCY_MIN, FREQUENCY_MAX, FREQUENCY_MAX)
                .with_log_scale(Rc::clone(&log_scale), Rc::clone(&log_scale_frequencies)),
        );
        let damping_gain = shared(FloatParam::new(format!("{name}DG"), -36.0, -0.01, -6.0));
        let width = shared(FloatParam::new(format!("{name}WID"), -1.0, 1.0, 0.6));
        let high_pass_frequency = shared(
            FloatParam::new(format!("{name}HPF"), FREQUENCY_MIN, FREQUENCY_MAX, 20.0)
                .with_log_scale(log_scale, Rc::clone(&log_scale_frequencies)),
        );
        let tempo_sync = shared(toggle(format!("{name}SYN"), OFF));
        let tuning = shared(ByteParam::new(format!("{name}TUN"), 0, TUNING_MAX, 0));

        let mut high_pass: HighPassed = BiquadFilter::fixed("", Feed::new(channels));
        high_pass.frequency = FloatParam::follower(&high_pass_frequency);

        let delay_buffer = shared(DelayBuffer::new(channels));
        let mut mixer = Mixer::new(channels);
        let mut lfos = Vec::with_capacity(VOICES);

        for (index, tuning) in TUNINGS[0].iter().enumerate() {
            let lfo = shared(Lfo::with_leaders(
                &format!("{name}L{}", index + 1),
                &frequency,
                &delay_time,
                &depth,
                Rc::clone(&tempo_sync),
                tuning.phase,
            ));
            lfo.borrow_mut().start(0.0);

            // The LFO swings around half of the center delay time, so the
            // voice range is twice as wide as the one of the leader.
            let mut time = FloatParam::new(
                format!("{name}DEL{}", index + 1),
                0.0,
                2.0,
                2.0 * DELAY_TIME_DEFAULT,
            );
            time.set_lfo(Some(Rc::clone(&lfo)));

            let mut delay = Delay::new(Silence::new(channels)).with_tempo_sync(Rc::clone(&tempo_sync));
            delay.time = time;
            delay.gain.set_value(1.0);
            delay.use_shared_delay_buffer(Rc::clone(&delay_buffer));

            let mode = if index % 2 == 1 {
                PanningMode::Flipped
            } else {
                PanningMode::Normal
            };

            mixer.add(PannedDelay::with_panning_leader(delay, mode, &width));
            lfos.push(lfo);
        }

        let mut damping: Damped = BiquadFilter::fixed("", mixer);
        damping.frequency = FloatParam::follower(&damping_frequency);
        damping.gain = FloatParam::follower(&damping_gain);

        let mut feedback_gain = Gain::with_leader(damping, &feedback);
        let feedback_tap = feedback_gain.state_mut().attach_tap();

        let mut chorus = Self {
            state: ProducerState::new(channels),
            delay_time,
            frequency,
            depth,
            feedback,
            damping_frequency,
            damping_gain,
            width,
            high_pass_frequency,
            tempo_sync,
            log_scale_frequencies,
            tuning,
            lfos,
            high_pass,
            delay_buffer,
            feedback_gain,
            feedback_tap,
            tuning_change_index: None,
        };

        chorus.resize_delay_buffer();
        chorus
    }

    /// The tuning in effect.
    pub fn current_tuning(&self) -> &'static [VoiceTuning; VOICES] {
        let index = self.tuning.try_borrow().map_or(0, |tuning| tuning.value());

        &TUNINGS[usize::from(index.min(TUNING_MAX))]
    }

    fn resize_delay_buffer(&mut self) {
        if let Ok(mut delay_buffer) = self.delay_buffer.try_borrow_mut() {
            delay_buffer.resize(
                self.state.block_size(),
                self.state.sample_rate(),
                2.0 * DELAY_TIME_MAX,
            );
        }
    }

    fn apply_tuning(&mut self) {
        let Some(change_index) = self.tuning.try_borrow().ok().map(|tuning| tuning.change_index()) else {
            return;
        };

        if self.tuning_change_index == Some(change_index) {
            return;
        }

        self.tuning_change_index = Some(change_index);

        let tuning = self.current_tuning();
        let total_weight: Number = tuning.iter().map(|voice| voice.weight).sum();
        let mixer = self.feedback_gain.input_mut().input_mut();

        for (index, (voice, lfo)) in tuning.iter().zip(&self.lfos).enumerate() {
            mixer.set_weight(index, voice.weight / total_weight);
            mixer.input_mut(index).set_panning_scale(voice.panning);

            if let Ok(mut lfo) = lfo.try_borrow_mut() {
                lfo.phase_mut().set_value(voice.phase);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            change_index,
            voices = tuning.iter().filter(|voice| voice.weight > 0.0).count(),
            "chorus tuning applied"
        );
    }

    fn leaders(&self) -> [&Shared<FloatParam>; 8] {
        [
            &self.delay_time,
            &self.frequency,
            &self.depth,
            &self.feedback,
            &self.damping_frequency,
            &self.damping_gain,
            &self.width,
            &self.high_pass_frequency,
        ]
    }
}

impl Processor for Chorus {
    fn feed(&mut self, round: Round, input: &Buffer, sample_count: usize) {
        self.high_pass.input_mut().feed(round, input, sample_count);
    }
}

impl SignalProducer for Chorus {
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

        for lfo in &self.lfos {
            if let Ok(mut lfo) = lfo.try_borrow_mut() {
                visitor(&mut *lfo);
            }
        }

        visitor(&mut self.high_pass);
        visitor(&mut self.feedback_gain);
    }

    fn block_size_changed(&mut self) {
        self.resize_delay_buffer();
    }

    fn sample_rate_changed(&mut self) {
        self.resize_delay_buffer();
    }

    fn reset_state(&mut self) {
        if let Ok(mut delay_buffer) = self.delay_buffer.try_borrow_mut() {
            delay_buffer.reset();
        }

        for lfo in &self.lfos {
            if let Ok(mut lfo) = lfo.try_borrow_mut() {
                lfo.start(0.0);
            }
        }
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        self.apply_tuning();

        produce(&mut self.high_pass, round, sample_count);
        let input_is_silent = self.high_pass.is_silent(round, sample_count);

        if let Ok(mut delay_buffer) = self.delay_buffer.try_borrow_mut() {
            delay_buffer.write(
                round,
                self.high_pass.state().buffer(),
                input_is_silent,
                Some(&self.feedback_tap),
                sample_count,
            );
        }

        produce(&mut self.feedback_gain, round, sample_count);

        if self.feedback_gain.input_mut().is_silent(round, sample_count) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        let chorused = self.feedback_gain.input().state().buffer();
        self.state.buffer_mut().copy_from(chorused, sample_count);

        Rendering::Ready
    }

    fn render(&mut self, _round: Round, _first: usize, _last: usize, _buffer: &mut Buffer) {}
}
