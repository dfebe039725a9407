//! Delay lines.
//!
//! A [`Delay`] writes its input into a circular [`DelayBuffer`] and reads it
//! back `time` seconds later. The buffer is held through a [`Shared`] handle
//! so that several delays can read one line (chorus voices): only the owner
//! writes, every other delay reading it only reads.
//!
//! Feedback is a back edge of the graph. The delay never pulls its feedback
//! source; it reads the source's previous block from a [`BlockTap`] and mixes
//! it in at the current write position, so the feedback path adds exactly one
//! block of latency.
//!
//! [`PannedDelay`] adds a stereo panner after the delay, optionally with a
//! high-shelf damping filter in between ([`HighShelfPannedDelay`]).

use core::f64::consts::{FRAC_PI_2, PI};
use core::marker::PhantomData;
use std::rc::Rc;

use crate::biquad::{BiquadFilter, FixedHighShelf};
use crate::math;
use crate::param::{FloatParam, ToggleParam, constant_or_rendered, is_on};
use crate::producer::{
    BlockTap, Buffer, ProducerState, Rendering, Round, Shared, SignalProducer, Silence, produce,
    rendered, shared,
};
use crate::{Frequency, Number, Sample, Seconds};

/// Lowest delay gain.
pub const GAIN_MIN: Number = 0.0;
/// Highest delay gain.
pub const GAIN_MAX: Number = 1.0;
/// Default delay gain.
pub const GAIN_DEFAULT: Number = 0.5;

/// Shortest delay time.
pub const TIME_MIN: Seconds = 0.0;
/// Longest delay time.
pub const TIME_MAX: Seconds = 3.0;
/// Default delay time.
pub const TIME_DEFAULT: Seconds = 0.5;

/// Room for tempo-synced times: a beat may last up to this many seconds per
/// unit of `time`.
const OVERSIZE: usize = 2;

const ONE_MINUTE: Seconds = 60.0;

/// Tempo floor of tempo-synced delays.
pub const BPM_MIN: Number = ONE_MINUTE / OVERSIZE as Number;

const TIME_MAX_EPSILON: Seconds = 0.000001;

/// Circular multi-channel sample store of one delay line, plus the write
/// positions and silence bookkeeping of its single writer.
#[derive(Debug)]
pub struct DelayBuffer {
    channels: Vec<Vec<Sample>>,
    block_size: usize,
    write_index_input: usize,
    write_index_feedback: usize,
    clear_index: usize,
    block_start: usize,
    silent_input_samples: usize,
    silent_feedback_samples: usize,
    is_starting: bool,
    round: Option<Round>,
}

impl DelayBuffer {
    /// Empty line with `channels` channels; sized by [`resize`](Self::resize).
    pub fn new(channels: usize) -> Self {
        Self {
            channels: vec![Vec::new(); channels],
            block_size: 0,
            write_index_input: 0,
            write_index_feedback: 0,
            clear_index: 0,
            block_start: 0,
            silent_input_samples: 0,
            silent_feedback_samples: 0,
            is_starting: true,
            round: None,
        }
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Whether nothing was allocated yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channels.
    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples of `channel`.
    pub fn channel(&self, channel: usize) -> &[Sample] {
        &self.channels[channel]
    }

    /// Position where the block of the current round was written.
    pub fn block_start(&self) -> usize {
        self.block_start
    }

    /// Size the line for delays up to `time_max` seconds plus tempo-sync
    /// headroom. Reallocates and clears only when the size changes.
    pub fn resize(&mut self, block_size: usize, sample_rate: Frequency, time_max: Seconds) {
        let max_delay = libm::ceil((time_max + TIME_MAX_EPSILON) * sample_rate) as usize;
        let size = block_size * 2 + max_delay.max(block_size) * OVERSIZE;

        self.block_size = block_size;

        if size == self.len() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(size, channels = self.channels.len(), "delay buffer reallocated");

        for channel in &mut self.channels {
            *channel = vec![0.0; size];
        }

        self.reset();
    }

    /// Clear the line and rewind every position.
    pub fn reset(&mut self) {
        let size = self.len();

        for channel in &mut self.channels {
            channel.fill(0.0);
        }

        self.write_index_input = 0;
        self.write_index_feedback = 0;
        self.clear_index = self.block_size % size.max(1);
        self.block_start = 0;
        self.silent_input_samples = size;
        self.silent_feedback_samples = size;
        self.is_starting = true;
        self.round = None;
    }

    /// Whether the whole line holds silence.
    pub fn is_silent(&self) -> bool {
        let size = self.len();

        self.silent_input_samples >= size && self.silent_feedback_samples >= size
    }

    /// Write the block of `round`: clear one block ahead, add the previous
    /// block of `feedback`, then add `input`. Only the first call of a round
    /// writes.
    pub fn write(
        &mut self,
        round: Round,
        input: &Buffer,
        input_is_silent: bool,
        feedback: Option<&Shared<BlockTap>>,
        sample_count: usize,
    ) {
        if self.round == Some(round) || self.is_empty() {
            return;
        }

        self.round = Some(round);
        self.block_start = self.write_index_input;
        self.clear_index = self.clear(self.clear_index, sample_count);

        if let Some(feedback) = feedback {
            self.mix_feedback(feedback, sample_count);
        }

        if input_is_silent {
            self.write_index_input = self.advance(self.write_index_input, sample_count);
            self.silent_input_samples = (self.silent_input_samples + sample_count).min(self.len());
        } else {
            self.silent_input_samples = 0;
            self.write_index_input = self.add(input, self.write_index_input, sample_count);
        }
    }

    fn mix_feedback(&mut self, feedback: &Shared<BlockTap>, sample_count: usize) {
        if self.is_starting {
            self.is_starting = false;
            self.skip_feedback(sample_count);
            return;
        }

        let Ok(tap) = feedback.try_borrow() else {
            self.skip_feedback(sample_count);
            return;
        };
        let (block, feedback_sample_count) = tap.block();

        if feedback_sample_count == 0 || block.is_silent(feedback_sample_count) {
            self.skip_feedback(feedback_sample_count);
            return;
        }

        self.silent_feedback_samples = 0;
        self.write_index_feedback = self.add(block, self.write_index_feedback, feedback_sample_count);
    }

    fn skip_feedback(&mut self, sample_count: usize) {
        self.write_index_feedback = self.advance(self.write_index_feedback, sample_count);
        self.silent_feedback_samples = (self.silent_feedback_samples + sample_count).min(self.len());
    }

    fn advance(&self, index: usize, increment: usize) -> usize {
        (index + increment) % self.len()
    }

    fn clear(&mut self, start: usize, sample_count: usize) -> usize {
        let size = self.len();

        for channel in &mut self.channels {
            let mut index = start;

            for _ in 0..sample_count {
                channel[index] = 0.0;
                index += 1;

                if index == size {
                    index = 0;
                }
            }
        }

        self.advance(start, sample_count)
    }

    fn add(&mut self, source: &Buffer, start: usize, sample_count: usize) -> usize {
        let size = self.len();

        for (c, channel) in self.channels.iter_mut().enumerate().take(source.channels()) {
            let mut index = start;

            for sample in &source.channel(c)[..sample_count] {
                channel[index] += sample;
                index += 1;

                if index == size {
                    index = 0;
                }
            }
        }

        self.advance(start, sample_count)
    }
}

/// Read head of reverse playback: each segment plays the `length` samples
/// preceding its start backwards under a half-sine window.
#[derive(Debug, Clone, Copy, Default)]
struct ReverseHead {
    start: usize,
    position: usize,
    length: usize,
}

/// Circular-buffer delay line over an input producer.
///
/// A delay sharing another delay's buffer ignores its own input; such delays
/// are built over [`Silence`].
pub struct Delay<I: SignalProducer = Silence> {
    state: ProducerState,
    input: I,

    /// Output level.
    pub gain: FloatParam,
    /// Delay time in seconds, or in beats while tempo sync is on.
    pub time: FloatParam,

    time_scale: Option<FloatParam>,
    tempo_sync: Option<Shared<ToggleParam>>,
    reverse: Option<Shared<ToggleParam>>,
    delay_buffer: Shared<DelayBuffer>,
    owns_buffer: bool,
    feedback: Option<Shared<BlockTap>>,
    is_gain_constant_1: bool,

    gain_value: Option<Number>,
    time_value: Option<Number>,
    time_values: Vec<Number>,
    read_index: usize,
    is_reversed: bool,
    reverse_head: ReverseHead,
    need_to_render_silence: bool,
}

impl<I: SignalProducer> core::fmt::Debug for Delay<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delay")
            .field("gain", &self.gain.value())
            .field("time", &self.time.value())
            .field("owns_buffer", &self.owns_buffer)
            .field("has_feedback", &self.feedback.is_some())
            .finish_non_exhaustive()
    }
}

impl<I: SignalProducer> Delay<I> {
    /// Delay with private gain and time parameters.
    pub fn new(input: I) -> Self {
        Self::with_params(
            input,
            FloatParam::new("", GAIN_MIN, GAIN_MAX, GAIN_DEFAULT),
            FloatParam::new("", TIME_MIN, TIME_MAX, TIME_DEFAULT),
            false,
        )
    }

    /// Unity gain delay whose time follows `time_leader`.
    pub fn with_time_leader(input: I, time_leader: &Shared<FloatParam>) -> Self {
        Self::with_params(
            input,
            FloatParam::new("", 0.0, 1.0, 1.0),
            FloatParam::follower(time_leader),
            true,
        )
    }

    /// Delay whose gain and time follow leaders.
    pub fn with_leaders(
        input: I,
        gain_leader: &Shared<FloatParam>,
        time_leader: &Shared<FloatParam>,
    ) -> Self {
        Self::with_params(
            input,
            FloatParam::follower(gain_leader),
            FloatParam::follower(time_leader),
            false,
        )
    }

    /// Delay with a gain leader and a fixed time of at most `time_max`.
    pub fn with_fixed_time(
        input: I,
        gain_leader: &Shared<FloatParam>,
        time: Seconds,
        time_max: Seconds,
    ) -> Self {
        Self::with_params(
            input,
            FloatParam::follower(gain_leader),
            FloatParam::new("", TIME_MIN, time_max, time),
            false,
        )
    }

    fn with_params(input: I, gain: FloatParam, time: FloatParam, is_gain_constant_1: bool) -> Self {
        let channels = input.state().channels();
        let mut delay = Self {
            state: ProducerState::new(channels),
            input,
            gain,
            time,
            time_scale: None,
            tempo_sync: None,
            reverse: None,
            delay_buffer: shared(DelayBuffer::new(channels)),
            owns_buffer: true,
            feedback: None,
            is_gain_constant_1,
            gain_value: None,
            time_value: None,
            time_values: Vec::new(),
            read_index: 0,
            is_reversed: false,
            reverse_head: ReverseHead::default(),
            need_to_render_silence: false,
        };

        delay.block_size_changed();
        delay
    }

    /// Interpret `time` in beats while `tempo_sync` is on.
    pub fn with_tempo_sync(mut self, tempo_sync: Shared<ToggleParam>) -> Self {
        self.tempo_sync = Some(tempo_sync);
        self
    }

    /// Play segments backwards while `reverse` is on.
    pub fn with_reverse(mut self, reverse: Shared<ToggleParam>) -> Self {
        self.reverse = Some(reverse);
        self
    }

    /// Multiply the delay time by `scale` per sample.
    pub fn set_time_scale_param(&mut self, mut scale: FloatParam) {
        scale.set_sample_rate(self.state.sample_rate());
        scale.set_block_size(self.state.block_size());
        self.time_scale = Some(scale);
    }

    /// Mix the previous block captured by `tap` into the line. The tapped
    /// producer must have as many channels as the delay and must be rendered
    /// after it in every round.
    pub fn set_feedback_tap(&mut self, tap: Shared<BlockTap>) {
        self.feedback = Some(tap);
    }

    /// Read the line of another delay instead of writing an own one.
    pub fn use_shared_delay_buffer(&mut self, delay_buffer: Shared<DelayBuffer>) {
        self.delay_buffer = delay_buffer;
        self.owns_buffer = false;
    }

    /// The line this delay reads.
    pub fn delay_buffer(&self) -> &Shared<DelayBuffer> {
        &self.delay_buffer
    }

    /// The delayed producer.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The delayed producer, mutably.
    pub fn input_mut(&mut self) -> &mut I {
        &mut self.input
    }

    fn resize_delay_buffer(&mut self) {
        if !self.owns_buffer {
            return;
        }

        if let Ok(mut delay_buffer) = self.delay_buffer.try_borrow_mut() {
            delay_buffer.resize(
                self.state.block_size(),
                self.state.sample_rate(),
                self.time.max(),
            );
        }
    }

    fn update_gain(&mut self, round: Round, sample_count: usize) {
        self.gain_value = if self.is_gain_constant_1 {
            Some(1.0)
        } else {
            constant_or_rendered(&mut self.gain, round, sample_count)
        };
    }

    fn update_time(&mut self, round: Round, sample_count: usize) {
        let samples_per_unit = if self.tempo_sync.as_ref().is_some_and(|toggle| {
            toggle.try_borrow().is_ok_and(|toggle| is_on(&toggle))
        }) {
            ONE_MINUTE / self.state.bpm().max(BPM_MIN) * self.state.sample_rate()
        } else {
            self.state.sample_rate()
        };

        let time = constant_or_rendered(&mut self.time, round, sample_count);
        let scale = match &mut self.time_scale {
            Some(scale) => constant_or_rendered(scale, round, sample_count),
            None => Some(1.0),
        };

        if let (Some(time), Some(scale)) = (time, scale) {
            self.time_value = Some(time * scale * samples_per_unit);
            return;
        }

        self.time_value = None;

        let times = rendered(&self.time);
        let scales = self.time_scale.as_ref().map_or(&[][..], |scale| rendered(scale));

        for (i, value) in self.time_values[..sample_count].iter_mut().enumerate() {
            let time = time.unwrap_or_else(|| times[i]);
            let scale = scale.unwrap_or_else(|| scales[i]);
            *value = time * scale * samples_per_unit;
        }
    }

    fn update_reverse(&mut self) {
        let is_reversed = self
            .reverse
            .as_ref()
            .is_some_and(|toggle| toggle.try_borrow().is_ok_and(|toggle| is_on(&toggle)));

        if is_reversed && !self.is_reversed {
            self.reverse_head = ReverseHead::default();
        }

        self.is_reversed = is_reversed;
    }

    fn render_forward(&self, delay_buffer: &DelayBuffer, first: usize, last: usize, buffer: &mut Buffer) {
        let gains = rendered(&self.gain);

        for c in 0..delay_buffer.channels().min(buffer.channels()) {
            let line = delay_buffer.channel(c);
            let output = &mut buffer.channel_mut(c)[first..last];

            for (out, i) in output.iter_mut().zip(first..last) {
                let time = self.time_value.unwrap_or_else(|| self.time_values[i]);
                let gain = self.gain_value.unwrap_or_else(|| gains[i]);
                let position = (self.read_index + i) as Number - time;

                *out = gain * math::lookup_periodic(line, position);
            }
        }
    }

    fn render_reverse(&mut self, delay_buffer: &DelayBuffer, first: usize, last: usize, buffer: &mut Buffer) {
        let gains = rendered(&self.gain);
        let max_length = (delay_buffer.len().saturating_sub(self.state.block_size()) / 2).max(1);
        let mut head = self.reverse_head;

        for c in 0..delay_buffer.channels().min(buffer.channels()) {
            let line = delay_buffer.channel(c);
            let output = &mut buffer.channel_mut(c)[first..last];
            head = self.reverse_head;

            for (out, i) in output.iter_mut().zip(first..last) {
                if head.position >= head.length {
                    let time = self.time_value.unwrap_or_else(|| self.time_values[i]);

                    head = ReverseHead {
                        start: self.read_index + i,
                        position: 0,
                        length: (libm::round(time) as usize).clamp(1, max_length),
                    };
                }

                let gain = self.gain_value.unwrap_or_else(|| gains[i]);
                let envelope =
                    libm::sin(PI * (head.position as Number + 0.5) / head.length as Number);
                let position = head.start as Number - 1.0 - head.position as Number;

                *out = gain * envelope * math::lookup_periodic(line, position);
                head.position += 1;
            }
        }

        self.reverse_head = head;
    }
}

impl<I: SignalProducer> SignalProducer for Delay<I> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.input);
        visitor(&mut self.gain);
        visitor(&mut self.time);

        if let Some(scale) = &mut self.time_scale {
            visitor(scale);
        }
    }

    fn block_size_changed(&mut self) {
        self.time_values = vec![0.0; self.state.block_size()];
        self.resize_delay_buffer();
    }

    fn sample_rate_changed(&mut self) {
        self.resize_delay_buffer();
    }

    fn reset_state(&mut self) {
        if self.owns_buffer
            && let Ok(mut delay_buffer) = self.delay_buffer.try_borrow_mut()
        {
            delay_buffer.reset();
        }

        self.reverse_head = ReverseHead::default();
        self.need_to_render_silence = false;
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.input, round, sample_count);

        if self.owns_buffer {
            let input_is_silent = self.input.is_silent(round, sample_count);

            if let Ok(mut delay_buffer) = self.delay_buffer.try_borrow_mut() {
                delay_buffer.write(
                    round,
                    self.input.state().buffer(),
                    input_is_silent,
                    self.feedback.as_ref(),
                    sample_count,
                );
            }
        }

        let (read_index, is_line_silent) = self
            .delay_buffer
            .try_borrow()
            .map_or((0, true), |delay_buffer| {
                (delay_buffer.block_start(), delay_buffer.is_silent())
            });

        self.read_index = read_index;
        self.update_gain(round, sample_count);
        self.update_time(round, sample_count);
        self.update_reverse();

        if is_line_silent {
            if self.need_to_render_silence {
                self.need_to_render_silence = false;
                let block_size = self.state.block_size();
                self.state.buffer_mut().silence(0, block_size);
            }

            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        self.need_to_render_silence = true;
        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let delay_buffer = Rc::clone(&self.delay_buffer);
        let Ok(delay_buffer) = delay_buffer.try_borrow() else {
            buffer.silence(first, last);
            return;
        };

        if delay_buffer.is_empty() {
            buffer.silence(first, last);
        } else if self.is_reversed {
            self.render_reverse(&delay_buffer, first, last, buffer);
        } else {
            self.render_forward(&delay_buffer, first, last, buffer);
        }
    }
}

/// Orientation of the stereo image of a [`PannedDelay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanningMode {
    /// Positive panning moves the signal to the right.
    #[default]
    Normal,
    /// Positive panning moves the signal to the left.
    Flipped,
}

/// A producer that contains a [`Delay`] over `I`: the delay itself or a
/// filter over it.
pub trait DelayStage<I: SignalProducer>: SignalProducer {
    /// The contained delay.
    fn delay(&self) -> &Delay<I>;

    /// The contained delay, mutably.
    fn delay_mut(&mut self) -> &mut Delay<I>;
}

impl<I: SignalProducer> DelayStage<I> for Delay<I> {
    fn delay(&self) -> &Delay<I> {
        self
    }

    fn delay_mut(&mut self) -> &mut Delay<I> {
        self
    }
}

impl<I: SignalProducer> DelayStage<I> for BiquadFilter<Delay<I>, FixedHighShelf> {
    fn delay(&self) -> &Delay<I> {
        self.input()
    }

    fn delay_mut(&mut self) -> &mut Delay<I> {
        self.input_mut()
    }
}

/// A stereo delay followed by a Web Audio style stereo panner.
pub struct PannedDelay<I: SignalProducer, S: DelayStage<I> = Delay<I>> {
    state: ProducerState,
    stage: S,

    /// Stereo position in `[-1, 1]`.
    pub panning: FloatParam,

    mode: PanningMode,
    panning_scale: Number,
    panning_value: Option<Number>,
    stereo_gains: [Vec<Sample>; 2],
    panning_values: Vec<Number>,
    input: PhantomData<I>,
}

/// Echo damping: a [`PannedDelay`] with a high-shelf filter after the delay.
pub type HighShelfPannedDelay<I> = PannedDelay<I, BiquadFilter<Delay<I>, FixedHighShelf>>;

impl<I: SignalProducer, S: DelayStage<I>> core::fmt::Debug for PannedDelay<I, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PannedDelay")
            .field("mode", &self.mode)
            .field("panning", &self.panning.value())
            .field("panning_scale", &self.panning_scale)
            .field("delay", self.stage.delay())
            .finish_non_exhaustive()
    }
}

impl<I: SignalProducer> PannedDelay<I, Delay<I>> {
    /// Pan the output of `delay` with a private panning parameter.
    pub fn new(delay: Delay<I>, mode: PanningMode) -> Self {
        Self::over(delay, mode, FloatParam::new("", -1.0, 1.0, 0.0))
    }

    /// Pan the output of `delay` following `panning_leader`.
    pub fn with_panning_leader(
        delay: Delay<I>,
        mode: PanningMode,
        panning_leader: &Shared<FloatParam>,
    ) -> Self {
        Self::over(delay, mode, FloatParam::follower(panning_leader))
    }
}

impl<I: SignalProducer> HighShelfPannedDelay<I> {
    /// Damp the output of `delay` with a high-shelf filter, then pan it.
    /// The filter opens fully at its defaults.
    pub fn high_shelf(delay: Delay<I>, mode: PanningMode, panning_leader: &Shared<FloatParam>) -> Self {
        let filter = BiquadFilter::fixed("", delay);

        Self::over(filter, mode, FloatParam::follower(panning_leader))
    }

    /// The damping filter.
    pub fn high_shelf_filter(&self) -> &BiquadFilter<Delay<I>, FixedHighShelf> {
        &self.stage
    }

    /// The damping filter, mutably.
    pub fn high_shelf_filter_mut(&mut self) -> &mut BiquadFilter<Delay<I>, FixedHighShelf> {
        &mut self.stage
    }
}

impl<I: SignalProducer, S: DelayStage<I>> PannedDelay<I, S> {
    fn over(stage: S, mode: PanningMode, panning: FloatParam) -> Self {
        let channels = stage.state().channels();
        let mut panned = Self {
            state: ProducerState::new(channels),
            stage,
            panning,
            mode,
            panning_scale: 1.0,
            panning_value: None,
            stereo_gains: [Vec::new(), Vec::new()],
            panning_values: Vec::new(),
            input: PhantomData,
        };

        panned.block_size_changed();
        panned
    }

    /// Scale applied to the panning before it takes effect.
    pub fn set_panning_scale(&mut self, scale: Number) {
        self.panning_scale = scale;
    }

    /// The contained delay.
    pub fn delay(&self) -> &Delay<I> {
        self.stage.delay()
    }

    /// The contained delay, mutably.
    pub fn delay_mut(&mut self) -> &mut Delay<I> {
        self.stage.delay_mut()
    }

    fn oriented(&self, panning: Number) -> Number {
        match self.mode {
            PanningMode::Normal => panning * self.panning_scale,
            PanningMode::Flipped => -panning * self.panning_scale,
        }
    }
}

/// Left and right gains of `panning` in `[-1, 1]`.
#[inline]
fn stereo_gains(panning: Number) -> (Sample, Sample) {
    let x = if panning <= 0.0 { panning + 1.0 } else { panning } * FRAC_PI_2;

    (libm::cos(x), libm::sin(x))
}

#[inline]
fn pan(panning: Number, gains: (Sample, Sample), left: Sample, right: Sample) -> (Sample, Sample) {
    let (gain_left, gain_right) = gains;

    if panning <= 0.0 {
        (left + right * gain_left, right * gain_right)
    } else {
        (left * gain_left, right + left * gain_right)
    }
}

impl<I: SignalProducer, S: DelayStage<I>> SignalProducer for PannedDelay<I, S> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.stage);
        visitor(&mut self.panning);
    }

    fn block_size_changed(&mut self) {
        let block_size = self.state.block_size();

        self.stereo_gains = [vec![0.0; block_size], vec![0.0; block_size]];
        self.panning_values = vec![0.0; block_size];
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.stage, round, sample_count);
        let panning = constant_or_rendered(&mut self.panning, round, sample_count);

        if self.stage.is_silent(round, sample_count) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        if self.state.channels() != 2 {
            let input = self.stage.state().buffer();
            self.state.buffer_mut().copy_from(input, sample_count);
            return Rendering::Ready;
        }

        self.panning_value = panning.map(|panning| self.oriented(panning));

        if self.panning_value.is_none() {
            let rendered_panning = rendered(&self.panning);

            for i in 0..sample_count {
                let panning = self.oriented(rendered_panning[i]);
                let (left, right) = stereo_gains(panning);

                self.panning_values[i] = panning;
                self.stereo_gains[0][i] = left;
                self.stereo_gains[1][i] = right;
            }
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let input = self.stage.state().buffer();
        let [left_out, right_out] = buffer.channels_mut() else {
            return;
        };
        let (left_in, right_in) = (input.channel(0), input.channel(1));

        match self.panning_value {
            Some(panning) => {
                let gains = stereo_gains(panning);

                for i in first..last {
                    (left_out[i], right_out[i]) = pan(panning, gains, left_in[i], right_in[i]);
                }
            }
            None => {
                for i in first..last {
                    let gains = (self.stereo_gains[0][i], self.stereo_gains[1][i]);

                    (left_out[i], right_out[i]) =
                        pan(self.panning_values[i], gains, left_in[i], right_in[i]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{ON, toggle};

    /// Repeats the same per-channel block every round, channel `c` scaled by
    /// `c + 1`, for a limited number of rounds.
    struct Blocks {
        state: ProducerState,
        block: Vec<Sample>,
        rounds_left: usize,
    }

    impl Blocks {
        fn new(channels: usize, block: &[Sample], rounds: usize) -> Self {
            Self {
                state: ProducerState::new(channels),
                block: block.to_vec(),
                rounds_left: rounds,
            }
        }
    }

    impl SignalProducer for Blocks {
        fn state(&self) -> &ProducerState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ProducerState {
            &mut self.state
        }

        fn initialize_rendering(&mut self, _round: Round, _sample_count: usize) -> Rendering {
            let audible = self.rounds_left > 0;
            self.rounds_left = self.rounds_left.saturating_sub(1);

            for (c, channel) in self.state.buffer_mut().channels_mut().iter_mut().enumerate() {
                for (out, sample) in channel.iter_mut().zip(&self.block) {
                    *out = if audible { sample * (c + 1) as Sample } else { 0.0 };
                }
            }

            Rendering::Ready
        }

        fn render(&mut self, _round: Round, _first: usize, _last: usize, _buffer: &mut Buffer) {}
    }

    fn prepare<P: SignalProducer>(producer: &mut P, sample_rate: Frequency, block_size: usize) {
        producer.set_sample_rate(sample_rate);
        producer.set_block_size(block_size);
    }

    fn render_rounds<P: SignalProducer>(producer: &mut P, rounds: Round, channel: usize) -> Vec<Sample> {
        let block_size = producer.state().block_size();
        let mut output = Vec::new();

        for round in 1..=rounds {
            output.extend_from_slice(&produce(producer, round, block_size).channel(channel)[..block_size]);
        }

        output
    }

    fn assert_close(actual: &[Sample], expected: &[Sample]) {
        assert_eq!(actual.len(), expected.len());

        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-9, "sample {i}: {a} != {e}");
        }
    }

    #[test]
    fn delay_reads_the_line_with_scheduled_time_changes() {
        let input = Blocks::new(2, &[0.1, 0.2, 0.3, 0.4, 0.5], usize::MAX);
        let mut delay = Delay::new(input);
        prepare(&mut delay, 10.0, 5);
        delay.gain.set_value(0.5);
        delay.time.set_value(0.25);
        delay.time.schedule_value(0.71, 0.4);

        let expected = [0.0, 0.0, 0.025, 0.075, 0.125, 0.175, 0.225, 0.150, 0.250, 0.050];
        let mut left = Vec::new();
        let mut right = Vec::new();

        for round in 1..=2 {
            let block = produce(&mut delay, round, 5);
            left.extend_from_slice(&block.channel(0)[..5]);
            right.extend_from_slice(&block.channel(1)[..5]);
        }

        assert_close(&left, &expected);
        assert_close(&right, &expected.map(|s| s * 2.0));
    }

    #[test]
    fn feedback_repeats_with_one_block_of_latency() {
        let mut impulse = [0.0; 5];
        impulse[0] = 1.0;
        let mut delay = Delay::new(Blocks::new(1, &impulse, 1));
        prepare(&mut delay, 10.0, 5);
        delay.gain.set_value(0.5);
        delay.time.set_value(0.5);
        let tap = delay.state_mut().attach_tap();
        delay.set_feedback_tap(tap);

        let output = render_rounds(&mut delay, 6, 0);

        assert_eq!(output[5], 0.5);
        assert_eq!(output[15], 0.25);
        assert_eq!(output[25], 0.125);
        assert_eq!(output.iter().filter(|s| **s != 0.0).count(), 3);
    }

    #[test]
    fn tempo_sync_measures_time_in_beats() {
        let mut impulse = [0.0; 8];
        impulse[0] = 1.0;
        let sync = shared(toggle("SYN", ON));
        let mut delay = Delay::new(Blocks::new(1, &impulse, 1)).with_tempo_sync(sync);
        prepare(&mut delay, 16.0, 8);
        delay.set_bpm(120.0);
        delay.gain.set_value(1.0);
        delay.time.set_value(1.0);

        // One beat at 120 BPM is 8 samples.
        let output = render_rounds(&mut delay, 3, 0);

        assert_eq!(output[8], 1.0);
        assert_eq!(output.iter().filter(|s| **s != 0.0).count(), 1);
    }

    #[test]
    fn time_scale_multiplies_the_delay_time() {
        let mut impulse = [0.0; 8];
        impulse[0] = 1.0;
        let mut delay = Delay::new(Blocks::new(1, &impulse, 1));
        delay.set_time_scale_param(FloatParam::new("", 0.0, 2.0, 0.5));
        prepare(&mut delay, 16.0, 8);
        delay.gain.set_value(1.0);
        delay.time.set_value(1.0);

        let output = render_rounds(&mut delay, 2, 0);

        assert_eq!(output[8], 1.0);
    }

    #[test]
    fn silent_line_renders_exact_zeros() {
        let mut delay = Delay::new(Blocks::new(1, &[1.0; 4], 1));
        prepare(&mut delay, 8.0, 4);
        delay.time.set_value(0.25);

        let len = delay.delay_buffer().borrow().len();
        let rounds = (len / 4 + 3) as Round;
        let output = render_rounds(&mut delay, rounds, 0);

        assert!(output[2..6].iter().all(|s| *s != 0.0));
        assert!(output[output.len() - 4..].iter().all(|s| *s == 0.0));
        assert!(delay.is_silent(rounds, 4));
    }

    #[test]
    fn readers_of_a_shared_line_see_the_writer_input() {
        let mut impulse = [0.0; 4];
        impulse[0] = 1.0;
        let mut writer = Delay::new(Blocks::new(1, &impulse, 1));
        let mut reader = Delay::new(Silence::new(1));
        reader.use_shared_delay_buffer(Rc::clone(writer.delay_buffer()));

        prepare(&mut writer, 8.0, 4);
        prepare(&mut reader, 8.0, 4);
        writer.gain.set_value(1.0);
        writer.time.set_value(0.5);
        reader.gain.set_value(1.0);
        reader.time.set_value(0.25);

        let mut writer_output = Vec::new();
        let mut reader_output = Vec::new();

        for round in 1..=2 {
            writer_output.extend_from_slice(&produce(&mut writer, round, 4).channel(0)[..4]);
            reader_output.extend_from_slice(&produce(&mut reader, round, 4).channel(0)[..4]);
        }

        assert_eq!(writer_output[4], 1.0);
        assert_eq!(reader_output[2], 1.0);
    }

    #[test]
    fn reverse_plays_segments_backwards_under_a_half_sine() {
        let reverse = shared(toggle("REV", ON));
        let mut delay = Delay::new(Blocks::new(1, &[1.0; 8], 1)).with_reverse(reverse);
        prepare(&mut delay, 16.0, 8);
        delay.gain.set_value(1.0);
        delay.time.set_value(0.5);

        let output = render_rounds(&mut delay, 2, 0);

        assert!(output[..8].iter().all(|s| *s == 0.0));

        for k in 0..8 {
            let envelope = libm::sin(PI * (k as Number + 0.5) / 8.0);
            assert!((output[8 + k] - envelope).abs() < 1e-12);
        }
    }

    #[test]
    fn panning_moves_the_image_and_flipping_mirrors_it() {
        let block = [0.25; 4];
        let mut normal = PannedDelay::new(Delay::new(Blocks::new(2, &block, 9)), PanningMode::Normal);
        let mut flipped =
            PannedDelay::new(Delay::new(Blocks::new(2, &block, 9)), PanningMode::Flipped);

        for panned in [&mut normal, &mut flipped] {
            prepare(&mut *panned, 8.0, 4);
            panned.delay_mut().gain.set_value(1.0);
            panned.delay_mut().time.set_value(0.0);
            panned.panning.set_value(1.0);
        }

        let normal_out = produce(&mut normal, 1, 4);
        assert!(normal_out.channel(0)[0].abs() < 1e-12);
        assert!((normal_out.channel(1)[0] - 0.75).abs() < 1e-12);

        let flipped_out = produce(&mut flipped, 1, 4);
        assert!((flipped_out.channel(0)[0] - 0.75).abs() < 1e-12);
        assert!(flipped_out.channel(1)[0].abs() < 1e-12);
    }

    #[test]
    fn centered_panning_keeps_both_channels() {
        let mut panned =
            PannedDelay::new(Delay::new(Blocks::new(2, &[0.5; 4], 9)), PanningMode::Normal);
        prepare(&mut panned, 8.0, 4);
        panned.delay_mut().gain.set_value(1.0);
        panned.delay_mut().time.set_value(0.0);

        let output = produce(&mut panned, 1, 4);

        // At the center the right channel leaks into the left at cos(pi/2).
        assert!((output.channel(0)[0] - 0.5).abs() < 1e-12);
        assert!((output.channel(1)[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn high_shelf_panned_delay_damps_through_its_filter() {
        let leader = shared(FloatParam::new("PAN", -1.0, 1.0, 0.0));
        let alternating = [0.5, -0.5, 0.5, -0.5];
        let mut open = HighShelfPannedDelay::high_shelf(
            Delay::new(Blocks::new(2, &alternating, usize::MAX)),
            PanningMode::Normal,
            &leader,
        );
        let mut damped = HighShelfPannedDelay::high_shelf(
            Delay::new(Blocks::new(2, &alternating, usize::MAX)),
            PanningMode::Normal,
            &leader,
        );

        for panned in [&mut open, &mut damped] {
            prepare(&mut *panned, 8.0, 4);
            panned.delay_mut().gain.set_value(1.0);
            panned.delay_mut().time.set_value(0.0);
        }

        damped.high_shelf_filter_mut().frequency.set_value(1.0);
        damped.high_shelf_filter_mut().gain.set_value(-48.0);

        let open_output = render_rounds(&mut open, 8, 1);
        let damped_output = render_rounds(&mut damped, 8, 1);

        assert!((open_output[31] + 1.0).abs() < 1e-12);
        assert!(damped_output[28..].iter().all(|s| s.abs() < 0.1));
    }
}
