//! Block-based pull protocol shared by every node of the signal graph.
//!
//! A [`SignalProducer`] renders at most once per *round*: the first
//! [`produce`] call of a round runs the producer's hooks and caches the
//! result, later calls in the same round return the cached [`Buffer`]
//! untouched. This lets one node feed any number of consumers without being
//! evaluated twice.
//!
//! ## Rendering a round
//!
//! 1. [`SignalProducer::initialize_rendering`] pulls inputs and may finish the
//!    round early by returning [`Rendering::Ready`] (bypass, silent input).
//! 2. Scheduled events whose time falls within the block split it into
//!    segments; each event is dispatched to [`SignalProducer::handle_event`]
//!    at the first sample whose time is not earlier than the event's time, and
//!    [`SignalProducer::render`] fills the samples between events.
//! 3. [`SignalProducer::finalize_rendering`] runs once the block is complete.
//!
//! When the event queue drains, the producer's local clock rewinds to zero,
//! so scheduled time offsets stay small in long sessions.
//!
//! ## Example
//!
//! ```rust
//! use vesta_core::producer::{produce, Buffer, ProducerState, SignalProducer};
//!
//! struct Ramp {
//!     state: ProducerState,
//!     next: f64,
//! }
//!
//! impl SignalProducer for Ramp {
//!     fn state(&self) -> &ProducerState { &self.state }
//!     fn state_mut(&mut self) -> &mut ProducerState { &mut self.state }
//!
//!     fn render(&mut self, _round: u64, first: usize, last: usize, buffer: &mut Buffer) {
//!         for i in first..last {
//!             buffer.channel_mut(0)[i] = self.next;
//!             self.next += 1.0;
//!         }
//!     }
//! }
//!
//! let mut ramp = Ramp { state: ProducerState::new(1), next: 0.0 };
//! ramp.set_block_size(4);
//!
//! assert_eq!(&produce(&mut ramp, 1, 4).channel(0)[..4], &[0.0, 1.0, 2.0, 3.0]);
//! // Same round: served from cache.
//! assert_eq!(&produce(&mut ramp, 1, 4).channel(0)[..4], &[0.0, 1.0, 2.0, 3.0]);
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use crate::queue::Queue;
use crate::{Frequency, Number, Sample, Seconds};

/// Identifies one evaluation sweep of the graph.
pub type Round = u64;

/// Event discriminator. Each producer defines its own values above
/// [`EVT_CANCEL`].
pub type EventType = u8;

/// Reference-counted handle for nodes shared between several owners
/// (leader parameters, LFOs, envelopes, controllers).
pub type Shared<T> = Rc<RefCell<T>>;

/// Wrap a value into a [`Shared`] handle.
pub fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// Block size used until the host sets one.
pub const DEFAULT_BLOCK_SIZE: usize = 256;
/// Sample rate used until the host sets one.
pub const DEFAULT_SAMPLE_RATE: Frequency = 44100.0;
/// One beat lasts one second at the default tempo.
pub const DEFAULT_BPM: Number = 60.0;
/// Tempo changes below this value are ignored.
pub const MIN_BPM: Number = 0.000001;
/// Silence threshold in dBFS.
pub const SILENCE_THRESHOLD_DB: Number = -150.0;
/// Silence threshold as a linear magnitude: `2^(-150 / 6)`.
pub const SILENCE_THRESHOLD: Sample = 2.9802322387695312e-8;

/// Meta-event scheduled by every cancellation.
pub const EVT_CANCEL: EventType = 0;

/// A scheduled event. `time_offset` is absolute on the producer's local clock
/// once it has been queued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// Event discriminator.
    pub kind: EventType,
    /// Time of the event in seconds.
    pub time_offset: Seconds,
    /// Integer payload.
    pub int_param: i64,
    /// First numeric payload.
    pub number_param_1: Number,
    /// Second numeric payload.
    pub number_param_2: Number,
    /// First byte payload.
    pub byte_param_1: u8,
    /// Second byte payload.
    pub byte_param_2: u8,
}

impl Event {
    /// Event of `kind` at `time_offset` with empty payload.
    pub const fn new(kind: EventType, time_offset: Seconds) -> Self {
        Self {
            kind,
            time_offset,
            int_param: 0,
            number_param_1: 0.0,
            number_param_2: 0.0,
            byte_param_1: 0,
            byte_param_2: 0,
        }
    }

    /// Set the integer payload.
    pub const fn with_int(mut self, int_param: i64) -> Self {
        self.int_param = int_param;
        self
    }

    /// Set both numeric payloads.
    pub const fn with_numbers(mut self, number_param_1: Number, number_param_2: Number) -> Self {
        self.number_param_1 = number_param_1;
        self.number_param_2 = number_param_2;
        self
    }

    /// Set both byte payloads.
    pub const fn with_bytes(mut self, byte_param_1: u8, byte_param_2: u8) -> Self {
        self.byte_param_1 = byte_param_1;
        self.byte_param_2 = byte_param_2;
        self
    }
}

/// Per-channel sample storage, `channels × block_size`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Buffer {
    samples: Vec<Vec<Sample>>,
}

impl Buffer {
    /// Zeroed buffer.
    pub fn new(channels: usize, block_size: usize) -> Self {
        Self {
            samples: vec![vec![0.0; block_size]; channels],
        }
    }

    /// Number of channels.
    #[inline]
    pub fn channels(&self) -> usize {
        self.samples.len()
    }

    /// Samples per channel.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    /// Samples of one channel.
    #[inline]
    pub fn channel(&self, channel: usize) -> &[Sample] {
        &self.samples[channel]
    }

    /// Mutable samples of one channel.
    #[inline]
    pub fn channel_mut(&mut self, channel: usize) -> &mut [Sample] {
        &mut self.samples[channel]
    }

    /// All channels, mutably.
    #[inline]
    pub fn channels_mut(&mut self) -> &mut [Vec<Sample>] {
        &mut self.samples
    }

    /// Zero `first..last` on every channel.
    pub fn silence(&mut self, first: usize, last: usize) {
        for channel in &mut self.samples {
            channel[first..last].fill(0.0);
        }
    }

    /// Copy the first `sample_count` samples of every common channel. Extra
    /// destination channels receive the source's last channel.
    pub fn copy_from(&mut self, source: &Buffer, sample_count: usize) {
        let source_channels = source.channels();

        if source_channels == 0 {
            self.silence(0, sample_count);
            return;
        }

        for (c, channel) in self.samples.iter_mut().enumerate() {
            let src = &source.samples[c.min(source_channels - 1)];
            channel[..sample_count].copy_from_slice(&src[..sample_count]);
        }
    }

    /// Whether every sample in `0..sample_count` is below [`SILENCE_THRESHOLD`].
    pub fn is_silent(&self, sample_count: usize) -> bool {
        self.samples.iter().all(|channel| {
            channel[..sample_count.min(channel.len())]
                .iter()
                .all(|s| s.abs() <= SILENCE_THRESHOLD)
        })
    }

    fn resize(&mut self, block_size: usize) {
        for channel in &mut self.samples {
            channel.clear();
            channel.resize(block_size, 0.0);
        }
    }
}

/// Copy of a producer's most recent block, kept for a consumer that reads it
/// one round later (delay feedback).
#[derive(Debug, Default)]
pub struct BlockTap {
    buffer: Buffer,
    sample_count: usize,
}

impl BlockTap {
    /// The stored block and its length; the length is zero before the first
    /// round was captured.
    pub fn block(&self) -> (&Buffer, usize) {
        (&self.buffer, self.sample_count)
    }

    fn capture(&mut self, source: &Buffer, sample_count: usize) {
        if self.buffer.channels() != source.channels()
            || self.buffer.block_size() < sample_count
        {
            self.buffer = Buffer::new(source.channels(), source.block_size());
        }

        self.buffer.copy_from(source, sample_count);
        self.sample_count = sample_count;
    }
}

/// Timing, event queue and output buffer of a producer.
#[derive(Debug)]
pub struct ProducerState {
    channels: usize,
    block_size: usize,
    sample_rate: Frequency,
    sampling_period: Seconds,
    nyquist_frequency: Frequency,
    bpm: Number,
    current_time: Seconds,
    cached_round: Option<Round>,
    has_rendered: bool,
    last_sample_count: usize,
    cached_silence_round: Option<Round>,
    cached_silence: bool,
    events: Queue<Event>,
    buffer: Buffer,
    tap: Option<Shared<BlockTap>>,
}

impl ProducerState {
    /// State with `channels` output channels and the default timing.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            block_size: DEFAULT_BLOCK_SIZE,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sampling_period: 1.0 / DEFAULT_SAMPLE_RATE,
            nyquist_frequency: DEFAULT_SAMPLE_RATE * 0.5,
            bpm: DEFAULT_BPM,
            current_time: 0.0,
            cached_round: None,
            has_rendered: false,
            last_sample_count: 0,
            cached_silence_round: None,
            cached_silence: false,
            events: Queue::new(),
            buffer: Buffer::new(channels, DEFAULT_BLOCK_SIZE),
            tap: None,
        }
    }

    /// State with preallocated room for `events` queued events.
    pub fn with_event_capacity(channels: usize, events: usize) -> Self {
        let mut state = Self::new(channels);
        state.events.reserve(events);
        state
    }

    /// Number of output channels.
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Maximum samples per round.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Samples per second.
    #[inline]
    pub fn sample_rate(&self) -> Frequency {
        self.sample_rate
    }

    /// Seconds per sample.
    #[inline]
    pub fn sampling_period(&self) -> Seconds {
        self.sampling_period
    }

    /// Half the sample rate.
    #[inline]
    pub fn nyquist_frequency(&self) -> Frequency {
        self.nyquist_frequency
    }

    /// Beats per minute.
    #[inline]
    pub fn bpm(&self) -> Number {
        self.bpm
    }

    /// Local clock in seconds.
    #[inline]
    pub fn current_time(&self) -> Seconds {
        self.current_time
    }

    /// Advance the local clock without rendering.
    pub fn advance_time(&mut self, seconds: Seconds) {
        self.current_time += seconds;
    }

    /// The scheduled events.
    #[inline]
    pub fn events(&self) -> &Queue<Event> {
        &self.events
    }

    /// Round of the last `produce` call.
    #[inline]
    pub fn cached_round(&self) -> Option<Round> {
        self.cached_round
    }

    /// Mark `round` as produced without rendering.
    pub fn set_cached_round(&mut self, round: Round) {
        self.cached_round = Some(round);
    }

    /// Output buffer.
    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Mutable output buffer, for producers that complete their block inside
    /// `initialize_rendering`.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Absolute local time of the sample `sample_count` samples from now.
    #[inline]
    pub fn sample_count_to_time_offset(&self, sample_count: usize) -> Seconds {
        self.current_time + self.sample_count_to_relative_time_offset(sample_count)
    }

    /// Duration of `sample_count` samples.
    #[inline]
    pub fn sample_count_to_relative_time_offset(&self, sample_count: usize) -> Seconds {
        sample_count as Seconds * self.sampling_period
    }

    /// Queue `event`; its `time_offset` is relative to the current time.
    pub fn schedule(&mut self, mut event: Event) {
        event.time_offset += self.current_time;
        self.events.push(event);
    }

    /// Drop every event and schedule a cancellation.
    pub fn cancel_events(&mut self) {
        self.events.clear();
        self.schedule(Event::new(EVT_CANCEL, 0.0));
    }

    /// Drop events at or after `time_offset` and schedule a cancellation there.
    pub fn cancel_events_at(&mut self, time_offset: Seconds) {
        let time = time_offset + self.current_time;

        let index = self.events.iter().position(|e| e.time_offset >= time);

        if let Some(index) = index {
            self.events.drop_from(index);
        }

        self.schedule(Event::new(EVT_CANCEL, time_offset));
    }

    /// Drop events after `time_offset` and schedule a cancellation there.
    pub fn cancel_events_after(&mut self, time_offset: Seconds) {
        let time = time_offset + self.current_time;

        let index = self.events.iter().position(|e| e.time_offset > time);

        if let Some(index) = index {
            self.events.drop_from(index);
        }

        self.schedule(Event::new(EVT_CANCEL, time_offset));
    }

    /// Whether any event is queued.
    #[inline]
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Whether the last queued event is later than the absolute `time_offset`.
    pub fn has_events_after(&self, time_offset: Seconds) -> bool {
        self.events
            .back()
            .is_some_and(|event| event.time_offset > time_offset)
    }

    /// Time of the last queued event relative to now, or 0.
    pub fn last_event_time_offset(&self) -> Seconds {
        self.events
            .back()
            .map_or(0.0, |event| event.time_offset - self.current_time)
    }

    /// Whether the front event lands within the next `sample_count` samples.
    pub fn has_upcoming_events(&self, sample_count: usize) -> bool {
        self.events.front().is_some_and(|event| {
            event.time_offset <= self.sample_count_to_time_offset(sample_count)
        })
    }

    /// Whether the last rendered block is below the silence threshold. Cached
    /// per round; a producer that never rendered is silent.
    pub fn is_silent(&mut self, round: Round, sample_count: usize) -> bool {
        if !self.has_rendered {
            return true;
        }

        if self.cached_silence_round == Some(round) {
            return self.cached_silence;
        }

        self.cached_silence_round = Some(round);
        self.cached_silence = self.buffer.is_silent(sample_count);
        self.cached_silence
    }

    /// Record `round` as silent without scanning the buffer.
    pub fn mark_round_as_silent(&mut self, round: Round) {
        self.cached_silence_round = Some(round);
        self.cached_silence = true;
    }

    /// The previous block and its length, if anything was rendered yet.
    pub fn last_rendered_block(&self) -> Option<(&Buffer, usize)> {
        self.has_rendered
            .then_some((&self.buffer, self.last_sample_count))
    }

    /// Attach a tap that receives a copy of every produced block.
    pub fn attach_tap(&mut self) -> Shared<BlockTap> {
        let tap = shared(BlockTap::default());
        self.tap = Some(Rc::clone(&tap));
        tap
    }

    fn set_sample_rate(&mut self, sample_rate: Frequency) {
        self.sample_rate = sample_rate;
        self.sampling_period = 1.0 / sample_rate;
        self.nyquist_frequency = sample_rate * 0.5;
    }

    fn set_block_size(&mut self, block_size: usize) -> bool {
        if block_size == self.block_size && self.buffer.block_size() == block_size {
            return false;
        }

        self.block_size = block_size;

        if self.channels > 0 {
            self.buffer.resize(block_size);
        }

        self.last_sample_count = 0;
        self.cached_round = None;
        self.has_rendered = false;
        true
    }

    fn set_bpm(&mut self, bpm: Number) -> bool {
        if bpm < MIN_BPM || (self.bpm - bpm).abs() < MIN_BPM {
            return false;
        }

        self.bpm = bpm;
        true
    }

    fn reset(&mut self) {
        self.cancel_events();
        let block_size = self.block_size;
        self.buffer.silence(0, block_size);
    }
}

/// What `initialize_rendering` decided about the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendering {
    /// Run event dispatch and `render`.
    Render,
    /// The output buffer is already complete for this round.
    Ready,
}

/// A node of the signal graph.
///
/// Implementors provide access to their [`ProducerState`] and a `render`
/// body; everything else has working defaults. Hooks ending in `_changed`
/// run after the new setting was stored and forwarded to children.
pub trait SignalProducer {
    /// Shared producer state.
    fn state(&self) -> &ProducerState;

    /// Shared producer state, mutably.
    fn state_mut(&mut self) -> &mut ProducerState;

    /// Visit owned sub-producers, so that configuration changes reach them.
    /// Shared handles are not children; their owner configures them.
    fn visit_children(&mut self, _visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {}

    /// Prepare the round: pull inputs, compute per-block values.
    fn initialize_rendering(&mut self, _round: Round, _sample_count: usize) -> Rendering {
        Rendering::Render
    }

    /// Fill `first..last` of `buffer`.
    fn render(&mut self, round: Round, first: usize, last: usize, buffer: &mut Buffer);

    /// Runs after the whole block was rendered.
    fn finalize_rendering(&mut self, _round: Round, _sample_count: usize) {}

    /// React to a scheduled event whose time has come.
    fn handle_event(&mut self, _event: &Event) {}

    /// Called after the sample rate changed.
    fn sample_rate_changed(&mut self) {}

    /// Called after the block size changed.
    fn block_size_changed(&mut self) {}

    /// Called after the tempo changed.
    fn bpm_changed(&mut self) {}

    /// Called after the state and children were reset.
    fn reset_state(&mut self) {}

    /// Set the sample rate of this producer and its children.
    fn set_sample_rate(&mut self, sample_rate: Frequency) {
        self.state_mut().set_sample_rate(sample_rate);
        self.visit_children(&mut |child| child.set_sample_rate(sample_rate));
        self.sample_rate_changed();
    }

    /// Set the block size of this producer and its children, reallocating
    /// buffers. Not real-time safe.
    fn set_block_size(&mut self, block_size: usize) {
        let changed = self.state_mut().set_block_size(block_size);
        self.visit_children(&mut |child| child.set_block_size(block_size));

        if changed {
            self.block_size_changed();
        }
    }

    /// Set the tempo; values below [`MIN_BPM`] or equal to the current one are
    /// ignored.
    fn set_bpm(&mut self, bpm: Number) {
        if self.state_mut().set_bpm(bpm) {
            self.visit_children(&mut |child| child.set_bpm(bpm));
            self.bpm_changed();
        }
    }

    /// Drop scheduled events, silence the output and reset children.
    fn reset(&mut self) {
        self.state_mut().reset();
        self.visit_children(&mut |child| child.reset());
        self.reset_state();
    }

    /// Whether the last rendered block of `round` is silent.
    fn is_silent(&mut self, round: Round, sample_count: usize) -> bool {
        self.state_mut().is_silent(round, sample_count)
    }
}

/// Render `producer` for `round`, or return its cached output when it already
/// rendered this round. `sample_count` must not exceed the block size.
pub fn produce<P>(producer: &mut P, round: Round, sample_count: usize) -> &Buffer
where
    P: SignalProducer + ?Sized,
{
    if producer.state().cached_round == Some(round) {
        return &producer.state().buffer;
    }

    debug_assert!(
        sample_count <= producer.state().block_size,
        "sample_count ({sample_count}) exceeds block size ({})",
        producer.state().block_size
    );

    let count = sample_count.min(producer.state().block_size);

    {
        let state = producer.state_mut();
        state.cached_round = Some(round);
        state.has_rendered = true;
        state.last_sample_count = count;
    }

    if producer.initialize_rendering(round, count) == Rendering::Ready {
        capture_tap(producer.state_mut(), count);
        return &producer.state().buffer;
    }

    let mut buffer = std::mem::take(&mut producer.state_mut().buffer);
    let start_time = producer.state().current_time;
    let sampling_period = producer.state().sampling_period;

    if producer.state().has_upcoming_events(count) {
        let sample_rate = producer.state().sample_rate;
        let mut current_sample_index = 0;

        while current_sample_index != count {
            let next_stop = loop {
                let handle_until = producer.state().current_time;

                let Some(next_event) = producer.state().events.front().copied() else {
                    break count;
                };

                if next_event.time_offset > handle_until {
                    let delta = libm::ceil((next_event.time_offset - handle_until) * sample_rate);
                    break (current_sample_index + delta as usize).min(count);
                }

                producer.state_mut().events.pop();
                producer.handle_event(&next_event);
            };

            producer.render(round, current_sample_index, next_stop, &mut buffer);
            current_sample_index = next_stop;
            producer.state_mut().current_time =
                start_time + current_sample_index as Seconds * sampling_period;
        }
    } else {
        producer.render(round, 0, count, &mut buffer);
        producer.state_mut().current_time += count as Seconds * sampling_period;
    }

    producer.state_mut().buffer = buffer;
    producer.finalize_rendering(round, count);

    let state = producer.state_mut();

    if state.events.is_empty() {
        state.current_time = 0.0;
    }

    capture_tap(state, count);

    &producer.state().buffer
}

fn capture_tap(state: &mut ProducerState, sample_count: usize) {
    if let Some(tap) = &state.tap
        && let Ok(mut tap) = tap.try_borrow_mut()
    {
        tap.capture(&state.buffer, sample_count);
    }
}

/// First channel of the last render of a producer. Empty for producers
/// without a buffer.
pub fn rendered(producer: &dyn SignalProducer) -> &[Sample] {
    let buffer = producer.state().buffer();

    if buffer.channels() == 0 {
        return &[];
    }

    buffer.channel(0)
}

/// Adapter that lets several consumers own a handle to one producer. Each
/// round it renders the shared producer (once, thanks to round caching) and
/// copies its output.
#[derive(Debug)]
pub struct SharedProducer<P: SignalProducer> {
    state: ProducerState,
    inner: Shared<P>,
}

impl<P: SignalProducer> SharedProducer<P> {
    /// Wrap a shared producer.
    pub fn new(inner: Shared<P>) -> Self {
        let channels = inner.borrow().state().channels();

        Self {
            state: ProducerState::new(channels),
            inner,
        }
    }

    /// The wrapped handle.
    pub fn inner(&self) -> &Shared<P> {
        &self.inner
    }
}

impl<P: SignalProducer> SignalProducer for SharedProducer<P> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        match self.inner.try_borrow_mut() {
            Ok(mut inner) => {
                let output = produce(&mut *inner, round, sample_count);
                self.state.buffer.copy_from(output, sample_count);
            }
            Err(_) => self.state.buffer.silence(0, sample_count),
        }

        Rendering::Ready
    }

    fn render(&mut self, _round: Round, _first: usize, _last: usize, _buffer: &mut Buffer) {}
}

/// A producer whose block is written by its owner before it is pulled.
///
/// Lets a node hand the input it already rendered to a chain of nodes it
/// owns. Pulled in a round it was not fed, it renders silence.
#[derive(Debug)]
pub struct Feed {
    state: ProducerState,
}

impl Feed {
    /// Feed with `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            state: ProducerState::new(channels),
        }
    }

    /// Provide the block of `round`.
    pub fn feed(&mut self, round: Round, source: &Buffer, sample_count: usize) {
        let state = &mut self.state;
        state.buffer.copy_from(source, sample_count);
        state.cached_round = Some(round);
        state.has_rendered = true;
        state.last_sample_count = sample_count;
    }
}

impl SignalProducer for Feed {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        self.state.buffer.silence(0, sample_count);
        self.state.mark_round_as_silent(round);
        Rendering::Ready
    }

    fn render(&mut self, _round: Round, _first: usize, _last: usize, _buffer: &mut Buffer) {}
}

/// A producer that renders nothing but silence.
#[derive(Debug)]
pub struct Silence {
    state: ProducerState,
}

impl Silence {
    /// Silent producer with `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            state: ProducerState::new(channels),
        }
    }
}

impl SignalProducer for Silence {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        self.state.buffer.silence(0, sample_count);
        self.state.mark_round_as_silent(round);
        Rendering::Ready
    }

    fn render(&mut self, _round: Round, _first: usize, _last: usize, _buffer: &mut Buffer) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVT_SET: EventType = 1;

    /// Writes a constant that scheduled events can change, and records the
    /// segments it was asked to render.
    struct Stepper {
        state: ProducerState,
        value: Sample,
        segments: Vec<(usize, usize)>,
        bypass: bool,
    }

    impl Stepper {
        fn new(channels: usize) -> Self {
            Self {
                state: ProducerState::new(channels),
                value: 0.0,
                segments: Vec::new(),
                bypass: false,
            }
        }
    }

    impl SignalProducer for Stepper {
        fn state(&self) -> &ProducerState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ProducerState {
            &mut self.state
        }

        fn initialize_rendering(&mut self, _round: Round, sample_count: usize) -> Rendering {
            if self.bypass {
                self.state.buffer_mut().channel_mut(0)[..sample_count].fill(-1.0);
                return Rendering::Ready;
            }

            Rendering::Render
        }

        fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
            self.segments.push((first, last));

            for channel in buffer.channels_mut() {
                channel[first..last].fill(self.value);
            }
        }

        fn handle_event(&mut self, event: &Event) {
            if event.kind == EVT_SET {
                self.value = event.number_param_1;
            }
        }
    }

    #[test]
    fn renders_once_per_round() {
        let mut stepper = Stepper::new(1);
        stepper.set_block_size(4);

        produce(&mut stepper, 1, 4);
        produce(&mut stepper, 1, 4);

        assert_eq!(stepper.segments, vec![(0, 4)]);

        produce(&mut stepper, 2, 4);
        assert_eq!(stepper.segments.len(), 2);
    }

    #[test]
    fn events_split_the_block_at_sample_boundaries() {
        let mut stepper = Stepper::new(2);
        stepper.set_block_size(5);
        stepper.set_sample_rate(10.0);
        stepper
            .state_mut()
            .schedule(Event::new(EVT_SET, 0.21).with_numbers(2.0, 0.0));
        stepper
            .state_mut()
            .schedule(Event::new(EVT_SET, 0.3).with_numbers(3.0, 0.0));

        let output = produce(&mut stepper, 1, 5);

        assert_eq!(&output.channel(0)[..5], &[0.0, 0.0, 0.0, 3.0, 3.0]);
        assert_eq!(&output.channel(1)[..5], &[0.0, 0.0, 0.0, 3.0, 3.0]);
        assert_eq!(stepper.segments, vec![(0, 3), (3, 5)]);
    }

    #[test]
    fn events_beyond_the_block_stay_queued() {
        let mut stepper = Stepper::new(1);
        stepper.set_block_size(4);
        stepper.set_sample_rate(4.0);
        stepper
            .state_mut()
            .schedule(Event::new(EVT_SET, 1.5).with_numbers(7.0, 0.0));

        let first = produce(&mut stepper, 1, 4).channel(0)[..4].to_vec();
        assert_eq!(first, vec![0.0; 4]);
        assert_eq!(stepper.state().events().len(), 1);

        let second = produce(&mut stepper, 2, 4).channel(0)[..4].to_vec();
        assert_eq!(second, vec![0.0, 0.0, 7.0, 7.0]);
        assert!(stepper.state().events().is_empty());
        assert_eq!(stepper.state().current_time(), 0.0);
    }

    #[test]
    fn ready_from_initialize_rendering_skips_render() {
        let mut stepper = Stepper::new(1);
        stepper.set_block_size(3);
        stepper.bypass = true;

        let output = produce(&mut stepper, 1, 3);

        assert_eq!(&output.channel(0)[..3], &[-1.0, -1.0, -1.0]);
        assert!(stepper.segments.is_empty());
    }

    #[test]
    fn cancel_events_at_keeps_earlier_events() {
        let mut state = ProducerState::new(1);
        state.schedule(Event::new(EVT_SET, 1.0));
        state.schedule(Event::new(EVT_SET, 2.0));
        state.schedule(Event::new(EVT_SET, 3.0));

        state.cancel_events_at(2.0);

        let times: Vec<_> = state.events().iter().map(|e| (e.kind, e.time_offset)).collect();
        assert_eq!(times, vec![(EVT_SET, 1.0), (EVT_CANCEL, 2.0)]);

        state.cancel_events_after(1.0);
        let times: Vec<_> = state.events().iter().map(|e| (e.kind, e.time_offset)).collect();
        assert_eq!(times, vec![(EVT_SET, 1.0), (EVT_CANCEL, 1.0)]);

        assert_eq!(state.last_event_time_offset(), 1.0);
        assert!(state.has_events_after(0.5));
        assert!(!state.has_events_after(1.0));
    }

    #[test]
    fn silence_is_detected_and_cached_per_round() {
        let mut stepper = Stepper::new(1);
        stepper.set_block_size(4);

        assert!(stepper.is_silent(0, 4), "never rendered");

        produce(&mut stepper, 1, 4);
        assert!(stepper.is_silent(1, 4));

        stepper.value = 0.5;
        produce(&mut stepper, 2, 4);
        assert!(!stepper.is_silent(2, 4));

        stepper.state_mut().mark_round_as_silent(2);
        assert!(stepper.is_silent(2, 4));
    }

    #[test]
    fn bpm_changes_below_the_minimum_are_ignored() {
        let mut stepper = Stepper::new(1);

        stepper.set_bpm(0.0);
        assert_eq!(stepper.state().bpm(), DEFAULT_BPM);

        stepper.set_bpm(120.0);
        assert_eq!(stepper.state().bpm(), 120.0);
    }

    #[test]
    fn reset_drops_events_and_silences_the_buffer() {
        let mut stepper = Stepper::new(1);
        stepper.set_block_size(2);
        stepper.value = 1.0;
        produce(&mut stepper, 1, 2);
        stepper
            .state_mut()
            .schedule(Event::new(EVT_SET, 5.0).with_numbers(3.0, 0.0));

        stepper.reset();

        assert_eq!(&stepper.state().buffer().channel(0)[..2], &[0.0, 0.0]);
        assert!(stepper
            .state()
            .events()
            .iter()
            .all(|event| event.kind == EVT_CANCEL));
    }

    #[test]
    fn tap_holds_the_previous_block() {
        let mut stepper = Stepper::new(1);
        stepper.set_block_size(2);
        let tap = stepper.state_mut().attach_tap();

        assert_eq!(tap.borrow().block().1, 0);

        stepper.value = 0.25;
        produce(&mut stepper, 1, 2);

        let tap = tap.borrow();
        let (block, count) = tap.block();
        assert_eq!(count, 2);
        assert_eq!(&block.channel(0)[..2], &[0.25, 0.25]);
    }

    #[test]
    fn shared_producer_renders_the_inner_producer_once() {
        let inner = shared(Stepper::new(1));
        inner.borrow_mut().set_block_size(3);
        inner.borrow_mut().value = 0.5;

        let mut a = SharedProducer::new(Rc::clone(&inner));
        let mut b = SharedProducer::new(Rc::clone(&inner));
        a.set_block_size(3);
        b.set_block_size(3);

        assert_eq!(&produce(&mut a, 1, 3).channel(0)[..3], &[0.5; 3]);
        assert_eq!(&produce(&mut b, 1, 3).channel(0)[..3], &[0.5; 3]);
        assert_eq!(inner.borrow().segments.len(), 1);
    }

    #[test]
    fn feed_serves_the_fed_block_and_silence_otherwise() {
        let mut source = Buffer::new(2, 4);
        source.channel_mut(0).copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        source.channel_mut(1).copy_from_slice(&[0.5; 4]);

        let mut feed = Feed::new(2);
        feed.set_block_size(4);
        feed.feed(1, &source, 4);

        assert_eq!(&produce(&mut feed, 1, 4).channel(0)[..4], &[0.1, 0.2, 0.3, 0.4]);
        assert!(!feed.is_silent(1, 4));

        assert_eq!(&produce(&mut feed, 2, 4).channel(1)[..4], &[0.0; 4]);
        assert!(feed.is_silent(2, 4));
    }
}
