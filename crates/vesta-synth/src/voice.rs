//! A synthesizer voice.
//!
//! `Oscillator → Filter 1 → Wavefolder → [Distortion] → Filter 2 → Volume`,
//! panned to stereo. Every parameter follows a leader from
//! [`VoiceParams`]; envelopes and per-channel controllers make a follower
//! render on its own.

use core::f64::consts::FRAC_PI_4;
use std::rc::Rc;

use vesta_core::math;
use vesta_core::{
    BiquadFilter, BiquadFilterSharedBuffers, Buffer, ENVELOPE_RANDOMS, EnvelopeRandoms,
    FilterInaccuracy, FloatParam, Frequency, LfoEnvelopeMapping, Modulator, Number, Oscillator,
    OscillatorInaccuracy, ProducerState, Rendering, Round, Sample, Seconds, Shared, SignalProducer,
    constant_or_rendered, produce, rendered, shared,
};
use vesta_effects::{Distortion, Wavefolder};

use crate::frequency::FrequencyTable;
use crate::params::{ModulationLevels, VoiceParams};

/// Pitch to stereo position scale of the width parameter.
pub const NOTE_PANNING_SCALE: Number = 2.0 / 127.0;
/// Fade time of a note that is cut short.
pub const SMOOTH_NOTE_CANCELLATION_DURATION: Seconds = 0.01;

const DETUNE_SCALE: Number = 0.01;
const DECAY_THRESHOLD: Number = 0.000001;
const PORTAMENTO_DEPTH_INSIGNIFICANT: Number = 0.01;
const GLIDE_INSIGNIFICANT: Seconds = 0.000001;
const RANDOM_STEP: Number = 0.618_033_988_749_895;

/// Oscillator through the first filter.
pub type Filtered = BiquadFilter<Oscillator>;
/// First filter through the wavefolder.
pub type Folded = Wavefolder<Filtered>;
/// Wavefolder through the carrier distortion.
pub type Distorted = Distortion<Folded>;

/// The stage between the wavefolder and the second filter.
pub trait VoiceStage: SignalProducer + Sized {
    /// Wrap the wavefolder of a new voice.
    fn build(folded: Folded, params: &VoiceParams) -> Self;

    /// The wavefolder.
    fn folded(&self) -> &Folded;

    /// The wavefolder, mutably.
    fn folded_mut(&mut self) -> &mut Folded;

    /// Level of the distortion, for stages that have one.
    fn distortion_level_mut(&mut self) -> Option<&mut FloatParam>;
}

impl VoiceStage for Folded {
    fn build(folded: Folded, _params: &VoiceParams) -> Self {
        folded
    }

    fn folded(&self) -> &Folded {
        self
    }

    fn folded_mut(&mut self) -> &mut Folded {
        self
    }

    fn distortion_level_mut(&mut self) -> Option<&mut FloatParam> {
        None
    }
}

impl VoiceStage for Distorted {
    fn build(folded: Folded, params: &VoiceParams) -> Self {
        match &params.distortion {
            Some(leaders) => Distortion::with_leaders(folded, Rc::clone(&leaders.shape), &leaders.level),
            None => Distortion::fixed(
                &format!("{}D", params.prefix()),
                folded,
                crate::params::CARRIER_DISTORTION_SHAPE,
            ),
        }
    }

    fn folded(&self) -> &Folded {
        self.input()
    }

    fn folded_mut(&mut self) -> &mut Folded {
        self.input_mut()
    }

    fn distortion_level_mut(&mut self) -> Option<&mut FloatParam> {
        Some(&mut self.level)
    }
}

/// Voice that modulates a carrier; no distortion stage.
pub type ModulatorVoice = Voice<Folded>;
/// Voice whose oscillator is modulated by a [`ModulatorVoice`].
pub type CarrierVoice = Voice<Distorted>;

/// A note event addressed to a voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    /// Seconds from the start of the next block.
    pub time_offset: Seconds,
    /// Identifies the note across on and off events.
    pub id: u64,
    /// MIDI note.
    pub note: u8,
    /// MIDI channel, `0..16`.
    pub channel: u8,
    /// Velocity in `[0, 1]`.
    pub velocity: Number,
}

/// What a voice needs to know besides the note.
#[derive(Clone, Copy)]
pub struct NoteContext<'a> {
    /// Note to glide from when the portamento depth is zero.
    pub previous_note: u8,
    /// Note frequencies.
    pub frequencies: &'a dyn FrequencyTable,
    /// Amount envelopes of the LFOs.
    pub lfo_envelopes: &'a LfoEnvelopeMapping,
    /// Drift state to copy, so that paired voices drift together.
    pub synced_inaccuracy: Option<&'a OscillatorInaccuracy>,
    /// Channel the parameters read controllers on.
    pub controller_channel: u8,
}

/// Coefficient buffers shared by the filters of one voice kind.
#[derive(Debug, Clone)]
pub struct FilterBuffers {
    /// Shared by every first filter.
    pub filter_1: Shared<BiquadFilterSharedBuffers>,
    /// Shared by every second filter.
    pub filter_2: Shared<BiquadFilterSharedBuffers>,
}

impl FilterBuffers {
    /// Empty buffers.
    pub fn new() -> Self {
        Self {
            filter_1: shared(BiquadFilterSharedBuffers::new()),
            filter_2: shared(BiquadFilterSharedBuffers::new()),
        }
    }
}

impl Default for FilterBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplies its input by note velocity and volume.
#[derive(Debug)]
pub struct VolumeApplier<I: SignalProducer> {
    state: ProducerState,
    input: I,
    /// Velocity of the current note after the sensitivity curve.
    pub velocity: FloatParam,
    /// Output level.
    pub volume: FloatParam,
    velocity_value: Option<Number>,
    volume_value: Option<Number>,
}

impl<I: SignalProducer> VolumeApplier<I> {
    /// Volume stage over `input` with the volume following `volume_leader`.
    pub fn new(input: I, volume_leader: &Shared<FloatParam>) -> Self {
        let channels = input.state().channels();

        Self {
            state: ProducerState::new(channels),
            input,
            velocity: FloatParam::new("NV", 0.0, 1.0, 1.0),
            volume: FloatParam::follower(volume_leader),
            velocity_value: None,
            volume_value: None,
        }
    }

    /// The scaled producer.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The scaled producer, mutably.
    pub fn input_mut(&mut self) -> &mut I {
        &mut self.input
    }
}

impl<I: SignalProducer> SignalProducer for VolumeApplier<I> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.input);
        visitor(&mut self.velocity);
        visitor(&mut self.volume);
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.input, round, sample_count);
        self.velocity_value = constant_or_rendered(&mut self.velocity, round, sample_count);
        self.volume_value = constant_or_rendered(&mut self.volume, round, sample_count);

        if self.input.is_silent(round, sample_count) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let input = self.input.state().buffer();
        let velocities = rendered(&self.velocity);
        let volumes = rendered(&self.volume);

        for (c, output) in buffer.channels_mut().iter_mut().enumerate() {
            let input = &input.channel(c)[first..last];
            let output = &mut output[first..last];

            if let (Some(velocity), Some(volume)) = (self.velocity_value, self.volume_value) {
                let gain = velocity * volume;

                for (out, sample) in output.iter_mut().zip(input) {
                    *out = gain * sample;
                }

                continue;
            }

            for (i, (out, sample)) in output.iter_mut().zip(input).enumerate() {
                let velocity = self.velocity_value.unwrap_or_else(|| velocities[first + i]);
                let volume = self.volume_value.unwrap_or_else(|| volumes[first + i]);
                *out = velocity * volume * sample;
            }
        }
    }
}

/// Whether the voice holds a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// Released or never triggered; may still be fading out.
    #[default]
    Off,
    /// Holding a note.
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamRole {
    /// Scales the output; its release decides when the oscillator stops.
    Level,
    Other,
}

/// Leaders read once per note.
#[derive(Debug, Clone)]
struct NoteSettings {
    velocity_sensitivity: Shared<FloatParam>,
    portamento_length: Shared<FloatParam>,
    portamento_depth: Shared<FloatParam>,
    detune: Shared<FloatParam>,
    fine_detune: Shared<FloatParam>,
    width: Shared<FloatParam>,
    inaccuracy: Shared<FloatParam>,
    instability: Shared<FloatParam>,
}

fn leader_value(leader: &Shared<FloatParam>) -> Number {
    leader.try_borrow().map_or(0.0, |leader| leader.value())
}

/// One voice: a mono chain panned to stereo.
pub struct Voice<S: VoiceStage> {
    state: ProducerState,
    output: VolumeApplier<BiquadFilter<S>>,
    panning: FloatParam,
    note_panning: FloatParam,
    settings: NoteSettings,
    inaccuracy: OscillatorInaccuracy,
    lifecycle: VoiceState,
    note_id: u64,
    note: u8,
    channel: u8,
    panning_value: Option<Number>,
    note_panning_value: Option<Number>,
}

impl<S: VoiceStage> core::fmt::Debug for Voice<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Voice")
            .field("lifecycle", &self.lifecycle)
            .field("note_id", &self.note_id)
            .field("note", &self.note)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl<S: VoiceStage> Voice<S> {
    /// Voice number `index` following `params`. Carriers pass the levels and
    /// the source of their modulation.
    pub fn new(
        params: &VoiceParams,
        index: usize,
        buffers: &FilterBuffers,
        modulation: Option<(&ModulationLevels, Shared<dyn Modulator>)>,
    ) -> Self {
        let (levels, modulator) = match modulation {
            Some((levels, modulator)) => (Some(levels), Some(modulator)),
            None => (None, None),
        };

        let filter_inaccuracy =
            || FilterInaccuracy::new(Rc::clone(&params.inaccuracy), Rc::clone(&params.inaccuracy));

        let oscillator = Oscillator::from_leaders(&params.oscillator_leaders(levels), modulator);
        let filter_1 = BiquadFilter::from_leaders(
            oscillator,
            &params.filter_1,
            Some(Rc::clone(&buffers.filter_1)),
        )
        .with_inaccuracy(filter_inaccuracy());
        let stage = S::build(Wavefolder::with_leader(filter_1, &params.folding), params);
        let filter_2 =
            BiquadFilter::from_leaders(stage, &params.filter_2, Some(Rc::clone(&buffers.filter_2)))
                .with_inaccuracy(filter_inaccuracy());

        Self {
            state: ProducerState::new(2),
            output: VolumeApplier::new(filter_2, &params.volume),
            panning: FloatParam::follower(&params.panning),
            note_panning: FloatParam::new("NP", -1.0, 1.0, 0.0),
            settings: NoteSettings {
                velocity_sensitivity: Rc::clone(&params.velocity_sensitivity),
                portamento_length: Rc::clone(&params.portamento_length),
                portamento_depth: Rc::clone(&params.portamento_depth),
                detune: Rc::clone(&params.detune),
                fine_detune: Rc::clone(&params.fine_detune),
                width: Rc::clone(&params.width),
                inaccuracy: Rc::clone(&params.inaccuracy),
                instability: Rc::clone(&params.instability),
            },
            inaccuracy: OscillatorInaccuracy::new(OscillatorInaccuracy::calculate_seed(index)),
            lifecycle: VoiceState::Off,
            note_id: 0,
            note: 0,
            channel: 0,
            panning_value: None,
            note_panning_value: None,
        }
    }

    // Lifecycle

    /// Start `event`. Ignored while a note is held.
    pub fn note_on(&mut self, event: &NoteEvent, context: &NoteContext<'_>) {
        if self.lifecycle == VoiceState::On {
            return;
        }

        let time_offset = event.time_offset;

        self.save_note(event);
        self.lifecycle = VoiceState::On;

        match context.synced_inaccuracy {
            Some(synced) => self.inaccuracy.clone_from(synced),
            None => self.inaccuracy.update(),
        }

        self.set_up_note_params(time_offset, event, None);
        self.oscillator_mut().state_mut().cancel_events_at(time_offset);

        let randoms = self.envelope_randoms();
        let channel = context.controller_channel;
        let lfo_envelopes = context.lfo_envelopes;

        self.for_each_param(&mut |_, param| {
            param.set_midi_channel(channel);
            param.set_envelope_randoms(randoms);
            param.start_envelope(time_offset);
            param.start_lfo_envelope(time_offset, lfo_envelopes);
        });

        self.set_up_oscillator_frequency(time_offset, event, context);
        self.update_filter_inaccuracy();
        self.oscillator_mut().start(time_offset);
    }

    /// Fade out the current note, then start `event`.
    pub fn retrigger(&mut self, event: &NoteEvent, context: &NoteContext<'_>) {
        self.cancel_note_smoothly(event.time_offset);

        let delayed = NoteEvent {
            time_offset: event.time_offset + SMOOTH_NOTE_CANCELLATION_DURATION,
            ..*event
        };

        self.note_on(&delayed, context);
    }

    /// Move the held note to `event` over the portamento length, keeping
    /// envelopes running. Without portamento the voice is retriggered.
    pub fn glide_to(&mut self, event: &NoteEvent, context: &NoteContext<'_>) {
        let length = leader_value(&self.settings.portamento_length);

        if length <= GLIDE_INSIGNIFICANT {
            self.retrigger(event, context);
            return;
        }

        let time_offset = event.time_offset;

        self.save_note(event);
        self.set_up_note_params(time_offset, event, Some(length));

        let target = context.frequencies.frequency(event.note, event.channel);
        let frequency = &mut self.oscillator_mut().frequency;

        frequency.cancel_events_at(time_offset);
        frequency.schedule_linear_ramp(length, target);
    }

    /// Release the note `id` playing `note`. Other notes are ignored. The
    /// oscillator stops when the longest level release ends.
    pub fn note_off(&mut self, time_offset: Seconds, id: u64, note: u8) {
        if self.lifecycle != VoiceState::On || self.note_id != id || self.note != note {
            return;
        }

        self.lifecycle = VoiceState::Off;

        let mut release: Seconds = 0.0;

        self.for_each_param(&mut |role, param| {
            let param_release = param.end_envelope(time_offset);

            if role == ParamRole::Level {
                release = release.max(param_release);
            }
        });

        let off_after = time_offset + release;
        let oscillator = self.oscillator_mut();

        oscillator.state_mut().cancel_events_at(off_after);
        oscillator.stop(off_after);
    }

    /// Fade out over [`SMOOTH_NOTE_CANCELLATION_DURATION`] and stop.
    pub fn cancel_note_smoothly(&mut self, time_offset: Seconds) {
        self.lifecycle = VoiceState::Off;

        self.for_each_param(&mut |_, param| {
            param.cancel_envelope(time_offset, SMOOTH_NOTE_CANCELLATION_DURATION);
        });

        let off_after = time_offset + SMOOTH_NOTE_CANCELLATION_DURATION;
        let oscillator = self.oscillator_mut();

        oscillator.state_mut().cancel_events_at(off_after);
        oscillator.stop(off_after);
    }

    /// Whether a held note went silent for good: the volume or the
    /// amplitude envelope settled at zero and ends at zero.
    pub fn has_decayed_before_note_off(&self) -> bool {
        self.lifecycle == VoiceState::On
            && (has_decayed(&self.output.volume) || has_decayed(&self.oscillator().amplitude))
    }

    /// Forward voice status flags to every parameter.
    pub fn set_status(&mut self, status: u8) {
        self.for_each_param(&mut |_, param| param.set_voice_status(status));
    }

    // State

    /// Whether the voice holds a note or is still fading out.
    pub fn is_on(&self) -> bool {
        !self.is_off_after(0.0)
    }

    /// Whether the voice is released and silent `time_offset` seconds from
    /// now.
    pub fn is_off_after(&self, time_offset: Seconds) -> bool {
        let oscillator = self.oscillator().state();

        self.lifecycle == VoiceState::Off
            && !oscillator.has_events_after(oscillator.current_time() + time_offset)
    }

    /// Whether the voice holds a note.
    pub fn lifecycle(&self) -> VoiceState {
        self.lifecycle
    }

    /// Id of the last note.
    pub fn note_id(&self) -> u64 {
        self.note_id
    }

    /// Last note.
    pub fn note(&self) -> u8 {
        self.note
    }

    /// Channel of the last note.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Current output level: volume times amplitude.
    pub fn level(&self) -> Number {
        self.output.volume.value() * self.oscillator().amplitude.value()
    }

    /// The drift generator.
    pub fn inaccuracy(&self) -> &OscillatorInaccuracy {
        &self.inaccuracy
    }

    // Chain access

    /// The oscillator.
    pub fn oscillator(&self) -> &Oscillator {
        self.filter_1().input()
    }

    /// The oscillator, mutably.
    pub fn oscillator_mut(&mut self) -> &mut Oscillator {
        self.filter_1_mut().input_mut()
    }

    /// The filter after the oscillator.
    pub fn filter_1(&self) -> &Filtered {
        self.stage().folded().input()
    }

    /// The filter after the oscillator, mutably.
    pub fn filter_1_mut(&mut self) -> &mut Filtered {
        self.stage_mut().folded_mut().input_mut()
    }

    /// The stage between the wavefolder and the second filter.
    pub fn stage(&self) -> &S {
        self.output.input().input()
    }

    /// The stage between the wavefolder and the second filter, mutably.
    pub fn stage_mut(&mut self) -> &mut S {
        self.output.input_mut().input_mut()
    }

    /// The filter before the volume stage.
    pub fn filter_2(&self) -> &BiquadFilter<S> {
        self.output.input()
    }

    /// The volume stage; its output is the mono signal of the voice.
    pub fn volume_applier(&self) -> &VolumeApplier<BiquadFilter<S>> {
        &self.output
    }

    // Internals

    fn save_note(&mut self, event: &NoteEvent) {
        self.note_id = event.id;
        self.note = event.note;
        self.channel = event.channel;
    }

    /// Schedule velocity and pitch panning of `event`, ramping over `glide`
    /// when given.
    fn set_up_note_params(&mut self, time_offset: Seconds, event: &NoteEvent, glide: Option<Seconds>) {
        let velocity = calculate_velocity(leader_value(&self.settings.velocity_sensitivity), event.velocity);
        let detune = leader_value(&self.settings.detune) + leader_value(&self.settings.fine_detune);
        let panning = calculate_note_panning(leader_value(&self.settings.width), event.note, detune);

        for (param, value) in [
            (&mut self.output.velocity, velocity),
            (&mut self.note_panning, panning),
        ] {
            param.cancel_events_at(time_offset);

            match glide {
                Some(length) => param.schedule_linear_ramp(length, value),
                None => param.schedule_value(time_offset, value),
            }
        }
    }

    fn set_up_oscillator_frequency(&mut self, time_offset: Seconds, event: &NoteEvent, context: &NoteContext<'_>) {
        let note_frequency = context.frequencies.frequency(event.note, event.channel);
        let length = leader_value(&self.settings.portamento_length);
        let depth = leader_value(&self.settings.portamento_depth);
        let sampling_period = self.state.sampling_period();
        let frequency = &mut self.oscillator_mut().frequency;

        frequency.cancel_events_at(time_offset);

        if length <= sampling_period {
            frequency.schedule_value(time_offset, note_frequency);
            return;
        }

        let start: Frequency = if depth.abs() < PORTAMENTO_DEPTH_INSIGNIFICANT {
            context.frequencies.frequency(context.previous_note, event.channel)
        } else {
            math::detune(note_frequency, depth)
        };

        frequency.schedule_value(time_offset, start);
        frequency.schedule_linear_ramp(length, note_frequency);
    }

    fn random(&self, index: usize) -> Number {
        math::randomize(1.0, (self.inaccuracy.value() + index as Number * RANDOM_STEP).fract())
    }

    fn envelope_randoms(&self) -> EnvelopeRandoms {
        core::array::from_fn(|i| self.random(i))
    }

    fn update_filter_inaccuracy(&mut self) {
        let randoms = [
            self.random(ENVELOPE_RANDOMS),
            self.random(ENVELOPE_RANDOMS + 1),
            self.random(ENVELOPE_RANDOMS + 2),
            self.random(ENVELOPE_RANDOMS + 3),
        ];

        self.filter_1_mut().update_inaccuracy(randoms[0], randoms[1]);
        self.output.input_mut().update_inaccuracy(randoms[2], randoms[3]);
    }

    fn apply_inaccuracy(&mut self, sample_count: usize) {
        let level = leader_value(&self.settings.inaccuracy);
        let instability = leader_value(&self.settings.instability);
        let mut cents = self.inaccuracy.detune_cents(level);

        if instability > 0.0 {
            let elapsed = self.state.sample_count_to_relative_time_offset(sample_count);
            cents += self.inaccuracy.drift(instability, elapsed);
        }

        self.oscillator_mut().set_inaccuracy(cents);
    }

    /// Visit every per-note parameter of the chain.
    fn for_each_param(&mut self, visit: &mut dyn FnMut(ParamRole, &mut FloatParam)) {
        visit(ParamRole::Other, &mut self.panning);
        visit(ParamRole::Level, &mut self.output.volume);

        let filter_2 = self.output.input_mut();
        visit(ParamRole::Other, &mut filter_2.frequency);
        visit(ParamRole::Other, &mut filter_2.q);
        visit(ParamRole::Other, &mut filter_2.gain);

        let stage = filter_2.input_mut();

        if let Some(level) = stage.distortion_level_mut() {
            visit(ParamRole::Other, level);
        }

        let folded = stage.folded_mut();
        visit(ParamRole::Other, &mut folded.folding);

        let filter_1 = folded.input_mut();
        visit(ParamRole::Other, &mut filter_1.frequency);
        visit(ParamRole::Other, &mut filter_1.q);
        visit(ParamRole::Other, &mut filter_1.gain);

        let oscillator = filter_1.input_mut();
        visit(ParamRole::Level, oscillator.modulated_amplitude.param_mut());
        visit(ParamRole::Other, oscillator.modulated_amplitude.level_mut());
        visit(ParamRole::Level, &mut oscillator.amplitude);
        visit(ParamRole::Other, &mut oscillator.frequency);
        visit(ParamRole::Other, oscillator.phase.param_mut());
        visit(ParamRole::Other, oscillator.phase.level_mut());
        visit(ParamRole::Other, &mut oscillator.detune);
        visit(ParamRole::Other, oscillator.fine_detune.param_mut());
        visit(ParamRole::Other, oscillator.fine_detune.level_mut());
        visit(ParamRole::Other, &mut oscillator.subharmonic_amplitude);
    }
}

fn has_decayed(param: &FloatParam) -> bool {
    let Some(envelope) = param.envelope() else {
        return false;
    };

    let final_value = envelope
        .try_borrow()
        .map_or(Number::MAX, |envelope| envelope.final_value.value());

    final_value < DECAY_THRESHOLD && param.has_envelope_decayed(DECAY_THRESHOLD)
}

/// Loudness of a note of `velocity` in `[0, 1]`. Sensitivities up to 1 blend
/// from full level to linear; above 1 soft notes are pushed further down.
pub fn calculate_velocity(sensitivity: Number, velocity: Number) -> Number {
    if sensitivity <= 1.0 {
        1.0 - sensitivity + sensitivity * velocity
    } else {
        velocity + (sensitivity - 1.0) * (velocity.powi(4) - velocity)
    }
}

/// Stereo position of `note` detuned by `detune` cents, spread by `width`.
pub fn calculate_note_panning(width: Number, note: u8, detune: Number) -> Number {
    let position = NOTE_PANNING_SCALE * (Number::from(note) + detune * DETUNE_SCALE) - 1.0;

    position.clamp(-1.0, 1.0) * width
}

impl<S: VoiceStage> SignalProducer for Voice<S> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.output);
        visitor(&mut self.panning);
        visitor(&mut self.note_panning);
    }

    fn reset_state(&mut self) {
        self.lifecycle = VoiceState::Off;
        self.note_id = 0;
        self.note = 0;
        self.channel = 0;
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        self.apply_inaccuracy(sample_count);

        produce(&mut self.output, round, sample_count);
        self.panning_value = constant_or_rendered(&mut self.panning, round, sample_count);
        self.note_panning_value = constant_or_rendered(&mut self.note_panning, round, sample_count);

        if self.output.is_silent(round, sample_count) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let input = &self.output.state().buffer().channel(0)[first..last];
        let pannings = rendered(&self.panning);
        let note_pannings = rendered(&self.note_panning);

        let [left, right] = buffer.channels_mut() else {
            return;
        };

        let gains = |panning: Number, note_panning: Number| {
            let x = ((panning + note_panning).clamp(-1.0, 1.0) + 1.0) * FRAC_PI_4;
            let (sin, cos) = math::sincos(x);
            (cos, sin)
        };

        if let (Some(panning), Some(note_panning)) = (self.panning_value, self.note_panning_value) {
            let (left_gain, right_gain) = gains(panning, note_panning);

            for (i, sample) in input.iter().enumerate() {
                left[first + i] = left_gain * sample;
                right[first + i] = right_gain * sample;
            }

            return;
        }

        for (i, sample) in input.iter().enumerate() {
            let n = first + i;
            let panning = self.panning_value.unwrap_or_else(|| pannings[n]);
            let note_panning = self.note_panning_value.unwrap_or_else(|| note_pannings[n]);
            let (left_gain, right_gain) = gains(panning, note_panning);

            left[n] = left_gain * sample;
            right[n] = right_gain * sample;
        }
    }
}

impl<S: VoiceStage> Modulator for Voice<S> {
    fn modulation_signal(&mut self, round: Round, sample_count: usize) -> &[Sample] {
        &produce(&mut self.output, round, sample_count).channel(0)[..sample_count]
    }
}
