//! The synthesizer: voice pool, note routing, controllers and effects.

use std::rc::Rc;

use vesta_config::{
    ChorusSettings, ConfigError, EchoSettings, EngineConfig, MAX_POLYPHONY, ReverbSettings,
    SideChainSettings, StealPolicy,
};
use vesta_core::{
    ALL_CHANNELS, Buffer, ByteParam, Envelope, FloatParam, Lfo, LfoEnvelopeMapping, MIDI_CHANNELS,
    Macro, MidiController, Modulator, Number, OFF, ON, PARAM_DEFAULT_MPE_CHANNEL, ProducerState,
    Rendering, Round, Sample, Seconds, Shared, SignalProducer, VOICE_STATUS_HIGHEST,
    VOICE_STATUS_LAST, VOICE_STATUS_LOWEST, VOICE_STATUS_OLDEST, constant_or_rendered, is_on,
    produce, produce_if_not_constant, rendered, shared,
};
use vesta_effects::{Effects, SideChainCompressor};

use crate::frequency::{A4_NOTE, EqualTemperament, FrequencyTable, NOTES};
use crate::params::{SynthParams, split_note};
use crate::voice::{
    CarrierVoice, FilterBuffers, ModulatorVoice, NoteContext, NoteEvent, Voice, VoiceStage,
    VoiceState,
};

/// Number of envelope slots.
pub const ENVELOPES: usize = 12;
/// Number of LFO slots.
pub const LFOS: usize = 8;
/// Number of macro slots.
pub const MACROS: usize = 20;
/// Number of continuous controllers.
pub const CONTROL_CHANGES: usize = 128;
/// Output samples are clamped to `±OUTPUT_LIMIT`.
pub const OUTPUT_LIMIT: Sample = 2.8;

/// Sustain pedal controller number.
pub const SUSTAIN_PEDAL: u8 = 64;
/// Channel mode message silencing every voice at once.
pub const ALL_SOUND_OFF: u8 = 120;
/// Channel mode message releasing every held note.
pub const ALL_NOTES_OFF: u8 = 123;

const MODULATOR_MIX_INSIGNIFICANT: Number = 0.000001;
const MONO_SLOT: usize = 0;

/// Source driving a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    /// The parameter keeps its own value.
    None,
    /// Continuous controller `0..128`.
    ControlChange(u8),
    /// Pitch bend wheel, resting at the center.
    PitchWheel,
    /// Channel aftertouch.
    ChannelPressure,
    /// Note number of the latest note.
    Note,
    /// Velocity of the latest note.
    Velocity,
    /// Macro slot.
    Macro(usize),
    /// LFO slot.
    Lfo(usize),
}

/// Mix of every voice: carriers plus modulators at the modulator volume.
pub struct Bus {
    state: ProducerState,
    modulators: Vec<Shared<ModulatorVoice>>,
    carriers: Vec<CarrierVoice>,
    modulator_add_volume: FloatParam,
    mix_value: Option<Number>,
    rendered_modulators: Vec<bool>,
    rendered_carriers: Vec<bool>,
}

impl core::fmt::Debug for Bus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bus")
            .field("voices", &self.carriers.len())
            .finish_non_exhaustive()
    }
}

impl Bus {
    /// `polyphony` carrier voices, each modulated by its own modulator voice.
    pub fn new(params: &SynthParams, polyphony: usize) -> Self {
        let modulator_buffers = FilterBuffers::new();
        let carrier_buffers = FilterBuffers::new();
        let mut modulators = Vec::with_capacity(polyphony);
        let mut carriers = Vec::with_capacity(polyphony);

        for index in 0..polyphony {
            let modulator = shared(Voice::new(&params.modulator, index, &modulator_buffers, None));
            let source: Shared<dyn Modulator> = modulator.clone();

            carriers.push(Voice::new(
                &params.carrier,
                index,
                &carrier_buffers,
                Some((&params.modulation, source)),
            ));
            modulators.push(modulator);
        }

        Self {
            state: ProducerState::new(2),
            modulators,
            carriers,
            modulator_add_volume: FloatParam::follower(&params.modulator_add_volume),
            mix_value: None,
            rendered_modulators: vec![false; polyphony],
            rendered_carriers: vec![false; polyphony],
        }
    }

    /// Number of voice pairs.
    pub fn polyphony(&self) -> usize {
        self.carriers.len()
    }

    /// Modulator voice of `slot`.
    pub fn modulator(&self, slot: usize) -> Option<&Shared<ModulatorVoice>> {
        self.modulators.get(slot)
    }

    /// Carrier voice of `slot`.
    pub fn carrier(&self, slot: usize) -> Option<&CarrierVoice> {
        self.carriers.get(slot)
    }

    /// Whether both voices of `slot` are silent `time_offset` seconds from
    /// now.
    pub fn is_slot_off_after(&self, slot: usize, time_offset: Seconds) -> bool {
        let modulator_off = self.modulators[slot]
            .try_borrow()
            .is_ok_and(|voice| voice.is_off_after(time_offset));

        modulator_off && self.carriers[slot].is_off_after(time_offset)
    }

    /// Combined level of both voices of `slot`.
    pub fn level(&self, slot: usize) -> Number {
        let modulator = self.modulators[slot]
            .try_borrow()
            .map_or(0.0, |voice| voice.level());

        modulator + self.carriers[slot].level()
    }

    fn add(
        output: &mut Buffer,
        voice: &dyn SignalProducer,
        weights: Option<&[Sample]>,
        weight: Number,
        first: usize,
        last: usize,
    ) {
        let source = voice.state().buffer();

        for (c, channel) in output.channels_mut().iter_mut().enumerate() {
            let input = &source.channel(c)[first..last];
            let channel = &mut channel[first..last];

            match weights {
                Some(weights) => {
                    let weights = &weights[first..last];

                    for ((out, sample), weight) in channel.iter_mut().zip(input).zip(weights) {
                        *out += weight * sample;
                    }
                }
                None => {
                    for (out, sample) in channel.iter_mut().zip(input) {
                        *out += weight * sample;
                    }
                }
            }
        }
    }
}

impl SignalProducer for Bus {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        for modulator in &self.modulators {
            if let Ok(mut modulator) = modulator.try_borrow_mut() {
                visitor(&mut *modulator);
            }
        }

        for carrier in &mut self.carriers {
            visitor(carrier);
        }

        visitor(&mut self.modulator_add_volume);
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        self.mix_value = constant_or_rendered(&mut self.modulator_add_volume, round, sample_count);

        let mix_modulators = self
            .mix_value
            .is_none_or(|mix| mix > MODULATOR_MIX_INSIGNIFICANT);
        let mut any = false;

        let slots = self
            .modulators
            .iter()
            .zip(&mut self.carriers)
            .zip(self.rendered_modulators.iter_mut().zip(&mut self.rendered_carriers));

        for ((modulator, carrier), (modulator_rendered, carrier_rendered)) in slots {
            *modulator_rendered = match modulator.try_borrow_mut() {
                Ok(mut voice) if voice.is_on() => {
                    produce(&mut *voice, round, sample_count);
                    mix_modulators
                }
                _ => false,
            };

            *carrier_rendered = carrier.is_on();

            if *carrier_rendered {
                produce(carrier, round, sample_count);
            }

            any |= *modulator_rendered || *carrier_rendered;
        }

        if !any {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        for channel in buffer.channels_mut() {
            channel[first..last].fill(0.0);
        }

        let mixes = self.mix_value.is_none().then(|| rendered(&self.modulator_add_volume));
        let mix = self.mix_value.unwrap_or(1.0);

        for (modulator, _) in self
            .modulators
            .iter()
            .zip(&self.rendered_modulators)
            .filter(|(_, rendered)| **rendered)
        {
            if let Ok(voice) = modulator.try_borrow() {
                Self::add(buffer, &*voice, mixes, mix, first, last);
            }
        }

        for (carrier, _) in self
            .carriers
            .iter()
            .zip(&self.rendered_carriers)
            .filter(|(_, rendered)| **rendered)
        {
            Self::add(buffer, carrier, None, 1.0, first, last);
        }
    }
}

/// Bookkeeping of the note a voice pair plays.
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    id: u64,
    note: u8,
    channel: u8,
    age: u64,
    held: bool,
}

/// Polyphonic two-operator synthesizer.
///
/// Every voice slot pairs a modulator voice with a carrier voice; the
/// modulator drives the carrier oscillator and is mixed into the output.
/// Note and controller methods take a time offset relative to the start of
/// the next block.
///
/// ```rust,ignore
/// use vesta_core::{SignalProducer, produce};
/// use vesta_synth::Synth;
///
/// let mut synth = Synth::new(16, Default::default());
/// synth.set_sample_rate(48000.0);
/// synth.note_on(0.0, 0, 60, 0.8);
///
/// let block = produce(&mut synth, 1, 256);
/// ```
pub struct Synth {
    state: ProducerState,
    effects: Effects<Bus>,
    params: SynthParams,
    leaders: Vec<Shared<FloatParam>>,
    selectors: Vec<Shared<ByteParam>>,
    control_changes: Vec<Shared<MidiController>>,
    pitch_wheel: Shared<MidiController>,
    channel_pressure: Shared<MidiController>,
    triggered_note: Shared<MidiController>,
    triggered_velocity: Shared<MidiController>,
    macros: Vec<Shared<Macro>>,
    envelopes: Vec<Shared<Envelope>>,
    lfos: Vec<Shared<Lfo>>,
    lfo_envelopes: LfoEnvelopeMapping,
    frequencies: Box<dyn FrequencyTable>,
    steal_policy: StealPolicy,
    slots: Vec<Slot>,
    assignments: [[Option<usize>; NOTES]; MIDI_CHANNELS],
    held_notes: Vec<NoteEvent>,
    delayed_note_offs: Vec<(usize, u64)>,
    next_slot: usize,
    next_note_id: u64,
    age: u64,
    previous_note: u8,
    sustain: bool,
}

impl core::fmt::Debug for Synth {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Synth")
            .field("polyphony", &self.slots.len())
            .field("steal_policy", &self.steal_policy)
            .field("sustain", &self.sustain)
            .finish_non_exhaustive()
    }
}

impl Synth {
    /// Synth with `polyphony` voice pairs, clamped to `1..=MAX_POLYPHONY`.
    pub fn new(polyphony: usize, steal_policy: StealPolicy) -> Self {
        let polyphony = polyphony.clamp(1, MAX_POLYPHONY);
        let params = SynthParams::new();
        let effects = Effects::new("FX", Bus::new(&params, polyphony));

        let lfos: Vec<_> = (1..=LFOS).map(|i| shared(Lfo::new(&format!("L{i}")))).collect();

        for lfo in &lfos {
            lfo.borrow_mut().start(0.0);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(polyphony, ?steal_policy, "synth created");

        Self {
            state: ProducerState::new(2),
            effects,
            leaders: params.float_params(),
            selectors: params.byte_params(),
            params,
            control_changes: (0..CONTROL_CHANGES).map(|_| shared(MidiController::new())).collect(),
            pitch_wheel: shared(MidiController::with_initial_value(0.5)),
            channel_pressure: shared(MidiController::new()),
            triggered_note: shared(MidiController::new()),
            triggered_velocity: shared(MidiController::new()),
            macros: (1..=MACROS).map(|i| shared(Macro::new(&format!("M{i}")))).collect(),
            envelopes: (1..=ENVELOPES).map(|i| shared(Envelope::new(&format!("E{i}")))).collect(),
            lfos,
            lfo_envelopes: LfoEnvelopeMapping::with_capacity(LFOS),
            frequencies: Box::new(EqualTemperament::default()),
            steal_policy,
            slots: vec![Slot::default(); polyphony],
            assignments: [[None; NOTES]; MIDI_CHANNELS],
            held_notes: Vec::with_capacity(NOTES),
            delayed_note_offs: Vec::with_capacity(polyphony),
            next_slot: 0,
            next_note_id: 0,
            age: 0,
            previous_note: A4_NOTE,
            sustain: false,
        }
    }

    /// Synth set up from a host configuration, which is validated first.
    pub fn with_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut synth = Self::new(config.polyphony, config.steal_policy);

        synth.set_sample_rate(config.sample_rate);
        synth.set_block_size(config.block_size);
        synth.set_bpm(config.bpm);
        synth.apply_effect_settings(&config.chorus, &config.echo, &config.reverb);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            bpm = config.bpm,
            "synth configured"
        );

        Ok(synth)
    }

    /// Set the effects bus. A disabled stage is made fully dry.
    pub fn apply_effect_settings(
        &mut self,
        chorus: &ChorusSettings,
        echo: &EchoSettings,
        reverb: &ReverbSettings,
    ) {
        let stage = self.effects.chorus_mut();
        let (dry, wet) = if chorus.enabled { (chorus.dry, chorus.wet) } else { (1.0, 0.0) };

        stage.dry.set_value(dry);
        stage.wet.set_value(wet);

        let processor = stage.processor_mut();
        set_shared(&processor.delay_time, chorus.delay_time);
        set_shared(&processor.frequency, chorus.frequency);
        set_shared(&processor.depth, chorus.depth);
        set_shared(&processor.feedback, chorus.feedback);
        set_shared(&processor.width, chorus.width);
        set_selector(&processor.tuning, chorus.tuning);

        let stage = self.effects.echo_mut();
        let (dry, wet) = if echo.enabled { (echo.dry, echo.wet) } else { (1.0, 0.0) };

        stage.dry.set_value(dry);
        stage.wet.set_value(wet);

        let processor = stage.processor_mut();
        set_shared(&processor.delay_time, echo.delay_time);
        set_shared(&processor.feedback, echo.feedback);
        set_shared(&processor.damping_frequency, echo.damping_frequency);
        set_shared(&processor.width, echo.width);
        set_shared(&processor.distortion_level, echo.distortion_level);
        set_selector(&processor.tempo_sync, toggle_value(echo.tempo_sync));
        set_selector(&processor.reversed_1, toggle_value(echo.reversed));
        set_selector(&processor.reversed_2, toggle_value(echo.reversed));

        if let Some(compressor) = stage.compressor_mut() {
            apply_side_chain(compressor, &echo.side_chain);
        }

        let stage = self.effects.reverb_mut();
        let (dry, wet) = if reverb.enabled { (reverb.dry, reverb.wet) } else { (1.0, 0.0) };

        stage.dry.set_value(dry);
        stage.wet.set_value(wet);

        let processor = stage.processor_mut();
        set_shared(&processor.room_size, reverb.room_size);
        set_shared(&processor.room_reflectivity, reverb.room_reflectivity);
        set_shared(&processor.damping_frequency, reverb.damping_frequency);
        set_shared(&processor.damping_gain, reverb.damping_gain);
        set_shared(&processor.width, reverb.width);
        set_shared(&processor.high_pass_frequency, reverb.high_pass_frequency);
        set_shared(&processor.distortion_level, reverb.distortion_level);

        if let Some(compressor) = stage.compressor_mut() {
            apply_side_chain(compressor, &reverb.side_chain);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            chorus = chorus.enabled,
            echo = echo.enabled,
            reverb = reverb.enabled,
            "effect settings applied"
        );
    }

    /// Replace the note frequency source; sounding notes keep their pitch.
    pub fn set_frequency_table(&mut self, frequencies: Box<dyn FrequencyTable>) {
        self.frequencies = frequencies;
    }

    // Configuration

    /// Number of voice pairs.
    pub fn polyphony(&self) -> usize {
        self.slots.len()
    }

    /// Current voice stealing policy.
    pub fn steal_policy(&self) -> StealPolicy {
        self.steal_policy
    }

    /// Change the voice stealing policy.
    pub fn set_steal_policy(&mut self, steal_policy: StealPolicy) {
        self.steal_policy = steal_policy;
    }

    /// Every leader.
    pub fn params(&self) -> &SynthParams {
        &self.params
    }

    /// Float leader called `name`.
    pub fn float_param(&self, name: &str) -> Option<&Shared<FloatParam>> {
        self.leaders
            .iter()
            .find(|leader| leader.try_borrow().is_ok_and(|leader| leader.name() == name))
    }

    /// Selector or toggle leader called `name`.
    pub fn byte_param(&self, name: &str) -> Option<&Shared<ByteParam>> {
        self.selectors
            .iter()
            .find(|selector| selector.try_borrow().is_ok_and(|selector| selector.name() == name))
    }

    /// Envelope slot `index`.
    pub fn envelope(&self, index: usize) -> Option<&Shared<Envelope>> {
        self.envelopes.get(index)
    }

    /// LFO slot `index`.
    pub fn lfo(&self, index: usize) -> Option<&Shared<Lfo>> {
        self.lfos.get(index)
    }

    /// Macro slot `index`.
    pub fn macro_(&self, index: usize) -> Option<&Shared<Macro>> {
        self.macros.get(index)
    }

    /// Drive the leader `name` from `controller`. Returns whether both
    /// exist.
    pub fn assign_controller(&mut self, name: &str, controller: Controller) -> bool {
        let source = match controller {
            Controller::None => Some(Source::None),
            Controller::ControlChange(cc) => self.control_changes.get(cc as usize).map(|c| Source::Midi(Rc::clone(c))),
            Controller::PitchWheel => Some(Source::Midi(Rc::clone(&self.pitch_wheel))),
            Controller::ChannelPressure => Some(Source::Midi(Rc::clone(&self.channel_pressure))),
            Controller::Note => Some(Source::Midi(Rc::clone(&self.triggered_note))),
            Controller::Velocity => Some(Source::Midi(Rc::clone(&self.triggered_velocity))),
            Controller::Macro(index) => self.macros.get(index).map(|m| Source::Macro(Rc::clone(m))),
            Controller::Lfo(index) => self.lfos.get(index).map(|l| Source::Lfo(Rc::clone(l))),
        };

        let (Some(source), Some(leader)) = (source, self.float_param(name)) else {
            return false;
        };

        let Ok(mut leader) = leader.try_borrow_mut() else {
            return false;
        };

        leader.set_midi_controller(None);
        leader.set_macro(None);
        leader.set_lfo(None);

        match source {
            Source::None => {}
            Source::Midi(controller) => leader.set_midi_controller(Some(controller)),
            Source::Macro(macro_) => leader.set_macro(Some(macro_)),
            Source::Lfo(lfo) => leader.set_lfo(Some(lfo)),
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(name, ?controller, "controller assigned");

        true
    }

    /// Run envelope slot `index` on every note of the leader `name`, or
    /// remove its envelope with `None`. Returns whether both exist.
    pub fn assign_envelope(&mut self, name: &str, index: Option<usize>) -> bool {
        let envelope = match index {
            Some(index) => match self.envelopes.get(index) {
                Some(envelope) => Some(Rc::clone(envelope)),
                None => return false,
            },
            None => None,
        };

        let Some(leader) = self.float_param(name) else {
            return false;
        };

        leader
            .try_borrow_mut()
            .map(|mut leader| leader.set_envelope(envelope))
            .is_ok()
    }

    // Voices

    /// The voice mix under the effects.
    pub fn bus(&self) -> &Bus {
        self.effects.input()
    }

    /// The effects bus.
    pub fn effects(&self) -> &Effects<Bus> {
        &self.effects
    }

    /// The effects bus, mutably.
    pub fn effects_mut(&mut self) -> &mut Effects<Bus> {
        &mut self.effects
    }

    /// Number of voice pairs holding a note or fading out.
    pub fn active_voices(&self) -> usize {
        let bus = self.bus();

        (0..self.slots.len())
            .filter(|&slot| !bus.is_slot_off_after(slot, 0.0))
            .count()
    }

    /// Whether the sustain pedal is down.
    pub fn is_sustained(&self) -> bool {
        self.sustain
    }

    // Note events

    /// Start `note` on `channel` with `velocity` in `[0, 1]`.
    pub fn note_on(&mut self, time_offset: Seconds, channel: u8, note: u8, velocity: Number) {
        let channel = channel % MIDI_CHANNELS as u8;
        let note = note.min((NOTES - 1) as u8);
        let velocity = velocity.clamp(0.0, 1.0);

        #[cfg(feature = "tracing")]
        tracing::trace!(time_offset, channel, note, velocity, "note on");

        self.next_note_id += 1;

        let event = NoteEvent {
            time_offset,
            id: self.next_note_id,
            note,
            channel,
            velocity,
        };

        let controller_channel = self.is_mpe().then_some(channel);
        change(&self.triggered_note, controller_channel, time_offset, Number::from(note) / 127.0);
        change(&self.triggered_velocity, controller_channel, time_offset, velocity);

        self.update_lfo_envelopes();

        if self.is_polyphonic() {
            self.poly_note_on(&event);
        } else {
            self.mono_note_on(&event);
        }

        self.previous_note = note;
        self.update_voice_statuses();
    }

    /// Release `note` on `channel`. Held by the sustain pedal while it is
    /// down.
    pub fn note_off(&mut self, time_offset: Seconds, channel: u8, note: u8) {
        let channel = channel % MIDI_CHANNELS as u8;
        let note = note.min((NOTES - 1) as u8);

        #[cfg(feature = "tracing")]
        tracing::trace!(time_offset, channel, note, "note off");

        if self.is_polyphonic() {
            if let Some(slot) = self.assignments[channel as usize][note as usize] {
                self.release_or_sustain(time_offset, slot);
            }
        } else {
            self.mono_note_off(time_offset, channel, note);
        }

        self.update_voice_statuses();
    }

    /// Continuous controller `cc` moved to `ratio`. Also handles the sustain
    /// pedal and the all sound off and all notes off messages.
    pub fn control_change(&mut self, time_offset: Seconds, channel: u8, cc: u8, ratio: Number) {
        match cc {
            ALL_SOUND_OFF => {
                self.all_sound_off();
                return;
            }
            ALL_NOTES_OFF => {
                self.all_notes_off(time_offset);
                return;
            }
            SUSTAIN_PEDAL => self.set_sustain(time_offset, ratio >= 0.5),
            _ => {}
        }

        if let Some(controller) = self.control_changes.get(cc as usize) {
            change(controller, self.is_mpe().then_some(channel), time_offset, ratio);
        }
    }

    /// Pitch wheel moved to `ratio`; 0.5 is the center.
    pub fn pitch_wheel(&mut self, time_offset: Seconds, channel: u8, ratio: Number) {
        change(&self.pitch_wheel, self.is_mpe().then_some(channel), time_offset, ratio);
    }

    /// Channel aftertouch changed to `ratio`.
    pub fn channel_pressure(&mut self, time_offset: Seconds, channel: u8, ratio: Number) {
        change(&self.channel_pressure, self.is_mpe().then_some(channel), time_offset, ratio);
    }

    /// Release every held note, ignoring the sustain pedal.
    pub fn all_notes_off(&mut self, time_offset: Seconds) {
        self.held_notes.clear();
        self.delayed_note_offs.clear();

        for slot in 0..self.slots.len() {
            self.release_slot(time_offset, slot);
        }

        self.update_voice_statuses();
    }

    /// Silence everything at once: voices, effect tails and controller
    /// ramps.
    pub fn all_sound_off(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("all sound off");

        self.reset();
    }

    // Internals

    fn is_polyphonic(&self) -> bool {
        self.params.polyphonic.try_borrow().is_ok_and(|toggle| is_on(&toggle))
    }

    fn is_mpe(&self) -> bool {
        self.params.mpe.try_borrow().is_ok_and(|toggle| is_on(&toggle))
    }

    /// Which voices of a slot play `note`: (modulator, carrier).
    fn voice_kinds(&self, note: u8) -> (bool, bool) {
        let mode = self.params.mode.try_borrow().map_or(0, |mode| mode.value());

        match split_note(mode) {
            Some(split) => (note < split, note >= split),
            None => (true, true),
        }
    }

    fn set_sustain(&mut self, time_offset: Seconds, sustain: bool) {
        self.sustain = sustain;

        if sustain {
            return;
        }

        while let Some((slot, id)) = self.delayed_note_offs.pop() {
            if self.slots[slot].id == id {
                self.release_slot(time_offset, slot);
            }
        }
    }

    fn update_lfo_envelopes(&mut self) {
        self.lfo_envelopes.clear();

        for lfo in &self.lfos {
            let envelope = lfo.try_borrow().ok().and_then(|lfo| lfo.amount_envelope());

            if let Some(envelope) = envelope {
                self.lfo_envelopes.push(Rc::clone(lfo), envelope);
            }
        }
    }

    fn poly_note_on(&mut self, event: &NoteEvent) {
        if let Some(slot) = self.assignments[event.channel as usize][event.note as usize] {
            self.release_slot(event.time_offset, slot);
        }

        let slot = match self.find_free_slot(event.time_offset) {
            Some(slot) => slot,
            None => {
                let slot = self.steal_slot();

                #[cfg(feature = "tracing")]
                tracing::trace!(
                    slot,
                    stolen_note = self.slots[slot].note,
                    note = event.note,
                    policy = ?self.steal_policy,
                    "voice stolen"
                );

                slot
            }
        };

        self.start_slot(slot, event, false);
    }

    fn mono_note_on(&mut self, event: &NoteEvent) {
        self.held_notes
            .retain(|held| held.channel != event.channel || held.note != event.note);

        if self.held_notes.len() == self.held_notes.capacity() {
            self.held_notes.remove(0);
        }

        let legato = self.slots[MONO_SLOT].held;

        self.held_notes.push(*event);
        self.start_slot(MONO_SLOT, event, legato);
    }

    fn mono_note_off(&mut self, time_offset: Seconds, channel: u8, note: u8) {
        let Some(position) = self
            .held_notes
            .iter()
            .position(|held| held.channel == channel && held.note == note)
        else {
            return;
        };

        let was_sounding = position + 1 == self.held_notes.len();
        self.held_notes.remove(position);

        if !was_sounding {
            return;
        }

        match self.held_notes.last().copied() {
            Some(previous) => {
                let event = NoteEvent {
                    time_offset,
                    ..previous
                };

                self.start_slot(MONO_SLOT, &event, true);
                self.previous_note = note;
            }
            None => self.release_or_sustain(time_offset, MONO_SLOT),
        }
    }

    /// A slot whose voices are silent by `time_offset`, searching round-robin.
    fn find_free_slot(&mut self, time_offset: Seconds) -> Option<usize> {
        let count = self.slots.len();
        let bus = self.effects.input();

        let found = (0..count)
            .map(|i| (self.next_slot + i) % count)
            .find(|&slot| !self.slots[slot].held && bus.is_slot_off_after(slot, time_offset));

        if let Some(slot) = found {
            self.next_slot = (slot + 1) % count;
        }

        found
    }

    /// The slot to give up when every voice is busy.
    fn steal_slot(&self) -> usize {
        let slots = self.slots.iter().enumerate();
        let oldest = || {
            slots
                .clone()
                .min_by_key(|(_, slot)| slot.age)
                .map_or(0, |(i, _)| i)
        };

        match self.steal_policy {
            StealPolicy::Oldest => oldest(),
            StealPolicy::QuietestReleased => {
                let bus = self.effects.input();

                slots
                    .clone()
                    .filter(|(_, slot)| !slot.held)
                    .map(|(i, _)| (i, bus.level(i)))
                    .min_by(|(_, a), (_, b)| a.total_cmp(b))
                    .map_or_else(oldest, |(i, _)| i)
            }
            StealPolicy::Lowest => slots
                .clone()
                .min_by_key(|(_, slot)| slot.note)
                .map_or(0, |(i, _)| i),
            StealPolicy::Highest => slots
                .clone()
                .max_by_key(|(_, slot)| slot.note)
                .map_or(0, |(i, _)| i),
        }
    }

    /// Play `event` on `slot`. With `legato`, held voices glide to the new
    /// note instead of restarting.
    fn start_slot(&mut self, slot: usize, event: &NoteEvent, legato: bool) {
        self.unassign(slot);
        self.age += 1;

        let (play_modulator, play_carrier) = self.voice_kinds(event.note);
        let controller_channel = if self.is_mpe() {
            event.channel
        } else {
            PARAM_DEFAULT_MPE_CHANNEL
        };

        let context = NoteContext {
            previous_note: self.previous_note,
            frequencies: self.frequencies.as_ref(),
            lfo_envelopes: &self.lfo_envelopes,
            synced_inaccuracy: None,
            controller_channel,
        };

        let bus = self.effects.input_mut();

        if let Ok(mut modulator) = bus.modulators[slot].try_borrow_mut() {
            start_voice(&mut *modulator, event, &context, play_modulator, legato);

            let context = NoteContext {
                synced_inaccuracy: play_modulator.then(|| modulator.inaccuracy()),
                ..context
            };

            start_voice(&mut bus.carriers[slot], event, &context, play_carrier, legato);
        }

        self.slots[slot] = Slot {
            id: event.id,
            note: event.note,
            channel: event.channel,
            age: self.age,
            held: true,
        };
        self.assignments[event.channel as usize][event.note as usize] = Some(slot);
    }

    fn release_or_sustain(&mut self, time_offset: Seconds, slot: usize) {
        if !self.sustain {
            self.release_slot(time_offset, slot);
            return;
        }

        let id = self.slots[slot].id;

        self.delayed_note_offs.retain(|&(delayed, _)| delayed != slot);
        self.delayed_note_offs.push((slot, id));
    }

    fn release_slot(&mut self, time_offset: Seconds, slot: usize) {
        let Slot { id, note, held, .. } = self.slots[slot];

        if !held {
            return;
        }

        self.unassign(slot);

        let bus = self.effects.input_mut();

        if let Ok(mut modulator) = bus.modulators[slot].try_borrow_mut() {
            modulator.note_off(time_offset, id, note);
        }

        bus.carriers[slot].note_off(time_offset, id, note);
    }

    fn unassign(&mut self, slot: usize) {
        let info = &mut self.slots[slot];

        if !info.held {
            return;
        }

        info.held = false;

        let assignment = &mut self.assignments[info.channel as usize][info.note as usize];

        if *assignment == Some(slot) {
            *assignment = None;
        }
    }

    /// Recompute the status flags of every held slot.
    fn update_voice_statuses(&mut self) {
        let held = || self.slots.iter().filter(|slot| slot.held);

        let (Some(oldest), Some(newest), Some(lowest), Some(highest)) = (
            held().map(|slot| slot.age).min(),
            held().map(|slot| slot.age).max(),
            held().map(|slot| slot.note).min(),
            held().map(|slot| slot.note).max(),
        ) else {
            return;
        };

        let bus = self.effects.input_mut();

        for (index, slot) in self.slots.iter().enumerate().filter(|(_, slot)| slot.held) {
            let mut status = 0;

            if slot.age == newest {
                status |= VOICE_STATUS_LAST;
            }

            if slot.age == oldest {
                status |= VOICE_STATUS_OLDEST;
            }

            if slot.note == lowest {
                status |= VOICE_STATUS_LOWEST;
            }

            if slot.note == highest {
                status |= VOICE_STATUS_HIGHEST;
            }

            if let Ok(mut modulator) = bus.modulators[index].try_borrow_mut() {
                modulator.set_status(status);
            }

            bus.carriers[index].set_status(status);
        }
    }

    /// Drop controller events consumed this round.
    fn clear_controllers(&mut self) {
        let controllers = self.control_changes.iter().chain([
            &self.pitch_wheel,
            &self.channel_pressure,
            &self.triggered_note,
            &self.triggered_velocity,
        ]);

        for controller in controllers {
            if let Ok(mut controller) = controller.try_borrow_mut() {
                controller.clear();
            }
        }
    }

    /// Free voices whose held note decayed to silence.
    fn collect_garbage(&mut self) {
        for slot in 0..self.slots.len() {
            let bus = self.effects.input_mut();

            let modulator_off = match bus.modulators[slot].try_borrow_mut() {
                Ok(mut modulator) => collect(&mut *modulator),
                Err(_) => false,
            };
            let carrier_off = collect(&mut bus.carriers[slot]);

            if modulator_off && carrier_off && self.slots[slot].held {
                self.unassign(slot);
            }
        }
    }
}

enum Source {
    None,
    Midi(Shared<MidiController>),
    Macro(Shared<Macro>),
    Lfo(Shared<Lfo>),
}

/// Reset a voice whose held note decayed; returns whether the voice is
/// released.
fn collect<S: VoiceStage>(voice: &mut Voice<S>) -> bool {
    if voice.has_decayed_before_note_off() {
        voice.reset();
    }

    voice.lifecycle() == VoiceState::Off
}

fn start_voice<S: VoiceStage>(
    voice: &mut Voice<S>,
    event: &NoteEvent,
    context: &NoteContext<'_>,
    play: bool,
    legato: bool,
) {
    let sounding = !voice.is_off_after(event.time_offset);

    if !play {
        if sounding {
            voice.cancel_note_smoothly(event.time_offset);
        }

        return;
    }

    if legato && voice.lifecycle() == VoiceState::On {
        voice.glide_to(event, context);
    } else if sounding {
        voice.retrigger(event, context);
    } else {
        voice.note_on(event, context);
    }
}

/// Send `ratio` to `channel`, or to every channel with `None`.
fn change(controller: &Shared<MidiController>, channel: Option<u8>, time_offset: Seconds, ratio: Number) {
    let Ok(mut controller) = controller.try_borrow_mut() else {
        return;
    };

    match channel {
        Some(channel) if channel != ALL_CHANNELS => controller.change(channel, time_offset, ratio),
        _ => controller.change_all_channels(time_offset, ratio),
    }
}

fn set_shared(param: &Shared<FloatParam>, value: Number) {
    if let Ok(mut param) = param.try_borrow_mut() {
        param.set_value(value);
    }
}

fn set_selector(param: &Shared<ByteParam>, value: u8) {
    if let Ok(mut param) = param.try_borrow_mut() {
        param.set_value(value);
    }
}

fn apply_side_chain(compressor: &mut SideChainCompressor, settings: &SideChainSettings) {
    compressor.threshold.set_value(settings.threshold);
    compressor.attack_time.set_value(settings.attack_time);
    compressor.release_time.set_value(settings.release_time);
    compressor.ratio.set_value(settings.ratio);
}

fn toggle_value(on: bool) -> u8 {
    if on { ON } else { OFF }
}

impl SignalProducer for Synth {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.effects);

        for leader in &self.leaders {
            if let Ok(mut leader) = leader.try_borrow_mut() {
                visitor(&mut *leader);
            }
        }

        for lfo in &self.lfos {
            if let Ok(mut lfo) = lfo.try_borrow_mut() {
                visitor(&mut *lfo);
            }
        }
    }

    fn sample_rate_changed(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(sample_rate = self.state.sample_rate(), "synth sample rate changed");
    }

    fn block_size_changed(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(block_size = self.state.block_size(), "synth block size changed");
    }

    fn reset_state(&mut self) {
        self.slots.fill(Slot::default());
        self.assignments = [[None; NOTES]; MIDI_CHANNELS];
        self.held_notes.clear();
        self.delayed_note_offs.clear();
        self.sustain = false;

        for lfo in &self.lfos {
            if let Ok(mut lfo) = lfo.try_borrow_mut() {
                lfo.start(0.0);
            }
        }
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        self.collect_garbage();

        produce(&mut self.effects, round, sample_count);

        for leader in &self.leaders {
            if let Ok(mut leader) = leader.try_borrow_mut() {
                produce_if_not_constant(&mut leader, round, sample_count);
            }
        }

        for lfo in &self.lfos {
            if let Ok(mut lfo) = lfo.try_borrow_mut() {
                lfo.skip_round(round, sample_count);
            }
        }

        if self.effects.is_silent(round, sample_count) {
            self.clear_controllers();
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let source = self.effects.state().buffer();

        for (c, channel) in buffer.channels_mut().iter_mut().enumerate() {
            let input = &source.channel(c)[first..last];

            for (out, sample) in channel[first..last].iter_mut().zip(input) {
                *out = sample.clamp(-OUTPUT_LIMIT, OUTPUT_LIMIT);
            }
        }
    }

    fn finalize_rendering(&mut self, _round: Round, _sample_count: usize) {
        self.clear_controllers();
    }
}
