//! Band-limited wavetable oscillator.
//!
//! Voices use it as their sound source with amplitude, frequency and phase
//! modulation from a modulator voice; [`Lfo`](crate::Lfo) uses it in LFO
//! mode, where the output is offset into `[0, 2 × amplitude]` unless centered
//! and the frequency may be synced to the tempo.

use crate::math;
use crate::param::{
    ByteParam, FloatParam, ModulatableFloatParam, Modulator, ToggleParam, constant_or_rendered,
    is_on, produce_if_not_constant,
};
use crate::producer::{
    Buffer, Event, EventType, ProducerState, Rendering, Round, Shared, SignalProducer, rendered,
};
use crate::wavetable::{StandardWaveforms, Wavetable, WavetableState};
use crate::{Frequency, Number, Sample, Seconds};

/// Start producing sound; a start while running restarts the phase.
pub const EVT_START: EventType = 1;
/// Stop producing sound.
pub const EVT_STOP: EventType = 2;

/// Number of harmonics of the custom waveform.
pub const CUSTOM_WAVEFORM_HARMONICS: usize = 10;

/// Lowest oscillator frequency.
pub const FREQUENCY_MIN: Frequency = 0.001;
/// Highest oscillator frequency.
pub const FREQUENCY_MAX: Frequency = 24000.0;
/// Frequency before the first note.
pub const FREQUENCY_DEFAULT: Frequency = 440.0;

/// Coarse detune range in cents.
pub const DETUNE_MAX: Number = 4800.0;
/// Fine detune range in cents.
pub const FINE_DETUNE_MAX: Number = 300.0;

const CUSTOM_WAVEFORM_DEFAULTS: [Number; CUSTOM_WAVEFORM_HARMONICS] =
    [0.333, 0.333, 0.333, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];

const SECONDS_IN_ONE_MINUTE: Number = 60.0;

const SUBHARMONIC_INSIGNIFICANT: Number = 0.000001;

/// Waveform selector values of a waveform [`ByteParam`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Waveform {
    /// Pure sine.
    Sine = 0,
    /// Rising sawtooth.
    #[default]
    Sawtooth = 1,
    /// Sawtooth with attenuated upper harmonics.
    SoftSawtooth = 2,
    /// Falling sawtooth.
    InverseSawtooth = 3,
    /// Falling sawtooth with attenuated upper harmonics.
    SoftInverseSawtooth = 4,
    /// Triangle.
    Triangle = 5,
    /// Triangle with attenuated upper harmonics.
    SoftTriangle = 6,
    /// Square.
    Square = 7,
    /// Square with attenuated upper harmonics.
    SoftSquare = 8,
    /// Ten harmonics with parameter-controlled amplitudes.
    Custom = 9,
}

impl Waveform {
    /// Every waveform, in selector order.
    pub const ALL: [Self; 10] = [
        Self::Sine,
        Self::Sawtooth,
        Self::SoftSawtooth,
        Self::InverseSawtooth,
        Self::SoftInverseSawtooth,
        Self::Triangle,
        Self::SoftTriangle,
        Self::Square,
        Self::SoftSquare,
        Self::Custom,
    ];

    /// Waveform of a selector value; out-of-range values select
    /// [`Waveform::Custom`].
    pub fn from_index(index: u8) -> Self {
        Self::ALL
            .get(usize::from(index))
            .copied()
            .unwrap_or(Self::Custom)
    }

    /// Selector value.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Waveform selector parameter with `default` selected.
    pub fn param(name: impl Into<String>, default: Self) -> ByteParam {
        ByteParam::new(name, Self::Sine.index(), Self::Custom.index(), default.index())
    }

    fn standard_wavetable(self) -> Option<&'static Wavetable> {
        let waveforms = StandardWaveforms::get();

        Some(match self {
            Self::Sine => waveforms.sine(),
            Self::Sawtooth => waveforms.sawtooth(),
            Self::SoftSawtooth => waveforms.soft_sawtooth(),
            Self::InverseSawtooth => waveforms.inverse_sawtooth(),
            Self::SoftInverseSawtooth => waveforms.soft_inverse_sawtooth(),
            Self::Triangle => waveforms.triangle(),
            Self::SoftTriangle => waveforms.soft_triangle(),
            Self::Square => waveforms.square(),
            Self::SoftSquare => waveforms.soft_square(),
            Self::Custom => return None,
        })
    }
}

/// Shared parameters an oscillator follows. Unset leaders leave the
/// oscillator with a private parameter of its own.
#[derive(Debug, Clone)]
pub struct OscillatorLeaders {
    /// Waveform selector.
    pub waveform: Shared<ByteParam>,
    /// Output level.
    pub amplitude: Option<Shared<FloatParam>>,
    /// Frequency in Hz; voices set their own per note instead.
    pub frequency: Option<Shared<FloatParam>>,
    /// Phase offset in periods.
    pub phase: Option<Shared<FloatParam>>,
    /// Coarse detune in cents.
    pub detune: Option<Shared<FloatParam>>,
    /// Fine detune in cents.
    pub fine_detune: Option<Shared<FloatParam>>,
    /// Level of the sine one octave below.
    pub subharmonic_amplitude: Option<Shared<FloatParam>>,
    /// Harmonic amplitudes of the custom waveform.
    pub harmonics: Option<[Shared<FloatParam>; CUSTOM_WAVEFORM_HARMONICS]>,
    /// Amplitude modulation level.
    pub amplitude_modulation_level: Option<Shared<FloatParam>>,
    /// Frequency modulation level in cents.
    pub frequency_modulation_level: Option<Shared<FloatParam>>,
    /// Phase modulation level in periods.
    pub phase_modulation_level: Option<Shared<FloatParam>>,
}

impl OscillatorLeaders {
    /// Leaders with only the waveform selector set.
    pub fn new(waveform: Shared<ByteParam>) -> Self {
        Self {
            waveform,
            amplitude: None,
            frequency: None,
            phase: None,
            detune: None,
            fine_detune: None,
            subharmonic_amplitude: None,
            harmonics: None,
            amplitude_modulation_level: None,
            frequency_modulation_level: None,
            phase_modulation_level: None,
        }
    }
}

fn follow_or(leader: Option<&Shared<FloatParam>>, own: impl FnOnce() -> FloatParam) -> FloatParam {
    leader.map_or_else(own, FloatParam::follower)
}

fn modulatable(
    param: FloatParam,
    level_leader: Option<&Shared<FloatParam>>,
    modulator: Option<&Shared<dyn Modulator>>,
) -> ModulatableFloatParam {
    match (modulator, level_leader) {
        (Some(modulator), Some(level)) => ModulatableFloatParam::new(
            param,
            FloatParam::follower(level),
            std::rc::Rc::clone(modulator),
        ),
        _ => ModulatableFloatParam::unmodulated(param),
    }
}

/// Per-round value of a parameter: one constant or a rendered block.
#[derive(Debug, Clone, Copy)]
enum Computed {
    Constant(Number),
    Buffer,
}

/// Band-limited wavetable oscillator.
///
/// Output per sample is `amplitude × (offset + wave) + subharmonic_amplitude ×
/// subharmonic`, where `amplitude` already includes amplitude modulation and
/// `offset` is 1 only for uncentered LFOs.
pub struct Oscillator {
    state: ProducerState,
    waveform: Shared<ByteParam>,
    tempo_sync: Option<Shared<ToggleParam>>,
    center: Option<Shared<ToggleParam>>,
    is_lfo: bool,

    /// Multiplier of `amplitude`, shifted by amplitude modulation.
    pub modulated_amplitude: ModulatableFloatParam,
    /// Output level.
    pub amplitude: FloatParam,
    /// Frequency in Hz.
    pub frequency: FloatParam,
    /// Phase offset in periods, shifted by phase modulation.
    pub phase: ModulatableFloatParam,
    /// Coarse detune in cents.
    pub detune: FloatParam,
    /// Fine detune in cents, shifted by frequency modulation.
    pub fine_detune: ModulatableFloatParam,
    /// Level of the sine one octave below.
    pub subharmonic_amplitude: FloatParam,
    /// Harmonic amplitudes of the custom waveform.
    pub harmonics: [FloatParam; CUSTOM_WAVEFORM_HARMONICS],

    custom_wavetable: Wavetable,
    custom_coefficients: [Number; CUSTOM_WAVEFORM_HARMONICS],
    custom_change_indices: [Option<u32>; CUSTOM_WAVEFORM_HARMONICS],
    current_waveform: Waveform,
    wavetable_state: WavetableState,

    amplitude_value: Computed,
    frequency_value: Computed,
    phase_value: Computed,
    subharmonic_value: Computed,
    computed_amplitude: Vec<Sample>,
    computed_frequency: Vec<Frequency>,
    computed_phase: Vec<Number>,
    computed_subharmonic: Vec<Sample>,

    inaccuracy_cents: Number,
    frequency_scale: Number,
    offset_scale: Number,
    start_time_offset: Seconds,
    is_on: bool,
    is_starting: bool,
}

impl core::fmt::Debug for Oscillator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Oscillator")
            .field("waveform", &self.current_waveform)
            .field("is_lfo", &self.is_lfo)
            .field("is_on", &self.is_on)
            .finish_non_exhaustive()
    }
}

impl Oscillator {
    /// Standalone oscillator with private parameters.
    pub fn new(waveform: Shared<ByteParam>) -> Self {
        Self::from_leaders(&OscillatorLeaders::new(waveform), None)
    }

    /// Oscillator following `leaders`, modulated by `modulator` at the
    /// leaders' modulation levels.
    pub fn from_leaders(
        leaders: &OscillatorLeaders,
        modulator: Option<Shared<dyn Modulator>>,
    ) -> Self {
        let modulator = modulator.as_ref();
        let harmonics = core::array::from_fn(|i| {
            follow_or(
                leaders.harmonics.as_ref().map(|harmonics| &harmonics[i]),
                || FloatParam::block("", -1.0, 1.0, CUSTOM_WAVEFORM_DEFAULTS[i]),
            )
        });

        let mut oscillator = Self {
            state: ProducerState::new(1),
            waveform: std::rc::Rc::clone(&leaders.waveform),
            tempo_sync: None,
            center: None,
            is_lfo: false,
            modulated_amplitude: modulatable(
                FloatParam::new("", 0.0, 1.0, 1.0),
                leaders.amplitude_modulation_level.as_ref(),
                modulator,
            ),
            amplitude: follow_or(leaders.amplitude.as_ref(), || {
                FloatParam::new("", 0.0, 1.0, 1.0)
            }),
            frequency: follow_or(leaders.frequency.as_ref(), || {
                FloatParam::new("", FREQUENCY_MIN, FREQUENCY_MAX, FREQUENCY_DEFAULT)
            }),
            phase: modulatable(
                follow_or(leaders.phase.as_ref(), || FloatParam::new("", 0.0, 1.0, 0.0)),
                leaders.phase_modulation_level.as_ref(),
                modulator,
            ),
            detune: follow_or(leaders.detune.as_ref(), || {
                FloatParam::new("", -DETUNE_MAX, DETUNE_MAX, 0.0).with_round_to(100.0)
            }),
            fine_detune: modulatable(
                follow_or(leaders.fine_detune.as_ref(), || {
                    FloatParam::new("", -FINE_DETUNE_MAX, FINE_DETUNE_MAX, 0.0)
                }),
                leaders.frequency_modulation_level.as_ref(),
                modulator,
            ),
            subharmonic_amplitude: follow_or(leaders.subharmonic_amplitude.as_ref(), || {
                FloatParam::new("", 0.0, 1.0, 0.0)
            }),
            harmonics,
            custom_wavetable: Wavetable::new(&[0.0; CUSTOM_WAVEFORM_HARMONICS]),
            custom_coefficients: [0.0; CUSTOM_WAVEFORM_HARMONICS],
            custom_change_indices: [None; CUSTOM_WAVEFORM_HARMONICS],
            current_waveform: Waveform::default(),
            wavetable_state: WavetableState::default(),
            amplitude_value: Computed::Constant(1.0),
            frequency_value: Computed::Constant(FREQUENCY_DEFAULT),
            phase_value: Computed::Constant(0.0),
            subharmonic_value: Computed::Constant(0.0),
            computed_amplitude: Vec::new(),
            computed_frequency: Vec::new(),
            computed_phase: Vec::new(),
            computed_subharmonic: Vec::new(),
            inaccuracy_cents: 0.0,
            frequency_scale: 1.0,
            offset_scale: 0.0,
            start_time_offset: 0.0,
            is_on: false,
            is_starting: false,
        };

        oscillator.block_size_changed();
        oscillator
    }

    /// Switch to LFO mode: the output is offset into the positive range
    /// unless `center` is on, and the frequency follows the tempo while
    /// `tempo_sync` is on.
    pub fn with_lfo_toggles(
        mut self,
        tempo_sync: Shared<ToggleParam>,
        center: Shared<ToggleParam>,
    ) -> Self {
        self.tempo_sync = Some(tempo_sync);
        self.center = Some(center);
        self.is_lfo = true;
        self
    }

    /// Schedule [`EVT_START`].
    pub fn start(&mut self, time_offset: Seconds) {
        self.state.schedule(Event::new(EVT_START, time_offset));
    }

    /// Schedule [`EVT_STOP`].
    pub fn stop(&mut self, time_offset: Seconds) {
        self.state.schedule(Event::new(EVT_STOP, time_offset));
    }

    /// Whether the oscillator has started and not stopped yet.
    pub fn is_on(&self) -> bool {
        self.is_on
    }

    /// Extra detune in cents, such as analog-style drift.
    pub fn set_inaccuracy(&mut self, cents: Number) {
        self.inaccuracy_cents = cents;
    }

    /// Drop scheduled events of the oscillator and its parameters.
    pub fn cancel_events(&mut self) {
        self.state.cancel_events();
        self.amplitude.cancel_events();
        self.frequency.cancel_events();
        self.detune.cancel_events();
    }

    /// Advance every clock by one block without rendering.
    pub fn skip_round(&mut self, round: Round, sample_count: usize) {
        if self.state.cached_round() == Some(round) {
            return;
        }

        self.state.set_cached_round(round);
        self.modulated_amplitude.skip_round(round, sample_count);
        self.amplitude.skip_round(round, sample_count);
        self.frequency.skip_round(round, sample_count);
        self.phase.skip_round(round, sample_count);
        self.detune.skip_round(round, sample_count);
        self.fine_detune.skip_round(round, sample_count);
        self.subharmonic_amplitude.skip_round(round, sample_count);

        if self.state.has_events() {
            let elapsed = self.state.sample_count_to_relative_time_offset(sample_count);
            self.state.advance_time(elapsed);
        }
    }

    fn update_waveform(&mut self, round: Round, sample_count: usize) {
        self.current_waveform = Waveform::from_index(self.waveform.borrow().value());

        if self.current_waveform != Waveform::Custom {
            return;
        }

        let mut has_changed = false;

        for (i, harmonic) in self.harmonics.iter_mut().enumerate() {
            let change_index = harmonic.change_index();

            if self.custom_change_indices[i] != Some(change_index) {
                self.custom_change_indices[i] = Some(change_index);
                self.custom_coefficients[i] = harmonic.value();
                has_changed = true;
            }

            produce_if_not_constant(harmonic, round, sample_count);
        }

        if has_changed {
            self.custom_wavetable
                .update_coefficients(&self.custom_coefficients);
        }
    }

    fn update_lfo_scales(&mut self) {
        self.frequency_scale = match &self.tempo_sync {
            Some(toggle) if is_on(&toggle.borrow()) => self.state.bpm() / SECONDS_IN_ONE_MINUTE,
            _ => 1.0,
        };

        self.offset_scale = match &self.center {
            Some(toggle) if self.is_lfo && !is_on(&toggle.borrow()) => 1.0,
            _ => 0.0,
        };
    }

    fn compute_amplitude(&mut self, round: Round, sample_count: usize) {
        let amplitude = constant_or_rendered(&mut self.amplitude, round, sample_count);
        let modulated = self
            .modulated_amplitude
            .produce_if_not_constant(round, sample_count)
            .is_none()
            .then(|| self.modulated_amplitude.value());
        let output = &mut self.computed_amplitude[..sample_count];

        self.amplitude_value = match (amplitude, modulated) {
            (Some(amplitude), Some(modulated)) => Computed::Constant(amplitude * modulated),
            (Some(amplitude), None) => {
                for (out, m) in output.iter_mut().zip(rendered(&self.modulated_amplitude)) {
                    *out = amplitude * m;
                }
                Computed::Buffer
            }
            (None, Some(modulated)) => {
                for (out, a) in output.iter_mut().zip(rendered(&self.amplitude)) {
                    *out = a * modulated;
                }
                Computed::Buffer
            }
            (None, None) => {
                let amplitudes = rendered(&self.amplitude);
                let modulated = rendered(&self.modulated_amplitude);

                for ((out, a), m) in output.iter_mut().zip(amplitudes).zip(modulated) {
                    *out = a * m;
                }
                Computed::Buffer
            }
        };
    }

    fn compute_frequency(&mut self, round: Round, sample_count: usize) {
        let frequency = constant_or_rendered(&mut self.frequency, round, sample_count);
        let detune = constant_or_rendered(&mut self.detune, round, sample_count);
        let fine_detune = self
            .fine_detune
            .produce_if_not_constant(round, sample_count)
            .is_none()
            .then(|| self.fine_detune.value());
        let scale = self.frequency_scale;
        let inaccuracy = self.inaccuracy_cents;

        if let (Some(frequency), Some(detune), Some(fine_detune)) = (frequency, detune, fine_detune) {
            self.frequency_value = Computed::Constant(
                math::detune(frequency, detune + fine_detune + inaccuracy) * scale,
            );
            return;
        }

        let frequencies = rendered(&self.frequency);
        let detunes = rendered(&self.detune);
        let fine_detunes = rendered(&self.fine_detune);

        for (i, out) in self.computed_frequency[..sample_count].iter_mut().enumerate() {
            let f = frequency.unwrap_or_else(|| frequencies[i]);
            let cents = detune.unwrap_or_else(|| detunes[i])
                + fine_detune.unwrap_or_else(|| fine_detunes[i])
                + inaccuracy;

            *out = math::detune(f, cents) * scale;
        }

        self.frequency_value = Computed::Buffer;
    }

    fn compute_phase(&mut self, round: Round, sample_count: usize) {
        if self.phase.produce_if_not_constant(round, sample_count).is_none() {
            self.phase_value = Computed::Constant(Wavetable::scale_phase_offset(self.phase.value()));
            return;
        }

        for (out, phase) in self.computed_phase[..sample_count]
            .iter_mut()
            .zip(rendered(&self.phase))
        {
            *out = Wavetable::scale_phase_offset(*phase);
        }

        self.phase_value = Computed::Buffer;
    }

    fn compute_subharmonic(&mut self, round: Round, sample_count: usize) {
        if let Some(value) =
            constant_or_rendered(&mut self.subharmonic_amplitude, round, sample_count)
        {
            self.subharmonic_value = Computed::Constant(value);
            return;
        }

        self.computed_subharmonic[..sample_count]
            .copy_from_slice(&rendered(&self.subharmonic_amplitude)[..sample_count]);
        self.subharmonic_value = Computed::Buffer;
    }

    fn frequency_at(&self, index: usize) -> Frequency {
        match self.frequency_value {
            Computed::Constant(frequency) => frequency,
            Computed::Buffer => self.computed_frequency[index],
        }
    }
}

#[inline]
fn value_at(computed: Computed, buffer: &[Sample], index: usize) -> Number {
    match computed {
        Computed::Constant(value) => value,
        Computed::Buffer => buffer[index],
    }
}

impl SignalProducer for Oscillator {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.modulated_amplitude);
        visitor(&mut self.amplitude);
        visitor(&mut self.frequency);
        visitor(&mut self.phase);
        visitor(&mut self.detune);
        visitor(&mut self.fine_detune);
        visitor(&mut self.subharmonic_amplitude);

        for harmonic in &mut self.harmonics {
            visitor(harmonic);
        }
    }

    fn block_size_changed(&mut self) {
        let block_size = self.state.block_size();

        self.computed_amplitude = vec![0.0; block_size];
        self.computed_frequency = vec![0.0; block_size];
        self.computed_phase = vec![0.0; block_size];
        self.computed_subharmonic = vec![0.0; block_size];
    }

    fn sample_rate_changed(&mut self) {
        if self.is_on {
            self.is_starting = true;
            self.start_time_offset = 0.0;
        }
    }

    fn reset_state(&mut self) {
        self.is_on = false;
        self.is_starting = false;
        self.start_time_offset = 0.0;
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        self.update_waveform(round, sample_count);
        self.update_lfo_scales();
        self.compute_amplitude(round, sample_count);
        self.compute_frequency(round, sample_count);
        self.compute_phase(round, sample_count);
        self.compute_subharmonic(round, sample_count);

        Rendering::Render
    }

    fn handle_event(&mut self, event: &Event) {
        match event.kind {
            EVT_START => {
                self.is_on = true;
                self.is_starting = true;
                self.start_time_offset = self.state.current_time() - event.time_offset;
            }
            EVT_STOP => self.is_on = false,
            _ => {}
        }
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let output = &mut buffer.channel_mut(0)[first..last];

        if !self.is_on {
            output.fill(0.0);
            return;
        }

        if self.is_starting {
            self.is_starting = false;
            let frequency = self.frequency_at(first);
            Wavetable::reset_state(
                &mut self.wavetable_state,
                self.state.sampling_period(),
                self.state.nyquist_frequency(),
                frequency,
                self.start_time_offset,
            );
        }

        let wavetable = match self.current_waveform.standard_wavetable() {
            Some(wavetable) => wavetable,
            None => &self.custom_wavetable,
        };
        let with_subharmonic = !matches!(
            self.subharmonic_value,
            Computed::Constant(level) if level < SUBHARMONIC_INSIGNIFICANT
        );
        let offset_scale = self.offset_scale;

        for (out, i) in output.iter_mut().zip(first..last) {
            let amplitude = value_at(self.amplitude_value, &self.computed_amplitude, i);
            let frequency = value_at(self.frequency_value, &self.computed_frequency, i);
            let phase = value_at(self.phase_value, &self.computed_phase, i);
            let (sample, subharmonic) =
                wavetable.lookup(&mut self.wavetable_state, frequency, phase, with_subharmonic);

            *out = amplitude * (offset_scale + sample);

            if with_subharmonic {
                *out += value_at(self.subharmonic_value, &self.computed_subharmonic, i) * subharmonic;
            }
        }
    }
}
