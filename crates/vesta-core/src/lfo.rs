//! Low-frequency oscillator for parameter modulation.
//!
//! The output is a ratio in `[0, 1]`: a [`FloatParam`] driven by an LFO maps
//! each sample through its own `ratio_to_value`, so one LFO can modulate
//! parameters of any range.

use std::rc::Rc;

use crate::envelope::Envelope;
use crate::math;
use crate::oscillator::{Oscillator, OscillatorLeaders, Waveform};
use crate::param::{ByteParam, FloatParam, ModulatableFloatParam, OFF, ON, ToggleParam, is_on};
use crate::producer::{Buffer, ProducerState, Rendering, Round, Shared, SignalProducer, produce, shared};
use crate::{Number, Seconds};

/// Lowest LFO frequency in Hz.
pub const FREQUENCY_MIN: Number = 0.01;
/// Highest LFO frequency in Hz.
pub const FREQUENCY_MAX: Number = 30.0;
/// Highest amount; the oscillator swings `amount` around its center.
pub const AMOUNT_MAX: Number = 0.5;

const SHAPING_INSIGNIFICANT: Number = 0.000001;

/// Low-frequency oscillator with range, distortion and randomness.
///
/// Frequency, phase and amount live on the inner oscillator and are reached
/// through accessors. Uncentered LFOs sweep `min..=max`; centered ones swing
/// around the midpoint of the range.
pub struct Lfo {
    state: ProducerState,
    name: String,
    /// Waveform selector.
    pub waveform: Shared<ByteParam>,
    /// Sync the frequency to the tempo: frequency becomes cycles per beat.
    pub tempo_sync: Shared<ToggleParam>,
    /// Swing around the midpoint of the range instead of sweeping it.
    pub center: Shared<ToggleParam>,
    /// Lower end of the range.
    pub min: FloatParam,
    /// Upper end of the range.
    pub max: FloatParam,
    /// Amount of `tanh` distortion applied to the waveform.
    pub distortion: FloatParam,
    /// Amount of deterministic randomization applied to the waveform.
    pub randomness: FloatParam,
    oscillator: Oscillator,
    amount_envelope: Option<Shared<Envelope>>,
}

impl core::fmt::Debug for Lfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lfo")
            .field("name", &self.name)
            .field("oscillator", &self.oscillator)
            .finish_non_exhaustive()
    }
}

impl Lfo {
    /// LFO with private parameters; names are prefixed with `name`.
    pub fn new(name: &str) -> Self {
        let waveform = shared(Waveform::param(format!("{name}WAV"), Waveform::SoftSquare));
        let tempo_sync = shared(crate::param::toggle(format!("{name}SYN"), OFF));
        let center = shared(crate::param::toggle(format!("{name}CEN"), OFF));

        let mut oscillator = Oscillator::new(Rc::clone(&waveform))
            .with_lfo_toggles(Rc::clone(&tempo_sync), Rc::clone(&center));
        oscillator.frequency =
            FloatParam::new(format!("{name}FRQ"), FREQUENCY_MIN, FREQUENCY_MAX, 1.0);
        oscillator.amplitude = FloatParam::new(format!("{name}AMT"), 0.0, AMOUNT_MAX, AMOUNT_MAX);
        oscillator.phase =
            ModulatableFloatParam::unmodulated(FloatParam::new(format!("{name}PHS"), 0.0, 1.0, 0.0));

        Self {
            state: ProducerState::new(1),
            name: name.to_owned(),
            waveform,
            tempo_sync,
            center,
            min: FloatParam::block(format!("{name}MIN"), 0.0, 1.0, 0.0),
            max: FloatParam::block(format!("{name}MAX"), 0.0, 1.0, 1.0),
            distortion: FloatParam::block(format!("{name}DST"), 0.0, 1.0, 0.0),
            randomness: FloatParam::block(format!("{name}RND"), 0.0, 1.0, 0.0),
            oscillator,
            amount_envelope: None,
        }
    }

    /// Centered sine LFO following shared frequency, range and amount
    /// parameters, shifted by `phase_offset` periods. Used for ensembles of
    /// LFOs that move together, such as chorus voices.
    pub fn with_leaders(
        name: &str,
        frequency_leader: &Shared<FloatParam>,
        max_leader: &Shared<FloatParam>,
        amount_leader: &Shared<FloatParam>,
        tempo_sync: Shared<ToggleParam>,
        phase_offset: Number,
    ) -> Self {
        let waveform = shared(Waveform::param(format!("{name}WAV"), Waveform::Sine));
        let center = shared(crate::param::toggle(format!("{name}CEN"), ON));

        let mut leaders = OscillatorLeaders::new(Rc::clone(&waveform));
        leaders.frequency = Some(Rc::clone(frequency_leader));
        leaders.amplitude = Some(Rc::clone(amount_leader));

        let mut oscillator = Oscillator::from_leaders(&leaders, None)
            .with_lfo_toggles(Rc::clone(&tempo_sync), Rc::clone(&center));
        oscillator
            .phase
            .param_mut()
            .set_value(phase_offset.rem_euclid(1.0));

        Self {
            state: ProducerState::new(1),
            name: name.to_owned(),
            waveform,
            tempo_sync,
            center,
            min: FloatParam::block(format!("{name}MIN"), 0.0, 1.0, 0.0),
            max: FloatParam::follower(max_leader),
            distortion: FloatParam::block(format!("{name}DST"), 0.0, 1.0, 0.0),
            randomness: FloatParam::block(format!("{name}RND"), 0.0, 1.0, 0.0),
            oscillator,
            amount_envelope: None,
        }
    }

    /// Name prefix of the parameters.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frequency in Hz, or cycles per beat with tempo sync.
    pub fn frequency(&self) -> &FloatParam {
        &self.oscillator.frequency
    }

    /// Frequency, mutably.
    pub fn frequency_mut(&mut self) -> &mut FloatParam {
        &mut self.oscillator.frequency
    }

    /// Phase offset in periods.
    pub fn phase(&self) -> &FloatParam {
        self.oscillator.phase.param()
    }

    /// Phase offset, mutably.
    pub fn phase_mut(&mut self) -> &mut FloatParam {
        self.oscillator.phase.param_mut()
    }

    /// Swing of the waveform; [`AMOUNT_MAX`] covers the whole range.
    pub fn amount(&self) -> &FloatParam {
        &self.oscillator.amplitude
    }

    /// Amount, mutably.
    pub fn amount_mut(&mut self) -> &mut FloatParam {
        &mut self.oscillator.amplitude
    }

    /// Envelope applied per voice to the output of this LFO.
    pub fn amount_envelope(&self) -> Option<Shared<Envelope>> {
        self.amount_envelope.clone()
    }

    /// Assign or clear the per-voice amount envelope.
    pub fn set_amount_envelope(&mut self, envelope: Option<Shared<Envelope>>) {
        self.amount_envelope = envelope;
    }

    /// Start oscillating at `time_offset`.
    pub fn start(&mut self, time_offset: Seconds) {
        self.oscillator.start(time_offset);
    }

    /// Stop oscillating at `time_offset`, dropping scheduled parameter changes.
    pub fn stop(&mut self, time_offset: Seconds) {
        self.oscillator.cancel_events();
        self.oscillator.stop(time_offset);
    }

    /// Whether the oscillator is running.
    pub fn is_on(&self) -> bool {
        self.oscillator.is_on()
    }

    /// Advance every clock by one block without rendering.
    pub fn skip_round(&mut self, round: Round, sample_count: usize) {
        if self.state.cached_round() == Some(round) {
            return;
        }

        self.state.set_cached_round(round);
        self.oscillator.skip_round(round, sample_count);
        self.min.skip_round(round, sample_count);
        self.max.skip_round(round, sample_count);
        self.distortion.skip_round(round, sample_count);
        self.randomness.skip_round(round, sample_count);
    }
}

impl SignalProducer for Lfo {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.oscillator);
        visitor(&mut self.min);
        visitor(&mut self.max);
        visitor(&mut self.distortion);
        visitor(&mut self.randomness);
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        for param in [&mut self.min, &mut self.max, &mut self.distortion, &mut self.randomness] {
            produce(param, round, sample_count);
        }

        let min = self.min.value();
        let max = self.max.value();
        let distortion = self.distortion.value();
        let randomness = self.randomness.value();
        let range = max - min;
        let is_centered = is_on(&self.center.borrow());

        let waveform = &produce(&mut self.oscillator, round, sample_count).channel(0)[..sample_count];
        let output = &mut self.state.buffer_mut().channel_mut(0)[..sample_count];
        let is_shaped = distortion >= SHAPING_INSIGNIFICANT || randomness >= SHAPING_INSIGNIFICANT;

        if is_centered {
            let center = (min + max) * 0.5;

            for (out, x) in output.iter_mut().zip(waveform) {
                let x = if is_shaped {
                    math::randomize_centered(randomness, math::distort_centered(distortion, *x))
                } else {
                    *x
                };

                *out = center + range * x;
            }
        } else {
            for (out, x) in output.iter_mut().zip(waveform) {
                let x = if is_shaped {
                    math::randomize(randomness, math::distort(distortion, *x))
                } else {
                    *x
                };

                *out = min + range * x;
            }
        }

        Rendering::Ready
    }

    fn render(&mut self, _round: Round, _first: usize, _last: usize, _buffer: &mut Buffer) {}
}

/// Per-note assignment of amount envelopes to LFOs, handed to voices on
/// note-on. Capacity is reserved up front so rebuilding it does not allocate.
#[derive(Debug, Default)]
pub struct LfoEnvelopeMapping {
    entries: Vec<(Shared<Lfo>, Shared<Envelope>)>,
}

impl LfoEnvelopeMapping {
    /// Mapping with room for `capacity` assignments.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Drop every assignment.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Envelope `envelope` the output of `lfo`.
    pub fn push(&mut self, lfo: Shared<Lfo>, envelope: Shared<Envelope>) {
        self.entries.push((lfo, envelope));
    }

    /// Number of assignments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no assignments.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Envelope assigned to `lfo`, matched by identity.
    pub fn envelope_for(&self, lfo: &Shared<Lfo>) -> Option<Shared<Envelope>> {
        self.entries
            .iter()
            .find(|(candidate, _)| Rc::ptr_eq(candidate, lfo))
            .map(|(_, envelope)| Rc::clone(envelope))
    }
}
