use core::fmt;

use super::float::{FloatParam, produce_if_not_constant};
use crate::lfo::LfoEnvelopeMapping;
use crate::producer::{Buffer, ProducerState, Rendering, Round, Shared, SignalProducer, produce};
use crate::{Number, Sample, Seconds};

/// Modulation levels at or below this are treated as zero.
pub const MODULATION_LEVEL_INSIGNIFICANT: Number = 0.000001;

/// Source of an audio-rate modulation signal.
///
/// Implemented by voices so that a carrier's oscillator can read its
/// modulator's output. The signal is rendered at most once per round.
pub trait Modulator {
    /// Mono modulation signal of `round`; `sample_count` samples long.
    fn modulation_signal(&mut self, round: Round, sample_count: usize) -> &[Sample];
}

/// A [`FloatParam`] plus `level × modulator` per sample.
///
/// The modulation level is a parameter of its own, so it can follow a leader
/// and run envelopes. A constant insignificant level does not pull the
/// modulator at all.
pub struct ModulatableFloatParam {
    state: ProducerState,
    param: FloatParam,
    level: FloatParam,
    modulator: Option<Shared<dyn Modulator>>,
    is_no_op: bool,
}

impl fmt::Debug for ModulatableFloatParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModulatableFloatParam")
            .field("param", &self.param)
            .field("level", &self.level)
            .field("has_modulator", &self.modulator.is_some())
            .finish_non_exhaustive()
    }
}

impl ModulatableFloatParam {
    /// Modulate `param` by `modulator`, scaled by `level`.
    pub fn new(param: FloatParam, level: FloatParam, modulator: Shared<dyn Modulator>) -> Self {
        Self {
            state: ProducerState::new(1),
            param,
            level,
            modulator: Some(modulator),
            is_no_op: true,
        }
    }

    /// A parameter without a modulator; renders exactly like `param`.
    pub fn unmodulated(param: FloatParam) -> Self {
        Self {
            state: ProducerState::new(1),
            param,
            level: FloatParam::block("", 0.0, 0.0, 0.0),
            modulator: None,
            is_no_op: true,
        }
    }

    /// The modulated parameter.
    pub fn param(&self) -> &FloatParam {
        &self.param
    }

    /// The modulated parameter, mutably.
    pub fn param_mut(&mut self) -> &mut FloatParam {
        &mut self.param
    }

    /// The modulation level.
    pub fn level(&self) -> &FloatParam {
        &self.level
    }

    /// The modulation level, mutably.
    pub fn level_mut(&mut self) -> &mut FloatParam {
        &mut self.level
    }

    /// Whether a modulator is attached.
    pub fn has_modulator(&self) -> bool {
        self.modulator.is_some()
    }

    /// Unmodulated value.
    pub fn value(&self) -> Number {
        self.param.value()
    }

    /// Whether the next `sample_count` samples all equal
    /// [`value`](Self::value).
    pub fn is_constant_in_next_round(&mut self, round: Round, sample_count: usize) -> bool {
        if self.modulator.is_none() {
            return self.param.is_constant_in_next_round(round, sample_count);
        }

        self.level.is_constant_in_next_round(round, sample_count)
            && self.param.is_constant_in_next_round(round, sample_count)
            && self.level.value() <= MODULATION_LEVEL_INSIGNIFICANT
    }

    /// Like [`produce_if_not_constant`] for plain parameters: `None` means
    /// read [`value`](Self::value) instead.
    pub fn produce_if_not_constant(&mut self, round: Round, sample_count: usize) -> Option<&[Sample]> {
        if self.is_constant_in_next_round(round, sample_count) {
            self.skip_round(round, sample_count);
            return None;
        }

        Some(&produce(self, round, sample_count).channel(0)[..sample_count])
    }

    /// Advance both clocks by one block without rendering.
    pub fn skip_round(&mut self, round: Round, sample_count: usize) {
        self.param.skip_round(round, sample_count);

        if self.modulator.is_some() {
            self.level.skip_round(round, sample_count);
        }
    }

    /// Start the envelopes of the parameter and the modulation level.
    pub fn start_envelope(&mut self, time_offset: Seconds) {
        self.param.start_envelope(time_offset);

        if self.modulator.is_some() {
            self.level.start_envelope(time_offset);
        }
    }

    /// Start the LFO amplitude envelopes of the parameter and the level.
    pub fn start_lfo_envelope(&mut self, time_offset: Seconds, mapping: &LfoEnvelopeMapping) {
        self.param.start_lfo_envelope(time_offset, mapping);

        if self.modulator.is_some() {
            self.level.start_lfo_envelope(time_offset, mapping);
        }
    }

    /// Release both envelopes; returns the longer release.
    pub fn end_envelope(&mut self, time_offset: Seconds) -> Seconds {
        let release = self.param.end_envelope(time_offset);

        if self.modulator.is_none() {
            return release;
        }

        release.max(self.level.end_envelope(time_offset))
    }

    /// Cut both envelopes short; returns the longer effective release.
    pub fn cancel_envelope(&mut self, time_offset: Seconds, duration: Seconds) -> Seconds {
        let release = self.param.cancel_envelope(time_offset, duration);

        if self.modulator.is_none() {
            return release;
        }

        release.max(self.level.cancel_envelope(time_offset, duration))
    }

    /// Forward the voice's MIDI channel to both parameters.
    pub fn set_midi_channel(&mut self, channel: u8) {
        self.param.set_midi_channel(channel);
        self.level.set_midi_channel(channel);
    }

    /// Forward the voice status to both parameters.
    pub fn set_voice_status(&mut self, voice_status: u8) {
        self.param.set_voice_status(voice_status);
        self.level.set_voice_status(voice_status);
    }
}

impl SignalProducer for ModulatableFloatParam {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.param);
        visitor(&mut self.level);
    }

    fn reset_state(&mut self) {
        self.is_no_op = true;
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        {
            let output = produce(&mut self.param, round, sample_count);
            self.state.buffer_mut().copy_from(output, sample_count);
        }

        let Some(modulator) = &self.modulator else {
            self.is_no_op = true;
            return Rendering::Ready;
        };

        let level_is_constant = produce_if_not_constant(&mut self.level, round, sample_count).is_none();
        let level_value = self.level.value();

        self.is_no_op = level_is_constant && level_value <= MODULATION_LEVEL_INSIGNIFICANT;

        if self.is_no_op {
            return Rendering::Ready;
        }

        // Borrowed elsewhere only through a modulation cycle; such a cycle
        // reads as no modulation.
        let Ok(mut modulator) = modulator.try_borrow_mut() else {
            return Rendering::Ready;
        };

        let signal = modulator.modulation_signal(round, sample_count);
        let output = &mut self.state.buffer_mut().channel_mut(0)[..sample_count];

        if level_is_constant {
            for (out, modulation) in output.iter_mut().zip(signal) {
                *out += level_value * modulation;
            }
        } else {
            let level = &self.level.state().buffer().channel(0)[..sample_count];

            for ((out, modulation), level) in output.iter_mut().zip(signal).zip(level) {
                *out += level * modulation;
            }
        }

        Rendering::Ready
    }

    fn render(&mut self, _round: Round, _first: usize, _last: usize, _buffer: &mut Buffer) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::shared;
    use std::rc::Rc;

    #[derive(Debug)]
    struct Ramp {
        output: Vec<Sample>,
        pulls: usize,
        round: Option<Round>,
    }

    impl Modulator for Ramp {
        fn modulation_signal(&mut self, round: Round, sample_count: usize) -> &[Sample] {
            if self.round != Some(round) {
                self.round = Some(round);
                self.pulls += 1;
            }

            &self.output[..sample_count]
        }
    }

    fn ramp_modulator() -> Shared<Ramp> {
        shared(Ramp {
            output: vec![0.0, 1.0, 2.0, 3.0],
            pulls: 0,
            round: None,
        })
    }

    #[test]
    fn modulation_is_added_to_the_value() {
        let modulator = ramp_modulator();
        let level = FloatParam::new("lvl", 0.0, 1.0, 0.5);
        let mut param = ModulatableFloatParam::new(
            FloatParam::new("p", 0.0, 10.0, 1.0),
            level,
            Rc::clone(&modulator) as Shared<dyn Modulator>,
        );
        param.set_block_size(4);

        let output = produce(&mut param, 1, 4).channel(0)[..4].to_vec();

        assert_eq!(output, vec![1.0, 1.5, 2.0, 2.5]);
        assert!(!param.is_constant_in_next_round(2, 4));
    }

    #[test]
    fn insignificant_level_does_not_pull_the_modulator() {
        let modulator = ramp_modulator();
        let mut param = ModulatableFloatParam::new(
            FloatParam::new("p", 0.0, 10.0, 1.0),
            FloatParam::new("lvl", 0.0, 1.0, 0.0),
            Rc::clone(&modulator) as Shared<dyn Modulator>,
        );
        param.set_block_size(4);

        let output = produce(&mut param, 1, 4).channel(0)[..4].to_vec();

        assert_eq!(output, vec![1.0; 4]);
        assert_eq!(modulator.borrow().pulls, 0);
        assert!(param.is_constant_in_next_round(2, 4));
    }

    #[test]
    fn unmodulated_params_render_like_the_inner_param() {
        let mut param = ModulatableFloatParam::unmodulated(FloatParam::new("p", 0.0, 1.0, 0.25));
        param.set_block_size(3);
        param.param_mut().schedule_value(0.0, 0.75);

        assert_eq!(produce(&mut param, 1, 3).channel(0)[..3].to_vec(), vec![0.75; 3]);
        assert!(!param.has_modulator());
    }
}
