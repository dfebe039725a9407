//! Dry/wet wrapper around an effect processor.

use vesta_core::{
    Buffer, FloatParam, Number, ProducerState, Rendering, Round, Sample, SignalProducer,
    constant_or_rendered, produce, rendered,
};

use crate::compressor::{BYPASS_GAIN, SideChainCompressor};

const WET_INSIGNIFICANT: Number = 0.000001;
const DRY_FULL: Number = 0.99999;

/// A producer that processes a block handed to it by its owner.
///
/// [`Effect`] feeds the processor the block of its input, then pulls it in
/// the same round.
pub trait Processor: SignalProducer {
    /// Provide the input block of `round`.
    fn feed(&mut self, round: Round, input: &Buffer, sample_count: usize);
}

/// Blends an input with the output of a [`Processor`]: `dry * input + wet * processed`.
///
/// While `wet` is constant zero the processor is not pulled at all, and
/// while additionally `dry` is constant one the input is copied unchanged.
/// A [compressed](Self::compressed) effect also scales the processed signal
/// by the gain of its [`SideChainCompressor`].
pub struct Effect<I: SignalProducer, P: Processor> {
    state: ProducerState,
    input: I,
    processor: P,
    compressor: Option<SideChainCompressor>,

    /// Level of the unprocessed input, `[0, 1]`.
    pub dry: FloatParam,
    /// Level of the processed signal, `[0, 1]`.
    pub wet: FloatParam,

    dry_value: Option<Number>,
    wet_value: Option<Number>,
    gain_value: Option<Number>,
    is_dry: bool,
}

impl<I: SignalProducer, P: Processor> core::fmt::Debug for Effect<I, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Effect")
            .field("dry", &self.dry.value())
            .field("wet", &self.wet.value())
            .field("compressor", &self.compressor)
            .finish_non_exhaustive()
    }
}

impl<I: SignalProducer, P: Processor> Effect<I, P> {
    /// Wrap `processor` over `input`; the levels are named `<name>DRY` and
    /// `<name>WET` and start fully dry.
    pub fn new(name: &str, input: I, processor: P) -> Self {
        let channels = input.state().channels();

        Self {
            state: ProducerState::new(channels),
            input,
            processor,
            compressor: None,
            dry: FloatParam::new(format!("{name}DRY"), 0.0, 1.0, 1.0),
            wet: FloatParam::new(format!("{name}WET"), 0.0, 1.0, 0.0),
            dry_value: None,
            wet_value: None,
            gain_value: Some(BYPASS_GAIN),
            is_dry: true,
        }
    }

    /// Same as [`new`](Self::new), with the processed signal ducked by the
    /// input through a side-chain compressor named after `name`.
    pub fn compressed(name: &str, input: I, processor: P) -> Self {
        let mut effect = Self::new(name, input, processor);
        effect.compressor = Some(SideChainCompressor::new(name));
        effect
    }

    /// The side-chain compressor of a compressed effect.
    pub fn compressor(&self) -> Option<&SideChainCompressor> {
        self.compressor.as_ref()
    }

    /// The side-chain compressor of a compressed effect, mutably.
    pub fn compressor_mut(&mut self) -> Option<&mut SideChainCompressor> {
        self.compressor.as_mut()
    }

    /// The wrapped processor.
    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// The wrapped processor, mutably.
    pub fn processor_mut(&mut self) -> &mut P {
        &mut self.processor
    }

    /// The unprocessed producer.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The unprocessed producer, mutably.
    pub fn input_mut(&mut self) -> &mut I {
        &mut self.input
    }
}

impl<I: SignalProducer, P: Processor> SignalProducer for Effect<I, P> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.input);
        visitor(&mut self.processor);
        visitor(&mut self.dry);
        visitor(&mut self.wet);

        if let Some(compressor) = &mut self.compressor {
            compressor.visit_params(visitor);
        }
    }

    fn reset_state(&mut self) {
        if let Some(compressor) = &mut self.compressor {
            compressor.reset();
        }
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.input, round, sample_count);
        self.dry_value = constant_or_rendered(&mut self.dry, round, sample_count);
        self.wet_value = constant_or_rendered(&mut self.wet, round, sample_count);
        self.is_dry = self.wet_value.is_some_and(|wet| wet < WET_INSIGNIFICANT);

        if self.is_dry && self.dry_value.is_some_and(|dry| dry > DRY_FULL) {
            if let Some(compressor) = &mut self.compressor {
                compressor.bypass(round, sample_count);
            }

            let input = self.input.state().buffer();
            self.state.buffer_mut().copy_from(input, sample_count);
            return Rendering::Ready;
        }

        let input_is_silent = self.input.is_silent(round, sample_count);

        if !self.is_dry {
            self.processor
                .feed(round, self.input.state().buffer(), sample_count);
            produce(&mut self.processor, round, sample_count);
        }

        self.gain_value = match &mut self.compressor {
            Some(compressor) => {
                compressor.update(self.is_dry, self.input.state().buffer(), round, sample_count)
            }
            None => Some(BYPASS_GAIN),
        };

        if input_is_silent && (self.is_dry || self.processor.is_silent(round, sample_count)) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let input = self.input.state().buffer();
        let processed = self.processor.state().buffer();
        let dry_levels = rendered(&self.dry);
        let wet_levels = rendered(&self.wet);
        let gains = self
            .compressor
            .as_ref()
            .map_or(&[][..], |compressor| rendered(compressor.gain()));

        for (c, output) in buffer.channels_mut().iter_mut().enumerate() {
            let input: &[Sample] = input.channel(c);

            for i in first..last {
                let dry = self.dry_value.unwrap_or_else(|| dry_levels[i]);

                output[i] = if self.is_dry {
                    dry * input[i]
                } else {
                    let wet = self.wet_value.unwrap_or_else(|| wet_levels[i]);
                    let gain = self.gain_value.unwrap_or_else(|| gains[i]);

                    dry * input[i] + wet * gain * processed.channel(c)[i]
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesta_core::Feed;

    struct Level {
        state: ProducerState,
        value: Sample,
    }

    impl Level {
        fn new(value: Sample) -> Self {
            Self {
                state: ProducerState::new(2),
                value,
            }
        }
    }

    impl SignalProducer for Level {
        fn state(&self) -> &ProducerState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ProducerState {
            &mut self.state
        }

        fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
            for channel in buffer.channels_mut() {
                channel[first..last].fill(self.value);
            }
        }
    }

    /// Negates what it is fed and counts the rounds it was pulled in.
    struct Invert {
        state: ProducerState,
        feed: Feed,
        pulls: usize,
    }

    impl Invert {
        fn new() -> Self {
            Self {
                state: ProducerState::new(2),
                feed: Feed::new(2),
                pulls: 0,
            }
        }
    }

    impl Processor for Invert {
        fn feed(&mut self, round: Round, input: &Buffer, sample_count: usize) {
            self.feed.feed(round, input, sample_count);
        }
    }

    impl SignalProducer for Invert {
        fn state(&self) -> &ProducerState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ProducerState {
            &mut self.state
        }

        fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
            visitor(&mut self.feed);
        }

        fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
            self.pulls += 1;
            produce(&mut self.feed, round, sample_count);
            Rendering::Render
        }

        fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
            let input = self.feed.state().buffer();

            for (c, channel) in buffer.channels_mut().iter_mut().enumerate() {
                for i in first..last {
                    channel[i] = -input.channel(c)[i];
                }
            }
        }
    }

    fn effect(value: Sample) -> Effect<Level, Invert> {
        let mut effect = Effect::new("E", Level::new(value), Invert::new());
        effect.set_block_size(8);
        effect
    }

    #[test]
    fn fully_dry_effect_skips_the_processor() {
        let mut effect = effect(0.5);

        assert_eq!(produce(&mut effect, 1, 8).channel(0), &[0.5; 8]);
        assert_eq!(effect.processor().pulls, 0);
    }

    #[test]
    fn wet_and_dry_are_blended() {
        let mut effect = effect(0.5);
        effect.dry.set_value(0.5);
        effect.wet.set_value(0.25);

        let output = produce(&mut effect, 1, 8);

        assert_eq!(output.channel(1), &[0.125; 8]);
        assert_eq!(effect.processor().pulls, 1);
    }

    #[test]
    fn zero_wet_scales_the_input_without_processing() {
        let mut effect = effect(0.5);
        effect.dry.set_value(0.5);

        assert_eq!(produce(&mut effect, 1, 8).channel(0), &[0.25; 8]);
        assert_eq!(effect.processor().pulls, 0);
    }

    #[test]
    fn automated_levels_are_applied_per_sample() {
        let mut effect = effect(1.0);
        effect.dry.set_value(0.0);
        effect.wet.schedule_value(0.0, 1.0);

        let output = produce(&mut effect, 1, 8).channel(0).to_vec();

        assert!(output.iter().all(|&sample| (sample + 1.0).abs() < 1e-12));
    }

    /// Fully wet compressed effect over a constant input, at 1 kHz.
    fn compressed(value: Sample) -> Effect<Level, Invert> {
        let mut effect = Effect::compressed("E", Level::new(value), Invert::new());
        effect.set_sample_rate(1000.0);
        effect.set_block_size(8);
        effect.dry.set_value(0.0);
        effect.wet.set_value(1.0);
        effect
    }

    #[test]
    fn no_op_ratio_leaves_the_wet_signal_alone() {
        let mut effect = compressed(1.0);

        for round in 1..=4 {
            assert_eq!(produce(&mut effect, round, 8).channel(0), &[-1.0; 8]);
        }

        assert!(effect.compressor().is_some_and(SideChainCompressor::is_bypassing));
    }

    #[test]
    fn loud_input_ducks_the_wet_signal() {
        let mut effect = compressed(1.0);
        let compressor = effect.compressor_mut().unwrap();
        compressor.ratio.set_value(4.0);
        compressor.attack_time.set_value(0.01);

        // 18 dB above the threshold, compressed to 4.5 dB above it.
        let target = vesta_core::math::db_to_magnitude(-18.0 + 18.0 / 4.0);
        let mut last = 0.0;

        for round in 1..=60 {
            last = produce(&mut effect, round, 8).channel(1)[7];
        }

        assert!((last + target).abs() < 0.01, "{last} vs {target}");
        assert!(!effect.compressor().unwrap().is_bypassing());
    }

    #[test]
    fn quiet_input_is_not_compressed() {
        let mut effect = compressed(0.1);
        effect.compressor_mut().unwrap().ratio.set_value(120.0);

        for round in 1..=8 {
            let output = produce(&mut effect, round, 8);

            assert!(output.channel(0).iter().all(|&sample| (sample + 0.1).abs() < 1e-12));
        }
    }

    #[test]
    fn gain_is_released_once_the_input_falls_silent() {
        let mut effect = compressed(1.0);
        let compressor = effect.compressor_mut().unwrap();
        compressor.ratio.set_value(120.0);
        compressor.attack_time.set_value(0.001);
        compressor.release_time.set_value(0.05);

        for round in 1..=20 {
            produce(&mut effect, round, 8);
        }

        assert!(effect.compressor().unwrap().gain().value() < 0.5);

        effect.input_mut().value = 0.0;

        for round in 21..=60 {
            produce(&mut effect, round, 8);
        }

        let compressor = effect.compressor().unwrap();

        assert!((compressor.gain().value() - 1.0).abs() < 1e-9);
        assert!(compressor.is_bypassing());
    }

    #[test]
    fn silent_input_and_processor_make_silence() {
        let mut effect = effect(0.0);
        effect.wet.set_value(1.0);

        produce(&mut effect, 1, 8);

        assert!(effect.is_silent(1, 8));
    }
}
