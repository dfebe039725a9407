//! The effects bus of the synthesizer: chorus, echo, then reverb.

use vesta_core::{Buffer, ProducerState, Rendering, Round, SignalProducer, produce};

use crate::chorus::Chorus;
use crate::echo::Echo;
use crate::effect::Effect;
use crate::reverb::Reverb;

/// Chorus stage over the bus input.
pub type ChorusStage<I> = Effect<I, Chorus>;
/// Echo stage over the chorus stage.
pub type EchoStage<I> = Effect<ChorusStage<I>, Echo>;
/// Reverb stage over the echo stage.
pub type ReverbStage<I> = Effect<EchoStage<I>, Reverb>;

/// `input → chorus → echo → reverb`, every stage with its own dry and wet
/// levels. The echo and the reverb are side-chain compressed by their input.
///
/// Every stage starts fully dry, so a fresh bus passes its input through.
pub struct Effects<I: SignalProducer> {
    state: ProducerState,
    chain: ReverbStage<I>,
}

impl<I: SignalProducer> core::fmt::Debug for Effects<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Effects")
            .field("chorus", self.chorus())
            .field("echo", self.echo())
            .field("reverb", &self.chain)
            .finish_non_exhaustive()
    }
}

impl<I: SignalProducer> Effects<I> {
    /// Bus over `input`; stage parameters are prefixed with `<name>C`,
    /// `<name>E` and `<name>R`.
    pub fn new(name: &str, input: I) -> Self {
        let channels = input.state().channels();
        let chorus_name = format!("{name}C");
        let echo_name = format!("{name}E");
        let reverb_name = format!("{name}R");

        let chorus = Effect::new(&chorus_name, input, Chorus::new(&chorus_name, channels));
        let echo = Effect::compressed(&echo_name, chorus, Echo::new(&echo_name, channels));
        let reverb = Effect::compressed(&reverb_name, echo, Reverb::new(&reverb_name, channels));

        Self {
            state: ProducerState::new(channels),
            chain: reverb,
        }
    }

    /// The chorus stage.
    pub fn chorus(&self) -> &ChorusStage<I> {
        self.echo().input()
    }

    /// The chorus stage, mutably.
    pub fn chorus_mut(&mut self) -> &mut ChorusStage<I> {
        self.echo_mut().input_mut()
    }

    /// The echo stage.
    pub fn echo(&self) -> &EchoStage<I> {
        self.chain.input()
    }

    /// The echo stage, mutably.
    pub fn echo_mut(&mut self) -> &mut EchoStage<I> {
        self.chain.input_mut()
    }

    /// The reverb stage.
    pub fn reverb(&self) -> &ReverbStage<I> {
        &self.chain
    }

    /// The reverb stage, mutably.
    pub fn reverb_mut(&mut self) -> &mut ReverbStage<I> {
        &mut self.chain
    }

    /// The bus input.
    pub fn input(&self) -> &I {
        self.chorus().input()
    }

    /// The bus input, mutably.
    pub fn input_mut(&mut self) -> &mut I {
        self.chorus_mut().input_mut()
    }
}

impl<I: SignalProducer> SignalProducer for Effects<I> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.chain);
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.chain, round, sample_count);

        if self.chain.is_silent(round, sample_count) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        let output = self.chain.state().buffer();
        self.state.buffer_mut().copy_from(output, sample_count);

        Rendering::Ready
    }

    fn render(&mut self, _round: Round, _first: usize, _last: usize, _buffer: &mut Buffer) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesta_core::Sample;

    struct Level {
        state: ProducerState,
        value: Sample,
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

    fn bus(value: Sample) -> Effects<Level> {
        let mut effects = Effects::new(
            "FX",
            Level {
                state: ProducerState::new(2),
                value,
            },
        );
        effects.set_sample_rate(8000.0);
        effects.set_block_size(32);
        effects
    }

    #[test]
    fn fresh_bus_passes_the_input_through() {
        let mut effects = bus(0.3);

        assert_eq!(produce(&mut effects, 1, 32).channel(1), &[0.3; 32]);
    }

    #[test]
    fn stage_parameters_are_prefixed() {
        let effects = bus(0.0);

        assert_eq!(effects.chorus().wet.name(), "FXCWET");
        assert_eq!(effects.echo().dry.name(), "FXEDRY");
        assert_eq!(effects.echo().processor().feedback.borrow().name(), "FXEFB");
        assert_eq!(effects.reverb().wet.name(), "FXRWET");
        assert_eq!(effects.reverb().processor().room_size.borrow().name(), "FXRRSZ");
    }

    #[test]
    fn echo_and_reverb_are_compressed() {
        let effects = bus(0.0);

        assert!(effects.chorus().compressor().is_none());
        assert_eq!(
            effects.echo().compressor().map(|compressor| compressor.threshold.name()),
            Some("FXECTH")
        );
        assert_eq!(
            effects.reverb().compressor().map(|compressor| compressor.ratio.name()),
            Some("FXRCR")
        );
    }

    #[test]
    fn wet_reverb_adds_a_tail() {
        let mut effects = bus(0.5);
        effects.reverb_mut().wet.set_value(1.0);

        for round in 1..=8 {
            produce(&mut effects, round, 32);
        }

        effects.input_mut().value = 0.0;

        let tail = produce(&mut effects, 9, 32).channel(0).to_vec();

        assert!(tail.iter().all(|sample| sample.is_finite()));
        assert!(tail.iter().any(|sample| sample.abs() > 1e-3));
    }

    #[test]
    fn wet_chorus_changes_the_signal() {
        let mut effects = bus(0.5);
        effects.chorus_mut().wet.set_value(1.0);
        effects.chorus_mut().dry.set_value(0.0);

        let mut heard = false;

        for round in 1..=4 {
            let output = produce(&mut effects, round, 32);

            assert!(output.channel(0).iter().all(|sample| sample.is_finite()));
            heard |= output.channel(0).iter().any(|sample| (sample - 0.5).abs() > 1e-3);
        }

        assert!(heard);
    }

    #[test]
    fn silent_input_makes_a_silent_bus() {
        let mut effects = bus(0.0);
        effects.echo_mut().wet.set_value(1.0);

        produce(&mut effects, 1, 32);

        assert!(effects.is_silent(1, 32));
    }
}
