//! Summing node.

use crate::producer::{Buffer, ProducerState, Rendering, Round, SignalProducer, produce};
use crate::{Number, Sample};

/// Weighted sum of owned producers with the same channel count.
///
/// Silent inputs are skipped; when all of them are silent the mixer output
/// is marked silent without summing.
#[derive(Debug)]
pub struct Mixer<P: SignalProducer> {
    state: ProducerState,
    inputs: Vec<P>,
    weights: Vec<Number>,
    audible: Vec<bool>,
}

impl<P: SignalProducer> Mixer<P> {
    /// Empty mixer with `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            state: ProducerState::new(channels),
            inputs: Vec::new(),
            weights: Vec::new(),
            audible: Vec::new(),
        }
    }

    /// Append `input` with unity weight and return its index. Not real-time
    /// safe; the input is configured like the mixer.
    pub fn add(&mut self, input: P) -> usize {
        self.add_weighted(input, 1.0)
    }

    /// Append `input` scaled by `weight` and return its index.
    pub fn add_weighted(&mut self, mut input: P, weight: Number) -> usize {
        input.set_sample_rate(self.state.sample_rate());
        input.set_block_size(self.state.block_size());
        input.set_bpm(self.state.bpm());

        self.inputs.push(input);
        self.weights.push(weight);
        self.audible.push(false);

        #[cfg(feature = "tracing")]
        tracing::debug!(inputs = self.inputs.len(), weight, "mixer input added");

        self.inputs.len() - 1
    }

    /// Number of inputs.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Whether there are no inputs.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Input at `index`.
    pub fn input(&self, index: usize) -> &P {
        &self.inputs[index]
    }

    /// Input at `index`, mutably.
    pub fn input_mut(&mut self, index: usize) -> &mut P {
        &mut self.inputs[index]
    }

    /// All inputs.
    pub fn inputs(&self) -> &[P] {
        &self.inputs
    }

    /// All inputs, mutably.
    pub fn inputs_mut(&mut self) -> &mut [P] {
        &mut self.inputs
    }

    /// Weight of the input at `index`.
    pub fn weight(&self, index: usize) -> Number {
        self.weights[index]
    }

    /// Change the weight of the input at `index`.
    pub fn set_weight(&mut self, index: usize, weight: Number) {
        self.weights[index] = weight;
    }
}

impl<P: SignalProducer> SignalProducer for Mixer<P> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        for input in &mut self.inputs {
            visitor(input);
        }
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        let mut any_audible = false;

        for (input, audible) in self.inputs.iter_mut().zip(&mut self.audible) {
            produce(input, round, sample_count);
            *audible = !input.is_silent(round, sample_count);
            any_audible |= *audible;
        }

        if !any_audible {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        buffer.silence(first, last);

        let mixed = self
            .inputs
            .iter()
            .zip(&self.weights)
            .zip(&self.audible)
            .filter(|(_, audible)| **audible);

        for ((input, weight), _) in mixed {
            let input = input.state().buffer();

            for (c, output) in buffer.channels_mut().iter_mut().enumerate().take(input.channels()) {
                let samples: &[Sample] = &input.channel(c)[first..last];

                for (out, sample) in output[first..last].iter_mut().zip(samples) {
                    *out += weight * sample;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn sums_weighted_inputs() {
        let mut mixer = Mixer::new(2);
        mixer.set_block_size(4);
        mixer.add(Level::new(0.25));
        mixer.add_weighted(Level::new(0.5), 0.5);

        let output = produce(&mut mixer, 1, 4);

        assert_eq!(output.channel(0), &[0.5; 4]);
        assert_eq!(output.channel(1), &[0.5; 4]);
    }

    #[test]
    fn inputs_follow_the_mixer_configuration() {
        let mut mixer = Mixer::new(2);
        mixer.set_block_size(16);
        mixer.set_sample_rate(22050.0);
        let index = mixer.add(Level::new(1.0));

        assert_eq!(mixer.input(index).state().block_size(), 16);
        assert_eq!(mixer.input(index).state().sample_rate(), 22050.0);
    }

    #[test]
    fn all_silent_inputs_make_a_silent_mix() {
        let mut mixer = Mixer::new(2);
        mixer.set_block_size(4);
        mixer.add(Level::new(0.0));
        mixer.add(Level::new(0.0));

        produce(&mut mixer, 1, 4);

        assert!(mixer.is_silent(1, 4));
    }

    #[test]
    fn empty_mixer_is_silent() {
        let mut mixer: Mixer<Level> = Mixer::new(1);
        mixer.set_block_size(4);

        assert_eq!(produce(&mut mixer, 1, 4).channel(0), &[0.0; 4]);
    }

    #[test]
    fn weights_can_change_between_rounds() {
        let mut mixer = Mixer::new(2);
        mixer.set_block_size(2);
        let index = mixer.add(Level::new(1.0));

        produce(&mut mixer, 1, 2);
        mixer.set_weight(index, 0.25);

        assert_eq!(produce(&mut mixer, 2, 2).channel(0), &[0.25; 2]);
        assert_eq!(mixer.weight(index), 0.25);
    }
}
