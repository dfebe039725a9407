//! Level node: multiplies its input by a parameter.

use crate::Number;
use crate::param::{FloatParam, constant_or_rendered};
use crate::producer::{
    Buffer, ProducerState, Rendering, Round, Shared, SignalProducer, produce, rendered,
};

const UNITY_TOLERANCE: Number = 0.000001;

/// Multiplies every channel of its input by `gain`.
///
/// A constant unity gain copies the input without multiplying.
#[derive(Debug)]
pub struct Gain<I: SignalProducer> {
    state: ProducerState,
    input: I,
    /// Multiplier, evaluated per sample when automated.
    pub gain: FloatParam,
    gain_value: Option<Number>,
}

impl<I: SignalProducer> Gain<I> {
    /// Gain node with a private parameter.
    pub fn new(input: I, gain: FloatParam) -> Self {
        let channels = input.state().channels();

        Self {
            state: ProducerState::new(channels),
            input,
            gain,
            gain_value: None,
        }
    }

    /// Gain node whose parameter follows `leader`.
    pub fn with_leader(input: I, leader: &Shared<FloatParam>) -> Self {
        Self::new(input, FloatParam::follower(leader))
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

impl<I: SignalProducer> SignalProducer for Gain<I> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.input);
        visitor(&mut self.gain);
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.input, round, sample_count);
        self.gain_value = constant_or_rendered(&mut self.gain, round, sample_count);

        if self.input.is_silent(round, sample_count) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        if self
            .gain_value
            .is_some_and(|gain| (1.0 - gain).abs() < UNITY_TOLERANCE)
        {
            let input = self.input.state().buffer();
            self.state.buffer_mut().copy_from(input, sample_count);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let input = self.input.state().buffer();
        let gains = rendered(&self.gain);

        for (c, output) in buffer.channels_mut().iter_mut().enumerate() {
            let input = &input.channel(c)[first..last];
            let output = &mut output[first..last];

            match self.gain_value {
                Some(gain) => {
                    for (out, sample) in output.iter_mut().zip(input) {
                        *out = gain * sample;
                    }
                }
                None => {
                    for ((out, sample), gain) in output.iter_mut().zip(input).zip(&gains[first..last]) {
                        *out = gain * sample;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::shared;

    struct Constant {
        state: ProducerState,
        value: f64,
    }

    impl Constant {
        fn new(channels: usize, value: f64) -> Self {
            Self {
                state: ProducerState::new(channels),
                value,
            }
        }
    }

    impl SignalProducer for Constant {
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
    fn constant_gain_scales_every_channel() {
        let mut gain = Gain::new(Constant::new(2, 0.5), FloatParam::new("G", 0.0, 2.0, 1.5));
        gain.set_block_size(8);

        let output = produce(&mut gain, 1, 8);

        assert!(output.channel(0).iter().all(|s| *s == 0.75));
        assert!(output.channel(1).iter().all(|s| *s == 0.75));
    }

    #[test]
    fn unity_gain_copies_the_input() {
        let mut gain = Gain::new(Constant::new(1, 0.3), FloatParam::new("G", 0.0, 1.0, 1.0));
        gain.set_block_size(4);

        assert_eq!(produce(&mut gain, 1, 4).channel(0), &[0.3; 4]);
    }

    #[test]
    fn ramped_gain_is_applied_per_sample() {
        let leader = shared(FloatParam::new("G", 0.0, 1.0, 0.0));
        let mut gain = Gain::with_leader(Constant::new(1, 1.0), &leader);
        gain.set_sample_rate(4.0);
        gain.set_block_size(4);
        leader.borrow_mut().set_sample_rate(4.0);
        leader.borrow_mut().set_block_size(4);
        leader.borrow_mut().schedule_linear_ramp(1.0, 1.0);

        let output = produce(&mut gain, 1, 4).channel(0).to_vec();

        assert_eq!(output[0], 0.0);
        assert!(output.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn silent_input_stays_silent() {
        let mut gain = Gain::new(Constant::new(1, 0.0), FloatParam::new("G", 0.0, 2.0, 2.0));
        gain.set_block_size(4);

        produce(&mut gain, 1, 4);

        assert!(gain.is_silent(1, 4));
    }
}
