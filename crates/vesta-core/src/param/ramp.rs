use crate::shape::EnvelopeShape;
use crate::{Number, Seconds};

/// Progress of a scheduled ramp, advanced one sample at a time.
///
/// Values are interpolated in value space, or in ratio space for
/// logarithmic parameters; the caller maps ratios back to values.
#[derive(Debug, Clone, Copy)]
pub(super) struct Ramp {
    pub start_time: Seconds,
    pub in_ratio_space: bool,
    done_samples: Number,
    initial: Number,
    target: Number,
    duration_samples: Number,
    duration: Seconds,
    delta: Number,
    speed: Number,
    shape: EnvelopeShape,
    is_done: bool,
}

impl Ramp {
    /// A ramp from `initial` to `target` that started at `start_time` and
    /// has already progressed `done_samples` samples.
    pub fn new(
        start_time: Seconds,
        done_samples: Number,
        initial: Number,
        target: Number,
        duration: Seconds,
        sample_rate: Number,
        shape: EnvelopeShape,
        in_ratio_space: bool,
    ) -> Self {
        let duration_samples = duration * sample_rate;
        let is_done = duration_samples <= 0.0 || done_samples >= duration_samples;

        Self {
            start_time,
            in_ratio_space,
            done_samples,
            initial,
            target,
            duration_samples,
            duration,
            delta: target - initial,
            speed: if duration_samples > 0.0 {
                1.0 / duration_samples
            } else {
                0.0
            },
            shape,
            is_done,
        }
    }

    /// Value of the next sample.
    #[inline]
    pub fn advance(&mut self) -> Number {
        if self.is_done {
            return self.target;
        }

        let value = self.initial + self.shape.apply(self.done_samples * self.speed) * self.delta;

        self.done_samples += 1.0;

        if self.done_samples >= self.duration_samples {
            self.is_done = true;
        }

        value
    }

    /// Value `elapsed` seconds after the ramp started; may fall between two
    /// samples.
    pub fn value_at(&self, elapsed: Seconds) -> Number {
        if self.duration > 0.0 && elapsed <= self.duration {
            self.initial + self.shape.apply(elapsed / self.duration) * self.delta
        } else {
            self.target
        }
    }

    /// Whether every remaining sample equals the target.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.is_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_ramp_reaches_the_target_after_its_duration() {
        let mut ramp = Ramp::new(0.0, 0.0, 0.0, 1.0, 4.0, 1.0, EnvelopeShape::Linear, false);
        let values: Vec<_> = (0..6).map(|_| ramp.advance()).collect();

        assert_eq!(values, vec![0.0, 0.25, 0.5, 0.75, 1.0, 1.0]);
        assert!(ramp.is_done());
    }

    #[test]
    fn zero_duration_yields_the_target_at_once() {
        let mut ramp = Ramp::new(0.0, 0.0, 3.0, 7.0, 0.0, 44100.0, EnvelopeShape::Linear, false);

        assert!(ramp.is_done());
        assert_eq!(ramp.advance(), 7.0);
    }

    #[test]
    fn value_at_interpolates_between_samples() {
        let ramp = Ramp::new(0.0, 0.0, 0.0, 1.0, 2.0, 1.0, EnvelopeShape::Linear, false);

        assert_eq!(ramp.value_at(0.5), 0.25);
        assert_eq!(ramp.value_at(5.0), 1.0);
    }

    #[test]
    fn curved_ramp_follows_its_shape() {
        let mut ramp = Ramp::new(0.0, 0.0, 2.0, 4.0, 2.0, 1.0, EnvelopeShape::SmoothSharp, false);

        assert_eq!(ramp.advance(), 2.0);
        assert_eq!(ramp.advance(), 2.5);
        assert_eq!(ramp.advance(), 4.0);
    }
}
