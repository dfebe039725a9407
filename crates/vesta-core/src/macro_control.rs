//! Macros: adjustable mapping curves between a source and many parameters.
//!
//! A macro reads its `input` parameter (usually assigned to a MIDI controller
//! or to another macro), bends it around `midpoint`, distorts and randomizes
//! it, then scales the result into `[min, max]`. Parameters assigned to the
//! macro read the result as a ratio and smooth its changes.

use crate::Number;
use crate::math;
use crate::param::FloatParam;

/// A controller whose value is computed from its own parameters.
#[derive(Debug)]
pub struct Macro {
    /// Input value that ends up in the middle of the output range.
    pub midpoint: FloatParam,
    /// Source ratio.
    pub input: FloatParam,
    /// Output for zero input.
    pub min: FloatParam,
    /// Output for full input.
    pub max: FloatParam,
    /// Portion of `[min, max]` the output spans.
    pub amount: FloatParam,
    /// Soft saturation of the curve.
    pub distortion: FloatParam,
    /// Deterministic jitter of the curve.
    pub randomness: FloatParam,
    seen_change_indices: [u32; 7],
    value: Number,
    change_index: u32,
}

impl Macro {
    /// Macro passing its input through; parameter names are prefixed with
    /// `name`.
    pub fn new(name: &str) -> Self {
        let mut macro_ = Self {
            midpoint: FloatParam::block(format!("{name}MID"), 0.0, 1.0, 0.5),
            input: FloatParam::block(format!("{name}IN"), 0.0, 1.0, 0.5),
            min: FloatParam::block(format!("{name}MIN"), 0.0, 1.0, 0.0),
            max: FloatParam::block(format!("{name}MAX"), 0.0, 1.0, 1.0),
            amount: FloatParam::block(format!("{name}AMT"), 0.0, 1.0, 1.0),
            distortion: FloatParam::block(format!("{name}DST"), 0.0, 1.0, 0.0),
            randomness: FloatParam::block(format!("{name}RND"), 0.0, 1.0, 0.0),
            seen_change_indices: [u32::MAX; 7],
            value: 0.5,
            change_index: 0,
        };

        macro_.update();
        macro_
    }

    /// Recompute the output if any parameter changed since the last call.
    pub fn update(&mut self) {
        let current = [
            self.midpoint.change_index(),
            self.input.change_index(),
            self.min.change_index(),
            self.max.change_index(),
            self.amount.change_index(),
            self.distortion.change_index(),
            self.randomness.change_index(),
        ];

        if current == self.seen_change_indices {
            return;
        }

        self.seen_change_indices = current;

        let midpoint = self.midpoint.value();
        let input = self.input.value();
        let shifted = if input < 0.5 {
            2.0 * input * midpoint
        } else {
            midpoint + (2.0 * input - 1.0) * (1.0 - midpoint)
        };
        let shaped = math::randomize(
            self.randomness.value(),
            math::distort(self.distortion.value(), shifted),
        );
        let min = self.min.value();

        self.value = (min + shaped * self.amount.value() * (self.max.value() - min)).clamp(0.0, 1.0);
        self.change_index = self.change_index.wrapping_add(1);
    }

    /// Output ratio as of the last [`update`](Self::update).
    #[inline]
    pub fn value(&self) -> Number {
        self.value
    }

    /// Wrapping counter of output changes.
    #[inline]
    pub fn change_index(&self) -> u32 {
        self.change_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::shared;

    #[test]
    fn default_macro_passes_its_input_through() {
        let mut macro_ = Macro::new("M");

        for input in [0.0, 0.2, 0.5, 0.9, 1.0] {
            macro_.input.set_value(input);
            macro_.update();
            assert!((macro_.value() - input).abs() < 1e-12, "input {input}");
        }
    }

    #[test]
    fn midpoint_bends_the_curve() {
        let mut macro_ = Macro::new("M");
        macro_.midpoint.set_value(0.2);
        macro_.input.set_value(0.25);
        macro_.update();

        assert!((macro_.value() - 0.1).abs() < 1e-12);

        macro_.input.set_value(0.75);
        macro_.update();
        assert!((macro_.value() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn output_is_scaled_into_min_max() {
        let mut macro_ = Macro::new("M");
        macro_.min.set_value(0.2);
        macro_.max.set_value(0.6);
        macro_.amount.set_value(0.5);
        macro_.input.set_value(1.0);
        macro_.update();

        assert!((macro_.value() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn change_index_only_moves_on_edits() {
        let mut macro_ = Macro::new("M");
        let before = macro_.change_index();

        macro_.update();
        assert_eq!(macro_.change_index(), before);

        macro_.input.set_value(0.1);
        macro_.update();
        assert_ne!(macro_.change_index(), before);
    }

    #[test]
    fn macros_can_drive_other_macros() {
        let inner = shared(Macro::new("A"));
        let mut outer = Macro::new("B");
        outer.input.set_macro(Some(inner.clone()));

        inner.borrow_mut().input.set_value(0.3);
        outer.update();

        assert!((outer.value() - 0.3).abs() < 1e-12);
    }
}
