//! Parameters: scalar values that shape the sound.
//!
//! - [`Param<T>`] is a bounded, ratio-addressable value with a change index.
//!   [`ByteParam`] and [`ToggleParam`] are its discrete flavours, used for
//!   waveform selectors, switches and similar settings.
//! - [`FloatParam`] is a full signal producer: values can be scheduled,
//!   ramped, smoothed from MIDI controllers and macros, shaped by envelopes
//!   and replaced by LFOs.
//! - [`ModulatableFloatParam`] adds an audio-rate modulator on top.
//!
//! ## Ratio addressing
//!
//! Hosts and controllers address parameters through a ratio in `[0, 1]`.
//! Linear parameters map it affinely onto `[min, max]`; parameters with a
//! [`LogScale`] use an exponential mapping; integer parameters round to the
//! nearest value.
//!
//! ## Change index
//!
//! Every observable change bumps a wrapping counter. Code that derives a slow
//! computation from a parameter caches the result together with the change
//! index and recomputes only when the index moves.

mod float;
mod log_scale;
mod modulatable;
mod ramp;

pub use float::{
    DYNAMIC_ENVELOPE_RAMP_TIME, EVT_CURVED_RAMP, EVT_ENVELOPE_CANCEL, EVT_ENVELOPE_END,
    EVT_ENVELOPE_START, EVT_LINEAR_RAMP, EVT_LOG_RAMP, EVT_SET_VALUE, EnvelopeStage, FloatParam,
    MIDI_CTL_BIG_CHANGE_DURATION, MIDI_CTL_SMALL_CHANGE_DURATION, constant_or_rendered,
    produce_if_not_constant,
};
pub use log_scale::{LOG_SCALE_TABLE_SIZE, LogScale};
pub use modulatable::{MODULATION_LEVEL_INSIGNIFICANT, ModulatableFloatParam, Modulator};

use crate::Number;

/// Whether a parameter produces one value per block or a sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// One value per block; no buffer is allocated.
    Block,
    /// One value per sample.
    Sample,
}

/// Number types a [`Param`] can hold.
pub trait ParamValue: Copy + PartialOrd + core::fmt::Debug {
    /// Lossless widening to [`Number`].
    fn to_number(self) -> Number;

    /// Map a ratio onto `[min, max]`.
    fn from_ratio(min: Self, max: Self, ratio: Number) -> Self;
}

impl ParamValue for Number {
    #[inline]
    fn to_number(self) -> Number {
        self
    }

    #[inline]
    fn from_ratio(min: Self, max: Self, ratio: Number) -> Self {
        (min + ratio * (max - min)).clamp(min, max)
    }
}

impl ParamValue for u8 {
    #[inline]
    fn to_number(self) -> Number {
        Number::from(self)
    }

    #[inline]
    fn from_ratio(min: Self, max: Self, ratio: Number) -> Self {
        let range = Number::from(max - min);
        let value = Number::from(min) + libm::round(ratio.clamp(0.0, 1.0) * range);

        (value as u8).clamp(min, max)
    }
}

/// A bounded value with ratio addressing and a change index.
#[derive(Debug, Clone)]
pub struct Param<T: ParamValue> {
    name: String,
    min: T,
    max: T,
    default: T,
    range_inv: Number,
    value: T,
    change_index: u32,
}

impl<T: ParamValue> Param<T> {
    /// Create a parameter holding `default`.
    pub fn new(name: impl Into<String>, min: T, max: T, default: T) -> Self {
        let range = max.to_number() - min.to_number();

        Self {
            name: name.into(),
            min,
            max,
            default,
            range_inv: if range > 0.0 { 1.0 / range } else { 0.0 },
            value: default,
            change_index: 0,
        }
    }

    /// Identifier, as used by hosts and presets.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lower bound.
    #[inline]
    pub fn min(&self) -> T {
        self.min
    }

    /// Upper bound.
    #[inline]
    pub fn max(&self) -> T {
        self.max
    }

    /// Initial value.
    #[inline]
    pub fn default_value(&self) -> T {
        self.default
    }

    /// Current value.
    #[inline]
    pub fn value(&self) -> T {
        self.value
    }

    /// Store a value, clamped into `[min, max]`. The change index moves when
    /// the stored value changes.
    pub fn set_value(&mut self, value: T) {
        let value = self.clamp(value);

        if value != self.value {
            self.value = value;
            self.change_index = self.change_index.wrapping_add(1);
        }
    }

    /// Clamp into `[min, max]`.
    #[inline]
    pub fn clamp(&self, value: T) -> T {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }

    /// Current value as a ratio.
    pub fn ratio(&self) -> Number {
        self.value_to_ratio(self.value)
    }

    /// Default value as a ratio.
    pub fn default_ratio(&self) -> Number {
        self.value_to_ratio(self.default)
    }

    /// Set the value through its ratio.
    pub fn set_ratio(&mut self, ratio: Number) {
        self.set_value(self.ratio_to_value(ratio));
    }

    /// Map a ratio onto `[min, max]`.
    #[inline]
    pub fn ratio_to_value(&self, ratio: Number) -> T {
        T::from_ratio(self.min, self.max, ratio)
    }

    /// Map a value onto `[0, 1]`.
    #[inline]
    pub fn value_to_ratio(&self, value: T) -> Number {
        (value.to_number() - self.min.to_number()) * self.range_inv
    }

    /// Wrapping counter of changes.
    #[inline]
    pub fn change_index(&self) -> u32 {
        self.change_index
    }
}

/// Discrete parameter such as a waveform selector.
pub type ByteParam = Param<u8>;

/// Two-state switch.
pub type ToggleParam = Param<u8>;

/// Value of a switched-off [`ToggleParam`].
pub const OFF: u8 = 0;
/// Value of a switched-on [`ToggleParam`].
pub const ON: u8 = 1;

/// Create a [`ToggleParam`].
pub fn toggle(name: impl Into<String>, default: u8) -> ToggleParam {
    Param::new(name, OFF, ON, default)
}

/// Whether a toggle is on.
#[inline]
pub fn is_on(toggle: &ToggleParam) -> bool {
    toggle.value() == ON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_clamped() {
        let mut param = Param::new("p", -1.0, 1.0, 0.0);

        param.set_value(3.0);
        assert_eq!(param.value(), 1.0);

        param.set_value(-3.0);
        assert_eq!(param.value(), -1.0);
    }

    #[test]
    fn byte_params_round_ratios_to_the_nearest_value() {
        let mut param = ByteParam::new("waveform", 0, 9, 0);

        param.set_ratio(0.5);
        assert_eq!(param.value(), 5);

        param.set_ratio(0.04);
        assert_eq!(param.value(), 0);

        param.set_ratio(2.0);
        assert_eq!(param.value(), 9);

        assert!((param.ratio() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn change_index_moves_on_effective_changes() {
        let mut param = toggle("t", OFF);
        let before = param.change_index();

        param.set_value(OFF);
        assert_eq!(param.change_index(), before);

        param.set_value(ON);
        assert_ne!(param.change_index(), before);
        assert!(is_on(&param));
    }

    #[test]
    fn zero_range_ratio_is_zero() {
        let param = Param::new("fixed", 2.0, 2.0, 2.0);

        assert_eq!(param.ratio(), 0.0);
        assert_eq!(param.ratio_to_value(0.7), 2.0);
    }
}
