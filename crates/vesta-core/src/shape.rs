//! Curves for envelope stages and curved ramps.
//!
//! Every shape maps `[0, 1]` onto `[0, 1]` monotonically with `f(0) = 0` and
//! `f(1) = 1`. "Smooth" ends have zero slope, "sharp" ends keep a non-zero
//! slope; the `steep` variants raise the order of the polynomial.

use crate::Number;

/// Transition curve between two values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EnvelopeShape {
    /// `3x² − 2x³`.
    SmoothSmooth = 0,
    /// `6x⁵ − 15x⁴ + 10x³`.
    SmoothSmoothSteep = 1,
    /// Smoothstep of smootherstep.
    SmoothSmoothSteeper = 2,
    /// `x²`, flat start.
    SmoothSharp = 3,
    /// `x³`.
    SmoothSharpSteep = 4,
    /// `1 − (1 − x)²`, flat end.
    SharpSmooth = 5,
    /// `1 − (1 − x)³`.
    SharpSmoothSteep = 6,
    /// `0.5 + 4(x − 0.5)³`, flat middle.
    SharpSharp = 7,
    /// `0.5 + 16(x − 0.5)⁵`.
    SharpSharpSteep = 8,
    /// Identity.
    #[default]
    Linear = 9,
}

impl EnvelopeShape {
    /// Every shape, in discriminant order.
    pub const ALL: [Self; 10] = [
        Self::SmoothSmooth,
        Self::SmoothSmoothSteep,
        Self::SmoothSmoothSteeper,
        Self::SmoothSharp,
        Self::SmoothSharpSteep,
        Self::SharpSmooth,
        Self::SharpSmoothSteep,
        Self::SharpSharp,
        Self::SharpSharpSteep,
        Self::Linear,
    ];

    /// Decode a byte parameter value; unknown values fall back to linear.
    pub fn from_byte(byte: u8) -> Self {
        Self::ALL
            .get(byte as usize)
            .copied()
            .unwrap_or(Self::Linear)
    }

    /// Evaluate the curve at `x`, which is clamped into `[0, 1]`.
    #[inline]
    pub fn apply(self, x: Number) -> Number {
        let x = x.clamp(0.0, 1.0);

        match self {
            Self::Linear => x,
            Self::SmoothSmooth => smoothstep(x),
            Self::SmoothSmoothSteep => smootherstep(x),
            Self::SmoothSmoothSteeper => smoothstep(smootherstep(x)),
            Self::SmoothSharp => x * x,
            Self::SmoothSharpSteep => x * x * x,
            Self::SharpSmooth => {
                let y = 1.0 - x;
                1.0 - y * y
            }
            Self::SharpSmoothSteep => {
                let y = 1.0 - x;
                1.0 - y * y * y
            }
            Self::SharpSharp => {
                let y = x - 0.5;
                0.5 + 4.0 * y * y * y
            }
            Self::SharpSharpSteep => {
                let y = x - 0.5;
                let y2 = y * y;
                0.5 + 16.0 * y2 * y2 * y
            }
        }
    }
}

#[inline]
fn smoothstep(x: Number) -> Number {
    x * x * (3.0 - 2.0 * x)
}

#[inline]
fn smootherstep(x: Number) -> Number {
    x * x * x * (x * (x * 6.0 - 15.0) + 10.0)
}
