//! Table-driven math for the render path.
//!
//! Trigonometry, soft distortion curves, deterministic pseudo-randomness and
//! the logarithmic filter frequency scale are all read from tables that are
//! computed once on first use and are read-only afterwards. Every lookup
//! interpolates linearly between neighbouring entries.
//!
//! # Lookups
//!
//! - [`lookup`] clamps: indices at or beyond the last entry return the last entry.
//! - [`lookup_periodic`] wraps: negative and oversized indices fold back into
//!   the table.
//!
//! # Example
//!
//! ```rust
//! use vesta_core::math;
//!
//! assert!((math::sin(core::f64::consts::FRAC_PI_2) - 1.0).abs() < 1e-6);
//! assert!((math::detune(440.0, 1200.0) - 880.0).abs() < 1e-9);
//! assert_eq!(math::combine(0.25, 4.0, 0.0), 1.0);
//! ```

use std::sync::LazyLock;

use crate::{Frequency, Number};

/// Size of the sine and cosine tables.
pub const SIN_TABLE_SIZE: usize = 0x1000;
const SIN_TABLE_MASK: usize = SIN_TABLE_SIZE - 1;
const SINE_SCALE: Number = SIN_TABLE_SIZE as Number / core::f64::consts::TAU;

const RANDOMS: usize = 0x0200;
const RANDOMS_MAX_INDEX: usize = RANDOMS - 1;
const RANDOM_SCALE: Number = RANDOMS as Number;

const DISTORTION_TABLE_SIZE: usize = 0x0800;
const DISTORTION_TABLE_MAX_INDEX: usize = DISTORTION_TABLE_SIZE - 1;
const DISTORTION_SCALE: Number = DISTORTION_TABLE_SIZE as Number;

/// Lowest frequency of the logarithmic filter frequency scale.
pub const LOG_FREQ_MIN: Frequency = 1.0;
/// Highest frequency of the logarithmic filter frequency scale.
pub const LOG_FREQ_MAX: Frequency = 24000.0;
/// Size of the logarithmic filter frequency table.
pub const LOG_FREQ_TABLE_SIZE: usize = 0x1000;
/// Largest valid index of the logarithmic filter frequency table.
pub const LOG_FREQ_TABLE_MAX_INDEX: usize = LOG_FREQ_TABLE_SIZE - 1;

const EXP_ITERATIONS: u32 = 8;
const EXP_SCALE: Number = 1.0 / (1u32 << EXP_ITERATIONS) as Number;
const POW_10_SCALE: Number = core::f64::consts::LN_10 * EXP_SCALE;

const LOG_FREQ_CORRECTION: Number = -0.6683103012188;

struct Tables {
    sines: [Number; SIN_TABLE_SIZE],
    cosines: [Number; SIN_TABLE_SIZE],
    randoms: [Number; RANDOMS],
    randoms_centered: [Number; RANDOMS],
    distortion: [Number; DISTORTION_TABLE_SIZE],
    distortion_centered: [Number; DISTORTION_TABLE_SIZE],
    log_freq: [Number; LOG_FREQ_TABLE_SIZE],
}

static TABLES: LazyLock<Box<Tables>> = LazyLock::new(|| {
    let mut tables = Box::new(Tables {
        sines: [0.0; SIN_TABLE_SIZE],
        cosines: [0.0; SIN_TABLE_SIZE],
        randoms: [0.0; RANDOMS],
        randoms_centered: [0.0; RANDOMS],
        distortion: [0.0; DISTORTION_TABLE_SIZE],
        distortion_centered: [0.0; DISTORTION_TABLE_SIZE],
        log_freq: [0.0; LOG_FREQ_TABLE_SIZE],
    });

    init_trig(&mut tables);
    init_randoms(&mut tables);
    init_distortion(&mut tables);
    init_log_freq(&mut tables);

    tables
});

fn init_trig(tables: &mut Tables) {
    let scale = core::f64::consts::TAU / SIN_TABLE_SIZE as Number;

    for i in 0..SIN_TABLE_SIZE {
        let x = i as Number * scale;
        tables.sines[i] = libm::sin(x);
        tables.cosines[i] = libm::cos(x);
    }
}

fn init_randoms(tables: &mut Tables) {
    // Multiply-with-carry generator with a fixed seed, so that the table is
    // identical in every run.
    const SEED: u64 = 0x1705;
    let scale = 1.0 / 65536.0;
    let mut x: u64 = SEED;
    let mut c: u64 = ((!SEED >> 3) ^ 0x3cf5) & 0xffff;

    for i in 0..RANDOMS {
        x = 32718 * x + c;
        c = x >> 16;
        x &= 0xffff;
        tables.randoms[i] = x as Number * scale;
        tables.randoms_centered[i] = tables.randoms[i] - 0.5;
    }
}

fn init_distortion(tables: &mut Tables) {
    let max_inv = 1.0 / DISTORTION_TABLE_MAX_INDEX as Number;

    for i in 0..DISTORTION_TABLE_SIZE {
        let x = 2.0 * (i as Number * max_inv) - 1.0;
        tables.distortion_centered[i] = libm::tanh(8.0 * x) * 0.5;
        tables.distortion[i] = tables.distortion_centered[i] + 0.5;
    }
}

fn init_log_freq(tables: &mut Tables) {
    let max_index_inv = 1.0 / LOG_FREQ_TABLE_MAX_INDEX as Number;
    let mut prev_idx = 0.0;
    let mut prev = LOG_FREQ_MIN;

    tables.log_freq[0] = prev;

    // Linear segments over-estimate the exponential curve everywhere, so each
    // entry is shifted down by a fraction of its midpoint error.
    for i in 1..LOG_FREQ_TABLE_MAX_INDEX {
        let current_idx = i as Number;
        let current = ratio_to_exact_log_frequency(current_idx * max_index_inv);
        let midpoint_error = (current + prev) * 0.5
            - ratio_to_exact_log_frequency((prev_idx + 0.5) * max_index_inv);

        tables.log_freq[i] = current + LOG_FREQ_CORRECTION * midpoint_error;
        prev = current;
        prev_idx = current_idx;
    }

    tables.log_freq[LOG_FREQ_TABLE_MAX_INDEX] = LOG_FREQ_MAX;
}

/// Exact logarithmic filter frequency for a ratio in `[0, 1]`.
pub fn ratio_to_exact_log_frequency(ratio: Number) -> Frequency {
    LOG_FREQ_MIN * libm::pow(LOG_FREQ_MAX / LOG_FREQ_MIN, ratio)
}

/// The logarithmic filter frequency table.
pub fn log_frequency_table() -> &'static [Number] {
    &TABLES.log_freq
}

#[inline]
fn trig(table: &[Number; SIN_TABLE_SIZE], x: Number) -> Number {
    let index = x * SINE_SCALE;
    let floor = libm::floor(index);
    let after_weight = index - floor;
    let before_index = (floor as i64 as usize) & SIN_TABLE_MASK;
    let after_index = (before_index + 1) & SIN_TABLE_MASK;

    combine(after_weight, table[after_index], table[before_index])
}

/// Table-based sine.
#[inline]
pub fn sin(x: Number) -> Number {
    trig(&TABLES.sines, x)
}

/// Table-based cosine.
#[inline]
pub fn cos(x: Number) -> Number {
    trig(&TABLES.cosines, x)
}

/// Table-based sine and cosine of the same angle, as `(sin, cos)`.
#[inline]
pub fn sincos(x: Number) -> (Number, Number) {
    let tables = &*TABLES;
    let index = x * SINE_SCALE;
    let floor = libm::floor(index);
    let after_weight = index - floor;
    let before_index = (floor as i64 as usize) & SIN_TABLE_MASK;
    let after_index = (before_index + 1) & SIN_TABLE_MASK;

    (
        combine(
            after_weight,
            tables.sines[after_index],
            tables.sines[before_index],
        ),
        combine(
            after_weight,
            tables.cosines[after_index],
            tables.cosines[before_index],
        ),
    )
}

#[inline]
fn iterate_exp(x: Number, scale: Number) -> Number {
    // exp(x) = lim (1 + x/n)^n, with n = 2^EXP_ITERATIONS.
    let mut value = 1.0 + x * scale;

    for _ in 0..EXP_ITERATIONS {
        value *= value;
    }

    value
}

/// Fast approximation of `e^x` for small arguments.
#[inline]
pub fn exp(x: Number) -> Number {
    iterate_exp(x, EXP_SCALE)
}

/// Fast approximation of `10^x` for small arguments.
#[inline]
pub fn pow_10(x: Number) -> Number {
    iterate_exp(x, POW_10_SCALE)
}

/// Fast approximation of `10^(-x)` for small arguments.
#[inline]
pub fn pow_10_inv(x: Number) -> Number {
    iterate_exp(x, -POW_10_SCALE)
}

/// Decibels to linear magnitude.
#[inline]
pub fn db_to_magnitude(db: Number) -> Number {
    libm::pow(10.0, db / 20.0)
}

/// Linear magnitude to decibels, floored at -150 dB for (near) silence.
#[inline]
pub fn linear_to_db(linear: Number) -> Number {
    if linear <= crate::producer::SILENCE_THRESHOLD {
        crate::producer::SILENCE_THRESHOLD_DB
    } else {
        20.0 * libm::log10(linear)
    }
}

/// Shift `frequency` by `cents`.
#[inline]
pub fn detune(frequency: Frequency, cents: Number) -> Frequency {
    // Exact pow: approximation errors would accumulate as phase drift.
    frequency * libm::exp2(cents / 1200.0)
}

/// `a_weight * a + (1 - a_weight) * b`.
#[inline]
pub fn combine(a_weight: Number, a: Number, b: Number) -> Number {
    a_weight * (a - b) + b
}

/// Whether `|x| < threshold`.
#[inline]
pub fn is_abs_small(x: Number, threshold: Number) -> bool {
    x.abs() < threshold
}

/// Whether `|a - b| < threshold`.
#[inline]
pub fn is_close(a: Number, b: Number, threshold: Number) -> bool {
    is_abs_small(a - b, threshold)
}

/// Linear interpolation in `table`; indices past `max_index` return the last
/// entry. `index` must be non-negative.
#[inline]
pub fn lookup(table: &[Number], max_index: usize, index: Number) -> Number {
    let floor = libm::floor(index);
    let before_index = floor as usize;

    if before_index >= max_index {
        return table[max_index];
    }

    let after_weight = index - floor;

    combine(after_weight, table[before_index + 1], table[before_index])
}

/// Linear interpolation in a periodic `table`; any finite index wraps around.
#[inline]
pub fn lookup_periodic(table: &[Number], index: Number) -> Number {
    let size = table.len() as i64;
    let floor = libm::floor(index);
    let after_weight = index - floor;
    let before_index = (floor as i64).rem_euclid(size) as usize;
    let after_index = if before_index + 1 == table.len() {
        0
    } else {
        before_index + 1
    };

    combine(after_weight, table[after_index], table[before_index])
}

/// Steep `tanh`-based distortion of a value in `[0, 1]`, mixed in by `level`.
pub fn distort(level: Number, number: Number) -> Number {
    if level < 0.0001 {
        return number;
    }

    combine(
        level,
        lookup(
            &TABLES.distortion,
            DISTORTION_TABLE_MAX_INDEX,
            number * DISTORTION_SCALE,
        ),
        number,
    )
}

/// Same as [`distort`] for values in `[-0.5, 0.5]`.
pub fn distort_centered(level: Number, number: Number) -> Number {
    if level < 0.0001 {
        return number;
    }

    combine(
        level,
        lookup(
            &TABLES.distortion_centered,
            DISTORTION_TABLE_MAX_INDEX,
            (number + 0.5) * DISTORTION_SCALE,
        ),
        number,
    )
}

/// Deterministic pseudo-random value for `number` in `[0, 1]`, mixed in by
/// `level`. The same input always maps to the same output.
pub fn randomize(level: Number, number: Number) -> Number {
    if level < 0.000001 {
        return number;
    }

    let random = lookup(&TABLES.randoms, RANDOMS_MAX_INDEX, number * RANDOM_SCALE);

    combine(level, random, number)
}

/// Same as [`randomize`] for values in `[-0.5, 0.5]`.
pub fn randomize_centered(level: Number, number: Number) -> Number {
    if level < 0.000001 {
        return number;
    }

    let random = lookup(
        &TABLES.randoms_centered,
        RANDOMS_MAX_INDEX,
        (number + 0.5) * RANDOM_SCALE,
    );

    combine(level, random, number)
}

/// Force table initialization outside the audio thread.
pub fn warm_up() {
    LazyLock::force(&TABLES);
}
