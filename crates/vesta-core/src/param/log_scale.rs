use crate::Number;
use crate::math;

/// Entries in a [`LogScale`] table.
pub const LOG_SCALE_TABLE_SIZE: usize = 0x400;

const LOG_SCALE_TABLE_MAX_INDEX: usize = LOG_SCALE_TABLE_SIZE - 1;

/// Exponential ratio ↔ value mapping for frequency-like parameters.
///
/// `value(r) = (min + offset) · ((max + offset) / (min + offset))^r − offset`.
/// The offset keeps the logarithm defined when `min` is zero.
#[derive(Debug, Clone)]
pub struct LogScale {
    table: Vec<Number>,
    log2_min: Number,
    log_range_inv: Number,
    offset: Number,
}

impl LogScale {
    /// Build the table for `[min, max]`. `min + offset` must be positive.
    pub fn new(min: Number, max: Number, offset: Number) -> Self {
        let low = min + offset;
        let high = max + offset;
        let log2_min = libm::log2(low);
        let log2_range = libm::log2(high) - log2_min;

        let table = (0..LOG_SCALE_TABLE_SIZE)
            .map(|i| {
                let ratio = i as Number / LOG_SCALE_TABLE_MAX_INDEX as Number;
                libm::exp2(log2_min + ratio * log2_range) - offset
            })
            .collect();

        Self {
            table,
            log2_min,
            log_range_inv: if log2_range > 0.0 { 1.0 / log2_range } else { 0.0 },
            offset,
        }
    }

    /// Table lookup with linear interpolation.
    #[inline]
    pub fn ratio_to_value(&self, ratio: Number) -> Number {
        math::lookup(
            &self.table,
            LOG_SCALE_TABLE_MAX_INDEX,
            ratio.clamp(0.0, 1.0) * LOG_SCALE_TABLE_MAX_INDEX as Number,
        )
    }

    /// Exact inverse of the continuous mapping.
    #[inline]
    pub fn value_to_ratio(&self, value: Number) -> Number {
        (libm::log2(value + self.offset) - self.log2_min) * self.log_range_inv
    }
}
