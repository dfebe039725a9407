//! Antialiased waveshaping distortion.
//!
//! Every [`Shape`] is an odd function that is tabulated once, together with
//! its antiderivative, over `[0, 3]`. Rendering runs the tables through
//! first-order ADAA (see [`vesta_core::adaa`]) and blends the shaped signal
//! with the input by the `level` parameter.

use std::f64::consts::FRAC_PI_2;
use std::sync::LazyLock;

use vesta_core::adaa::{DEFAULT_EPSILON, Waveshaper};
use vesta_core::math::{self, combine};
use vesta_core::{
    Adaa, Buffer, ByteParam, Fallback, FloatParam, Number, ProducerState, Rendering, Round, Sample,
    Shared, SignalProducer, constant_or_rendered, produce, rendered, shared,
};

/// Entries of each shape table.
pub const TABLE_SIZE: usize = 0x2000;

const MAX_INDEX: usize = TABLE_SIZE - 1;
const INPUT_MAX: Sample = 3.0;
const SCALE: Number = MAX_INDEX as Number / INPUT_MAX;
const LEVEL_INSIGNIFICANT: Number = 0.000001;

/// Shaping functions, in selector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Shape {
    /// `tanh(1.5x)`.
    Tanh3 = 0,
    /// `tanh(2.5x)`.
    Tanh5 = 1,
    /// `tanh(5x)`.
    #[default]
    Tanh10 = 2,
    /// Fundamental with a third harmonic.
    Harmonic13 = 3,
    /// Fundamental with a fifth harmonic.
    Harmonic15 = 4,
    /// Fundamental with third and fifth harmonics.
    Harmonic135 = 5,
    /// Odd harmonics of a square wave, up to the ninth.
    HarmonicSqr = 6,
    /// Odd harmonics of a triangle wave, up to the ninth.
    HarmonicTri = 7,
    /// 1 bit quantization.
    BitCrush1 = 8,
    /// 2 bit quantization.
    BitCrush2 = 9,
    /// 3 bit quantization.
    BitCrush3 = 10,
    /// 4 bit quantization.
    BitCrush4 = 11,
    /// 4.6 bit quantization.
    BitCrush4_6 = 12,
    /// 5 bit quantization.
    BitCrush5 = 13,
    /// 5.6 bit quantization.
    BitCrush5_6 = 14,
    /// 6 bit quantization.
    BitCrush6 = 15,
    /// 6.6 bit quantization.
    BitCrush6_6 = 16,
    /// 7 bit quantization.
    BitCrush7 = 17,
    /// 7.6 bit quantization.
    BitCrush7_6 = 18,
    /// 8 bit quantization.
    BitCrush8 = 19,
    /// 8.6 bit quantization.
    BitCrush8_6 = 20,
    /// 9 bit quantization.
    BitCrush9 = 21,
    /// Linear up to 0.5, then saturating softly towards 1. Keeps delay
    /// feedback loops bounded.
    DelayFeedback = 22,
}

impl Shape {
    /// Every shape, in selector order.
    pub const ALL: [Self; 23] = [
        Self::Tanh3,
        Self::Tanh5,
        Self::Tanh10,
        Self::Harmonic13,
        Self::Harmonic15,
        Self::Harmonic135,
        Self::HarmonicSqr,
        Self::HarmonicTri,
        Self::BitCrush1,
        Self::BitCrush2,
        Self::BitCrush3,
        Self::BitCrush4,
        Self::BitCrush4_6,
        Self::BitCrush5,
        Self::BitCrush5_6,
        Self::BitCrush6,
        Self::BitCrush6_6,
        Self::BitCrush7,
        Self::BitCrush7_6,
        Self::BitCrush8,
        Self::BitCrush8_6,
        Self::BitCrush9,
        Self::DelayFeedback,
    ];

    /// Shape of a selector value; out-of-range values select the last shape.
    pub fn from_index(index: u8) -> Self {
        Self::ALL[usize::from(index).min(Self::ALL.len() - 1)]
    }

    /// Selector value.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// A selector parameter defaulting to `default`.
    pub fn param(name: impl Into<String>, default: Self) -> ByteParam {
        ByteParam::new(name, 0, Self::DelayFeedback.index(), default.index())
    }

    /// The precomputed tables of this shape.
    pub fn tables(self) -> &'static ShapeTables {
        &TABLES[usize::from(self.index())]
    }

    fn is_harmonic(self) -> bool {
        matches!(
            self,
            Self::Harmonic13
                | Self::Harmonic15
                | Self::Harmonic135
                | Self::HarmonicSqr
                | Self::HarmonicTri
        )
    }

    /// `f(x)` for `x >= 0`, before tabulation.
    fn evaluate(self, x: Sample) -> Sample {
        match self {
            Self::Tanh3 => tanh_shape(3.0, x),
            Self::Tanh5 => tanh_shape(5.0, x),
            Self::Tanh10 => tanh_shape(10.0, x),
            Self::Harmonic13 => harmonics(&[(1, 1.0), (3, -0.3)], x),
            Self::Harmonic15 => harmonics(&[(1, 1.0), (5, 0.3)], x),
            Self::Harmonic135 => harmonics(&[(1, 1.0), (3, 0.3), (5, 0.15)], x),
            Self::HarmonicSqr => harmonics(
                &[(1, 1.0), (3, 1.0 / 3.0), (5, 1.0 / 5.0), (7, 1.0 / 7.0), (9, 1.0 / 9.0)],
                x,
            ),
            Self::HarmonicTri => harmonics(
                &[(1, 1.0), (3, -1.0 / 9.0), (5, 1.0 / 25.0), (7, -1.0 / 49.0), (9, 1.0 / 81.0)],
                x,
            ),
            Self::BitCrush1 => bit_crush(1.0, x),
            Self::BitCrush2 => bit_crush(2.0, x),
            Self::BitCrush3 => bit_crush(3.0, x),
            Self::BitCrush4 => bit_crush(4.0, x),
            Self::BitCrush4_6 => bit_crush(4.6, x),
            Self::BitCrush5 => bit_crush(5.0, x),
            Self::BitCrush5_6 => bit_crush(5.6, x),
            Self::BitCrush6 => bit_crush(6.0, x),
            Self::BitCrush6_6 => bit_crush(6.6, x),
            Self::BitCrush7 => bit_crush(7.0, x),
            Self::BitCrush7_6 => bit_crush(7.6, x),
            Self::BitCrush8 => bit_crush(8.0, x),
            Self::BitCrush8_6 => bit_crush(8.6, x),
            Self::BitCrush9 => bit_crush(9.0, x),
            Self::DelayFeedback => {
                if x <= 0.5 {
                    x
                } else {
                    0.5 + 0.5 * libm::tanh((x - 0.5) * 2.0)
                }
            }
        }
    }
}

fn tanh_shape(steepness: Number, x: Sample) -> Sample {
    libm::tanh(steepness * x * 0.5)
}

/// Sum of sines over the quarter period that `x ∈ [0, 1]` maps to, held
/// beyond 1. Not normalized.
fn harmonics(partials: &[(u32, Number)], x: Sample) -> Sample {
    let theta = x.min(1.0) * FRAC_PI_2;

    partials
        .iter()
        .map(|&(k, amplitude)| amplitude * libm::sin(Number::from(k) * theta))
        .sum()
}

fn bit_crush(bits: Number, x: Sample) -> Sample {
    let levels = libm::exp2(bits - 1.0);

    (libm::floor(x * levels + 0.5) / levels).min(1.0)
}

/// Tabulated `f` and `F₀` of one shape over `[0, 3]`; negative inputs use
/// odd symmetry of `f` (so `F₀` is even).
#[derive(Debug)]
pub struct ShapeTables {
    f: Box<[Sample]>,
    f0: Box<[Sample]>,
}

impl ShapeTables {
    fn build(shape: Shape) -> Self {
        let mut f: Box<[Sample]> = (0..TABLE_SIZE)
            .map(|i| shape.evaluate(i as Sample / SCALE))
            .collect();

        if shape.is_harmonic() {
            let peak = f.iter().fold(0.0, |peak: Sample, y| peak.max(y.abs()));

            for y in f.iter_mut() {
                *y /= peak;
            }
        }

        let step = 1.0 / SCALE;
        let mut f0 = vec![0.0; TABLE_SIZE].into_boxed_slice();

        for i in 1..TABLE_SIZE {
            f0[i] = f0[i - 1] + 0.5 * step * (f[i - 1] + f[i]);
        }

        Self { f, f0 }
    }
}

impl Waveshaper for ShapeTables {
    #[inline]
    fn shape(&self, x: Sample) -> Sample {
        let magnitude = x.abs();
        let y = if magnitude >= INPUT_MAX {
            self.f[MAX_INDEX]
        } else {
            math::lookup(&self.f, MAX_INDEX, magnitude * SCALE)
        };

        if x < 0.0 { -y } else { y }
    }

    #[inline]
    fn antiderivative(&self, x: Sample) -> Sample {
        let magnitude = x.abs();

        if magnitude >= INPUT_MAX {
            return self.f0[MAX_INDEX] + (magnitude - INPUT_MAX) * self.f[MAX_INDEX];
        }

        math::lookup(&self.f0, MAX_INDEX, magnitude * SCALE)
    }
}

static TABLES: LazyLock<Box<[ShapeTables]>> =
    LazyLock::new(|| Shape::ALL.iter().map(|&shape| ShapeTables::build(shape)).collect());

/// Build every shape table now instead of on first use.
pub fn warm_up() {
    LazyLock::force(&TABLES);
}

/// Blends an antialiased shaping of its input with the input itself.
///
/// `level` 0 passes the input through unchanged, `level` 1 outputs the
/// shaped signal only.
pub struct Distortion<I: SignalProducer> {
    state: ProducerState,
    input: I,
    shape: Shared<ByteParam>,

    /// Blend between the input and the shaped signal.
    pub level: FloatParam,

    current_shape: Shape,
    adaa: Vec<Adaa>,
    level_value: Option<Number>,
}

impl<I: SignalProducer> core::fmt::Debug for Distortion<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Distortion")
            .field("shape", &self.current_shape)
            .field("level", &self.level.value())
            .finish_non_exhaustive()
    }
}

impl<I: SignalProducer> Distortion<I> {
    /// Distortion with a private level parameter named `<name>LEV`, shaping
    /// with the selected value of `shape`.
    pub fn new(name: &str, input: I, shape: Shared<ByteParam>) -> Self {
        Self::with_level(input, shape, FloatParam::new(format!("{name}LEV"), 0.0, 1.0, 0.0))
    }

    /// Distortion with a private selector fixed to `shape`.
    pub fn fixed(name: &str, input: I, shape: Shape) -> Self {
        Self::new(name, input, shared(Shape::param(format!("{name}TYP"), shape)))
    }

    /// Distortion whose level follows `level_leader`.
    pub fn with_leaders(input: I, shape: Shared<ByteParam>, level_leader: &Shared<FloatParam>) -> Self {
        Self::with_level(input, shape, FloatParam::follower(level_leader))
    }

    fn with_level(input: I, shape: Shared<ByteParam>, level: FloatParam) -> Self {
        let channels = input.state().channels();
        let current_shape = shape
            .try_borrow()
            .map_or(Shape::default(), |param| Shape::from_index(param.value()));
        let tables = current_shape.tables();

        Self {
            state: ProducerState::new(channels),
            input,
            shape,
            level,
            current_shape,
            adaa: vec![Adaa::new(tables, Fallback::Midpoint, DEFAULT_EPSILON); channels],
            level_value: None,
        }
    }

    /// Shape used by the last rendered block.
    pub fn current_shape(&self) -> Shape {
        self.current_shape
    }

    /// The shaped producer.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The shaped producer, mutably.
    pub fn input_mut(&mut self) -> &mut I {
        &mut self.input
    }

    fn update_shape(&mut self) {
        let Ok(param) = self.shape.try_borrow() else {
            return;
        };
        let shape = Shape::from_index(param.value());

        if shape != self.current_shape {
            self.current_shape = shape;

            for adaa in &mut self.adaa {
                adaa.rebase(shape.tables());
            }
        }
    }
}

impl<I: SignalProducer> SignalProducer for Distortion<I> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.input);
        visitor(&mut self.level);
    }

    fn reset_state(&mut self) {
        let tables = self.current_shape.tables();

        for adaa in &mut self.adaa {
            adaa.reset(tables);
        }
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.input, round, sample_count);
        self.level_value = constant_or_rendered(&mut self.level, round, sample_count);
        self.update_shape();

        if self.input.is_silent(round, sample_count) {
            self.reset_state();
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        if self
            .level_value
            .is_some_and(|level| level < LEVEL_INSIGNIFICANT)
        {
            let input = self.input.state().buffer();
            self.state.buffer_mut().copy_from(input, sample_count);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let tables = self.current_shape.tables();
        let input = self.input.state().buffer();
        let levels = rendered(&self.level);

        for ((c, output), adaa) in buffer.channels_mut().iter_mut().enumerate().zip(&mut self.adaa) {
            let input = &input.channel(c)[first..last];

            for ((out, x), i) in output[first..last].iter_mut().zip(input).zip(first..last) {
                let level = self.level_value.unwrap_or_else(|| levels[i]);
                *out = combine(level, adaa.process(tables, *x), *x);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ramp {
        state: ProducerState,
        values: Vec<Sample>,
    }

    impl Ramp {
        fn new(values: &[Sample]) -> Self {
            Self {
                state: ProducerState::new(1),
                values: values.to_vec(),
            }
        }
    }

    impl SignalProducer for Ramp {
        fn state(&self) -> &ProducerState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ProducerState {
            &mut self.state
        }

        fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
            buffer.channel_mut(0)[first..last].copy_from_slice(&self.values[first..last]);
        }
    }

    #[test]
    fn shapes_are_odd_and_bounded() {
        for shape in Shape::ALL {
            let tables = shape.tables();

            for i in 0..=60 {
                let x = i as Sample * 0.1 - 3.0;
                let y = tables.shape(x);

                assert!((y + tables.shape(-x)).abs() < 1e-12, "{shape:?} at {x}");
                assert!(y.abs() <= 1.0 + 1e-9, "{shape:?} at {x}: {y}");
            }
        }
    }

    #[test]
    fn shapes_reach_full_scale() {
        for shape in Shape::ALL {
            let y = shape.tables().shape(3.0);

            assert!(y > 0.7 && y <= 1.0 + 1e-12, "{shape:?}: {y}");
        }
    }

    #[test]
    fn antiderivative_matches_the_shape() {
        let tables = Shape::Tanh5.tables();
        let x = 0.8;
        let h = 1e-3;
        let slope = (tables.antiderivative(x + h) - tables.antiderivative(x - h)) / (2.0 * h);

        assert!((slope - tables.shape(x)).abs() < 1e-3);
        assert!((tables.antiderivative(-x) - tables.antiderivative(x)).abs() < 1e-12);
    }

    #[test]
    fn antiderivative_continues_linearly_past_the_table() {
        let tables = Shape::Tanh10.tables();
        let at_edge = tables.antiderivative(3.0);

        assert!((tables.antiderivative(4.0) - at_edge - tables.shape(3.0)).abs() < 1e-9);
    }

    #[test]
    fn bit_crush_quantizes() {
        assert_eq!(bit_crush(2.0, 0.3), 0.5);
        assert_eq!(bit_crush(2.0, 0.2), 0.0);
        assert_eq!(bit_crush(1.0, 0.6), 1.0);
        assert_eq!(bit_crush(3.0, 2.0), 1.0);
    }

    #[test]
    fn delay_feedback_is_linear_below_half() {
        let tables = Shape::DelayFeedback.tables();

        assert!((tables.shape(0.3) - 0.3).abs() < 1e-6);
        assert!(tables.shape(2.5) < 1.0);
    }

    #[test]
    fn zero_level_passes_the_input_through() {
        let values = [0.1, -0.4, 0.9, 0.2];
        let mut distortion = Distortion::fixed("D", Ramp::new(&values), Shape::Tanh10);
        distortion.set_block_size(4);

        assert_eq!(produce(&mut distortion, 1, 4).channel(0), &values);
    }

    #[test]
    fn full_level_saturates() {
        let values = [3.0; 8];
        let mut distortion = Distortion::fixed("D", Ramp::new(&values), Shape::Tanh10);
        distortion.set_block_size(8);
        distortion.level.set_value(1.0);

        let output = produce(&mut distortion, 1, 8).channel(0).to_vec();

        assert!((output[7] - libm::tanh(15.0)).abs() < 1e-6);
        assert!(output.iter().all(|y| y.abs() <= 1.0));
    }

    #[test]
    fn half_level_blends() {
        let values = [0.8; 4];
        let mut distortion = Distortion::fixed("D", Ramp::new(&values), Shape::BitCrush1);
        distortion.set_block_size(4);
        distortion.level.set_value(0.5);

        let output = produce(&mut distortion, 1, 4).channel(0).to_vec();

        assert!((output[3] - 0.9).abs() < 1e-9);
    }

    #[test]
    fn selector_changes_take_effect_next_block() {
        let selector = shared(Shape::param("TYP", Shape::Tanh3));
        let mut distortion = Distortion::new("D", Ramp::new(&[2.0; 4]), std::rc::Rc::clone(&selector));
        distortion.set_block_size(4);
        distortion.level.set_value(1.0);

        produce(&mut distortion, 1, 4);
        selector.borrow_mut().set_value(Shape::BitCrush2.index());
        produce(&mut distortion, 2, 4);

        assert_eq!(distortion.current_shape(), Shape::BitCrush2);
        assert!((distortion.state().buffer().channel(0)[3] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn silent_input_is_silent() {
        let mut distortion = Distortion::fixed("D", Ramp::new(&[0.0; 4]), Shape::Harmonic135);
        distortion.set_block_size(4);
        distortion.level.set_value(1.0);

        produce(&mut distortion, 1, 4);

        assert!(distortion.is_silent(1, 4));
    }
}
