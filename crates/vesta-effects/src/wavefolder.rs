//! Antialiased wavefolder.
//!
//! The folding function is the first three partials of a triangle wave with
//! a wavelength of 4, which maps `[-1, 1]` onto itself and folds anything
//! beyond back into that range. Its antiderivative is tabulated over one
//! period and read with wrap-around, so any input amplitude is supported.

use std::f64::consts::PI;
use std::sync::LazyLock;

use vesta_core::adaa::Waveshaper;
use vesta_core::math::{self, combine};
use vesta_core::{
    Adaa, Buffer, Fallback, FloatParam, Number, ProducerState, Rendering, Round, Sample, Shared,
    SignalProducer, constant_or_rendered, produce, rendered,
};

/// Lowest folding amount.
pub const FOLD_MIN: Number = 0.0;
/// Highest folding amount.
pub const FOLD_MAX: Number = 5.5;
/// Default folding amount.
pub const FOLD_DEFAULT: Number = 0.0;
/// Below this amount the folded signal is blended into the dry one instead
/// of folding harder.
pub const FOLD_TRANSITION: Number = 0.5;

const TRANSITION_INV: Number = 1.0 / FOLD_TRANSITION;
const TRANSITION_DELTA: Number = 1.0 - FOLD_TRANSITION;
const FOLDING_INSIGNIFICANT: Number = 0.000001;
const EPSILON: Sample = 0.000001;

const TRIANGLE_SCALE: Number = 8.0 / (PI * PI);
const S1: Number = PI / 2.0;
const S3: Number = 3.0 * PI / 2.0;
const S5: Number = 5.0 * PI / 2.0;

const TABLE_SIZE: usize = 0x1000;
const WAVE_LENGTH: Number = 4.0;
const TABLE_SCALE: Number = TABLE_SIZE as Number / WAVE_LENGTH;
const TABLE_OFFSET: Number = TABLE_SIZE as Number / 2.0;

fn fold_shape(x: Sample) -> Sample {
    TRIANGLE_SCALE
        * (libm::sin(S1 * x) - libm::sin(S3 * x) / 9.0 + libm::sin(S5 * x) / 25.0)
}

fn fold_antiderivative(x: Sample) -> Sample {
    TRIANGLE_SCALE
        * (-libm::cos(S1 * x) / S1 + libm::cos(S3 * x) / (9.0 * S3) - libm::cos(S5 * x) / (25.0 * S5))
}

static ANTIDERIVATIVE: LazyLock<Box<[Sample]>> = LazyLock::new(|| {
    (0..TABLE_SIZE)
        .map(|i| fold_antiderivative((i as Number - TABLE_OFFSET) / TABLE_SCALE))
        .collect()
});

/// Build the antiderivative table now instead of on first use.
pub fn warm_up() {
    LazyLock::force(&ANTIDERIVATIVE);
}

/// The folding function with its tabulated antiderivative.
#[derive(Debug, Clone, Copy)]
struct Fold;

impl Waveshaper for Fold {
    #[inline]
    fn shape(&self, x: Sample) -> Sample {
        fold_shape(x)
    }

    #[inline]
    fn antiderivative(&self, x: Sample) -> Sample {
        math::lookup_periodic(&ANTIDERIVATIVE, TABLE_SCALE * x + TABLE_OFFSET)
    }
}

/// Folds its input back into `[-1, 1]`.
///
/// The `folding` amount scales the input before folding. Amounts up to
/// [`FOLD_TRANSITION`] crossfade from the dry signal to a single fold, so
/// turning the knob up from zero does not click.
pub struct Wavefolder<I: SignalProducer> {
    state: ProducerState,
    input: I,

    /// Folding amount in `[FOLD_MIN, FOLD_MAX]`.
    pub folding: FloatParam,

    adaa: Vec<Adaa>,
    folding_value: Option<Number>,
}

impl<I: SignalProducer> core::fmt::Debug for Wavefolder<I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Wavefolder")
            .field("folding", &self.folding.value())
            .finish_non_exhaustive()
    }
}

impl<I: SignalProducer> Wavefolder<I> {
    /// Wavefolder with a private `FLD` parameter.
    pub fn new(input: I) -> Self {
        Self::with_param(input, FloatParam::new("FLD", FOLD_MIN, FOLD_MAX, FOLD_DEFAULT))
    }

    /// Wavefolder whose amount follows `folding_leader`.
    pub fn with_leader(input: I, folding_leader: &Shared<FloatParam>) -> Self {
        Self::with_param(input, FloatParam::follower(folding_leader))
    }

    fn with_param(input: I, folding: FloatParam) -> Self {
        let channels = input.state().channels();

        Self {
            state: ProducerState::new(channels),
            input,
            folding,
            adaa: vec![Adaa::new(&Fold, Fallback::HoldPrevious, EPSILON); channels],
            folding_value: None,
        }
    }

    /// The folded producer.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The folded producer, mutably.
    pub fn input_mut(&mut self) -> &mut I {
        &mut self.input
    }
}

#[inline]
fn fold(adaa: &mut Adaa, folding: Number, x: Sample) -> Sample {
    if folding <= FOLD_TRANSITION {
        combine(folding * TRANSITION_INV, adaa.process(&Fold, x), x)
    } else {
        adaa.process(&Fold, (folding + TRANSITION_DELTA) * x)
    }
}

impl<I: SignalProducer> SignalProducer for Wavefolder<I> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.input);
        visitor(&mut self.folding);
    }

    fn reset_state(&mut self) {
        for adaa in &mut self.adaa {
            adaa.reset(&Fold);
        }
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.input, round, sample_count);
        self.folding_value = constant_or_rendered(&mut self.folding, round, sample_count);

        if self.input.is_silent(round, sample_count) {
            self.state.buffer_mut().silence(0, sample_count);
            self.state.mark_round_as_silent(round);
            return Rendering::Ready;
        }

        if self
            .folding_value
            .is_some_and(|folding| folding < FOLDING_INSIGNIFICANT)
        {
            let input = self.input.state().buffer();
            self.state.buffer_mut().copy_from(input, sample_count);
            return Rendering::Ready;
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let input = self.input.state().buffer();
        let foldings = rendered(&self.folding);

        for ((c, output), adaa) in buffer.channels_mut().iter_mut().enumerate().zip(&mut self.adaa) {
            let input = &input.channel(c)[first..last];

            match self.folding_value {
                Some(folding) => {
                    for (out, x) in output[first..last].iter_mut().zip(input) {
                        *out = fold(adaa, folding, *x);
                    }
                }
                None => {
                    for ((out, x), folding) in output[first..last]
                        .iter_mut()
                        .zip(input)
                        .zip(&foldings[first..last])
                    {
                        *out = fold(adaa, *folding, *x);
                    }
                }
            }
        }
    }
}
