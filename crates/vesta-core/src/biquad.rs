//! Biquad (bi-quadratic) filter with seven response types.
//!
//! Coefficients follow the Web Audio / RBJ Audio EQ Cookbook formulas and
//! are computed once per block when every relevant parameter is constant,
//! otherwise once per sample. Voices that follow the same leader parameters
//! can hand the filter a [`BiquadFilterSharedBuffers`]: the first filter
//! pulled in a round computes the coefficients, the others copy them.
//!
//! Filtering is Direct Form I:
//! ```text
//! y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2]
//!                - a1*y[n-1] - a2*y[n-2]
//! ```

use core::f64::consts::{PI, SQRT_2};
use core::marker::PhantomData;

use crate::math;
use crate::param::{ByteParam, FloatParam, constant_or_rendered};
use crate::producer::{
    Buffer, ProducerState, Rendering, Round, SILENCE_THRESHOLD, Shared, SignalProducer, produce,
    rendered, shared,
};
use crate::{Frequency, Number, Sample};

/// Lowest cutoff or center frequency.
pub const FREQUENCY_MIN: Frequency = 1.0;
/// Highest cutoff or center frequency.
pub const FREQUENCY_MAX: Frequency = 24000.0;
/// Default frequency; an open low-pass.
pub const FREQUENCY_DEFAULT: Frequency = 24000.0;

/// Lowest Q.
pub const Q_MIN: Number = 0.0;
/// Highest Q.
pub const Q_MAX: Number = 30.0;
/// Default Q.
pub const Q_DEFAULT: Number = 1.0;

/// Lowest gain in dB.
pub const GAIN_MIN: Number = -48.0;
/// Highest gain in dB.
pub const GAIN_MAX: Number = 24.0;
/// Default gain in dB.
pub const GAIN_DEFAULT: Number = 0.0;

/// Largest frequency perturbation of [`FilterInaccuracy`], in cents.
pub const FREQUENCY_INACCURACY_CENTS: Number = 100.0;
/// Largest relative Q perturbation of [`FilterInaccuracy`].
pub const Q_INACCURACY: Number = 0.15;

const THRESHOLD: Number = 0.000001;

// Low-pass and high-pass Q is in dB.
const Q_SCALE: Number = 1.0 / 20.0;
const GAIN_SCALE: Number = 1.0 / 40.0;
const SHELF_GAIN_SCALE: Number = 1.0 / 80.0;

type Coefficients = [Sample; 5];

const NO_OP_COEFFICIENTS: Coefficients = [1.0, 0.0, 0.0, 0.0, 0.0];
const SILENT_COEFFICIENTS: Coefficients = [0.0; 5];

/// Filter response types, in selector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FilterType {
    /// 12 dB/octave low-pass; Q in dB.
    #[default]
    LowPass = 0,
    /// 12 dB/octave high-pass; Q in dB.
    HighPass = 1,
    /// Constant 0 dB peak gain band-pass.
    BandPass = 2,
    /// Band-reject.
    Notch = 3,
    /// Bell boost or cut around the frequency.
    Peaking = 4,
    /// Boost or cut below the frequency.
    LowShelf = 5,
    /// Boost or cut above the frequency.
    HighShelf = 6,
}

impl FilterType {
    /// All types in selector order.
    pub const ALL: [Self; 7] = [
        Self::LowPass,
        Self::HighPass,
        Self::BandPass,
        Self::Notch,
        Self::Peaking,
        Self::LowShelf,
        Self::HighShelf,
    ];

    /// Type of a selector value; out-of-range values select the last type.
    pub fn from_index(index: u8) -> Self {
        Self::ALL[usize::from(index).min(Self::ALL.len() - 1)]
    }

    /// Selector value.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// A selector parameter defaulting to `default`.
    pub fn param(name: impl Into<String>, default: Self) -> ByteParam {
        ByteParam::new(name, 0, Self::HighShelf.index(), default.index())
    }

    fn uses_q(self) -> bool {
        !matches!(self, Self::LowShelf | Self::HighShelf)
    }

    fn uses_gain(self) -> bool {
        matches!(self, Self::Peaking | Self::LowShelf | Self::HighShelf)
    }
}

/// Compile-time choice of the response type. Filters with a fixed type
/// ignore their selector parameter.
pub trait FixedType {
    /// The fixed type, or `None` to read the selector.
    const FILTER_TYPE: Option<FilterType>;
}

/// The type is read from the selector parameter every block.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFixedType;

impl FixedType for NoFixedType {
    const FILTER_TYPE: Option<FilterType> = None;
}

macro_rules! fixed_types {
    ($($name:ident => $filter_type:ident),* $(,)?) => {
        $(
            #[doc = concat!("Always [`FilterType::", stringify!($filter_type), "`].")]
            #[derive(Debug, Clone, Copy, Default)]
            pub struct $name;

            impl FixedType for $name {
                const FILTER_TYPE: Option<FilterType> = Some(FilterType::$filter_type);
            }
        )*
    };
}

fixed_types!(
    FixedLowPass => LowPass,
    FixedHighPass => HighPass,
    FixedBandPass => BandPass,
    FixedNotch => Notch,
    FixedPeaking => Peaking,
    FixedLowShelf => LowShelf,
    FixedHighShelf => HighShelf,
);

/// What a block of coefficients does to the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockResponse {
    Filter,
    NoOp,
    Silent,
}

/// Coefficients of one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Response {
    Coefficients(Coefficients),
    NoOp,
    Silent,
}

impl Response {
    fn coefficients(self) -> Coefficients {
        match self {
            Self::Coefficients(coefficients) => coefficients,
            Self::NoOp => NO_OP_COEFFICIENTS,
            Self::Silent => SILENT_COEFFICIENTS,
        }
    }
}

fn normalized(b0: Sample, b1: Sample, b2: Sample, a0: Sample, a1: Sample, a2: Sample) -> Response {
    let a0_inv = 1.0 / a0;

    Response::Coefficients([b0 * a0_inv, b1 * a0_inv, b2 * a0_inv, a1 * a0_inv, a2 * a0_inv])
}

fn gain(gain_db: Number) -> Response {
    Response::Coefficients([math::db_to_magnitude(gain_db), 0.0, 0.0, 0.0, 0.0])
}

/// Sample-rate dependent constants of the coefficient formulas.
#[derive(Debug, Clone, Copy)]
struct Design {
    w0_scale: Number,
    nyquist_frequency: Frequency,
    no_op_frequency: Frequency,
}

impl Design {
    fn new(state: &ProducerState, frequency_max: Frequency) -> Self {
        Self {
            w0_scale: 2.0 * PI * state.sampling_period(),
            nyquist_frequency: state.nyquist_frequency(),
            no_op_frequency: state.nyquist_frequency().min(frequency_max),
        }
    }

    #[inline]
    fn response(&self, filter_type: FilterType, frequency: Frequency, q: Number, gain_db: Number) -> Response {
        match filter_type {
            FilterType::LowPass => self.low_pass(frequency, q),
            FilterType::HighPass => self.high_pass(frequency, q),
            FilterType::BandPass => self.band_pass(frequency, q),
            FilterType::Notch => self.notch(frequency, q),
            FilterType::Peaking => self.peaking(frequency, q, gain_db),
            FilterType::LowShelf => self.low_shelf(frequency, gain_db),
            FilterType::HighShelf => self.high_shelf(frequency, gain_db),
        }
    }

    fn sincos(&self, frequency: Frequency) -> (Number, Number) {
        let w0 = self.w0_scale * frequency;

        (libm::sin(w0), libm::cos(w0))
    }

    fn low_pass(&self, frequency: Frequency, q: Number) -> Response {
        if frequency >= self.no_op_frequency {
            return Response::NoOp;
        }

        let (sin, cos) = self.sincos(frequency);
        let alpha = 0.5 * sin * math::pow_10_inv(q * Q_SCALE);
        let b1 = 1.0 - cos;
        let b0 = 0.5 * b1;

        normalized(b0, b1, b0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
    }

    fn high_pass(&self, frequency: Frequency, q: Number) -> Response {
        if frequency >= self.nyquist_frequency {
            return Response::Silent;
        }

        let (sin, cos) = self.sincos(frequency);
        let alpha = 0.5 * sin * math::pow_10_inv(q * Q_SCALE);
        let b1 = -1.0 - cos;
        let b0 = -0.5 * b1;

        normalized(b0, b1, b0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
    }

    fn band_pass(&self, frequency: Frequency, q: Number) -> Response {
        if q < THRESHOLD {
            return Response::NoOp;
        }

        if frequency >= self.no_op_frequency {
            return Response::Silent;
        }

        let (sin, cos) = self.sincos(frequency);
        let alpha = 0.5 * sin / q;

        normalized(alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
    }

    fn notch(&self, frequency: Frequency, q: Number) -> Response {
        if frequency >= self.no_op_frequency {
            return Response::NoOp;
        }

        if q < THRESHOLD {
            return Response::Silent;
        }

        let (sin, cos) = self.sincos(frequency);
        let alpha = 0.5 * sin / q;
        let b1 = -2.0 * cos;

        normalized(1.0, b1, 1.0, 1.0 + alpha, b1, 1.0 - alpha)
    }

    fn peaking(&self, frequency: Frequency, q: Number, gain_db: Number) -> Response {
        if gain_db.abs() < THRESHOLD || frequency >= self.no_op_frequency {
            return Response::NoOp;
        }

        if q < THRESHOLD {
            return gain(gain_db);
        }

        let (sin, cos) = self.sincos(frequency);
        let a = math::pow_10(gain_db * GAIN_SCALE);
        let alpha = 0.5 * sin / q;
        let alpha_a = alpha * a;
        let alpha_div_a = alpha / a;
        let b1 = -2.0 * cos;

        normalized(1.0 + alpha_a, b1, 1.0 - alpha_a, 1.0 + alpha_div_a, b1, 1.0 - alpha_div_a)
    }

    fn low_shelf(&self, frequency: Frequency, gain_db: Number) -> Response {
        if frequency >= self.nyquist_frequency {
            return gain(gain_db);
        }

        let (sin, cos) = self.sincos(frequency);
        let a = math::pow_10(gain_db * GAIN_SCALE);
        let as2 = sin * SQRT_2 * math::pow_10(gain_db * SHELF_GAIN_SCALE);
        let a_p1 = a + 1.0;
        let a_m1 = a - 1.0;

        normalized(
            a * (a_p1 - a_m1 * cos + as2),
            2.0 * a * (a_m1 - a_p1 * cos),
            a * (a_p1 - a_m1 * cos - as2),
            a_p1 + a_m1 * cos + as2,
            -2.0 * (a_m1 + a_p1 * cos),
            a_p1 + a_m1 * cos - as2,
        )
    }

    fn high_shelf(&self, frequency: Frequency, gain_db: Number) -> Response {
        if frequency >= self.no_op_frequency {
            return Response::NoOp;
        }

        let (sin, cos) = self.sincos(frequency);
        let a = math::pow_10(gain_db * GAIN_SCALE);
        let as2 = sin * SQRT_2 * math::pow_10(gain_db * SHELF_GAIN_SCALE);
        let a_p1 = a + 1.0;
        let a_m1 = a - 1.0;

        normalized(
            a * (a_p1 + a_m1 * cos + as2),
            -2.0 * a * (a_m1 + a_p1 * cos),
            a * (a_p1 + a_m1 * cos - as2),
            a_p1 - a_m1 * cos + as2,
            2.0 * (a_m1 - a_p1 * cos),
            a_p1 - a_m1 * cos - as2,
        )
    }
}

/// Coefficients computed by the first filter of a round, reused by every
/// other filter holding the same handle.
#[derive(Debug, Clone)]
pub struct BiquadFilterSharedBuffers {
    round: Option<Round>,
    response: BlockResponse,
    are_coefficients_constant: bool,
    coefficients: Vec<Coefficients>,
}

impl BiquadFilterSharedBuffers {
    /// Empty buffers; sized by the first filter that writes them.
    pub fn new() -> Self {
        Self {
            round: None,
            response: BlockResponse::NoOp,
            are_coefficients_constant: true,
            coefficients: Vec::new(),
        }
    }

    /// Round of the stored coefficients.
    pub fn round(&self) -> Option<Round> {
        self.round
    }

    fn store(
        &mut self,
        round: Round,
        response: BlockResponse,
        are_coefficients_constant: bool,
        coefficients: &[Coefficients],
    ) {
        self.round = Some(round);
        self.response = response;
        self.are_coefficients_constant = are_coefficients_constant;
        self.coefficients.clear();
        self.coefficients.extend_from_slice(coefficients);
    }
}

impl Default for BiquadFilterSharedBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-voice perturbation of frequency and Q.
///
/// The levels are shared block parameters in `[0, 1]`; the direction and
/// size of the perturbation come from two randoms drawn per note.
#[derive(Debug, Clone)]
pub struct FilterInaccuracy {
    frequency_level: Shared<FloatParam>,
    q_level: Shared<FloatParam>,
    frequency_random: Number,
    q_random: Number,
}

impl FilterInaccuracy {
    /// Inaccuracy scaled by the given levels.
    pub fn new(frequency_level: Shared<FloatParam>, q_level: Shared<FloatParam>) -> Self {
        Self {
            frequency_level,
            q_level,
            frequency_random: 0.0,
            q_random: 0.0,
        }
    }

    /// Take the randoms of the next note, both in `[0, 1]`.
    pub fn update(&mut self, random_1: Number, random_2: Number) {
        self.frequency_random = random_1.clamp(0.0, 1.0) * 2.0 - 1.0;
        self.q_random = random_2.clamp(0.0, 1.0) * 2.0 - 1.0;
    }

    /// Whether either level is above zero.
    pub fn is_active(&self) -> bool {
        level(&self.frequency_level) > 0.0 || level(&self.q_level) > 0.0
    }

    /// Multiplier of the frequency.
    pub fn frequency_scale(&self) -> Number {
        let cents = level(&self.frequency_level) * self.frequency_random * FREQUENCY_INACCURACY_CENTS;

        math::detune(1.0, cents)
    }

    /// Multiplier of Q.
    pub fn q_scale(&self) -> Number {
        1.0 + level(&self.q_level) * self.q_random * Q_INACCURACY
    }
}

fn level(param: &Shared<FloatParam>) -> Number {
    param.try_borrow().map_or(0.0, |param| param.value())
}

/// Leader parameters of filters that belong to voices.
#[derive(Debug, Clone)]
pub struct BiquadLeaders {
    /// Type selector.
    pub filter_type: Shared<ByteParam>,
    /// Cutoff or center frequency in Hz.
    pub frequency: Shared<FloatParam>,
    /// Q; in dB for low-pass and high-pass.
    pub q: Shared<FloatParam>,
    /// Gain in dB for peaking and shelves.
    pub gain: Shared<FloatParam>,
}

impl BiquadLeaders {
    /// Leaders with the default ranges, named `<prefix>TYP`, `<prefix>FRQ`,
    /// `<prefix>Q` and `<prefix>G`.
    pub fn new(prefix: &str, filter_type: FilterType) -> Self {
        let (frequency, q, gain) = default_params(prefix);

        Self {
            filter_type: shared(FilterType::param(format!("{prefix}TYP"), filter_type)),
            frequency: shared(frequency),
            q: shared(q),
            gain: shared(gain),
        }
    }
}

fn default_params(prefix: &str) -> (FloatParam, FloatParam, FloatParam) {
    (
        FloatParam::new(format!("{prefix}FRQ"), FREQUENCY_MIN, FREQUENCY_MAX, FREQUENCY_DEFAULT),
        FloatParam::new(format!("{prefix}Q"), Q_MIN, Q_MAX, Q_DEFAULT),
        FloatParam::new(format!("{prefix}G"), GAIN_MIN, GAIN_MAX, GAIN_DEFAULT),
    )
}

#[derive(Debug, Clone, Copy, Default)]
struct History {
    x1: Sample,
    x2: Sample,
    y1: Sample,
    y2: Sample,
}

impl History {
    fn is_silent(&self) -> bool {
        self.x1.abs() < SILENCE_THRESHOLD
            && self.x2.abs() < SILENCE_THRESHOLD
            && self.y1.abs() < SILENCE_THRESHOLD
            && self.y2.abs() < SILENCE_THRESHOLD
    }

    /// Keep the history of a pass-through block.
    fn pass_through(&mut self, input: &[Sample]) {
        match *input {
            [] => {}
            [only] => {
                self.x2 = self.x1;
                self.x1 = only;
            }
            [.., second_to_last, last] => {
                self.x2 = second_to_last;
                self.x1 = last;
            }
        }

        self.y1 = self.x1;
        self.y2 = self.x2;
    }
}

/// Second-order IIR filter over an input producer.
///
/// `F` fixes the response type at compile time; with [`NoFixedType`] the
/// type selector is read every block.
pub struct BiquadFilter<I: SignalProducer, F: FixedType = NoFixedType> {
    state: ProducerState,
    input: I,
    filter_type: Shared<ByteParam>,

    /// Cutoff or center frequency in Hz.
    pub frequency: FloatParam,
    /// Q; in dB for low-pass and high-pass.
    pub q: FloatParam,
    /// Gain in dB for peaking and shelves.
    pub gain: FloatParam,

    shared_buffers: Option<Shared<BiquadFilterSharedBuffers>>,
    inaccuracy: Option<FilterInaccuracy>,
    coefficients: Vec<Coefficients>,
    are_coefficients_constant: bool,
    history: Vec<History>,
    fixed_type: PhantomData<F>,
}

impl<I: SignalProducer, F: FixedType> core::fmt::Debug for BiquadFilter<I, F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BiquadFilter")
            .field("filter_type", &self.current_type())
            .field("frequency", &self.frequency.value())
            .field("q", &self.q.value())
            .field("gain", &self.gain.value())
            .field("shares_coefficients", &self.shared_buffers.is_some())
            .finish_non_exhaustive()
    }
}

impl<I: SignalProducer, F: FixedType> BiquadFilter<I, F> {
    /// Filter with private parameters named after `name`.
    pub fn new(name: &str, input: I, filter_type: Shared<ByteParam>) -> Self {
        let (frequency, q, gain) = default_params(name);

        Self::with_params(input, filter_type, frequency, q, gain)
    }

    /// Filter of the fixed type `F` with private parameters.
    pub fn fixed(name: &str, input: I) -> Self {
        let filter_type = F::FILTER_TYPE.unwrap_or_default();

        Self::new(name, input, shared(FilterType::param(format!("{name}TYP"), filter_type)))
    }

    /// Filter whose parameters follow `leaders`. Coefficients are shared
    /// through `shared_buffers` while no leader has an envelope.
    pub fn from_leaders(
        input: I,
        leaders: &BiquadLeaders,
        shared_buffers: Option<Shared<BiquadFilterSharedBuffers>>,
    ) -> Self {
        let mut filter = Self::with_params(
            input,
            std::rc::Rc::clone(&leaders.filter_type),
            FloatParam::follower(&leaders.frequency),
            FloatParam::follower(&leaders.q),
            FloatParam::follower(&leaders.gain),
        );
        filter.shared_buffers = shared_buffers;
        filter
    }

    fn with_params(
        input: I,
        filter_type: Shared<ByteParam>,
        frequency: FloatParam,
        q: FloatParam,
        gain: FloatParam,
    ) -> Self {
        let channels = input.state().channels();
        let mut filter = Self {
            state: ProducerState::new(channels),
            input,
            filter_type,
            frequency,
            q,
            gain,
            shared_buffers: None,
            inaccuracy: None,
            coefficients: Vec::new(),
            are_coefficients_constant: true,
            history: vec![History::default(); channels],
            fixed_type: PhantomData,
        };

        filter.block_size_changed();
        filter
    }

    /// Share coefficients through `shared_buffers` with other filters that
    /// follow the same leaders.
    pub fn share_coefficients(&mut self, shared_buffers: Shared<BiquadFilterSharedBuffers>) {
        self.shared_buffers = Some(shared_buffers);
    }

    /// Perturb frequency and Q per note.
    pub fn with_inaccuracy(mut self, inaccuracy: FilterInaccuracy) -> Self {
        self.inaccuracy = Some(inaccuracy);
        self
    }

    /// Draw the inaccuracy of the next note.
    pub fn update_inaccuracy(&mut self, random_1: Number, random_2: Number) {
        if let Some(inaccuracy) = &mut self.inaccuracy {
            inaccuracy.update(random_1, random_2);
        }
    }

    /// The filtered producer.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// The filtered producer, mutably.
    pub fn input_mut(&mut self) -> &mut I {
        &mut self.input
    }

    /// Response type of the next block.
    pub fn current_type(&self) -> FilterType {
        match F::FILTER_TYPE {
            Some(filter_type) => filter_type,
            None => self
                .filter_type
                .try_borrow()
                .map_or(FilterType::default(), |param| FilterType::from_index(param.value())),
        }
    }

    /// Shared coefficients are only valid while every parameter the type
    /// reads renders exactly what its leader renders.
    fn can_share_coefficients(&self, filter_type: FilterType) -> bool {
        let follows = |param: &FloatParam| param.envelope().is_none() && param.is_following_leader();

        self.shared_buffers.is_some()
            && self.inaccuracy.as_ref().is_none_or(|inaccuracy| !inaccuracy.is_active())
            && follows(&self.frequency)
            && (!filter_type.uses_q() || follows(&self.q))
            && (!filter_type.uses_gain() || follows(&self.gain))
    }

    fn update_coefficients(&mut self, filter_type: FilterType, round: Round, sample_count: usize) -> BlockResponse {
        let can_share = self.can_share_coefficients(filter_type);

        if can_share && let Some(response) = self.reuse_shared_coefficients(round, sample_count) {
            return response;
        }

        let response = self.compute_coefficients(filter_type, round, sample_count);

        if can_share
            && let Some(shared_buffers) = &self.shared_buffers
            && let Ok(mut shared_buffers) = shared_buffers.try_borrow_mut()
        {
            let count = if self.are_coefficients_constant { 1 } else { sample_count };
            shared_buffers.store(
                round,
                response,
                self.are_coefficients_constant,
                &self.coefficients[..count],
            );
        }

        response
    }

    fn reuse_shared_coefficients(&mut self, round: Round, sample_count: usize) -> Option<BlockResponse> {
        let shared_buffers = self.shared_buffers.as_ref()?.try_borrow().ok()?;

        if shared_buffers.round != Some(round) {
            return None;
        }

        let count = shared_buffers.coefficients.len().min(self.coefficients.len());
        self.coefficients[..count].copy_from_slice(&shared_buffers.coefficients[..count]);
        self.are_coefficients_constant = shared_buffers.are_coefficients_constant;
        let response = shared_buffers.response;
        drop(shared_buffers);

        self.frequency.skip_round(round, sample_count);
        self.q.skip_round(round, sample_count);
        self.gain.skip_round(round, sample_count);

        Some(response)
    }

    fn compute_coefficients(&mut self, filter_type: FilterType, round: Round, sample_count: usize) -> BlockResponse {
        let frequency = constant_or_rendered(&mut self.frequency, round, sample_count);
        let q = if filter_type.uses_q() {
            constant_or_rendered(&mut self.q, round, sample_count)
        } else {
            self.q.skip_round(round, sample_count);
            Some(self.q.value())
        };
        let gain = if filter_type.uses_gain() {
            constant_or_rendered(&mut self.gain, round, sample_count)
        } else {
            self.gain.skip_round(round, sample_count);
            Some(self.gain.value())
        };

        let design = Design::new(&self.state, self.frequency.max());
        let (frequency_scale, q_scale) = self
            .inaccuracy
            .as_ref()
            .map_or((1.0, 1.0), |inaccuracy| (inaccuracy.frequency_scale(), inaccuracy.q_scale()));

        if let (Some(frequency), Some(q), Some(gain)) = (frequency, q, gain) {
            self.are_coefficients_constant = true;

            return match design.response(filter_type, frequency * frequency_scale, q * q_scale, gain) {
                Response::Coefficients(coefficients) => {
                    self.coefficients[0] = coefficients;
                    BlockResponse::Filter
                }
                Response::NoOp => BlockResponse::NoOp,
                Response::Silent => BlockResponse::Silent,
            };
        }

        self.are_coefficients_constant = false;

        let frequencies = rendered(&self.frequency);
        let qs = rendered(&self.q);
        let gains = rendered(&self.gain);
        let mut is_no_op = true;
        let mut is_silent = true;

        for (i, coefficients) in self.coefficients[..sample_count].iter_mut().enumerate() {
            let response = design.response(
                filter_type,
                value_at(frequency, frequencies, i) * frequency_scale,
                value_at(q, qs, i) * q_scale,
                value_at(gain, gains, i),
            );

            is_no_op &= response == Response::NoOp;
            is_silent &= response == Response::Silent;
            *coefficients = response.coefficients();
        }

        if is_no_op {
            BlockResponse::NoOp
        } else if is_silent {
            BlockResponse::Silent
        } else {
            BlockResponse::Filter
        }
    }

    fn pass_input_through(&mut self, sample_count: usize) {
        let input = self.input.state().buffer();
        self.state.buffer_mut().copy_from(input, sample_count);

        for (channel, history) in self.history.iter_mut().enumerate() {
            history.pass_through(&input.channel(channel)[..sample_count]);
        }
    }

    fn silence(&mut self, round: Round, sample_count: usize) {
        self.history.fill(History::default());
        self.state.buffer_mut().silence(0, sample_count);
        self.state.mark_round_as_silent(round);
    }
}

#[inline]
fn value_at(constant: Option<Number>, buffer: &[Sample], index: usize) -> Number {
    match constant {
        Some(value) => value,
        None => buffer[index],
    }
}

impl<I: SignalProducer, F: FixedType> SignalProducer for BiquadFilter<I, F> {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        visitor(&mut self.input);
        visitor(&mut self.frequency);
        visitor(&mut self.q);
        visitor(&mut self.gain);
    }

    fn block_size_changed(&mut self) {
        self.coefficients = vec![NO_OP_COEFFICIENTS; self.state.block_size().max(1)];
    }

    fn reset_state(&mut self) {
        self.history.fill(History::default());
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        produce(&mut self.input, round, sample_count);
        let input_is_silent = self.input.is_silent(round, sample_count);
        let filter_type = self.current_type();

        match self.update_coefficients(filter_type, round, sample_count) {
            BlockResponse::NoOp => {
                self.pass_input_through(sample_count);
                Rendering::Ready
            }
            BlockResponse::Silent => {
                self.silence(round, sample_count);
                Rendering::Ready
            }
            BlockResponse::Filter => {
                if input_is_silent && self.history.iter().all(History::is_silent) {
                    self.silence(round, sample_count);
                    return Rendering::Ready;
                }

                Rendering::Render
            }
        }
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let input = self.input.state().buffer();

        for (channel, history) in self.history.iter_mut().enumerate() {
            let x = &input.channel(channel)[first..last];
            let y = &mut buffer.channel_mut(channel)[first..last];
            let History {
                mut x1,
                mut x2,
                mut y1,
                mut y2,
            } = *history;

            if self.are_coefficients_constant {
                let [b0, b1, b2, a1, a2] = self.coefficients[0];

                for (out, &x0) in y.iter_mut().zip(x) {
                    let y0 = b0 * x0 + b1 * x1 + b2 * x2 - a1 * y1 - a2 * y2;
                    x2 = x1;
                    x1 = x0;
                    y2 = y1;
                    y1 = y0;
                    *out = y0;
                }
            } else {
                let coefficients = &self.coefficients[first..last];

                for ((out, &x0), &[b0, b1, b2, a1, a2]) in y.iter_mut().zip(x).zip(coefficients) {
                    let y0 = b0 * x0 + b1 * x1 + b2 * x2 - a1 * y1 - a2 * y2;
                    x2 = x1;
                    x1 = x0;
                    y2 = y1;
                    y1 = y0;
                    *out = y0;
                }
            }

            *history = History { x1, x2, y1, y2 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: Frequency = 44100.0;

    /// Sum of exact sines on every channel, optionally cut off after a
    /// number of samples.
    struct Sines {
        state: ProducerState,
        partials: Vec<(Frequency, Sample)>,
        position: usize,
        cutoff: Option<usize>,
    }

    impl Sines {
        fn new(channels: usize, partials: &[(Frequency, Sample)]) -> Self {
            Self {
                state: ProducerState::new(channels),
                partials: partials.to_vec(),
                position: 0,
                cutoff: None,
            }
        }
    }

    impl SignalProducer for Sines {
        fn state(&self) -> &ProducerState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut ProducerState {
            &mut self.state
        }

        fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
            let sample_rate = self.state.sample_rate();

            for i in first..last {
                let t = self.position as Number / sample_rate;
                let audible = self.cutoff.is_none_or(|cutoff| self.position < cutoff);
                let sample: Sample = if audible {
                    self.partials
                        .iter()
                        .map(|(frequency, amplitude)| amplitude * libm::sin(2.0 * PI * frequency * t))
                        .sum()
                } else {
                    0.0
                };

                for channel in buffer.channels_mut() {
                    channel[i] = sample;
                }

                self.position += 1;
            }
        }
    }

    fn filter_type_param(filter_type: FilterType) -> Shared<ByteParam> {
        shared(FilterType::param("TYP", filter_type))
    }

    fn prepare<P: SignalProducer>(producer: &mut P, block_size: usize) {
        producer.set_sample_rate(SAMPLE_RATE);
        producer.set_block_size(block_size);
    }

    #[test]
    fn coefficients_match_the_cookbook_low_pass() {
        let design = Design {
            w0_scale: 2.0 * PI / SAMPLE_RATE,
            nyquist_frequency: SAMPLE_RATE / 2.0,
            no_op_frequency: SAMPLE_RATE / 2.0,
        };

        let Response::Coefficients([b0, b1, b2, a1, a2]) = design.low_pass(1000.0, 0.0) else {
            panic!("expected coefficients");
        };

        // DC gain of a low-pass is 1.
        let dc = (b0 + b1 + b2) / (1.0 + a1 + a2);
        assert!((dc - 1.0).abs() < 1e-9);
        assert!((b0 - b2).abs() < 1e-12);
        assert!((b1 - 2.0 * b0).abs() < 1e-12);
    }

    #[test]
    fn peaking_with_zero_gain_is_a_no_op() {
        let design = Design {
            w0_scale: 2.0 * PI / SAMPLE_RATE,
            nyquist_frequency: SAMPLE_RATE / 2.0,
            no_op_frequency: SAMPLE_RATE / 2.0,
        };

        assert_eq!(design.peaking(1000.0, 1.0, 0.0), Response::NoOp);
        assert_eq!(
            design.peaking(1000.0, 0.0, 6.0),
            Response::Coefficients([math::db_to_magnitude(6.0), 0.0, 0.0, 0.0, 0.0])
        );
    }

    #[test]
    fn degenerate_frequencies_follow_the_response_type() {
        let design = Design {
            w0_scale: 2.0 * PI / SAMPLE_RATE,
            nyquist_frequency: SAMPLE_RATE / 2.0,
            no_op_frequency: SAMPLE_RATE / 2.0,
        };
        let f = SAMPLE_RATE / 2.0;

        assert_eq!(design.response(FilterType::LowPass, f, 1.0, 0.0), Response::NoOp);
        assert_eq!(design.response(FilterType::HighPass, f, 1.0, 0.0), Response::Silent);
        assert_eq!(design.response(FilterType::BandPass, f, 1.0, 0.0), Response::Silent);
        assert_eq!(design.response(FilterType::BandPass, 1000.0, 0.0, 0.0), Response::NoOp);
        assert_eq!(design.response(FilterType::Notch, f, 1.0, 0.0), Response::NoOp);
        assert_eq!(design.response(FilterType::Notch, 1000.0, 0.0, 0.0), Response::Silent);
        assert_eq!(design.response(FilterType::Peaking, f, 1.0, 6.0), Response::NoOp);
        assert_eq!(design.response(FilterType::HighShelf, f, 1.0, 6.0), Response::NoOp);
        assert_eq!(design.response(FilterType::LowShelf, f, 1.0, -6.0), gain(-6.0));
    }

    #[test]
    fn open_low_pass_passes_the_input_through() {
        let input = Sines::new(1, &[(440.0, 0.5)]);
        let mut filter: BiquadFilter<Sines> =
            BiquadFilter::new("F", input, filter_type_param(FilterType::LowPass));
        prepare(&mut filter, 64);

        let expected = produce(filter.input_mut(), 1, 64).channel(0)[..64].to_vec();
        let output = produce(&mut filter, 1, 64).channel(0)[..64].to_vec();

        assert_eq!(output, expected);
    }

    #[test]
    fn high_pass_at_nyquist_is_silent() {
        let input = Sines::new(1, &[(440.0, 0.5)]);
        let mut filter: BiquadFilter<Sines, FixedHighPass> = BiquadFilter::fixed("F", input);
        prepare(&mut filter, 64);
        filter.frequency.set_value(SAMPLE_RATE);

        let output = produce(&mut filter, 1, 64);

        assert!(output.channel(0)[..64].iter().all(|s| *s == 0.0));
        assert_eq!(filter.current_type(), FilterType::HighPass);
    }

    #[test]
    fn tail_rings_out_then_settles_to_exact_zeros() {
        let mut input = Sines::new(1, &[(440.0, 0.5)]);
        input.cutoff = Some(128);
        let mut filter: BiquadFilter<Sines> =
            BiquadFilter::new("F", input, filter_type_param(FilterType::LowPass));
        prepare(&mut filter, 128);
        filter.frequency.set_value(200.0);
        filter.q.set_value(20.0);

        produce(&mut filter, 1, 128);
        let tail = produce(&mut filter, 2, 128).channel(0)[..128].to_vec();

        assert!(tail.iter().any(|s| s.abs() > 0.001), "resonant tail must continue");

        let mut round = 3;

        while !filter.history.iter().all(History::is_silent) {
            produce(&mut filter, round, 128);
            round += 1;
            assert!(round < 10_000, "tail never decayed");
        }

        let output = produce(&mut filter, round, 128);

        assert!(output.channel(0)[..128].iter().all(|s| *s == 0.0));
        assert!(filter.is_silent(round, 128));
    }

    #[test]
    fn filters_following_the_same_leaders_share_coefficients() {
        let leaders = BiquadLeaders::new("F", FilterType::Peaking);
        leaders.frequency.borrow_mut().set_value(2000.0);
        leaders.q.borrow_mut().set_value(2.0);
        leaders.gain.borrow_mut().set_value(12.0);
        let shared_buffers = shared(BiquadFilterSharedBuffers::new());

        let mut filters: Vec<BiquadFilter<Sines>> = (0..2)
            .map(|_| {
                BiquadFilter::from_leaders(
                    Sines::new(1, &[(1000.0, 0.3), (3000.0, 0.3)]),
                    &leaders,
                    Some(std::rc::Rc::clone(&shared_buffers)),
                )
            })
            .collect();

        for filter in &mut filters {
            prepare(filter, 128);
        }

        for round in 1..=4 {
            let first = produce(&mut filters[0], round, 128).channel(0)[..128].to_vec();
            assert_eq!(shared_buffers.borrow().round(), Some(round));
            let second = produce(&mut filters[1], round, 128).channel(0)[..128].to_vec();

            assert_eq!(first, second);
        }
    }

    #[test]
    fn ramped_frequency_uses_per_sample_coefficients() {
        let input = Sines::new(1, &[(440.0, 0.5)]);
        let mut filter: BiquadFilter<Sines> =
            BiquadFilter::new("F", input, filter_type_param(FilterType::LowPass));
        prepare(&mut filter, 128);
        filter.frequency.set_value(500.0);
        filter.frequency.schedule_linear_ramp(0.01, 5000.0);

        produce(&mut filter, 1, 128);

        assert!(!filter.are_coefficients_constant);
        assert_ne!(filter.coefficients[0], filter.coefficients[127]);
    }

    #[test]
    fn inaccuracy_scales_frequency_and_q() {
        let frequency_level = shared(FloatParam::block("FIA", 0.0, 1.0, 1.0));
        let q_level = shared(FloatParam::block("QIA", 0.0, 1.0, 0.0));
        let mut inaccuracy = FilterInaccuracy::new(frequency_level, q_level);

        inaccuracy.update(1.0, 0.0);

        assert!(inaccuracy.is_active());
        assert!((inaccuracy.frequency_scale() - math::detune(1.0, 100.0)).abs() < 1e-6);
        assert_eq!(inaccuracy.q_scale(), 1.0);

        inaccuracy.update(0.5, 0.5);

        assert!((inaccuracy.frequency_scale() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn selector_values_map_to_types() {
        for filter_type in FilterType::ALL {
            assert_eq!(FilterType::from_index(filter_type.index()), filter_type);
        }

        assert_eq!(FilterType::from_index(200), FilterType::HighShelf);
    }
}
