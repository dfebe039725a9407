//! Extreme parameter tests for the vesta effects.
//!
//! Verifies that every effect produces finite (non-NaN, non-Inf) output when
//! its parameters sit at their minimum or maximum, and when running at
//! extreme sample rates (8 kHz and 192 kHz).

use vesta_core::{
    Buffer, FloatParam, ON, ProducerState, Round, Sample, Shared, SignalProducer, produce,
};
use vesta_effects::{Chorus, Distortion, Echo, Effect, Effects, Reverb, Shape, Wavefolder};

const DEFAULT_SAMPLE_RATE: f64 = 48000.0;
const LOW_SAMPLE_RATE: f64 = 8000.0;
const HIGH_SAMPLE_RATE: f64 = 192000.0;
const BLOCK_SIZE: usize = 100;
const ROUNDS: Round = 10;

/// Repeats `0.5, -0.5, 0.0` on every channel.
struct Pulses {
    state: ProducerState,
    position: usize,
}

impl Pulses {
    fn new(channels: usize) -> Self {
        Self {
            state: ProducerState::new(channels),
            position: 0,
        }
    }
}

impl SignalProducer for Pulses {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        for i in first..last {
            let value = match (self.position + i) % 3 {
                0 => 0.5,
                1 => -0.5,
                _ => 0.0,
            };

            for channel in buffer.channels_mut() {
                channel[i] = value;
            }
        }

        self.position += last - first;
    }
}

/// Pull `ROUNDS` blocks and assert every output sample is finite.
fn assert_finite_output(producer: &mut dyn SignalProducer, label: &str) {
    let channels = producer.state().channels();

    for round in 1..=ROUNDS {
        let block = produce(producer, round, BLOCK_SIZE);

        for c in 0..channels {
            for (i, sample) in block.channel(c)[..BLOCK_SIZE].iter().enumerate() {
                assert!(
                    sample.is_finite(),
                    "{label}: non-finite output in round {round}, channel {c}, sample {i}: {sample}"
                );
            }
        }
    }
}

fn prepare(producer: &mut dyn SignalProducer, sample_rate: f64) {
    producer.set_sample_rate(sample_rate);
    producer.set_block_size(BLOCK_SIZE);
}

fn set_all(params: &[&Shared<FloatParam>], at_max: bool) {
    for param in params {
        let mut param = param.borrow_mut();
        let value = if at_max { param.max() } else { param.min() };
        param.set_value(value);
    }
}

fn chorus_leaders(chorus: &Chorus) -> [&Shared<FloatParam>; 8] {
    [
        &chorus.delay_time,
        &chorus.frequency,
        &chorus.depth,
        &chorus.feedback,
        &chorus.damping_frequency,
        &chorus.damping_gain,
        &chorus.width,
        &chorus.high_pass_frequency,
    ]
}

fn echo_leaders(echo: &Echo) -> [&Shared<FloatParam>; 9] {
    [
        &echo.delay_time,
        &echo.input_volume,
        &echo.feedback,
        &echo.damping_frequency,
        &echo.damping_gain,
        &echo.width,
        &echo.high_pass_frequency,
        &echo.high_pass_q,
        &echo.distortion_level,
    ]
}

fn reverb_leaders(reverb: &Reverb) -> [&Shared<FloatParam>; 8] {
    [
        &reverb.room_size,
        &reverb.room_reflectivity,
        &reverb.damping_frequency,
        &reverb.damping_gain,
        &reverb.width,
        &reverb.high_pass_frequency,
        &reverb.high_pass_q,
        &reverb.distortion_level,
    ]
}

fn wet_chorus() -> Effect<Pulses, Chorus> {
    let mut effect = Effect::new("C", Pulses::new(2), Chorus::new("C", 2));
    effect.wet.set_value(1.0);
    effect
}

fn wet_echo() -> Effect<Pulses, Echo> {
    let mut effect = Effect::new("E", Pulses::new(2), Echo::new("E", 2));
    effect.wet.set_value(1.0);
    effect
}

#[test]
fn chorus_extremes() {
    for at_max in [false, true] {
        for tuning in [0, vesta_effects::chorus::TUNING_MAX] {
            let mut effect = wet_chorus();
            prepare(&mut effect, DEFAULT_SAMPLE_RATE);
            set_all(&chorus_leaders(effect.processor()), at_max);
            effect.processor().tuning.borrow_mut().set_value(tuning);
            effect.processor().tempo_sync.borrow_mut().set_value(u8::from(at_max));

            assert_finite_output(&mut effect, &format!("Chorus (max: {at_max}, tuning {tuning})"));
        }
    }

    for sample_rate in [LOW_SAMPLE_RATE, HIGH_SAMPLE_RATE] {
        let mut effect = wet_chorus();
        prepare(&mut effect, sample_rate);
        assert_finite_output(&mut effect, &format!("Chorus ({sample_rate} Hz)"));
    }
}

#[test]
fn echo_extremes() {
    for at_max in [false, true] {
        let mut effect = wet_echo();
        prepare(&mut effect, DEFAULT_SAMPLE_RATE);
        set_all(&echo_leaders(effect.processor()), at_max);

        if at_max {
            let echo = effect.processor();
            echo.tempo_sync.borrow_mut().set_value(ON);
            echo.reversed_1.borrow_mut().set_value(ON);
            echo.reversed_2.borrow_mut().set_value(ON);
        }

        assert_finite_output(&mut effect, &format!("Echo (max: {at_max})"));
    }

    for sample_rate in [LOW_SAMPLE_RATE, HIGH_SAMPLE_RATE] {
        let mut effect = wet_echo();
        prepare(&mut effect, sample_rate);
        effect.processor().delay_time.borrow_mut().set_value(0.001);
        assert_finite_output(&mut effect, &format!("Echo ({sample_rate} Hz)"));
    }
}

fn wet_reverb() -> Effect<Pulses, Reverb> {
    let mut effect = Effect::compressed("R", Pulses::new(2), Reverb::new("R", 2));
    effect.wet.set_value(1.0);
    effect
}

#[test]
fn reverb_extremes() {
    for at_max in [false, true] {
        let mut effect = wet_reverb();
        prepare(&mut effect, DEFAULT_SAMPLE_RATE);
        set_all(&reverb_leaders(effect.processor()), at_max);

        if let Some(compressor) = effect.compressor_mut() {
            for param in [
                &mut compressor.threshold,
                &mut compressor.attack_time,
                &mut compressor.release_time,
                &mut compressor.ratio,
            ] {
                let value = if at_max { param.max() } else { param.min() };
                param.set_value(value);
            }
        }

        assert_finite_output(&mut effect, &format!("Reverb (max: {at_max})"));
    }

    for sample_rate in [LOW_SAMPLE_RATE, HIGH_SAMPLE_RATE] {
        let mut effect = wet_reverb();
        prepare(&mut effect, sample_rate);
        assert_finite_output(&mut effect, &format!("Reverb ({sample_rate} Hz)"));
    }
}

#[test]
fn distortion_extremes() {
    for shape in Shape::ALL {
        let mut distortion = Distortion::fixed("D", Pulses::new(2), shape);
        prepare(&mut distortion, DEFAULT_SAMPLE_RATE);
        distortion.level.set_value(1.0);

        assert_finite_output(&mut distortion, &format!("Distortion ({shape:?})"));
    }
}

#[test]
fn wavefolder_extremes() {
    for folding in [0.0, 0.25, 5.5] {
        for sample_rate in [LOW_SAMPLE_RATE, DEFAULT_SAMPLE_RATE, HIGH_SAMPLE_RATE] {
            let mut folder = Wavefolder::new(Pulses::new(2));
            prepare(&mut folder, sample_rate);
            folder.folding.set_value(folding);

            assert_finite_output(&mut folder, &format!("Wavefolder ({folding} at {sample_rate} Hz)"));
        }
    }
}

#[test]
fn full_bus_extremes() {
    let mut effects = Effects::new("FX", Pulses::new(2));
    prepare(&mut effects, DEFAULT_SAMPLE_RATE);
    effects.chorus_mut().wet.set_value(1.0);
    effects.echo_mut().wet.set_value(1.0);
    effects.reverb_mut().wet.set_value(1.0);
    set_all(&chorus_leaders(effects.chorus().processor()), true);
    set_all(&echo_leaders(effects.echo().processor()), true);
    set_all(&reverb_leaders(effects.reverb().processor()), true);

    assert_finite_output(&mut effects, "Effects (all max)");
}

#[test]
fn output_level_stays_reasonable_at_default_settings() {
    let mut effects = Effects::new("FX", Pulses::new(2));
    prepare(&mut effects, DEFAULT_SAMPLE_RATE);
    effects.chorus_mut().wet.set_value(1.0);
    effects.echo_mut().wet.set_value(1.0);
    effects.reverb_mut().wet.set_value(0.5);

    let mut peak: Sample = 0.0;

    for round in 1..=200 {
        let block = produce(&mut effects, round, BLOCK_SIZE);

        for c in 0..2 {
            peak = block.channel(c)[..BLOCK_SIZE]
                .iter()
                .fold(peak, |peak, sample| peak.max(sample.abs()));
        }
    }

    assert!(peak < 8.0, "peak {peak}");
}
