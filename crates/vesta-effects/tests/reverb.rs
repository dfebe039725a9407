//! Impulse response tests for the reverb and the compressed reverb stage.

use vesta_core::{Buffer, ProducerState, Round, Sample, SignalProducer, produce};
use vesta_effects::reverb::{COMB_FILTERS, TUNINGS};
use vesta_effects::{Effect, Processor, Reverb};

const SAMPLE_RATE: f64 = 44100.0;
const BLOCK_SIZE: usize = 128;

fn reverb() -> Reverb {
    let mut reverb = Reverb::new("R", 2);
    reverb.set_sample_rate(SAMPLE_RATE);
    reverb.set_block_size(BLOCK_SIZE);
    reverb.high_pass_frequency.borrow_mut().set_value(1.0);
    reverb
}

fn impulse() -> Buffer {
    let mut buffer = Buffer::new(2, BLOCK_SIZE);

    for channel in buffer.channels_mut() {
        channel[0] = 1.0;
    }

    buffer
}

/// Feed an impulse in round 1 and silence afterwards; returns both channels.
fn impulse_response(reverb: &mut Reverb, rounds: Round) -> [Vec<Sample>; 2] {
    let first = impulse();
    let silence = Buffer::new(2, BLOCK_SIZE);
    let mut output = [Vec::new(), Vec::new()];

    for round in 1..=rounds {
        let input = if round == 1 { &first } else { &silence };
        reverb.feed(round, input, BLOCK_SIZE);
        let block = produce(reverb, round, BLOCK_SIZE);

        for (c, channel) in output.iter_mut().enumerate() {
            channel.extend_from_slice(&block.channel(c)[..BLOCK_SIZE]);
        }
    }

    output
}

fn shortest_comb() -> usize {
    TUNINGS
        .iter()
        .map(|tuning| (tuning.delay_time * SAMPLE_RATE).round() as usize)
        .min()
        .unwrap_or_default()
}

fn peak(samples: &[Sample]) -> Sample {
    samples.iter().fold(0.0, |peak, sample| peak.max(sample.abs()))
}

#[test]
fn silent_input_stays_silent() {
    let mut reverb = reverb();
    let silence = Buffer::new(2, BLOCK_SIZE);

    for round in 1..=8 {
        reverb.feed(round, &silence, BLOCK_SIZE);
        produce(&mut reverb, round, BLOCK_SIZE);

        assert!(reverb.is_silent(round, BLOCK_SIZE));
    }
}

#[test]
fn first_reflection_arrives_after_the_shortest_comb() {
    let mut reverb = reverb();
    let [left, _] = impulse_response(&mut reverb, 24);
    let shortest = shortest_comb();

    assert_eq!(shortest, 1116);
    assert!(peak(&left[..shortest - 2]) < 1e-9, "{}", peak(&left[..shortest - 2]));
    assert!(peak(&left[shortest - 2..shortest + 600]) > 0.02);
}

#[test]
fn every_comb_contributes_a_reflection() {
    let mut reverb = reverb();
    let [left, _] = impulse_response(&mut reverb, 24);

    for tuning in TUNINGS {
        let at = (tuning.delay_time * SAMPLE_RATE).round() as usize;

        assert!(peak(&left[at - 2..at + 3]) > 0.02, "nothing at {at}");
    }

    assert_eq!(TUNINGS.len(), COMB_FILTERS);
}

#[test]
fn larger_rooms_delay_the_reflections() {
    let mut reverb = reverb();
    reverb.room_size.borrow_mut().set_value(2.0);

    let [left, _] = impulse_response(&mut reverb, 40);
    let doubled = 2 * shortest_comb();

    assert!(peak(&left[..doubled - 4]) < 1e-9);
    assert!(peak(&left[doubled - 4..doubled + 1200]) > 0.02);
}

#[test]
fn tail_decays() {
    let mut reverb = reverb();
    reverb.room_reflectivity.borrow_mut().set_value(0.5);

    let [left, right] = impulse_response(&mut reverb, 700);

    for channel in [&left, &right] {
        assert!(channel.iter().all(|sample| sample.is_finite()));
        assert!(peak(channel) < 1.0);
        assert!(peak(&channel[channel.len() - BLOCK_SIZE..]) < 1e-6);
    }
}

#[test]
fn width_spreads_the_combs_apart() {
    let mut centered = reverb();
    let mut wide = reverb();
    wide.width.borrow_mut().set_value(1.0);

    let [centered_left, centered_right] = impulse_response(&mut centered, 24);
    let [wide_left, wide_right] = impulse_response(&mut wide, 24);

    assert!(
        centered_left
            .iter()
            .zip(&centered_right)
            .all(|(left, right)| (left - right).abs() < 1e-12)
    );
    assert!(
        wide_left
            .iter()
            .zip(&wide_right)
            .any(|(left, right)| (left - right).abs() > 0.01)
    );
}

#[test]
fn high_reflectivity_with_clipping_stays_bounded() {
    let mut reverb = reverb();
    reverb.room_reflectivity.borrow_mut().set_value(vesta_effects::echo::FEEDBACK_MAX);
    reverb.distortion_level.borrow_mut().set_value(1.0);
    reverb.damping_gain.borrow_mut().set_value(-0.01);

    let mut loud = Buffer::new(2, BLOCK_SIZE);
    for channel in loud.channels_mut() {
        for (i, sample) in channel.iter_mut().enumerate() {
            *sample = if i % 8 < 4 { 1.0 } else { -1.0 };
        }
    }

    for round in 1..=400 {
        reverb.feed(round, &loud, BLOCK_SIZE);
        let output = produce(&mut reverb, round, BLOCK_SIZE);

        for c in 0..2 {
            let block = &output.channel(c)[..BLOCK_SIZE];

            assert!(block.iter().all(|y| y.is_finite() && y.abs() < 20.0));
        }
    }
}

/// Half a second of a loud constant input, then silence.
struct Burst {
    state: ProducerState,
    position: usize,
}

impl SignalProducer for Burst {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        for i in first..last {
            let value = if self.position + i - first < 22050 { 0.9 } else { 0.0 };

            for channel in buffer.channels_mut() {
                channel[i] = value;
            }
        }

        self.position += last - first;
    }
}

fn wet_reverb_stage() -> Effect<Burst, Reverb> {
    let mut stage = Effect::compressed(
        "R",
        Burst {
            state: ProducerState::new(2),
            position: 0,
        },
        Reverb::new("R", 2),
    );
    stage.set_sample_rate(SAMPLE_RATE);
    stage.set_block_size(BLOCK_SIZE);
    stage.dry.set_value(0.0);
    stage.wet.set_value(1.0);
    stage
}

/// Peak of the stage output while the burst plays and right after it.
fn burst_peaks(stage: &mut Effect<Burst, Reverb>) -> (Sample, Sample) {
    let mut during: Sample = 0.0;
    let mut after: Sample = 0.0;

    for round in 1..=260 {
        let block = produce(stage, round, BLOCK_SIZE);
        let block_peak = peak(&block.channel(0)[..BLOCK_SIZE]);

        match round {
            100..=170 => during = during.max(block_peak),
            176..=200 => after = after.max(block_peak),
            _ => {}
        }
    }

    (during, after)
}

#[test]
fn side_chain_compression_ducks_the_reverb_under_its_input() {
    let mut plain = wet_reverb_stage();
    let mut ducked = wet_reverb_stage();

    if let Some(compressor) = ducked.compressor_mut() {
        compressor.threshold.set_value(-30.0);
        compressor.ratio.set_value(20.0);
        compressor.attack_time.set_value(0.005);
        compressor.release_time.set_value(0.01);
    }

    let (plain_during, _) = burst_peaks(&mut plain);
    let (ducked_during, ducked_after) = burst_peaks(&mut ducked);

    assert!(ducked_during < 0.5 * plain_during, "{ducked_during} vs {plain_during}");
    assert!(ducked_after > ducked_during, "{ducked_after} vs {ducked_during}");
}
