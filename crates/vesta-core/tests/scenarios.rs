//! End-to-end scenarios for vesta-core signal chains.
//!
//! Each test drives a small graph through the public API only: producers are
//! configured, events are scheduled, and rounds are pulled the way a host
//! callback pulls them.

use std::f64::consts::PI;
use std::rc::Rc;

use vesta_core::{
    BiquadFilter, BiquadFilterSharedBuffers, BiquadLeaders, Buffer, ByteParam, Delay, Envelope,
    FilterType, FloatParam, Lfo, LfoEnvelopeMapping, MidiController, Mixer, Oscillator,
    ProducerState, Round, Sample, Shared, SharedProducer, SignalProducer, Waveform, produce,
    shared,
};

/// Repeats one block per round on every channel, channel `c` scaled by
/// `c + 1`.
struct Pattern {
    state: ProducerState,
    block: Vec<Sample>,
}

impl Pattern {
    fn new(channels: usize, block: &[Sample]) -> Self {
        Self {
            state: ProducerState::new(channels),
            block: block.to_vec(),
        }
    }
}

impl SignalProducer for Pattern {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        for (c, channel) in buffer.channels_mut().iter_mut().enumerate() {
            for i in first..last {
                channel[i] = self.block[i] * (c + 1) as Sample;
            }
        }
    }
}

/// Sum of sines, identical on every channel.
struct SineSum {
    state: ProducerState,
    partials: Vec<(Sample, Sample)>,
    position: usize,
}

impl SineSum {
    fn new(channels: usize, partials: &[(Sample, Sample)]) -> Self {
        Self {
            state: ProducerState::new(channels),
            partials: partials.to_vec(),
            position: 0,
        }
    }
}

impl SignalProducer for SineSum {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let sample_rate = self.state.sample_rate();

        for i in first..last {
            let t = self.position as Sample / sample_rate;
            let sample: Sample = self
                .partials
                .iter()
                .map(|(frequency, amplitude)| amplitude * (2.0 * PI * frequency * t).sin())
                .sum();

            for channel in buffer.channels_mut() {
                channel[i] = sample;
            }

            self.position += 1;
        }
    }
}

/// Amplitude of the `frequency` component of `signal`.
fn amplitude_at(signal: &[Sample], frequency: Sample, sample_rate: Sample) -> Sample {
    let (re, im) = signal.iter().enumerate().fold((0.0, 0.0), |(re, im), (n, s)| {
        let w = 2.0 * PI * frequency * n as Sample / sample_rate;
        (re + s * w.cos(), im + s * w.sin())
    });

    2.0 * (re * re + im * im).sqrt() / signal.len() as Sample
}

fn collect<P: SignalProducer>(producer: &mut P, rounds: Round, sample_count: usize) -> Vec<Vec<Sample>> {
    let channels = producer.state().channels();
    let mut output = vec![Vec::new(); channels];

    for round in 1..=rounds {
        let block = produce(producer, round, sample_count);

        for (c, samples) in output.iter_mut().enumerate() {
            samples.extend_from_slice(&block.channel(c)[..sample_count]);
        }
    }

    output
}

fn assert_close(actual: &[Sample], expected: &[Sample], tolerance: Sample) {
    assert_eq!(actual.len(), expected.len());

    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tolerance, "sample {i}: {a} != {e}");
    }
}

fn waveform(waveform: Waveform) -> Shared<ByteParam> {
    shared(Waveform::param("WAV", waveform))
}

#[test]
fn low_pass_sanity() {
    let input = SineSum::new(2, &[(440.0, 0.5), (7040.0, 0.5)]);
    let mut filter: BiquadFilter<SineSum> =
        BiquadFilter::new("F", input, shared(FilterType::param("TYP", FilterType::LowPass)));
    filter.set_sample_rate(44100.0);
    filter.set_block_size(256);
    filter.frequency.set_value(1000.0);
    filter.q.set_value(0.0);

    // 0.2 s: a whole number of periods of both sines.
    for samples in collect(&mut filter, 50, 256) {
        let tail = &samples[samples.len() - 8820..];

        assert!((amplitude_at(tail, 440.0, 44100.0) - 0.5).abs() < 0.1);
        assert!(amplitude_at(tail, 7040.0, 44100.0) < 0.1);
    }
}

#[test]
fn delay_basic() {
    let mut delay = Delay::new(Pattern::new(2, &[0.1, 0.2, 0.3, 0.4, 0.5]));
    delay.set_sample_rate(10.0);
    delay.set_block_size(5);
    delay.gain.set_value(0.5);
    delay.time.set_value(0.25);
    delay.time.schedule_value(0.71, 0.4);

    let output = collect(&mut delay, 2, 5);
    let expected = [0.0, 0.0, 0.025, 0.075, 0.125, 0.175, 0.225, 0.150, 0.250, 0.050];

    assert_close(&output[0], &expected, 1e-12);
    assert_close(&output[1], &expected.map(|s| 2.0 * s), 1e-12);
}

#[test]
fn envelope_dahds() {
    let envelope = shared(Envelope::new("E"));
    {
        let mut envelope = envelope.borrow_mut();
        envelope.scale.set_value(0.8);
        envelope.initial_value.set_value(0.625);
        envelope.delay_time.set_value(0.7);
        envelope.attack_time.set_value(3.0);
        envelope.peak_value.set_value(1.0);
        envelope.hold_time.set_value(1.0);
        envelope.decay_time.set_value(2.0);
        envelope.sustain_value.set_value(0.75);
        envelope.release_time.set_value(0.0);
    }

    let mut param = FloatParam::new("P", -5.0, 5.0, 0.0);
    param.set_sample_rate(1.0);
    param.set_block_size(10);
    param.set_envelope(Some(envelope));
    param.start_envelope(0.3);

    assert_close(
        &collect(&mut param, 1, 10)[0],
        &[0.0, 0.0, 1.0, 2.0, 3.0, 3.0, 2.0, 1.0, 1.0, 1.0],
        1e-12,
    );
}

#[test]
fn linear_ramp_clamp() {
    let mut param = FloatParam::new("P", -1.0, 1.0, 0.0);
    param.set_sample_rate(1.0);
    param.set_block_size(20);
    param.set_value(-0.1);
    param.schedule_value(4.0, 0.0);
    param.schedule_linear_ramp(15.0, 1.5);

    let output = &collect(&mut param, 1, 20)[0];

    for (i, sample) in output.iter().enumerate().skip(4) {
        let expected = ((i - 4) as Sample * 0.1).min(1.0);
        assert!((sample - expected).abs() < 1e-12, "sample {i}: {sample}");
    }
}

#[test]
fn midi_smoothing() {
    let controller = shared(MidiController::new());
    let mut param = FloatParam::new("P", 0.0, 1.0, 0.0);
    param.set_sample_rate(3000.0);
    param.set_block_size(3000);
    param.set_midi_controller(Some(Rc::clone(&controller)));

    controller.borrow_mut().change(0, 0.0, 0.2);

    let output = &collect(&mut param, 1, 3000)[0];
    let ramp_samples = (vesta_core::param::MIDI_CTL_SMALL_CHANGE_DURATION
        .max(vesta_core::param::MIDI_CTL_BIG_CHANGE_DURATION * 0.2)
        * 3000.0) as usize;

    assert!(output[..ramp_samples].windows(2).all(|w| w[1] > w[0]));
    assert!((output[ramp_samples] - 0.2).abs() < 1e-9);
    assert!(output[ramp_samples..].iter().all(|s| (s - 0.2).abs() < 1e-9));
}

#[test]
fn lfo_envelope_modulation() {
    let envelope = shared(Envelope::new("E1"));
    {
        let mut envelope = envelope.borrow_mut();
        envelope.attack_time.set_value(0.5);
        envelope.hold_time.set_value(0.0);
        envelope.decay_time.set_value(0.0);
        envelope.sustain_value.set_value(1.0);
    }

    let lfo = shared(Lfo::new("L1"));
    {
        let mut lfo = lfo.borrow_mut();
        lfo.waveform.borrow_mut().set_value(Waveform::Sine.index());
        lfo.frequency_mut().set_value(25.0);
        lfo.set_sample_rate(100.0);
        lfo.set_block_size(100);
        lfo.start(0.0);
    }

    let leader = shared(FloatParam::new("P", 0.0, 10.0, 0.0));
    leader.borrow_mut().set_lfo(Some(Rc::clone(&lfo)));

    let mut mapping = LfoEnvelopeMapping::with_capacity(1);
    mapping.push(Rc::clone(&lfo), Rc::clone(&envelope));

    let mut param = FloatParam::follower(&leader);
    param.set_sample_rate(100.0);
    param.set_block_size(100);
    param.start_lfo_envelope(0.0, &mapping);

    let mut reference = FloatParam::new("R", 0.0, 1.0, 0.0);
    reference.set_sample_rate(100.0);
    reference.set_block_size(100);
    reference.set_envelope(Some(envelope));
    reference.start_envelope(0.0);

    let output = collect(&mut param, 1, 100).remove(0);
    let envelope_samples = collect(&mut reference, 1, 100).remove(0);
    let lfo_samples = lfo.borrow().state().buffer().channel(0)[..100].to_vec();

    for i in 0..100 {
        assert!((output[i] - 10.0 * envelope_samples[i] * lfo_samples[i]).abs() < 1e-9);
    }
}

#[test]
fn oscillator_through_filter_and_delay() {
    let mut oscillator = Oscillator::new(waveform(Waveform::Sawtooth));
    oscillator.set_sample_rate(48000.0);
    oscillator.set_block_size(128);
    oscillator.frequency.set_value(220.0);
    oscillator.start(0.0);

    let filter_type = shared(FilterType::param("TYP", FilterType::LowPass));
    let filter: BiquadFilter<Oscillator> = BiquadFilter::new("F", oscillator, filter_type);
    let mut delay = Delay::new(filter);
    delay.set_sample_rate(48000.0);
    delay.set_block_size(128);
    delay.input_mut().frequency.set_value(2000.0);
    delay.gain.set_value(1.0);
    delay.time.set_value(0.01);

    let output = collect(&mut delay, 20, 128).remove(0);

    // 10 ms at 48 kHz.
    assert!(output[..480].iter().all(|s| *s == 0.0));
    assert!(output[480..].iter().any(|s| s.abs() > 0.1));
    assert!(output.iter().all(|s| s.is_finite() && s.abs() < 2.0));
}

#[test]
fn filters_sharing_leaders_render_identical_voices() {
    let leaders = BiquadLeaders::new("F", FilterType::BandPass);
    leaders.frequency.borrow_mut().set_value(800.0);
    leaders.q.borrow_mut().set_value(6.0);

    let buffers = shared(BiquadFilterSharedBuffers::new());
    let mut mixer: Mixer<BiquadFilter<Oscillator>> = Mixer::new(1);
    mixer.set_sample_rate(44100.0);
    mixer.set_block_size(64);

    for _ in 0..2 {
        let mut oscillator = Oscillator::new(waveform(Waveform::Square));
        oscillator.frequency.set_value(110.0);
        oscillator.start(0.0);

        mixer.add(BiquadFilter::from_leaders(
            oscillator,
            &leaders,
            Some(Rc::clone(&buffers)),
        ));
    }

    for round in 1..=8 {
        produce(&mut mixer, round, 64);

        let first = mixer.input(0).state().buffer().channel(0)[..64].to_vec();
        let second = mixer.input(1).state().buffer().channel(0)[..64].to_vec();

        assert_eq!(first, second);
    }

    assert_eq!(buffers.borrow().round(), Some(8));
}

#[test]
fn followers_on_different_channels_filter_independently() {
    let controller = shared(MidiController::new());
    let leaders = BiquadLeaders::new("F", FilterType::LowPass);
    leaders.frequency.borrow_mut().set_midi_controller(Some(Rc::clone(&controller)));
    let buffers = shared(BiquadFilterSharedBuffers::new());

    let follower = |channel: u8| {
        let mut oscillator = Oscillator::new(waveform(Waveform::Sawtooth));
        oscillator.frequency.set_value(220.0);
        oscillator.start(0.0);

        let mut filter: BiquadFilter<Oscillator> =
            BiquadFilter::from_leaders(oscillator, &leaders, Some(Rc::clone(&buffers)));
        filter.frequency.set_midi_channel(channel);
        filter.set_sample_rate(44100.0);
        filter.set_block_size(256);
        filter
    };
    let mut dark = follower(1);
    let mut open = follower(2);

    controller.borrow_mut().change(1, 0.0, 0.01);
    controller.borrow_mut().change(2, 0.0, 1.0);

    let mut blocks = (Vec::new(), Vec::new());

    for round in 1..=40 {
        blocks.0 = produce(&mut dark, round, 256).channel(0)[..256].to_vec();
        blocks.1 = produce(&mut open, round, 256).channel(0)[..256].to_vec();
        controller.borrow_mut().clear();
    }

    assert!((dark.frequency.value() - 240.99).abs() < 0.01);
    assert!((open.frequency.value() - 24000.0).abs() < 0.01);
    assert_ne!(blocks.0, blocks.1);

    // 24 kHz is above Nyquist, so the open filter passes its input through.
    assert_eq!(blocks.1, open.input().state().buffer().channel(0)[..256].to_vec());
}

#[test]
fn shared_producer_is_rendered_once_per_round() {
    let source = shared(Pattern::new(1, &[1.0, 2.0, 3.0, 4.0]));
    source.borrow_mut().set_block_size(4);

    let mut mixer = Mixer::new(1);
    mixer.set_block_size(4);
    mixer.add(SharedProducer::new(Rc::clone(&source)));
    mixer.add_weighted(SharedProducer::new(Rc::clone(&source)), 0.5);

    assert_eq!(produce(&mut mixer, 1, 4).channel(0), &[1.5, 3.0, 4.5, 6.0]);
    assert_eq!(source.borrow().state().cached_round(), Some(1));
}
