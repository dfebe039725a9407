//! Vesta Core - the block-based signal graph of the vesta synthesizer
//!
//! Everything that produces audio or control signals is a
//! [`SignalProducer`]: oscillators, filters and delays, and also every
//! automatable parameter. Producers are pulled once per *round* and cache
//! their output, so a signal shared by many consumers is computed once.
//!
//! # Core Abstractions
//!
//! ## Signal Graph
//!
//! - [`SignalProducer`] - Pull protocol with sample-accurate event dispatch
//! - [`produce`] - Render a producer for a round, or return its cached block
//! - [`Buffer`] - Fixed `[channel][sample]` block storage
//! - [`Queue`] - Ordered event queue
//!
//! ## Parameters
//!
//! - [`Param`], [`ByteParam`], [`ToggleParam`] - Bounded, ratio-addressable values
//! - [`FloatParam`] - Scheduled values, ramps, controller smoothing, envelopes and LFOs
//! - [`ModulatableFloatParam`] - Audio-rate modulation on top of a [`FloatParam`]
//! - [`Envelope`] - DAHDSR definition with per-voice snapshots
//! - [`MidiController`], [`Macro`] - Controller sources
//!
//! ## Signal Sources and Processors
//!
//! - [`Oscillator`] - Band-limited wavetable oscillator with AM, FM and PM
//! - [`Lfo`] - Low-frequency oscillator with range, distortion and randomness
//! - [`BiquadFilter`] - Seven response types with coefficient sharing
//! - [`Delay`], [`PannedDelay`], [`HighShelfPannedDelay`] - Delay lines
//! - [`Gain`], [`Mixer`] - Level and summing nodes
//! - [`adaa`] - Antiderivative antialiasing for static waveshapers
//!
//! # Real-time Contract
//!
//! Nothing reachable from [`produce`] allocates, locks or performs I/O.
//! Buffers are sized by [`SignalProducer::set_block_size`], which hosts call
//! outside the audio thread. The graph is single-threaded; shared nodes are
//! held through [`Shared`] handles.
//!
//! # Example
//!
//! ```rust,ignore
//! use vesta_core::{Oscillator, SignalProducer, produce, shared, ByteParam};
//!
//! let waveform = shared(ByteParam::new("WAV", 0, 9, 0));
//! let mut osc = Oscillator::new(waveform);
//! osc.set_sample_rate(48000.0);
//! osc.set_block_size(256);
//! osc.frequency.set_value(440.0);
//! osc.start(0.0);
//!
//! let block = produce(&mut osc, 1, 256);
//! ```

pub mod adaa;
pub mod biquad;
pub mod delay;
pub mod envelope;
pub mod gain;
pub mod inaccuracy;
pub mod lfo;
pub mod macro_control;
pub mod math;
pub mod midi_controller;
pub mod mixer;
pub mod oscillator;
pub mod param;
pub mod producer;
pub mod queue;
pub mod shape;
pub mod wavetable;

/// Audio sample.
pub type Sample = f64;
/// Generic real number used by parameters and math helpers.
pub type Number = f64;
/// Duration or time offset.
pub type Seconds = f64;
/// Frequency in Hz.
pub type Frequency = f64;

pub use adaa::{Adaa, Fallback, Waveshaper};
pub use biquad::{
    BiquadFilter, BiquadFilterSharedBuffers, BiquadLeaders, FilterInaccuracy, FilterType,
    FixedHighPass, FixedHighShelf, FixedLowPass, FixedType, NoFixedType,
};
pub use delay::{Delay, DelayBuffer, DelayStage, HighShelfPannedDelay, PannedDelay, PanningMode};
pub use envelope::{
    ENVELOPE_RANDOMS, Envelope, EnvelopeRandoms, EnvelopeSnapshot, UpdateMode, VOICE_STATUS_HIGHEST,
    VOICE_STATUS_LAST, VOICE_STATUS_LOWEST, VOICE_STATUS_OLDEST,
};
pub use gain::Gain;
pub use inaccuracy::OscillatorInaccuracy;
pub use lfo::{Lfo, LfoEnvelopeMapping};
pub use macro_control::Macro;
pub use midi_controller::{ALL_CHANNELS, MIDI_CHANNELS, MidiController, PARAM_DEFAULT_MPE_CHANNEL};
pub use mixer::Mixer;
pub use oscillator::{CUSTOM_WAVEFORM_HARMONICS, Oscillator, OscillatorLeaders, Waveform};
pub use param::{
    ByteParam, EnvelopeStage, Evaluation, FloatParam, LogScale, ModulatableFloatParam, Modulator,
    OFF, ON, Param, ToggleParam, constant_or_rendered, is_on, produce_if_not_constant, toggle,
};
pub use producer::{
    BlockTap, Buffer, DEFAULT_BLOCK_SIZE, DEFAULT_BPM, DEFAULT_SAMPLE_RATE, Event, Feed, MIN_BPM,
    ProducerState, Rendering, Round, SILENCE_THRESHOLD, SILENCE_THRESHOLD_DB, Shared,
    SharedProducer, SignalProducer, Silence, produce, rendered, shared,
};
pub use queue::Queue;
pub use shape::EnvelopeShape;
pub use wavetable::{StandardWaveforms, Wavetable};
