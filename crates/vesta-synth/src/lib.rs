//! Vesta Synth - polyphonic two-operator synthesizer
//!
//! Voices, voice allocation and the top-level mixer of the vesta engine.
//!
//! # Core Components
//!
//! ## Voices
//!
//! Each voice is a mono chain panned to stereo:
//! `oscillator → filter 1 → (wavefolder | distortion) → filter 2 → volume`.
//!
//! - [`ModulatorVoice`] - Folding voice whose output modulates a carrier
//! - [`CarrierVoice`] - Distorting voice with AM, FM and PM inputs
//! - [`Voice`] - The generic voice behind both
//!
//! ## The Synth
//!
//! - [`Synth`] - Voice pool, note routing, controllers and the effects bus
//! - [`Bus`] - Sum of every voice pair
//! - [`SynthParams`] - Every leader parameter, addressed by name
//! - [`Controller`] - Sources that can drive a leader
//!
//! ## Tuning
//!
//! - [`FrequencyTable`] - Note to frequency source, swappable at run time
//! - [`EqualTemperament`] - Twelve-tone equal temperament
//!
//! # Example
//!
//! ```rust,ignore
//! use vesta_config::EngineConfig;
//! use vesta_core::{SignalProducer, produce};
//! use vesta_synth::Synth;
//!
//! let mut synth = Synth::with_config(&EngineConfig::default())?;
//! synth.note_on(0.0, 0, 60, 0.8);
//! synth.control_change(0.01, 0, 64, 1.0);
//!
//! let block = produce(&mut synth, 1, 256);
//! let left = block.channel(0);
//! ```

pub mod frequency;
pub mod params;
pub mod synth;
pub mod voice;

pub use frequency::{A4_FREQUENCY, A4_NOTE, EqualTemperament, FrequencyTable, NOTES, midi_to_freq};
pub use params::{
    CARRIER_DISTORTION_SHAPE, MODE_MIX_AND_MOD, MODE_SPLIT_MAX, ModulationLevels, SynthParams,
    VoiceParams, split_note,
};
pub use synth::{
    ALL_NOTES_OFF, ALL_SOUND_OFF, Bus, CONTROL_CHANGES, Controller, ENVELOPES, LFOS, MACROS,
    OUTPUT_LIMIT, SUSTAIN_PEDAL, Synth,
};
pub use voice::{
    CarrierVoice, FilterBuffers, ModulatorVoice, NoteContext, NoteEvent, Voice, VoiceState,
    calculate_note_panning, calculate_velocity,
};
