//! Vesta Effects - waveshapers and time-based effects
//!
//! Every type here is a [`SignalProducer`](vesta_core::SignalProducer) built
//! from vesta-core nodes:
//!
//! - [`Distortion`] - 23 antialiased waveshapes blended with the dry signal
//! - [`Wavefolder`] - Antialiased triangle folder with a click-free onset
//! - [`Chorus`] - Seven modulated voices on one shared delay line
//! - [`Echo`] - Ping-pong feedback delay with damping and a soft clipper
//! - [`Reverb`] - Eight damped, panned combs over a high-passed input
//! - [`Effect`] - Dry/wet wrapper around a [`Processor`], optionally ducked
//!   by a [`SideChainCompressor`]
//! - [`Effects`] - The synthesizer bus: chorus, echo, then reverb
//!
//! The waveshaper tables are built on first use; call [`warm_up`] outside
//! the audio thread to build them up front.
//!
//! ## Example
//!
//! ```rust,ignore
//! use vesta_core::{SignalProducer, produce};
//! use vesta_effects::Effects;
//!
//! let mut bus = Effects::new("FX", voices);
//! bus.set_sample_rate(48000.0);
//! bus.set_block_size(256);
//! bus.chorus_mut().wet.set_value(0.5);
//!
//! let block = produce(&mut bus, 1, 256);
//! ```

pub mod chorus;
pub mod compressor;
pub mod distortion;
pub mod echo;
pub mod effect;
pub mod effects;
pub mod reverb;
pub mod wavefolder;

pub use chorus::{Chorus, TUNINGS, VoiceTuning};
pub use compressor::{PeakTracker, SideChainCompressor};
pub use distortion::{Distortion, Shape};
pub use echo::Echo;
pub use effect::{Effect, Processor};
pub use effects::{ChorusStage, EchoStage, Effects, ReverbStage};
pub use reverb::Reverb;
pub use wavefolder::Wavefolder;

/// Build every lookup table of this crate.
pub fn warm_up() {
    distortion::warm_up();
    wavefolder::warm_up();
}
