//! Leader parameters shared by every voice of one kind.
//!
//! Each voice owns followers of these leaders. While a leader has no
//! envelope and no per-channel controller, its followers render through it
//! and the signal is computed once per round for the whole pool.

use std::rc::Rc;

use vesta_core::biquad::{self, FilterType};
use vesta_core::oscillator::{DETUNE_MAX, FINE_DETUNE_MAX};
use vesta_core::{
    BiquadLeaders, ByteParam, CUSTOM_WAVEFORM_HARMONICS, FloatParam, OFF, ON, OscillatorLeaders,
    Shared, ToggleParam, Waveform, shared, toggle,
};
use vesta_effects::Shape;
use vesta_effects::wavefolder::{FOLD_DEFAULT, FOLD_MAX, FOLD_MIN};

/// Longest portamento in seconds.
pub const PORTAMENTO_LENGTH_MAX: f64 = 3.0;
/// Largest portamento depth in cents.
pub const PORTAMENTO_DEPTH_MAX: f64 = 2400.0;
/// Largest velocity sensitivity; above 1 soft notes get softer.
pub const VELOCITY_SENSITIVITY_MAX: f64 = 2.0;
/// Largest frequency modulation level in cents.
pub const FM_LEVEL_MAX: f64 = 2400.0;
/// Largest phase modulation level in periods.
pub const PM_LEVEL_MAX: f64 = 2.5;
/// Largest amplitude modulation level.
pub const AM_LEVEL_MAX: f64 = 1.0;

/// Modulator and carrier share every note.
pub const MODE_MIX_AND_MOD: u8 = 0;
/// Largest split mode; mode `m` sends notes below `m + 47` to the
/// modulator and the rest to the carrier.
pub const MODE_SPLIT_MAX: u8 = 13;

const SPLIT_NOTE_OFFSET: u8 = 47;

const CUSTOM_WAVEFORM_DEFAULTS: [f64; CUSTOM_WAVEFORM_HARMONICS] =
    [0.333, 0.333, 0.333, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];

/// Shape of the carrier distortion unless configured otherwise.
pub const CARRIER_DISTORTION_SHAPE: Shape = Shape::Tanh5;

/// First note routed to the carrier in split `mode`, or `None` when both
/// voices play every note.
pub fn split_note(mode: u8) -> Option<u8> {
    (mode != MODE_MIX_AND_MOD).then(|| mode.min(MODE_SPLIT_MAX) + SPLIT_NOTE_OFFSET)
}

/// Shape selector and level of a voice distortion.
#[derive(Debug, Clone)]
pub struct DistortionLeaders {
    /// [`Shape`] selector.
    pub shape: Shared<ByteParam>,
    /// Dry/distorted blend.
    pub level: Shared<FloatParam>,
}

/// Leaders of one voice kind, named `<prefix><suffix>`.
#[derive(Debug, Clone)]
pub struct VoiceParams {
    prefix: String,
    /// Oscillator waveform.
    pub waveform: Shared<ByteParam>,
    /// Oscillator amplitude.
    pub amplitude: Shared<FloatParam>,
    /// How much note velocity affects loudness.
    pub velocity_sensitivity: Shared<FloatParam>,
    /// Wavefolder amount.
    pub folding: Shared<FloatParam>,
    /// Glide time in seconds.
    pub portamento_length: Shared<FloatParam>,
    /// Glide start relative to the note in cents; near zero glides from the
    /// previous note.
    pub portamento_depth: Shared<FloatParam>,
    /// Coarse detune in cents.
    pub detune: Shared<FloatParam>,
    /// Fine detune in cents.
    pub fine_detune: Shared<FloatParam>,
    /// Spread of notes across the stereo field by pitch.
    pub width: Shared<FloatParam>,
    /// Stereo position.
    pub panning: Shared<FloatParam>,
    /// Output level.
    pub volume: Shared<FloatParam>,
    /// Level of the sine one octave below.
    pub subharmonic_amplitude: Shared<FloatParam>,
    /// Harmonic levels of the custom waveform.
    pub harmonics: [Shared<FloatParam>; CUSTOM_WAVEFORM_HARMONICS],
    /// Filter before the wavefolder; a high-pass by default.
    pub filter_1: BiquadLeaders,
    /// Filter after the shapers; a low-pass by default.
    pub filter_2: BiquadLeaders,
    /// Per-note random detune and filter offset level.
    pub inaccuracy: Shared<FloatParam>,
    /// Slow random pitch drift level.
    pub instability: Shared<FloatParam>,
    /// Distortion after the wavefolder, carriers only.
    pub distortion: Option<DistortionLeaders>,
}

impl VoiceParams {
    /// Leaders of modulator voices.
    pub fn modulator(prefix: &str) -> Self {
        Self::new(prefix, None)
    }

    /// Leaders of carrier voices, with a distortion stage.
    pub fn carrier(prefix: &str) -> Self {
        let distortion = DistortionLeaders {
            shape: shared(Shape::param(format!("{prefix}DTYP"), CARRIER_DISTORTION_SHAPE)),
            level: shared(FloatParam::new(format!("{prefix}DG"), 0.0, 1.0, 0.0)),
        };

        Self::new(prefix, Some(distortion))
    }

    fn new(prefix: &str, distortion: Option<DistortionLeaders>) -> Self {
        let float = |suffix: &str, min: f64, max: f64, default: f64| {
            shared(FloatParam::new(format!("{prefix}{suffix}"), min, max, default))
        };

        Self {
            prefix: prefix.to_owned(),
            waveform: shared(Waveform::param(format!("{prefix}WAV"), Waveform::Sine)),
            amplitude: float("AMP", 0.0, 1.0, 0.75),
            velocity_sensitivity: float("VS", 0.0, VELOCITY_SENSITIVITY_MAX, 1.0),
            folding: float("FLD", FOLD_MIN, FOLD_MAX, FOLD_DEFAULT),
            portamento_length: float("PRT", 0.0, PORTAMENTO_LENGTH_MAX, 0.0),
            portamento_depth: float("PRD", -PORTAMENTO_DEPTH_MAX, PORTAMENTO_DEPTH_MAX, 0.0),
            detune: shared(
                FloatParam::new(format!("{prefix}DTN"), -DETUNE_MAX, DETUNE_MAX, 0.0)
                    .with_round_to(100.0),
            ),
            fine_detune: float("FIN", -FINE_DETUNE_MAX, FINE_DETUNE_MAX, 0.0),
            width: float("WID", -1.0, 1.0, 0.2),
            panning: float("PAN", -1.0, 1.0, 0.0),
            volume: float("VOL", 0.0, 1.0, 0.33),
            subharmonic_amplitude: float("SUB", 0.0, 1.0, 0.0),
            harmonics: core::array::from_fn(|i| {
                shared(FloatParam::block(
                    format!("{prefix}C{}", i + 1),
                    -1.0,
                    1.0,
                    CUSTOM_WAVEFORM_DEFAULTS[i],
                ))
            }),
            filter_1: high_pass_leaders(&format!("{prefix}F1")),
            filter_2: BiquadLeaders::new(&format!("{prefix}F2"), FilterType::LowPass),
            inaccuracy: shared(FloatParam::block(format!("{prefix}OIA"), 0.0, 1.0, 0.0)),
            instability: shared(FloatParam::block(format!("{prefix}OIS"), 0.0, 1.0, 0.0)),
            distortion,
        }
    }

    /// Name prefix of every leader.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Oscillator leaders of a voice, with the modulation levels of a
    /// carrier when `modulation` is given.
    pub fn oscillator_leaders(&self, modulation: Option<&ModulationLevels>) -> OscillatorLeaders {
        let mut leaders = OscillatorLeaders::new(Rc::clone(&self.waveform));

        leaders.amplitude = Some(Rc::clone(&self.amplitude));
        leaders.detune = Some(Rc::clone(&self.detune));
        leaders.fine_detune = Some(Rc::clone(&self.fine_detune));
        leaders.subharmonic_amplitude = Some(Rc::clone(&self.subharmonic_amplitude));
        leaders.harmonics = Some(self.harmonics.clone());

        if let Some(modulation) = modulation {
            leaders.amplitude_modulation_level = Some(Rc::clone(&modulation.amplitude));
            leaders.frequency_modulation_level = Some(Rc::clone(&modulation.frequency));
            leaders.phase_modulation_level = Some(Rc::clone(&modulation.phase));
        }

        leaders
    }

    /// Every float leader, for lookup by name and per-round rendering.
    pub fn float_params(&self) -> Vec<Shared<FloatParam>> {
        let mut params = vec![
            Rc::clone(&self.amplitude),
            Rc::clone(&self.velocity_sensitivity),
            Rc::clone(&self.folding),
            Rc::clone(&self.portamento_length),
            Rc::clone(&self.portamento_depth),
            Rc::clone(&self.detune),
            Rc::clone(&self.fine_detune),
            Rc::clone(&self.width),
            Rc::clone(&self.panning),
            Rc::clone(&self.volume),
            Rc::clone(&self.subharmonic_amplitude),
        ];

        params.extend(self.harmonics.iter().map(Rc::clone));

        for filter in [&self.filter_1, &self.filter_2] {
            params.push(Rc::clone(&filter.frequency));
            params.push(Rc::clone(&filter.q));
            params.push(Rc::clone(&filter.gain));
        }

        params.push(Rc::clone(&self.inaccuracy));
        params.push(Rc::clone(&self.instability));

        if let Some(distortion) = &self.distortion {
            params.push(Rc::clone(&distortion.level));
        }

        params
    }

    /// Every selector leader.
    pub fn byte_params(&self) -> Vec<Shared<ByteParam>> {
        let mut params = vec![
            Rc::clone(&self.waveform),
            Rc::clone(&self.filter_1.filter_type),
            Rc::clone(&self.filter_2.filter_type),
        ];

        if let Some(distortion) = &self.distortion {
            params.push(Rc::clone(&distortion.shape));
        }

        params
    }
}

fn high_pass_leaders(prefix: &str) -> BiquadLeaders {
    let mut leaders = BiquadLeaders::new(prefix, FilterType::HighPass);

    leaders.frequency = shared(FloatParam::new(
        format!("{prefix}FRQ"),
        biquad::FREQUENCY_MIN,
        biquad::FREQUENCY_MAX,
        biquad::FREQUENCY_MIN,
    ));
    leaders
}

/// How strongly the modulator drives the carrier oscillator.
#[derive(Debug, Clone)]
pub struct ModulationLevels {
    /// Amplitude modulation level.
    pub amplitude: Shared<FloatParam>,
    /// Frequency modulation level in cents.
    pub frequency: Shared<FloatParam>,
    /// Phase modulation level in periods.
    pub phase: Shared<FloatParam>,
}

impl ModulationLevels {
    fn new() -> Self {
        Self {
            amplitude: shared(FloatParam::new("AM", 0.0, AM_LEVEL_MAX, 0.0)),
            frequency: shared(FloatParam::new("FM", 0.0, FM_LEVEL_MAX, 0.0)),
            phase: shared(FloatParam::new("PM", 0.0, PM_LEVEL_MAX, 0.0)),
        }
    }
}

/// Every leader of the synth.
#[derive(Debug, Clone)]
pub struct SynthParams {
    /// Mix-and-modulate or keyboard split selector.
    pub mode: Shared<ByteParam>,
    /// Level of the modulator voices in the mix.
    pub modulator_add_volume: Shared<FloatParam>,
    /// Levels of carrier modulation.
    pub modulation: ModulationLevels,
    /// Polyphonic when on; monophonic legato otherwise.
    pub polyphonic: Shared<ToggleParam>,
    /// Read controllers per note channel when on.
    pub mpe: Shared<ToggleParam>,
    /// Leaders of the modulator voices.
    pub modulator: VoiceParams,
    /// Leaders of the carrier voices.
    pub carrier: VoiceParams,
}

impl SynthParams {
    /// The default patch: mixed voices, no modulation, polyphonic.
    pub fn new() -> Self {
        Self {
            mode: shared(ByteParam::new("MODE", MODE_MIX_AND_MOD, MODE_SPLIT_MAX, MODE_MIX_AND_MOD)),
            modulator_add_volume: shared(FloatParam::new("MIX", 0.0, 1.0, 1.0)),
            modulation: ModulationLevels::new(),
            polyphonic: shared(toggle("POLY", ON)),
            mpe: shared(toggle("MPE", OFF)),
            modulator: VoiceParams::modulator("M"),
            carrier: VoiceParams::carrier("C"),
        }
    }

    /// Every float leader of the synth and both voice kinds.
    pub fn float_params(&self) -> Vec<Shared<FloatParam>> {
        let mut params = vec![
            Rc::clone(&self.modulator_add_volume),
            Rc::clone(&self.modulation.amplitude),
            Rc::clone(&self.modulation.frequency),
            Rc::clone(&self.modulation.phase),
        ];

        params.extend(self.modulator.float_params());
        params.extend(self.carrier.float_params());
        params
    }

    /// Every selector and toggle leader.
    pub fn byte_params(&self) -> Vec<Shared<ByteParam>> {
        let mut params = vec![
            Rc::clone(&self.mode),
            Rc::clone(&self.polyphonic),
            Rc::clone(&self.mpe),
        ];

        params.extend(self.modulator.byte_params());
        params.extend(self.carrier.byte_params());
        params
    }
}

impl Default for SynthParams {
    fn default() -> Self {
        Self::new()
    }
}
