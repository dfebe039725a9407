//! Range checks for engine settings.

use thiserror::Error;
use vesta_core::MIN_BPM;
use vesta_core::delay;
use vesta_effects::{chorus, echo, reverb};

use crate::effects::{ChorusSettings, EchoSettings, ReverbSettings, SideChainSettings};
use crate::engine::EngineConfig;

/// Lowest accepted sample rate in Hz.
pub const SAMPLE_RATE_MIN: f64 = 1.0;
/// Highest accepted sample rate in Hz.
pub const SAMPLE_RATE_MAX: f64 = 384_000.0;
/// Largest accepted block size.
pub const BLOCK_SIZE_MAX: usize = 8192;
/// Largest number of simultaneously sounding notes.
pub const MAX_POLYPHONY: usize = 64;

/// An engine setting outside of its allowed range.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Sample rate outside `[SAMPLE_RATE_MIN, SAMPLE_RATE_MAX]`.
    #[error("sample rate {0} Hz out of range [{min}, {max}]", min = SAMPLE_RATE_MIN, max = SAMPLE_RATE_MAX)]
    SampleRate(f64),

    /// Block size outside `[1, BLOCK_SIZE_MAX]`.
    #[error("block size {0} out of range [1, {max}]", max = BLOCK_SIZE_MAX)]
    BlockSize(usize),

    /// Polyphony outside `[1, MAX_POLYPHONY]`.
    #[error("polyphony {0} out of range [1, {max}]", max = MAX_POLYPHONY)]
    Polyphony(usize),

    /// Tempo below `MIN_BPM` or not finite.
    #[error("tempo {0} BPM is below {min} or not finite", min = MIN_BPM)]
    Bpm(f64),

    /// An effect setting outside of the range of its parameter.
    #[error("{effect} {param} {value} out of range [{min}, {max}]")]
    EffectParam {
        /// `"chorus"`, `"echo"` or `"reverb"`.
        effect: &'static str,
        /// Name of the setting.
        param: &'static str,
        /// The rejected value.
        value: f64,
        /// Lowest allowed value.
        min: f64,
        /// Highest allowed value.
        max: f64,
    },
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

fn check(effect: &'static str, param: &'static str, value: f64, min: f64, max: f64) -> ValidationResult<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::EffectParam {
            effect,
            param,
            value,
            min,
            max,
        })
    }
}

fn check_mix(effect: &'static str, dry: f64, wet: f64) -> ValidationResult<()> {
    check(effect, "dry", dry, 0.0, 1.0)?;
    check(effect, "wet", wet, 0.0, 1.0)
}

/// Check every field of an engine configuration, reporting the first
/// offending one.
pub fn validate_engine(config: &EngineConfig) -> ValidationResult<()> {
    if !(SAMPLE_RATE_MIN..=SAMPLE_RATE_MAX).contains(&config.sample_rate) {
        return Err(ValidationError::SampleRate(config.sample_rate));
    }

    if !(1..=BLOCK_SIZE_MAX).contains(&config.block_size) {
        return Err(ValidationError::BlockSize(config.block_size));
    }

    if !config.bpm.is_finite() || config.bpm < MIN_BPM {
        return Err(ValidationError::Bpm(config.bpm));
    }

    if !(1..=MAX_POLYPHONY).contains(&config.polyphony) {
        return Err(ValidationError::Polyphony(config.polyphony));
    }

    validate_chorus(&config.chorus)?;
    validate_echo(&config.echo)?;
    validate_reverb(&config.reverb)
}

/// Check the chorus settings against the ranges of the chorus parameters.
pub fn validate_chorus(settings: &ChorusSettings) -> ValidationResult<()> {
    const EFFECT: &str = "chorus";

    check_mix(EFFECT, settings.dry, settings.wet)?;
    check(EFFECT, "delay_time", settings.delay_time, 0.0, chorus::DELAY_TIME_MAX)?;
    check(EFFECT, "frequency", settings.frequency, 0.001, 20.0)?;
    check(EFFECT, "depth", settings.depth, 0.0, 0.5)?;
    check(EFFECT, "feedback", settings.feedback, 0.0, chorus::FEEDBACK_MAX)?;
    check(EFFECT, "width", settings.width, -1.0, 1.0)?;
    check(
        EFFECT,
        "tuning",
        f64::from(settings.tuning),
        0.0,
        f64::from(chorus::TUNING_MAX),
    )
}

/// Check the echo settings against the ranges of the echo parameters.
pub fn validate_echo(settings: &EchoSettings) -> ValidationResult<()> {
    const EFFECT: &str = "echo";

    check_mix(EFFECT, settings.dry, settings.wet)?;
    check(EFFECT, "delay_time", settings.delay_time, delay::TIME_MIN, delay::TIME_MAX)?;
    check(EFFECT, "feedback", settings.feedback, 0.0, echo::FEEDBACK_MAX)?;
    check(
        EFFECT,
        "damping_frequency",
        settings.damping_frequency,
        vesta_core::biquad::FREQUENCY_MIN,
        vesta_core::biquad::FREQUENCY_MAX,
    )?;
    check(EFFECT, "width", settings.width, -1.0, 1.0)?;
    check(EFFECT, "distortion_level", settings.distortion_level, 0.0, 1.0)?;
    validate_side_chain(EFFECT, &settings.side_chain)
}

/// Check the reverb settings against the ranges of the reverb parameters.
pub fn validate_reverb(settings: &ReverbSettings) -> ValidationResult<()> {
    const EFFECT: &str = "reverb";

    check_mix(EFFECT, settings.dry, settings.wet)?;
    check(EFFECT, "room_size", settings.room_size, 0.0, reverb::ROOM_SIZE_MAX)?;
    check(EFFECT, "room_reflectivity", settings.room_reflectivity, 0.0, echo::FEEDBACK_MAX)?;
    check(
        EFFECT,
        "damping_frequency",
        settings.damping_frequency,
        vesta_core::biquad::FREQUENCY_MIN,
        vesta_core::biquad::FREQUENCY_MAX,
    )?;
    check(EFFECT, "damping_gain", settings.damping_gain, -36.0, -0.01)?;
    check(EFFECT, "width", settings.width, -1.0, 1.0)?;
    check(
        EFFECT,
        "high_pass_frequency",
        settings.high_pass_frequency,
        vesta_core::biquad::FREQUENCY_MIN,
        vesta_core::biquad::FREQUENCY_MAX,
    )?;
    check(EFFECT, "distortion_level", settings.distortion_level, 0.0, 1.0)?;
    validate_side_chain(EFFECT, &settings.side_chain)
}

/// Check side-chain compression settings of `effect`.
pub fn validate_side_chain(effect: &'static str, settings: &SideChainSettings) -> ValidationResult<()> {
    check(effect, "side_chain.threshold", settings.threshold, -120.0, 0.0)?;
    check(effect, "side_chain.attack_time", settings.attack_time, 0.001, 3.0)?;
    check(effect, "side_chain.release_time", settings.release_time, 0.001, 3.0)?;
    check(effect, "side_chain.ratio", settings.ratio, 1.0, 120.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_engine(&EngineConfig::default()), Ok(()));
    }

    #[test]
    fn sample_rate_bounds() {
        let mut config = EngineConfig {
            sample_rate: SAMPLE_RATE_MAX,
            ..EngineConfig::default()
        };
        assert!(validate_engine(&config).is_ok());

        config.sample_rate = 0.5;
        assert_eq!(validate_engine(&config), Err(ValidationError::SampleRate(0.5)));

        config.sample_rate = f64::NAN;
        assert!(matches!(validate_engine(&config), Err(ValidationError::SampleRate(_))));
    }

    #[test]
    fn block_size_and_polyphony_bounds() {
        let config = EngineConfig {
            block_size: 0,
            ..EngineConfig::default()
        };
        assert_eq!(validate_engine(&config), Err(ValidationError::BlockSize(0)));

        let config = EngineConfig {
            block_size: BLOCK_SIZE_MAX + 1,
            ..EngineConfig::default()
        };
        assert_eq!(validate_engine(&config), Err(ValidationError::BlockSize(8193)));

        let config = EngineConfig {
            polyphony: MAX_POLYPHONY + 1,
            ..EngineConfig::default()
        };
        assert_eq!(validate_engine(&config), Err(ValidationError::Polyphony(65)));
    }

    #[test]
    fn tempo_must_be_finite_and_positive() {
        for bpm in [0.0, -120.0, f64::INFINITY] {
            let config = EngineConfig {
                bpm,
                ..EngineConfig::default()
            };

            assert!(matches!(validate_engine(&config), Err(ValidationError::Bpm(_))), "{bpm}");
        }
    }

    #[test]
    fn effect_settings_are_checked() {
        let mut config = EngineConfig::default();
        config.chorus.tuning = chorus::TUNING_MAX + 1;

        assert!(matches!(
            validate_engine(&config),
            Err(ValidationError::EffectParam {
                effect: "chorus",
                param: "tuning",
                ..
            })
        ));

        let mut config = EngineConfig::default();
        config.echo.feedback = 1.0;

        let err = validate_engine(&config).unwrap_err();
        assert_eq!(err.to_string(), "echo feedback 1 out of range [0, 0.999]");
    }

    #[test]
    fn reverb_settings_are_checked() {
        let mut config = EngineConfig::default();
        config.reverb.room_size = reverb::ROOM_SIZE_MAX + 1.0;

        assert!(matches!(
            validate_engine(&config),
            Err(ValidationError::EffectParam {
                effect: "reverb",
                param: "room_size",
                ..
            })
        ));

        let mut config = EngineConfig::default();
        config.reverb.side_chain.ratio = 0.5;

        let err = validate_engine(&config).unwrap_err();
        assert_eq!(err.to_string(), "reverb side_chain.ratio 0.5 out of range [1, 120]");
    }

    #[test]
    fn echo_side_chain_is_checked() {
        let mut config = EngineConfig::default();
        config.echo.side_chain.attack_time = 0.0;

        assert!(matches!(
            validate_engine(&config),
            Err(ValidationError::EffectParam {
                effect: "echo",
                param: "side_chain.attack_time",
                ..
            })
        ));
    }
}
