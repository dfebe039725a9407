//! Engine configuration file format and operations.

use serde::{Deserialize, Serialize};
use std::path::Path;

use vesta_core::{DEFAULT_BLOCK_SIZE, DEFAULT_BPM, DEFAULT_SAMPLE_RATE};

use crate::effects::{ChorusSettings, EchoSettings, ReverbSettings};
use crate::error::ConfigError;
use crate::validation::{self, MAX_POLYPHONY, ValidationResult};

/// Which sounding voice gives way when every voice is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StealPolicy {
    /// The voice that started first.
    #[default]
    Oldest,
    /// The released voice with the lowest volume envelope, falling back to
    /// the oldest voice while every note is held.
    QuietestReleased,
    /// The voice playing the lowest note.
    Lowest,
    /// The voice playing the highest note.
    Highest,
}

/// Host-side settings of the synthesizer engine.
///
/// Every field has a default, so a file only needs to list what it changes:
///
/// ```toml
/// sample_rate = 48000.0
/// block_size = 128
/// polyphony = 16
/// steal_policy = "quietest_released"
///
/// [echo]
/// wet = 0.3
/// tempo_sync = true
/// delay_time = 0.75
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Largest number of samples rendered per round.
    pub block_size: usize,
    /// Tempo for tempo-synced LFOs and delays.
    pub bpm: f64,
    /// Number of voices.
    pub polyphony: usize,
    /// Voice stealing policy.
    pub steal_policy: StealPolicy,
    /// Chorus stage of the effects bus.
    pub chorus: ChorusSettings,
    /// Echo stage of the effects bus.
    pub echo: EchoSettings,
    /// Reverb stage of the effects bus.
    pub reverb: ReverbSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            bpm: DEFAULT_BPM,
            polyphony: MAX_POLYPHONY,
            steal_policy: StealPolicy::default(),
            chorus: ChorusSettings::default(),
            echo: EchoSettings::default(),
            reverb: ReverbSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a configuration.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Self::from_toml_str(&content)
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
    }

    /// Convert the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> ValidationResult<()> {
        validation::validate_engine(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::SideChainSettings;
    use crate::validation::ValidationError;

    #[test]
    fn empty_document_gives_the_defaults() {
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn defaults_match_the_engine_constants() {
        let config = EngineConfig::default();

        assert_eq!(config.sample_rate, 44100.0);
        assert_eq!(config.block_size, 256);
        assert_eq!(config.bpm, 60.0);
        assert_eq!(config.polyphony, 64);
        assert_eq!(config.steal_policy, StealPolicy::Oldest);
        assert!(config.chorus.enabled);
        assert!(config.echo.enabled);
        assert!(config.reverb.enabled);
        assert_eq!(config.reverb.side_chain.ratio, 1.0);
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            block_size = 128
            steal_policy = "quietest_released"

            [chorus]
            wet = 0.4
            tuning = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.block_size, 128);
        assert_eq!(config.steal_policy, StealPolicy::QuietestReleased);
        assert_eq!(config.chorus.wet, 0.4);
        assert_eq!(config.chorus.tuning, 3);
        assert_eq!(config.chorus.depth, ChorusSettings::default().depth);
        assert_eq!(config.echo, EchoSettings::default());
        assert_eq!(config.reverb, ReverbSettings::default());
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn nested_side_chain_table_is_read() {
        let config = EngineConfig::from_toml_str(
            r#"
            [reverb]
            wet = 0.3

            [reverb.side_chain]
            threshold = -24.0
            ratio = 4.0
            "#,
        )
        .unwrap();

        assert_eq!(config.reverb.wet, 0.3);
        assert_eq!(config.reverb.side_chain.threshold, -24.0);
        assert_eq!(config.reverb.side_chain.ratio, 4.0);
        assert_eq!(config.reverb.side_chain.attack_time, 0.02);
        assert_eq!(config.echo.side_chain, SideChainSettings::default());
    }

    #[test]
    fn unknown_steal_policy_is_a_parse_error() {
        let err = EngineConfig::from_toml_str(r#"steal_policy = "random""#).unwrap_err();

        assert!(matches!(err, ConfigError::TomlParse(_)), "{err}");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = EngineConfig::from_toml_str("polyphony = 0").unwrap_err();

        assert!(matches!(err, ConfigError::Validation(ValidationError::Polyphony(0))), "{err}");
    }

    #[test]
    fn serialized_form_reads_back() {
        let config = EngineConfig {
            sample_rate: 96000.0,
            steal_policy: StealPolicy::Highest,
            ..EngineConfig::default()
        };
        let text = config.to_toml_string().unwrap();

        assert!(text.contains("steal_policy = \"highest\""), "{text}");
        assert!(text.contains("[echo]"), "{text}");
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
