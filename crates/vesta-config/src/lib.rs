//! Engine configuration for the vesta synthesizer.
//!
//! Everything the host decides before audio starts lives in an
//! [`EngineConfig`]: sample rate, block size, tempo, polyphony, the voice
//! stealing policy and the settings of the effects bus. Configurations are
//! TOML documents; every field has a default, and every value is range
//! checked before it reaches the engine.
//!
//! # Example
//!
//! ```rust,no_run
//! use vesta_config::{EngineConfig, StealPolicy};
//!
//! let config = EngineConfig::load("engine.toml").unwrap();
//! assert!(config.polyphony <= vesta_config::MAX_POLYPHONY);
//!
//! let config = EngineConfig {
//!     steal_policy: StealPolicy::Lowest,
//!     ..EngineConfig::default()
//! };
//! config.save("engine.toml").unwrap();
//! ```

mod effects;
mod engine;
mod error;

/// Range checks for engine settings.
pub mod validation;

pub use effects::{ChorusSettings, EchoSettings, ReverbSettings, SideChainSettings};
pub use engine::{EngineConfig, StealPolicy};
pub use error::ConfigError;
pub use validation::{
    BLOCK_SIZE_MAX, MAX_POLYPHONY, SAMPLE_RATE_MAX, SAMPLE_RATE_MIN, ValidationError,
    ValidationResult,
};
