//! Settings of the effects bus.

use serde::{Deserialize, Serialize};

/// Chorus stage settings.
///
/// ```toml
/// [chorus]
/// wet = 0.4
/// depth = 0.2
/// tuning = 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusSettings {
    /// A disabled stage passes its input through regardless of the levels
    /// below.
    pub enabled: bool,
    /// Level of the unprocessed signal, `0..=1`.
    pub dry: f64,
    /// Level of the chorus output, `0..=1`.
    pub wet: f64,
    /// Center delay time in seconds.
    pub delay_time: f64,
    /// LFO frequency in Hz.
    pub frequency: f64,
    /// Delay time modulation depth, `0..=0.5`.
    pub depth: f64,
    /// Feedback amount.
    pub feedback: f64,
    /// Stereo width, `-1..=1`.
    pub width: f64,
    /// Index of the voice tuning table.
    pub tuning: u8,
}

impl Default for ChorusSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dry: 1.0,
            wet: 0.0,
            delay_time: 0.025,
            frequency: 0.15,
            depth: 0.075,
            feedback: 0.0,
            width: 0.6,
            tuning: 0,
        }
    }
}

/// Echo stage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoSettings {
    /// A disabled stage passes its input through regardless of the levels
    /// below.
    pub enabled: bool,
    /// Level of the unprocessed signal, `0..=1`.
    pub dry: f64,
    /// Level of the echo output, `0..=1`.
    pub wet: f64,
    /// Delay time in seconds, or in beats with `tempo_sync`.
    pub delay_time: f64,
    /// Feedback amount.
    pub feedback: f64,
    /// Corner frequency of the high-shelf damping in Hz.
    pub damping_frequency: f64,
    /// Stereo width, `-1..=1`.
    pub width: f64,
    /// Soft clipping on the feedback path, `0..=1`.
    pub distortion_level: f64,
    /// Measure the delay time in beats.
    pub tempo_sync: bool,
    /// Play both delay lines backwards.
    pub reversed: bool,
    /// Ducking of the repeats by the echo input.
    pub side_chain: SideChainSettings,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dry: 1.0,
            wet: 0.0,
            delay_time: 0.5,
            feedback: 0.75,
            damping_frequency: 24000.0,
            width: 0.0,
            distortion_level: 0.0,
            tempo_sync: false,
            reversed: false,
            side_chain: SideChainSettings::default(),
        }
    }
}

/// Reverb stage settings.
///
/// ```toml
/// [reverb]
/// wet = 0.3
/// room_size = 1.5
///
/// [reverb.side_chain]
/// threshold = -24.0
/// ratio = 4.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbSettings {
    /// A disabled stage passes its input through regardless of the levels
    /// below.
    pub enabled: bool,
    /// Level of the unprocessed signal, `0..=1`.
    pub dry: f64,
    /// Level of the reverb output, `0..=1`.
    pub wet: f64,
    /// Multiplier of the comb lengths.
    pub room_size: f64,
    /// Comb feedback.
    pub room_reflectivity: f64,
    /// Corner frequency of the high-shelf damping in Hz.
    pub damping_frequency: f64,
    /// Gain of the damping in dB.
    pub damping_gain: f64,
    /// Stereo width, `-1..=1`.
    pub width: f64,
    /// Cutoff of the input high-pass filter in Hz.
    pub high_pass_frequency: f64,
    /// Soft clipping on the feedback paths, `0..=1`.
    pub distortion_level: f64,
    /// Ducking of the tail by the reverb input.
    pub side_chain: SideChainSettings,
}

impl Default for ReverbSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dry: 1.0,
            wet: 0.0,
            room_size: 1.0,
            room_reflectivity: 0.75,
            damping_frequency: 24000.0,
            damping_gain: -6.0,
            width: 0.0,
            high_pass_frequency: 20.0,
            distortion_level: 0.0,
            side_chain: SideChainSettings::default(),
        }
    }
}

/// Side-chain compression of a stage by its own input. A ratio of 1 turns
/// it off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideChainSettings {
    /// Input peak above which the stage is ducked, in dB.
    pub threshold: f64,
    /// Seconds to reach the ducked level.
    pub attack_time: f64,
    /// Seconds to return to full level.
    pub release_time: f64,
    /// Compression ratio, `1..=120`.
    pub ratio: f64,
}

impl Default for SideChainSettings {
    fn default() -> Self {
        Self {
            threshold: -18.0,
            attack_time: 0.02,
            release_time: 0.2,
            ratio: 1.0,
        }
    }
}
