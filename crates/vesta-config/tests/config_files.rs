//! Integration tests for vesta-config.
//!
//! These tests read and write real files.

use std::path::Path;

use tempfile::TempDir;
use vesta_config::{ConfigError, EngineConfig, StealPolicy, ValidationError};

#[test]
fn saved_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.toml");

    let mut config = EngineConfig {
        sample_rate: 48000.0,
        block_size: 64,
        polyphony: 12,
        steal_policy: StealPolicy::Lowest,
        ..EngineConfig::default()
    };
    config.echo.tempo_sync = true;
    config.echo.delay_time = 0.75;
    config.chorus.tuning = 7;
    config.reverb.enabled = true;
    config.reverb.room_size = 3.0;
    config.reverb.side_chain.ratio = 4.0;

    config.save(&path).unwrap();

    assert_eq!(EngineConfig::load(&path).unwrap(), config);
}

#[test]
fn handwritten_file_is_loaded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.toml");

    std::fs::write(
        &path,
        r#"
        sample_rate = 96000.0
        bpm = 128.0

        [echo]
        wet = 0.25
        reversed = true

        [reverb.side_chain]
        ratio = 6.0
        "#,
    )
    .unwrap();

    let config = EngineConfig::load(&path).unwrap();

    assert_eq!(config.sample_rate, 96000.0);
    assert_eq!(config.bpm, 128.0);
    assert_eq!(config.echo.wet, 0.25);
    assert!(config.echo.reversed);
    assert_eq!(config.reverb.side_chain.ratio, 6.0);
    assert_eq!(config.reverb.side_chain.threshold, -18.0);
    assert_eq!(config.block_size, 256);
}

#[test]
fn missing_file_reports_its_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing.toml");

    let err = EngineConfig::load(&path).unwrap_err();

    match err {
        ConfigError::ReadFile { path: ref reported, .. } => assert_eq!(reported, &path),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "sample_rate = \"fast\"").unwrap();

    assert!(matches!(EngineConfig::load(&path), Err(ConfigError::TomlParse(_))));
}

#[test]
fn invalid_file_is_rejected_after_parsing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("invalid.toml");
    std::fs::write(&path, "block_size = 100000").unwrap();

    assert!(matches!(
        EngineConfig::load(&path),
        Err(ConfigError::Validation(ValidationError::BlockSize(100000)))
    ));
}

#[test]
fn saving_into_a_missing_directory_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("no").join("such").join("engine.toml");

    let err = EngineConfig::default().save(&path).unwrap_err();

    assert!(matches!(err, ConfigError::WriteFile { .. }), "{err}");
    assert!(!Path::new(&path).exists());
}
