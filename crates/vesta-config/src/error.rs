//! Error types for configuration operations.

use std::path::PathBuf;
use thiserror::Error;

use crate::validation::ValidationError;

/// Errors that can occur while loading, saving or checking a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read engine config '{path}': {source}")]
    ReadFile {
        /// Path of the file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file could not be written.
    #[error("cannot write engine config '{path}': {source}")]
    WriteFile {
        /// Path of the file that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid TOML engine config.
    #[error("malformed engine config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// The config could not be written as TOML.
    #[error("cannot encode engine config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// A field is out of its allowed range.
    #[error("invalid engine config: {0}")]
    Validation(#[from] ValidationError),
}

impl ConfigError {
    /// Read failure for `path`.
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::ReadFile {
            path: path.into(),
            source,
        }
    }

    /// Write failure for `path`.
    pub fn write_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::WriteFile {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn mock_io_err() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::NotFound, "mock")
    }

    #[test]
    fn read_file_factory_produces_correct_variant() {
        let err = ConfigError::read_file("/some/engine.toml", mock_io_err());
        assert!(
            matches!(err, ConfigError::ReadFile { ref path, .. } if path == std::path::Path::new("/some/engine.toml"))
        );
    }

    #[test]
    fn read_file_display() {
        let msg = ConfigError::read_file("/a/b.toml", mock_io_err()).to_string();
        assert!(msg.contains("cannot read engine config"), "got: {msg}");
        assert!(msg.contains("/a/b.toml"), "got: {msg}");
    }

    #[test]
    fn write_file_display() {
        let msg = ConfigError::write_file("/a/b.toml", mock_io_err()).to_string();
        assert!(msg.contains("cannot write engine config"), "got: {msg}");
    }

    #[test]
    fn io_variants_expose_their_source() {
        assert!(ConfigError::read_file("/x", mock_io_err()).source().is_some());
        assert!(ConfigError::write_file("/x", mock_io_err()).source().is_some());
    }

    #[test]
    fn validation_wraps_the_field_error() {
        let err = ConfigError::from(ValidationError::BlockSize(0));
        let msg = err.to_string();

        assert!(msg.starts_with("invalid engine config: "), "got: {msg}");
        assert!(msg.contains("block size 0"), "got: {msg}");
        assert!(err.source().is_some());
    }
}
