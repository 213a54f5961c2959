//! Failures loading and validating configuration
//!
//! Each variant carries the path or key at fault so a startup error points
//! at what to fix.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file is not valid YAML or does not match the expected shape
    #[error("malformed YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Credential file missing at the auth mount path
    #[error("auth credential file not found at {path}")]
    CredentialFileNotFound { path: PathBuf },

    /// An `!include` whose argument is not a file path
    #[error("bad !include '{target}': {reason}")]
    Include { target: String, reason: String },

    /// `!include` chain that leads back to a file already being loaded
    #[error("include cycle: {}", format_chain(.chain))]
    IncludeCycle { chain: Vec<PathBuf> },

    /// `!env_var NAME` for an unset variable with no fallback
    #[error("environment variable '{var}' is not set and has no fallback")]
    MissingEnvVar { var: String },

    /// A field whose value is out of range or malformed
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// Cross-field checks failed after loading
    #[error("configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

fn format_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
