//! Error types for the Recycle Bot core library.

use std::path::PathBuf;

/// Result alias for configuration and persistence operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to extract configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::invalid("batch_size must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: batch_size must be positive"
        );

        let err = ConfigError::FileNotFound {
            path: PathBuf::from("/tmp/missing.toml"),
        };
        assert!(err.to_string().contains("/tmp/missing.toml"));
    }
}
