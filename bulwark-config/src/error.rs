// Error types for settings loading

use bulwark_cache::CacheError;
use bulwark_core::ConfigError;
use bulwark_core::logging::LoggingError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings key not found: {0}")]
    KeyNotFound(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid policy: {0}")]
    PolicyError(#[from] ConfigError),

    #[error("Invalid memoize options: {0}")]
    MemoizeError(#[from] CacheError),

    #[error("Invalid logging settings: {0}")]
    LoggingError(#[from] LoggingError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Environment variable error: {0}")]
    EnvError(#[from] std::env::VarError),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
