// Configuration management for Bulwark policies and memoizers

pub mod env;
pub mod error;
pub mod loader;
pub mod settings;
pub mod validation;

pub use env::{DEFAULT_PREFIX, EnvLoader};
pub use error::{Result, SettingsError};
pub use loader::{ConfigLoader, FileFormat};
pub use settings::{
    BackoffSettings, BulkheadSettings, BulwarkSettings, CircuitBreakerSettings, LoggingSettings,
    MemoizeSettings, ResilienceSettings, RetryOn, RetrySettings, TimeoutSettings,
};
pub use validation::{ConfigValidator, Validate};

use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::info;

/// Builder collecting settings from files, a `.env` file and the environment.
///
/// Sources are layered in the order files, then environment; later sources
/// override earlier ones key by key.
///
/// ```no_run
/// use bulwark_config::SettingsLoader;
///
/// # fn main() -> bulwark_config::Result<()> {
/// let settings = SettingsLoader::new()
///     .add_file("bulwark.toml")
///     .load_dotenv(None)
///     .load_env()
///     .build()?;
///
/// let policy = settings.policy("payments")?;
/// # Ok(())
/// # }
/// ```
pub struct SettingsLoader {
    env: EnvLoader,
    load_env: bool,
    load_dotenv: bool,
    dotenv_path: Option<PathBuf>,
    config_files: Vec<(PathBuf, Option<FileFormat>)>,
}

impl SettingsLoader {
    /// Create a loader with the default `BULWARK` prefix and no sources.
    pub fn new() -> Self {
        Self {
            env: EnvLoader::default(),
            load_env: false,
            load_dotenv: false,
            dotenv_path: None,
            config_files: Vec::new(),
        }
    }

    /// Set environment variable prefix (default `BULWARK`)
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env = EnvLoader::new(prefix);
        self
    }

    /// Enable loading from environment variables
    pub fn load_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Enable loading a `.env` file into the environment; a missing default file is ignored
    pub fn load_dotenv(mut self, path: Option<PathBuf>) -> Self {
        self.load_dotenv = true;
        self.dotenv_path = path;
        self
    }

    /// Add a configuration file, format detected from its extension
    pub fn add_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_files.push((path.into(), None));
        self
    }

    /// Add a configuration file in an explicit format
    pub fn add_file_with_format(mut self, path: impl Into<PathBuf>, format: FileFormat) -> Self {
        self.config_files.push((path.into(), Some(format)));
        self
    }

    /// Load, merge, deserialize and validate.
    pub fn build(self) -> Result<BulwarkSettings> {
        let mut tree = Value::Object(Map::new());

        for (path, format) in &self.config_files {
            let file_loader = match format {
                Some(format) => ConfigLoader::new(*format),
                None => ConfigLoader::auto(path)?,
            };
            loader::merge(&mut tree, file_loader.load_file(path)?);
        }

        if self.load_dotenv {
            match &self.dotenv_path {
                Some(path) => {
                    dotenvy::from_path(path).map_err(|e| {
                        SettingsError::LoadError(format!("{}: {}", path.display(), e))
                    })?;
                }
                None => {
                    dotenvy::dotenv().ok();
                }
            }
        }

        if self.load_env {
            loader::merge(&mut tree, self.env.load());
        }

        Self::from_value(tree)
    }

    /// Deserialize and validate an already merged settings tree.
    pub fn from_value(tree: Value) -> Result<BulwarkSettings> {
        let settings: BulwarkSettings = serde_json::from_value(tree)
            .map_err(|e| SettingsError::DeserializationError(e.to_string()))?;
        settings.validate()?;

        info!(
            policies = settings.policies.len(),
            memoizers = settings.memoize.len(),
            "Settings loaded"
        );
        Ok(settings)
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}
