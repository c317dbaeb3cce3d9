// Environment variable loading

use crate::loader::insert_path;
use crate::{Result, SettingsError};
use serde_json::{Map, Value};
use std::env;

/// Prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "BULWARK";

/// Environment variable loader
///
/// `BULWARK_POLICIES__DB__RETRY__MAX_ATTEMPTS=5` sets
/// `policies.db.retry.max_attempts` to `5`.
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Get the variable prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Load all prefixed environment variables into a settings tree
    pub fn load(&self) -> Value {
        self.collect(env::vars())
    }

    /// Build a settings tree from `vars`, keeping only prefixed names
    pub fn collect<I>(&self, vars: I) -> Value
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut root = Map::new();
        for (key, value) in vars {
            if let Some(path) = self.strip(&key) {
                insert_path(&mut root, &path.to_lowercase(), &value);
            }
        }
        Value::Object(root)
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        env::var(self.full_key(key)).map_err(SettingsError::EnvError)
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key.to_uppercase())
    }

    fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix('_')
            .filter(|rest| !rest.is_empty())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}
