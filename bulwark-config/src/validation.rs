// Settings validation

use crate::{Result, SettingsError};

/// Trait for validating settings after deserialization
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Range checks shared by the settings sections
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate that a number is greater than zero
    pub fn positive<T>(value: T, field: &str) -> Result<()>
    where
        T: PartialOrd + Default,
    {
        if value <= T::default() {
            return Err(SettingsError::ValidationError(format!(
                "{} must be greater than zero",
                field
            )));
        }
        Ok(())
    }

    /// Validate that a number is within `[min, max]`
    pub fn in_range<T>(value: T, min: T, max: T, field: &str) -> Result<()>
    where
        T: PartialOrd + std::fmt::Display,
    {
        if !(value >= min && value <= max) {
            return Err(SettingsError::ValidationError(format!(
                "{} must be between {} and {}, got {}",
                field, min, max, value
            )));
        }
        Ok(())
    }
}
