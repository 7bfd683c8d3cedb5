use crate::core::{MappingError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime knobs of the persisters.
///
/// Every field has a default, so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Rows per insert statement.
    pub batch_size: usize,

    /// Identifiers per `IN` list of a select, larger id sets are split.
    pub in_operator_max_size: usize,

    /// Emit a debug event for every statement sent by a persister.
    pub log_statements: bool,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            in_operator_max_size: 1000,
            log_statements: false,
        }
    }
}

impl PersistenceSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Set rows per insert statement
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set identifiers per IN list
    pub fn in_operator_max_size(mut self, size: usize) -> Self {
        self.in_operator_max_size = size;
        self
    }

    /// Enable statement logging
    pub fn log_statements(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MappingError::SettingsError(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.in_operator_max_size == 0 {
            return Err(MappingError::SettingsError(
                "in_operator_max_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PersistenceSettings::default();
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.in_operator_max_size, 1000);
        assert!(!settings.log_statements);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = PersistenceSettings::from_json_str(r#"{ "batch_size": 10 }"#).unwrap();
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.in_operator_max_size, 1000);
    }

    #[test]
    fn test_builder_and_validation() {
        let settings = PersistenceSettings::new().batch_size(5).log_statements(true);
        assert_eq!(settings.batch_size, 5);
        assert!(settings.log_statements);
        assert!(PersistenceSettings::new().batch_size(0).validate().is_err());
        assert!(PersistenceSettings::from_json_str("{ not json").is_err());
    }
}
