use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::sql::RenderOptions;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    #[error("Parse error for {field}: {value} - {source}")]
    Parse {
        field: String,
        value: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Builder configuration with validation
#[derive(Clone, Debug, PartialEq, Validate, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Prefix of generated table aliases (`t1`, `t2`, ...)
    #[validate(custom(function = "validate_identifier_prefix"))]
    pub table_alias_prefix: String,

    /// Aliases containing this marker are compiler-generated and never
    /// applied to a FROM table
    #[validate(length(min = 1, message = "Synthetic alias marker cannot be empty"))]
    pub synthetic_alias_marker: String,

    /// Prefix of generated names for unaliased columns (`c1`, `c2`, ...)
    #[validate(custom(function = "validate_identifier_prefix"))]
    pub column_alias_prefix: String,

    /// Maximum nesting of resolution calls before compilation is aborted
    #[validate(range(
        min = 1,
        max = 4096,
        message = "Max resolution depth must be between 1 and 4096"
    ))]
    pub max_resolution_depth: u32,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            table_alias_prefix: "t".to_string(),
            synthetic_alias_marker: "<".to_string(),
            column_alias_prefix: "c".to_string(),
            max_resolution_depth: 256,
        }
    }
}

impl BuilderConfig {
    /// Create configuration from environment variables with validation
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            table_alias_prefix: parse_env_var("SHAPESQL_TABLE_ALIAS_PREFIX", "t")?,
            synthetic_alias_marker: parse_env_var("SHAPESQL_SYNTHETIC_ALIAS_MARKER", "<")?,
            column_alias_prefix: parse_env_var("SHAPESQL_COLUMN_ALIAS_PREFIX", "c")?,
            max_resolution_depth: parse_env_var("SHAPESQL_MAX_RESOLUTION_DEPTH", "256")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Create configuration from YAML file
    pub fn from_yaml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            field: "yaml_file".to_string(),
            value: "file read failed".to_string(),
            source: Box::new(e),
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            field: "yaml_content".to_string(),
            value: content,
            source: Box::new(e),
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            table_alias_prefix: self.table_alias_prefix.clone(),
            column_alias_prefix: self.column_alias_prefix.clone(),
        }
    }

    /// True for aliases the compiler generated itself.
    pub fn is_synthetic_alias(&self, alias: &str) -> bool {
        alias.contains(self.synthetic_alias_marker.as_str())
    }
}

fn validate_identifier_prefix(prefix: &str) -> Result<(), ValidationError> {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return Err(ValidationError::new("identifier_prefix")),
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ValidationError::new("identifier_prefix"))
    }
}

/// Parse an environment variable with a default value
fn parse_env_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    value.parse().map_err(|e| ConfigError::Parse {
        field: key.to_string(),
        value,
        source: Box::new(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BuilderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.table_alias_prefix, "t");
        assert_eq!(config.max_resolution_depth, 256);
        assert!(config.is_synthetic_alias("<>h__TransparentIdentifier0"));
        assert!(!config.is_synthetic_alias("c"));
    }

    #[test]
    fn test_invalid_resolution_depth() {
        let config = BuilderConfig {
            max_resolution_depth: 0, // Invalid
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_alias_prefix() {
        let config = BuilderConfig {
            column_alias_prefix: "1c".to_string(), // Invalid
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        env::set_var("SHAPESQL_TABLE_ALIAS_PREFIX", "src");
        env::set_var("SHAPESQL_MAX_RESOLUTION_DEPTH", "64");
        let config = BuilderConfig::from_env();
        env::remove_var("SHAPESQL_TABLE_ALIAS_PREFIX");
        env::remove_var("SHAPESQL_MAX_RESOLUTION_DEPTH");

        let config = config.unwrap();
        assert_eq!(config.table_alias_prefix, "src");
        assert_eq!(config.max_resolution_depth, 64);
        assert_eq!(config.column_alias_prefix, "c");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unparsable_depth() {
        env::set_var("SHAPESQL_MAX_RESOLUTION_DEPTH", "deep");
        let result = BuilderConfig::from_env();
        env::remove_var("SHAPESQL_MAX_RESOLUTION_DEPTH");

        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_from_yaml_file_uses_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "column_alias_prefix: col").unwrap();
        writeln!(file, "max_resolution_depth: 32").unwrap();

        let config = BuilderConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.column_alias_prefix, "col");
        assert_eq!(config.max_resolution_depth, 32);
        assert_eq!(config.table_alias_prefix, "t");
    }
}
