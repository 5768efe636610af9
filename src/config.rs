//! Bridge configuration types and defaults.
//!
//! This module defines the configuration options for the bridge, including
//! how the error-masking mode is derived from the host environment name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default message substituted for masked errors
pub const DEFAULT_GENERIC_ERROR_MESSAGE: &str = "Internal Server Error";

/// Default outbound fetch timeout in milliseconds
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Default cap on live rewrite handler registrations
pub const DEFAULT_MAX_REWRITE_HANDLERS: usize = 1024;

/// Variables consulted, in order, for the environment name
pub const DEFAULT_ENVIRONMENT_KEYS: &[&str] = &["ENVIRONMENT", "APP_ENV", "NODE_ENV"];

/// Environment names that count as development
const DEVELOPMENT_NAMES: &[&str] = &["development", "dev", "test", "local"];

/// Environment names that count as production
const PRODUCTION_NAMES: &[&str] = &["production", "prod"];

/// How the masking mode is chosen from the environment name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MaskingPolicy {
    /// Mask unless the environment is declared as development (masks when unknown)
    #[default]
    MaskUnlessDevelopment,
    /// Mask only when the environment is declared as production
    MaskOnlyInProduction,
}

impl MaskingPolicy {
    /// Parse a policy from its configuration spelling
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mask_unless_development" | "maskunlessdevelopment" | "default" => {
                Some(Self::MaskUnlessDevelopment)
            }
            "mask_only_in_production" | "maskonlyinproduction" | "production_only" => {
                Some(Self::MaskOnlyInProduction)
            }
            _ => None,
        }
    }
}

/// Error masking mode applied to envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMasking {
    /// Original message and stack are exposed
    Development,
    /// Message replaced by a generic string, stack omitted
    Production,
}

impl ErrorMasking {
    /// Whether masking is active
    pub fn is_masked(&self) -> bool {
        matches!(self, ErrorMasking::Production)
    }
}

/// Configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Explicit environment name; overrides the variable lookup
    #[serde(default)]
    pub environment: Option<String>,

    /// Variables consulted, in order, for the environment name
    #[serde(default = "default_environment_keys")]
    pub environment_keys: Vec<String>,

    /// Masking policy (default: mask unless development)
    #[serde(default)]
    pub masking_policy: MaskingPolicy,

    /// Message substituted for masked errors
    #[serde(default = "default_generic_error_message")]
    pub generic_error_message: String,

    /// Outbound fetch timeout in milliseconds (0 = no limit)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    /// Maximum live rewrite handler registrations
    #[serde(default = "default_max_rewrite_handlers")]
    pub max_rewrite_handlers: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            environment: None,
            environment_keys: default_environment_keys(),
            masking_policy: MaskingPolicy::default(),
            generic_error_message: DEFAULT_GENERIC_ERROR_MESSAGE.to_string(),
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_rewrite_handlers: DEFAULT_MAX_REWRITE_HANDLERS,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from host variables.
    ///
    /// `BRIDGE_FETCH_TIMEOUT_MS` and `BRIDGE_MASKING_POLICY` override the defaults.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = vars.get("BRIDGE_FETCH_TIMEOUT_MS") {
            config.fetch_timeout_ms = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "BRIDGE_FETCH_TIMEOUT_MS".into(),
                reason: format!("'{}' is not a number of milliseconds", raw),
            })?;
        }

        if let Some(raw) = vars.get("BRIDGE_MASKING_POLICY") {
            config.masking_policy =
                MaskingPolicy::parse(raw).ok_or_else(|| ConfigError::InvalidValue {
                    field: "BRIDGE_MASKING_POLICY".into(),
                    reason: format!("unknown policy '{}'", raw),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the explicit environment name
    pub fn with_environment(mut self, name: impl Into<String>) -> Self {
        self.environment = Some(name.into());
        self
    }

    /// Set the masking policy
    pub fn with_masking_policy(mut self, policy: MaskingPolicy) -> Self {
        self.masking_policy = policy;
        self
    }

    /// Set the generic masked message
    pub fn with_generic_error_message(mut self, message: impl Into<String>) -> Self {
        self.generic_error_message = message.into();
        self
    }

    /// Set the outbound fetch timeout
    pub fn with_fetch_timeout(mut self, timeout_ms: u64) -> Self {
        self.fetch_timeout_ms = timeout_ms;
        self
    }

    /// Set the rewrite handler cap
    pub fn with_max_rewrite_handlers(mut self, max: usize) -> Self {
        self.max_rewrite_handlers = max;
        self
    }

    /// Resolve the environment name: explicit setting first, then the variables
    pub fn environment_name(&self, vars: &HashMap<String, String>) -> Option<String> {
        if let Some(name) = self.environment.as_ref().filter(|n| !n.trim().is_empty()) {
            return Some(name.trim().to_string());
        }

        self.environment_keys
            .iter()
            .filter_map(|key| vars.get(key))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Decide the masking mode once for a guest-runtime instance
    pub fn resolve_masking(&self, vars: &HashMap<String, String>) -> ErrorMasking {
        let name = self
            .environment_name(vars)
            .map(|n| n.to_ascii_lowercase());

        let masked = match (self.masking_policy, name.as_deref()) {
            (MaskingPolicy::MaskUnlessDevelopment, Some(n)) => !DEVELOPMENT_NAMES.contains(&n),
            (MaskingPolicy::MaskUnlessDevelopment, None) => true,
            (MaskingPolicy::MaskOnlyInProduction, Some(n)) => PRODUCTION_NAMES.contains(&n),
            (MaskingPolicy::MaskOnlyInProduction, None) => false,
        };

        if masked {
            ErrorMasking::Production
        } else {
            ErrorMasking::Development
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generic_error_message.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "generic_error_message".into(),
                reason: "must not be empty".into(),
            });
        }

        if self.max_rewrite_handlers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_rewrite_handlers".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.environment_keys.is_empty() && self.environment.is_none() {
            return Err(ConfigError::MissingField {
                field: "environment_keys".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// Missing required field
    #[error("Missing required configuration field: {field}")]
    MissingField {
        /// The field name
        field: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_environment_keys() -> Vec<String> {
    DEFAULT_ENVIRONMENT_KEYS
        .iter()
        .map(|k| k.to_string())
        .collect()
}

fn default_generic_error_message() -> String {
    DEFAULT_GENERIC_ERROR_MESSAGE.to_string()
}

fn default_fetch_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT_MS
}

fn default_max_rewrite_handlers() -> usize {
    DEFAULT_MAX_REWRITE_HANDLERS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.masking_policy, MaskingPolicy::MaskUnlessDevelopment);
        assert_eq!(config.fetch_timeout_ms, DEFAULT_FETCH_TIMEOUT_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_masked_when_environment_unknown() {
        let config = BridgeConfig::default();
        assert_eq!(config.resolve_masking(&vars(&[])), ErrorMasking::Production);
    }

    #[test]
    fn test_development_unmasks() {
        let config = BridgeConfig::default();
        let env = vars(&[("ENVIRONMENT", "development")]);
        assert_eq!(config.resolve_masking(&env), ErrorMasking::Development);
    }

    #[test]
    fn test_lookup_order() {
        let config = BridgeConfig::default();
        let env = vars(&[("NODE_ENV", "development"), ("ENVIRONMENT", "staging")]);
        assert_eq!(config.environment_name(&env).as_deref(), Some("staging"));
        assert_eq!(config.resolve_masking(&env), ErrorMasking::Production);
    }

    #[test]
    fn test_mask_only_in_production_policy() {
        let config = BridgeConfig::new().with_masking_policy(MaskingPolicy::MaskOnlyInProduction);
        assert_eq!(config.resolve_masking(&vars(&[])), ErrorMasking::Development);
        assert_eq!(
            config.resolve_masking(&vars(&[("APP_ENV", "production")])),
            ErrorMasking::Production
        );
    }

    #[test]
    fn test_explicit_environment_wins() {
        let config = BridgeConfig::new().with_environment("dev");
        let env = vars(&[("ENVIRONMENT", "production")]);
        assert_eq!(config.resolve_masking(&env), ErrorMasking::Development);
    }

    #[test]
    fn test_from_vars_overrides() {
        let env = vars(&[
            ("BRIDGE_FETCH_TIMEOUT_MS", "250"),
            ("BRIDGE_MASKING_POLICY", "mask_only_in_production"),
        ]);
        let config = BridgeConfig::from_vars(&env).unwrap();
        assert_eq!(config.fetch_timeout_ms, 250);
        assert_eq!(config.masking_policy, MaskingPolicy::MaskOnlyInProduction);

        let bad = vars(&[("BRIDGE_FETCH_TIMEOUT_MS", "soon")]);
        assert!(BridgeConfig::from_vars(&bad).is_err());
    }

    #[test]
    fn test_config_validation() {
        let invalid = BridgeConfig::new().with_max_rewrite_handlers(0);
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("maskUnlessDevelopment"));
        let parsed: BridgeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.max_rewrite_handlers, DEFAULT_MAX_REWRITE_HANDLERS);
    }
}
