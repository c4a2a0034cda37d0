//! Bridge configuration types and defaults.
//!
//! This module defines the configuration options for the sandbox
//! bridge, including the script-visible namespace root and resource
//! bounds.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default namespace root the bindings are installed under
pub const DEFAULT_NAMESPACE: &str = "__sandboxBridge";

/// Default maximum in-flight deferred capability calls
pub const DEFAULT_MAX_PENDING_CALLS: usize = 256;

/// Configuration for the sandbox bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Namespace root object for installed bindings. Capabilities are
    /// never attached to the bare global namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Maximum in-flight deferred capability calls per bridge
    #[serde(default = "default_max_pending_calls")]
    pub max_pending_calls: usize,

    /// Enable debug mode (default: false)
    #[serde(default)]
    pub debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_pending_calls: DEFAULT_MAX_PENDING_CALLS,
            debug: false,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the namespace root
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the maximum in-flight deferred calls
    pub fn with_max_pending_calls(mut self, max: usize) -> Self {
        self.max_pending_calls = max;
        self
    }

    /// Enable debug mode
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "namespace".into(),
                reason: "must not be empty".into(),
            });
        }

        if self.namespace.contains('.') || self.namespace.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                field: "namespace".into(),
                reason: "must be a single identifier without dots or whitespace".into(),
            });
        }

        if self.max_pending_calls == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_pending_calls".into(),
                reason: "must be greater than 0".into(),
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

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_max_pending_calls() -> usize {
    DEFAULT_MAX_PENDING_CALLS
}
