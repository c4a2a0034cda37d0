//! Error types for the sandbox bridge.
//!
//! Two error layers exist: [`ScriptError`] is the stable, serializable
//! shape thrown into script code at the binding boundary, and
//! [`BridgeError`] is the host-facing error returned from registration
//! and installation entry points. Per-call failures never cross the
//! boundary as anything other than a catchable [`ScriptError`].

use crate::value::ValueType;
use serde::{Deserialize, Serialize};

/// Stable error codes surfaced to script in the `code` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Script passed an argument that failed marshalling
    ArgumentTypeError,
    /// The active policy is missing a required permission tag
    PermissionDenied,
    /// Capability or context lookup missed
    NotFound,
    /// Binding installation failed (context left unbound)
    InstallError,
    /// Unexpected native failure inside a handler
    InternalError,
    /// A capability name was registered twice (startup-time, fatal)
    DuplicateCapability,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::ArgumentTypeError => write!(f, "ARGUMENT_TYPE_ERROR"),
            ErrorCode::PermissionDenied => write!(f, "PERMISSION_DENIED"),
            ErrorCode::NotFound => write!(f, "NOT_FOUND"),
            ErrorCode::InstallError => write!(f, "INSTALL_ERROR"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            ErrorCode::DuplicateCapability => write!(f, "DUPLICATE_CAPABILITY"),
        }
    }
}

/// Error thrown into script code from a capability binding.
///
/// Script sees this as a thrown error object with a stable `code`
/// field; it is always catchable and never tears down the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptError {
    /// Error code identifying the kind of failure
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Structured detail for script-side handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl ScriptError {
    /// Create a new script error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Create an argument marshalling error
    pub fn argument_type(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ArgumentTypeError, message)
    }

    /// Create an argument type mismatch error for a named parameter
    pub fn mismatch(param: &str, expected: ValueType, actual: ValueType) -> Self {
        Self::new(
            ErrorCode::ArgumentTypeError,
            format!("argument '{}' expected {}, got {}", param, expected, actual),
        )
    }

    /// Create a permission denied error naming the missing tags
    pub fn permission_denied(capability: &str, missing: Vec<String>) -> Self {
        let detail = serde_json::json!({
            "capability": capability,
            "missing": missing,
        });
        Self::new(
            ErrorCode::PermissionDenied,
            format!(
                "capability '{}' denied: missing permission(s) {}",
                capability,
                missing.join(", ")
            ),
        )
        .with_detail(detail)
    }

    /// Create a capability lookup miss error
    pub fn not_found(name: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("capability '{}' not found", name))
    }

    /// Create an error for an invocation against an invalidated context
    pub fn context_gone(context: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("context {} is no longer live", context),
        )
    }

    /// Create an installation failure error
    pub fn install_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InstallError, message)
    }

    /// Create a generic internal error.
    ///
    /// Diagnostic detail stays in native-side logs; script only sees
    /// the generic message.
    pub fn internal() -> Self {
        Self::new(ErrorCode::InternalError, "internal error in native handler")
    }

    /// Attach structured detail
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ScriptError {}

/// Host-facing error type for registration and installation results
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A capability with this name already exists
    #[error("capability '{0}' is already registered")]
    DuplicateCapability(String),

    /// Registration was attempted after the registration phase closed
    #[error("capability registration is closed")]
    RegistrationClosed,

    /// Capability lookup miss
    #[error("capability '{0}' not found")]
    NotFound(String),

    /// Binding installation failed; the context was rolled back to unbound
    #[error("installation failed: {0}")]
    Install(#[from] crate::installer::InstallError),

    /// The context handle refers to an invalidated or superseded lifetime
    #[error("context {0} has been invalidated")]
    ContextInvalidated(crate::context::ContextHandle),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Internal bridge error
    #[error("{0}")]
    Internal(String),
}

impl BridgeError {
    /// Convert to the script-visible error shape
    pub fn to_script_error(&self) -> ScriptError {
        match self {
            BridgeError::DuplicateCapability(name) => ScriptError::new(
                ErrorCode::DuplicateCapability,
                format!("capability '{}' is already registered", name),
            ),
            BridgeError::RegistrationClosed => ScriptError::internal(),
            BridgeError::NotFound(name) => ScriptError::not_found(name),
            BridgeError::Install(e) => ScriptError::install_error(e.to_string()),
            BridgeError::ContextInvalidated(handle) => ScriptError::context_gone(handle),
            BridgeError::Config(_) => ScriptError::internal(),
            BridgeError::Internal(_) => ScriptError::internal(),
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::PermissionDenied.to_string(), "PERMISSION_DENIED");
        assert_eq!(
            ErrorCode::ArgumentTypeError.to_string(),
            "ARGUMENT_TYPE_ERROR"
        );
    }

    #[test]
    fn test_permission_denied_lists_missing_tags() {
        let err =
            ScriptError::permission_denied("readClipboard", vec!["clipboard.read".to_string()]);
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        assert!(err.message.contains("readClipboard"));
        assert!(err.message.contains("clipboard.read"));
        assert!(err.detail.is_some());
    }

    #[test]
    fn test_script_error_serialization() {
        let err = ScriptError::mismatch("key", ValueType::String, ValueType::Number);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("ARGUMENT_TYPE_ERROR"));
        assert!(json.contains("expected string, got number"));
    }

    #[test]
    fn test_internal_error_is_generic() {
        let err = ScriptError::internal();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert!(!err.message.contains("panic"));
    }

    #[test]
    fn test_bridge_error_conversion() {
        let err = BridgeError::DuplicateCapability("readClipboard".into());
        assert_eq!(err.to_script_error().code, ErrorCode::DuplicateCapability);

        let err = BridgeError::NotFound("missing".into());
        assert_eq!(err.to_script_error().code, ErrorCode::NotFound);
    }
}
