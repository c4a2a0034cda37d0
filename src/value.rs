//! Script value marshalling types.
//!
//! [`ScriptValue`] is the engine-neutral representation of values
//! crossing the native/script boundary in either direction. Bindings
//! marshal script arguments into this shape before dispatch and marshal
//! handler results back out of it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Value types crossing the script boundary (must be serializable)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScriptValue {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Numeric value (f64 for JS compatibility)
    Number(f64),
    /// String value
    String(String),
    /// Array of values
    Array(Vec<ScriptValue>),
    /// Object/map of values
    Object(HashMap<String, ScriptValue>),
}

impl ScriptValue {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, ScriptValue::Null)
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&Vec<ScriptValue>> {
        match self {
            ScriptValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object
    pub fn as_object(&self) -> Option<&HashMap<String, ScriptValue>> {
        match self {
            ScriptValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// The runtime type of this value, for marshalling diagnostics
    pub fn type_of(&self) -> ValueType {
        match self {
            ScriptValue::Null => ValueType::Null,
            ScriptValue::Bool(_) => ValueType::Bool,
            ScriptValue::Number(_) => ValueType::Number,
            ScriptValue::String(_) => ValueType::String,
            ScriptValue::Array(_) => ValueType::Array,
            ScriptValue::Object(_) => ValueType::Object,
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<i64> for ScriptValue {
    fn from(n: i64) -> Self {
        ScriptValue::Number(n as f64)
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl<T: Into<ScriptValue>> From<Vec<T>> for ScriptValue {
    fn from(v: Vec<T>) -> Self {
        ScriptValue::Array(v.into_iter().map(Into::into).collect())
    }
}

impl Default for ScriptValue {
    fn default() -> Self {
        ScriptValue::Null
    }
}

/// Type tag used in parameter specs and mismatch reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Null
    Null,
    /// Boolean
    Bool,
    /// Number
    Number,
    /// String
    String,
    /// Array
    Array,
    /// Object
    Object,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Null => write!(f, "null"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Number => write!(f, "number"),
            ValueType::String => write!(f, "string"),
            ValueType::Array => write!(f, "array"),
            ValueType::Object => write!(f, "object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_value_conversions() {
        let v: ScriptValue = true.into();
        assert_eq!(v.as_bool(), Some(true));

        let v: ScriptValue = 42.0.into();
        assert_eq!(v.as_number(), Some(42.0));

        let v: ScriptValue = "hello".into();
        assert_eq!(v.as_str(), Some("hello"));
    }

    #[test]
    fn test_type_of() {
        assert_eq!(ScriptValue::Null.type_of(), ValueType::Null);
        assert_eq!(ScriptValue::from(1.5).type_of(), ValueType::Number);
        assert_eq!(ScriptValue::from(vec![1i64, 2]).type_of(), ValueType::Array);
    }

    #[test]
    fn test_untagged_serialization() {
        let v = ScriptValue::from(vec!["a", "b"]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"["a","b"]"#);

        let parsed: ScriptValue = serde_json::from_str("3.5").unwrap();
        assert_eq!(parsed, ScriptValue::Number(3.5));
    }

    #[test]
    fn test_value_type_display() {
        assert_eq!(ValueType::String.to_string(), "string");
        assert_eq!(ValueType::Object.to_string(), "object");
    }
}
