//! Scalar values flowing through expressions and ports.

use serde::{Deserialize, Serialize};

/// A port or expression value.
///
/// Booleans count as 1/0 whenever they are used arithmetically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
}

impl Value {
    /// Numeric view of the value
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Number(n) => *n,
        }
    }

    /// Truthiness (non-zero numbers are true)
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
        }
    }

    /// Integer view used by bitwise functions
    pub fn as_i64(&self) -> i64 {
        self.as_f64() as i64
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    /// Convert from JSON, accepting only booleans and numbers
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    serde_json::json!(*n as i64)
                } else {
                    serde_json::json!(*n)
                }
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Value::Bool(true).as_f64(), 1.0);
        assert_eq!(Value::Bool(false).as_f64(), 0.0);
        assert!(Value::Number(-0.5).as_bool());
        assert!(!Value::Number(0.0).as_bool());
        assert_eq!(Value::Number(-3.7).as_i64(), -3);
    }

    #[test]
    fn test_variants_never_equal() {
        assert_ne!(Value::Bool(true), Value::Number(1.0));
        assert_eq!(Value::Number(2.0), Value::from(2i64));
    }

    #[test]
    fn test_json_conversion() {
        assert_eq!(Value::from_json(&serde_json::json!(true)), Some(Value::Bool(true)));
        assert_eq!(Value::from_json(&serde_json::json!(1.5)), Some(Value::Number(1.5)));
        assert_eq!(Value::from_json(&serde_json::json!("x")), None);
        assert_eq!(Value::Number(42.0).to_json(), serde_json::json!(42));
        assert_eq!(Value::Number(0.25).to_json(), serde_json::json!(0.25));
    }
}
