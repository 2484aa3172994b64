//! Parse-time and evaluation-time errors.

use serde::Serialize;

use crate::Value;

/// Why an expression failed to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseErrorKind {
    InvalidExpression,
    UnbalancedParens,
    UnexpectedText,
    UnknownFunction,
    WrongArity,
    InvalidConstant,
    ExternalDependency,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseErrorKind::InvalidExpression => "invalid expression",
            ParseErrorKind::UnbalancedParens => "unbalanced parentheses",
            ParseErrorKind::UnexpectedText => "unexpected text",
            ParseErrorKind::UnknownFunction => "unknown function",
            ParseErrorKind::WrongArity => "wrong number of arguments",
            ParseErrorKind::InvalidConstant => "invalid constant",
            ParseErrorKind::ExternalDependency => "external dependency",
        };
        f.write_str(s)
    }
}

/// A parse error, pointing at the offending token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{reason} \"{token}\" at position {pos}")]
pub struct ParseError {
    pub reason: ParseErrorKind,
    pub token: String,
    /// Byte offset into the source string
    pub pos: usize,
}

impl ParseError {
    pub fn new(reason: ParseErrorKind, token: impl Into<String>, pos: usize) -> Self {
        Self {
            reason,
            token: token.into(),
            pos,
        }
    }
}

/// Errors raised while evaluating an expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// A referenced port is unknown, disabled, or has no value yet
    #[error("value unavailable")]
    ValueUnavailable,

    #[error("invalid argument {index}: {value}")]
    ArgError { index: usize, value: Value },
}

pub type EvalResult<T> = Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_serializes_as_object() {
        let err = ParseError::new(ParseErrorKind::UnknownFunction, "FOO", 3);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"reason": "unknown-function", "token": "FOO", "pos": 3})
        );
        assert_eq!(err.to_string(), "unknown function \"FOO\" at position 3");
    }
}
