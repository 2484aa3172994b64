//! Expression Parser
//!
//! Parses the prefix-call syntax (`NAME(arg, ...)`, `$port`, literals) into an
//! [`Expression`]. There is no infix notation, so parsing works on byte ranges
//! of the source: a range starting with `$` is a port reference, a range with a
//! `(` is a call, anything else is a constant.

use crate::ast::{Call, Expression, PortRef};
use crate::error::{ParseError, ParseErrorKind};
use crate::functions;
use crate::Value;

/// Reserved port id that always refers to the owning port
pub const SELF_ID: &str = "self";

/// Parse a port expression.
///
/// `self_id` is the id of the port that will own the expression; `$` and
/// `$self` resolve to it.
pub fn parse(source: &str, self_id: &str) -> Result<Expression, ParseError> {
    Parser { src: source, self_id }.parse_range(0, source.len())
}

/// Parse a read/write transform.
///
/// Transforms may only reference the port they belong to.
pub fn parse_transform(source: &str, self_id: &str) -> Result<Expression, ParseError> {
    let expr = parse(source, self_id)?;
    if let Some(r) = expr.external_refs().into_iter().find(|r| r.id != self_id) {
        return Err(ParseError::new(
            ParseErrorKind::ExternalDependency,
            format!("${}", r.id),
            r.pos,
        ));
    }
    Ok(expr)
}

struct Parser<'a> {
    src: &'a str,
    self_id: &'a str,
}

impl<'a> Parser<'a> {
    fn parse_range(&self, start: usize, end: usize) -> Result<Expression, ParseError> {
        let slice = &self.src[start..end];
        let trimmed = slice.trim();
        if trimmed.is_empty() {
            return Err(ParseError::new(ParseErrorKind::InvalidExpression, "", start));
        }

        let start = start + (slice.len() - slice.trim_start().len());
        let end = start + trimmed.len();

        if trimmed.starts_with('$') {
            return self.parse_port_ref(start, end);
        }

        if let Some(open) = trimmed.find('(') {
            return self.parse_call(start, start + open, end);
        }

        self.parse_constant(start, end)
    }

    fn parse_port_ref(&self, start: usize, end: usize) -> Result<Expression, ParseError> {
        let id = &self.src[start + 1..end];

        for (i, c) in id.char_indices() {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                continue;
            }
            let pos = start + 1 + i;
            let kind = if c == ')' {
                ParseErrorKind::UnbalancedParens
            } else {
                ParseErrorKind::UnexpectedText
            };
            return Err(ParseError::new(kind, &self.src[pos..end], pos));
        }

        let self_ref = id.is_empty() || id == SELF_ID;
        Ok(Expression::PortRef(PortRef {
            id: if self_ref { self.self_id.to_string() } else { id.to_string() },
            self_ref,
            pos: start,
        }))
    }

    fn parse_call(&self, start: usize, open: usize, end: usize) -> Result<Expression, ParseError> {
        let name = self.src[start..open].trim_end();
        if name.is_empty() {
            return Err(ParseError::new(ParseErrorKind::InvalidExpression, "(", open));
        }
        if let Some((i, _)) = name
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(ParseError::new(
                ParseErrorKind::UnexpectedText,
                &name[i..],
                start + i,
            ));
        }

        // Locate the matching close paren and top-level commas
        let mut depth = 0usize;
        let mut close = None;
        let mut commas = Vec::new();
        for (i, c) in self.src[open..end].char_indices() {
            let pos = open + i;
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(pos);
                        break;
                    }
                }
                ',' if depth == 1 => commas.push(pos),
                _ => {}
            }
        }
        let close =
            close.ok_or_else(|| ParseError::new(ParseErrorKind::UnbalancedParens, "(", open))?;

        let rest = &self.src[close + 1..end];
        if !rest.trim().is_empty() {
            let offset = close + 1 + (rest.len() - rest.trim_start().len());
            let token = rest.trim();
            let kind = if token.starts_with(')') {
                ParseErrorKind::UnbalancedParens
            } else {
                ParseErrorKind::UnexpectedText
            };
            return Err(ParseError::new(kind, token, offset));
        }

        let func = functions::lookup(name)
            .ok_or_else(|| ParseError::new(ParseErrorKind::UnknownFunction, name, start))?;

        let mut args = Vec::new();
        if !self.src[open + 1..close].trim().is_empty() {
            let mut arg_start = open + 1;
            for comma in commas.iter().copied().chain(std::iter::once(close)) {
                args.push(self.parse_range(arg_start, comma)?);
                arg_start = comma + 1;
            }
        }

        if !func.accepts(args.len()) {
            return Err(ParseError::new(ParseErrorKind::WrongArity, name, start));
        }

        Ok(Expression::Call(Call::new(func, args, start)))
    }

    fn parse_constant(&self, start: usize, end: usize) -> Result<Expression, ParseError> {
        let token = &self.src[start..end];

        if let Some(i) = token.find(')') {
            return Err(ParseError::new(
                ParseErrorKind::UnbalancedParens,
                ")",
                start + i,
            ));
        }
        if let Some(i) = token.find(',') {
            return Err(ParseError::new(
                ParseErrorKind::UnexpectedText,
                &token[i..],
                start + i,
            ));
        }

        let value = match token {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => {
                if let Ok(i) = token.parse::<i64>() {
                    Value::Number(i as f64)
                } else {
                    match token.parse::<f64>() {
                        Ok(f) if f.is_finite() => Value::Number(f),
                        _ => {
                            return Err(ParseError::new(
                                ParseErrorKind::InvalidConstant,
                                token,
                                start,
                            ))
                        }
                    }
                }
            }
        };

        Ok(Expression::Constant(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(src: &str) -> ParseError {
        parse(src, "me").unwrap_err()
    }

    #[test]
    fn test_constants() {
        assert_eq!(parse("true", "me").unwrap(), Expression::Constant(Value::Bool(true)));
        assert_eq!(parse(" 42 ", "me").unwrap(), Expression::Constant(Value::Number(42.0)));
        assert_eq!(parse("-0.5", "me").unwrap(), Expression::Constant(Value::Number(-0.5)));
        assert_eq!(err("abc").reason, ParseErrorKind::InvalidConstant);
        assert_eq!(err("inf").reason, ParseErrorKind::InvalidConstant);
    }

    #[test]
    fn test_port_refs() {
        let Expression::PortRef(r) = parse("$temp.sensor-1", "me").unwrap() else {
            panic!("Expected port ref");
        };
        assert_eq!(r.id, "temp.sensor-1");
        assert!(!r.self_ref);

        for src in ["$", "$self"] {
            let Expression::PortRef(r) = parse(src, "me").unwrap() else {
                panic!("Expected port ref");
            };
            assert_eq!(r.id, "me");
            assert!(r.self_ref);
        }

        let e = err("$a b");
        assert_eq!(e.reason, ParseErrorKind::UnexpectedText);
        assert_eq!(e.pos, 2);
    }

    #[test]
    fn test_calls() {
        let e = parse("mul($nid1, 10)", "me").unwrap();
        let Expression::Call(call) = &e else {
            panic!("Expected call");
        };
        assert_eq!(call.func.name, "MUL");
        assert_eq!(call.args.len(), 2);

        let e = parse("ADD(1, MAX(2, 3, 4), IF(true, 1, 2))", "me").unwrap();
        assert_eq!(e.to_string(), "ADD(1, MAX(2, 3, 4), IF(true, 1, 2))");

        let e = parse("TIME()", "me").unwrap();
        assert_eq!(e.to_string(), "TIME()");
    }

    #[test]
    fn test_error_positions() {
        let e = err("ADD(1, 2");
        assert_eq!((e.reason, e.pos), (ParseErrorKind::UnbalancedParens, 3));

        let e = err("ADD(1, 2))");
        assert_eq!((e.reason, e.token.as_str(), e.pos), (ParseErrorKind::UnbalancedParens, ")", 9));

        let e = err("ADD(1, 2) x");
        assert_eq!((e.reason, e.token.as_str(), e.pos), (ParseErrorKind::UnexpectedText, "x", 10));

        let e = err("ADD(1, FOO(2))");
        assert_eq!((e.reason, e.token.as_str(), e.pos), (ParseErrorKind::UnknownFunction, "FOO", 7));

        let e = err("SUB(1, 2, 3)");
        assert_eq!((e.reason, e.token.as_str(), e.pos), (ParseErrorKind::WrongArity, "SUB", 0));

        let e = err("ADD(1, , 2)");
        assert_eq!((e.reason, e.pos), (ParseErrorKind::InvalidExpression, 6));

        let e = err("ADD(1, 2x)");
        assert_eq!((e.reason, e.token.as_str(), e.pos), (ParseErrorKind::InvalidConstant, "2x", 7));

        let e = err("");
        assert_eq!(e.reason, ParseErrorKind::InvalidExpression);
    }

    #[test]
    fn test_transform_allows_only_self() {
        assert!(parse_transform("MUL($, 1.8)", "t").is_ok());
        assert!(parse_transform("ADD($self, 32)", "t").is_ok());
        assert!(parse_transform("ADD($t, 32)", "t").is_ok());

        let e = parse_transform("ADD($, $other)", "t").unwrap_err();
        assert_eq!(e.reason, ParseErrorKind::ExternalDependency);
        assert_eq!(e.token, "$other");
        assert_eq!(e.pos, 7);
    }
}
