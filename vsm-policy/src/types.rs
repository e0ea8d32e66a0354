//! Core types for the policy engine library
//!
//! This module defines the typed signal values exchanged between the store,
//! the expression evaluator and the emission pipeline, plus the library-wide
//! error type. Evaluation never raises: anything the evaluator cannot produce
//! a value for is represented as the `None` arm of `Option<Value>` and is
//! referred to as "undefined" throughout.

use std::fmt;

/// Logical engine time in milliseconds since program start
pub type Millis = u64;

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors that can occur while loading rules or driving the engine
///
/// Everything here is fatal at load time. Runtime evaluation problems
/// (undefined operands, type mismatches, division by zero) are soft and
/// never surface as a `PolicyError`.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Failed to parse rule file: {0}")]
    RuleParse(String),

    #[error("Failed to parse expression '{expr}': {reason}")]
    ExprParse { expr: String, reason: String },

    #[error("Signal '{0}' not in signal number mapping file")]
    UnknownSignal(String),

    #[error("Invalid timing value: {0}")]
    InvalidTiming(String),

    #[error("'{wrapper}' block contains illegal child: {child}")]
    IllegalChild { wrapper: String, child: String },

    #[error("Failed to parse signal number file: {0}")]
    SignalMapParse(String),

    #[error("Failed to parse replay log: {0}")]
    ReplayParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A typed signal value
///
/// Signals carry one of four kinds. Arithmetic is defined only on the
/// numeric kinds, comparison permits numeric coercion, equality permits
/// same-kind comparison. Cross-kind operations are undefined, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    Text(String),
    /// Boolean value
    Boolean(bool),
}

impl Value {
    /// Kind name used in log messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "string",
            Value::Boolean(_) => "boolean",
        }
    }

    /// Numeric view used by arithmetic and comparison coercion
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Parse a short value literal: integer, float, `true`/`True`/`false`/
    /// `False`, or a quoted string with backslash escapes.
    pub fn parse_literal(input: &str) -> Option<Value> {
        let s = input.trim();
        if s.is_empty() {
            return None;
        }

        if let Some(quote) = s.chars().next().filter(|c| *c == '\'' || *c == '"') {
            return parse_quoted(s, quote).map(Value::Text);
        }

        match s {
            "true" | "True" => return Some(Value::Boolean(true)),
            "false" | "False" => return Some(Value::Boolean(false)),
            _ => {}
        }

        if let Ok(v) = s.parse::<i64>() {
            return Some(Value::Integer(v));
        }
        if let Ok(v) = s.parse::<f64>() {
            return Some(Value::Float(v));
        }

        None
    }
}

/// Values format as the same short literals the parser accepts, so emission
/// lines, capture logs and replay input all share one codec.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => {
                // keep a decimal point so the literal stays a float
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Value::Boolean(v) => write!(f, "{}", if *v { "True" } else { "False" }),
            Value::Text(s) => {
                f.write_str("'")?;
                for c in s.chars() {
                    match c {
                        '\\' => f.write_str("\\\\")?,
                        '\'' => f.write_str("\\'")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                f.write_str("'")
            }
        }
    }
}

fn parse_quoted(s: &str, quote: char) -> Option<String> {
    let mut chars = s.chars();
    if chars.next() != Some(quote) {
        return None;
    }

    let mut out = String::new();
    loop {
        match chars.next()? {
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                c => out.push(c),
            },
            c if c == quote => {
                // the closing quote must end the literal
                return if chars.next().is_none() { Some(out) } else { None };
            }
            c => out.push(c),
        }
    }
}

/// Truth state of a condition node
///
/// `Unknown` is the state of a freshly armed (or disarmed) condition;
/// evaluation only ever produces `True` or `False`. Rising edges are
/// transitions from `Unknown`/`False` to `True`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Truth {
    #[default]
    Unknown,
    True,
    False,
}

impl Truth {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    pub fn is_true(self) -> bool {
        self == Truth::True
    }
}

impl fmt::Display for Truth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Truth::Unknown => write!(f, "Unknown"),
            Truth::True => write!(f, "True"),
            Truth::False => write!(f, "False"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literals() {
        assert_eq!(Value::parse_literal("42"), Some(Value::Integer(42)));
        assert_eq!(Value::parse_literal("-7"), Some(Value::Integer(-7)));
        assert_eq!(Value::parse_literal("3.5"), Some(Value::Float(3.5)));
        assert_eq!(Value::parse_literal("true"), Some(Value::Boolean(true)));
        assert_eq!(Value::parse_literal("False"), Some(Value::Boolean(false)));
        assert_eq!(
            Value::parse_literal("'reverse'"),
            Some(Value::Text("reverse".to_string()))
        );
        assert_eq!(
            Value::parse_literal("\"park\""),
            Some(Value::Text("park".to_string()))
        );
        assert_eq!(Value::parse_literal("bogus"), None);
        assert_eq!(Value::parse_literal("'unterminated"), None);
    }

    #[test]
    fn test_quoted_escapes() {
        assert_eq!(
            Value::parse_literal(r"'it\'s'"),
            Some(Value::Text("it's".to_string()))
        );
        assert_eq!(
            Value::parse_literal(r"'a\\b'"),
            Some(Value::Text("a\\b".to_string()))
        );
    }

    #[test]
    fn test_display_round_trip() {
        let values = [
            Value::Integer(42),
            Value::Float(2.0),
            Value::Float(3.25),
            Value::Boolean(true),
            Value::Text("it's".to_string()),
            Value::Text("a\\b".to_string()),
        ];
        for v in values {
            let literal = v.to_string();
            assert_eq!(Value::parse_literal(&literal), Some(v), "literal {}", literal);
        }
    }

    #[test]
    fn test_float_display_keeps_point() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Integer(2).to_string(), "2");
    }

    #[test]
    fn test_truth_edges() {
        assert_eq!(Truth::from_bool(true), Truth::True);
        assert!(!Truth::Unknown.is_true());
    }
}
