//! Condition expression evaluation.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr    := and ("OR" and)*
//! and     := not ("AND" not)*
//! not     := "NOT" not | primary
//! primary := "(" expr ")" | operand [op operand]
//! operand := variable | integer | "quoted string" | v1.2.3
//! op      := = <> < > <= >= >< << >>   (prefix ~ for case-insensitive strings)
//! ```
//!
//! A bare operand is true when it is a non-empty string, a non-zero number
//! or a non-zero version. Missing variables are false and compare as empty.

use std::cmp::Ordering;

use crate::hresult::HResult;
use crate::variables::{VariableError, Variables};
use crate::variant::VariantType;
use crate::version::Version;

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error(transparent)]
    Variable(#[from] VariableError),
}

impl ConditionError {
    pub fn hresult(&self) -> HResult {
        match self {
            ConditionError::Syntax { .. } => HResult::INVALID_DATA,
            ConditionError::Variable(e) => e.hresult(),
        }
    }
}

/// Evaluate `condition` against the variable store.
pub fn evaluate(condition: &str, variables: &mut Variables) -> Result<bool, ConditionError> {
    let tokens = tokenize(condition)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        variables,
    };
    let value = parser.expression()?;
    if let Some((position, token)) = parser.tokens.get(parser.pos) {
        return Err(syntax(*position, format!("unexpected {token:?}")));
    }
    Ok(value)
}

/// Evaluate an optional condition, treating absence as true.
pub fn evaluate_optional(
    condition: Option<&str>,
    variables: &mut Variables,
) -> Result<bool, ConditionError> {
    match condition.map(str::trim) {
        None | Some("") => Ok(true),
        Some(text) => evaluate(text, variables),
    }
}

fn syntax(position: usize, message: impl Into<String>) -> ConditionError {
    ConditionError::Syntax {
        position,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    Number(i64),
    Text(String),
    Version(String),
    Op(Comparison, bool),
    And,
    Or,
    Not,
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Contains,
    StartsWith,
    EndsWith,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        let start = pos;
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        match c {
            b'(' => {
                tokens.push((start, Token::Open));
                pos += 1;
            }
            b')' => {
                tokens.push((start, Token::Close));
                pos += 1;
            }
            b'"' => {
                let end = input[pos + 1..]
                    .find('"')
                    .ok_or_else(|| syntax(start, "unterminated string"))?;
                tokens.push((start, Token::Text(input[pos + 1..pos + 1 + end].to_string())));
                pos += end + 2;
            }
            b'~' | b'=' | b'<' | b'>' => {
                let insensitive = c == b'~';
                if insensitive {
                    pos += 1;
                }
                let rest = &input[pos..];
                let (op, len) = if rest.starts_with("<>") {
                    (Comparison::NotEqual, 2)
                } else if rest.starts_with("<=") {
                    (Comparison::LessOrEqual, 2)
                } else if rest.starts_with(">=") {
                    (Comparison::GreaterOrEqual, 2)
                } else if rest.starts_with("><") {
                    (Comparison::Contains, 2)
                } else if rest.starts_with("<<") {
                    (Comparison::StartsWith, 2)
                } else if rest.starts_with(">>") {
                    (Comparison::EndsWith, 2)
                } else if rest.starts_with('=') {
                    (Comparison::Equal, 1)
                } else if rest.starts_with('<') {
                    (Comparison::Less, 1)
                } else if rest.starts_with('>') {
                    (Comparison::Greater, 1)
                } else {
                    return Err(syntax(start, "expected comparison operator"));
                };
                tokens.push((start, Token::Op(op, insensitive)));
                pos += len;
            }
            b'-' | b'0'..=b'9' => {
                pos += 1;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                let number = input[start..pos]
                    .parse::<i64>()
                    .map_err(|_| syntax(start, "invalid number"))?;
                tokens.push((start, Token::Number(number)));
            }
            b'v' | b'V'
                if bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) =>
            {
                pos += 1;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric()
                        || matches!(bytes[pos], b'.' | b'-' | b'+'))
                {
                    pos += 1;
                }
                tokens.push((start, Token::Version(input[start..pos].to_string())));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || matches!(bytes[pos], b'_' | b'.'))
                {
                    pos += 1;
                }
                let word = &input[start..pos];
                let token = if word.eq_ignore_ascii_case("AND") {
                    Token::And
                } else if word.eq_ignore_ascii_case("OR") {
                    Token::Or
                } else if word.eq_ignore_ascii_case("NOT") {
                    Token::Not
                } else {
                    Token::Identifier(word.to_string())
                };
                tokens.push((start, token));
            }
            _ => return Err(syntax(start, format!("unexpected character {:?}", c as char))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Operand {
    Missing,
    Number(i64),
    Text(String),
    Version(Version),
}

impl Operand {
    fn truthy(&self) -> bool {
        match self {
            Operand::Missing => false,
            Operand::Number(n) => *n != 0,
            Operand::Text(s) => !s.is_empty(),
            Operand::Version(v) => !v.is_zero(),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Operand::Missing => String::new(),
            Operand::Number(n) => n.to_string(),
            Operand::Text(s) => s.clone(),
            Operand::Version(v) => v.to_string(),
        }
    }
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    variables: &'a mut Variables,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or(self.tokens.last())
            .map_or(0, |(p, _)| *p)
    }

    fn expression(&mut self) -> Result<bool, ConditionError> {
        let mut value = self.conjunction()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.conjunction()?;
            value = value || right;
        }
        Ok(value)
    }

    fn conjunction(&mut self) -> Result<bool, ConditionError> {
        let mut value = self.negation()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.negation()?;
            value = value && right;
        }
        Ok(value)
    }

    fn negation(&mut self) -> Result<bool, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(!self.negation()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<bool, ConditionError> {
        if self.peek() == Some(&Token::Open) {
            self.pos += 1;
            let value = self.expression()?;
            if self.peek() != Some(&Token::Close) {
                return Err(syntax(self.position(), "expected ')'"));
            }
            self.pos += 1;
            return Ok(value);
        }

        let left = self.operand()?;
        let Some(Token::Op(op, insensitive)) = self.peek().cloned() else {
            return Ok(left.truthy());
        };
        self.pos += 1;
        let right = self.operand()?;
        Ok(compare(&left, op, insensitive, &right))
    }

    fn operand(&mut self) -> Result<Operand, ConditionError> {
        let position = self.position();
        let Some((_, token)) = self.tokens.get(self.pos).cloned() else {
            return Err(syntax(position, "expected operand"));
        };
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Operand::Number(n)),
            Token::Text(s) => Ok(Operand::Text(s)),
            Token::Version(v) => Ok(Operand::Version(Version::parse(&v))),
            Token::Identifier(name) => self.lookup(&name),
            other => Err(syntax(position, format!("expected operand, found {other:?}"))),
        }
    }

    fn lookup(&mut self, name: &str) -> Result<Operand, ConditionError> {
        match self.variables.kind(name) {
            None | Some(VariantType::None) => Ok(Operand::Missing),
            Some(VariantType::Numeric) => Ok(Operand::Number(self.variables.get_numeric(name)?)),
            Some(VariantType::Version) => {
                Ok(Operand::Version(self.variables.get_version(name)?))
            }
            Some(VariantType::String) | Some(VariantType::Formatted) => Ok(Operand::Text(
                self.variables.get_formatted(name)?.as_str().to_string(),
            )),
        }
    }
}

fn compare(left: &Operand, op: Comparison, insensitive: bool, right: &Operand) -> bool {
    match (left, right) {
        (Operand::Number(a), Operand::Number(b)) => compare_numbers(*a, op, *b),
        (Operand::Version(a), Operand::Version(b)) => compare_ordering(a.cmp(b), op),
        (Operand::Version(a), other) => {
            compare_ordering(a.cmp(&Version::parse(&other.as_text())), op)
        }
        (other, Operand::Version(b)) => {
            compare_ordering(Version::parse(&other.as_text()).cmp(b), op)
        }
        (Operand::Text(s), Operand::Number(b)) | (Operand::Number(b), Operand::Text(s))
            if s.trim().parse::<i64>().is_ok() =>
        {
            let a = s.trim().parse::<i64>().unwrap_or_default();
            if matches!(left, Operand::Text(_)) {
                compare_numbers(a, op, *b)
            } else {
                compare_numbers(*b, op, a)
            }
        }
        _ => compare_strings(&left.as_text(), op, insensitive, &right.as_text()),
    }
}

fn compare_ordering(ordering: Ordering, op: Comparison) -> bool {
    match op {
        Comparison::Equal => ordering == Ordering::Equal,
        Comparison::NotEqual => ordering != Ordering::Equal,
        Comparison::Less => ordering == Ordering::Less,
        Comparison::Greater => ordering == Ordering::Greater,
        Comparison::LessOrEqual => ordering != Ordering::Greater,
        Comparison::GreaterOrEqual => ordering != Ordering::Less,
        Comparison::Contains | Comparison::StartsWith | Comparison::EndsWith => false,
    }
}

fn compare_numbers(a: i64, op: Comparison, b: i64) -> bool {
    match op {
        Comparison::Contains => a & b != 0,
        Comparison::StartsWith | Comparison::EndsWith => false,
        _ => compare_ordering(a.cmp(&b), op),
    }
}

fn compare_strings(a: &str, op: Comparison, insensitive: bool, b: &str) -> bool {
    let (a, b) = if insensitive {
        (a.to_lowercase(), b.to_lowercase())
    } else {
        (a.to_string(), b.to_string())
    };
    match op {
        Comparison::Contains => a.contains(&b),
        Comparison::StartsWith => a.starts_with(&b),
        Comparison::EndsWith => a.ends_with(&b),
        _ => compare_ordering(a.cmp(&b), op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Variables {
        let mut v = Variables::new();
        v.set_numeric("VersionNT", 601).unwrap();
        v.set_string("Flavor", "Pro").unwrap();
        v.set_numeric("Zero", 0).unwrap();
        v.set_version("Installed", Version::parse("2.5.1")).unwrap();
        v.set_string("NumericText", "10").unwrap();
        v
    }

    fn eval(text: &str) -> bool {
        evaluate(text, &mut vars()).unwrap()
    }

    #[test]
    fn test_truthiness() {
        assert!(eval("VersionNT"));
        assert!(!eval("Zero"));
        assert!(!eval("Missing"));
        assert!(eval("NOT Missing"));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(eval("VersionNT >= 600"));
        assert!(eval("VersionNT <> 600"));
        assert!(!eval("VersionNT < 600"));
        assert!(eval("NumericText = 10"));
    }

    #[test]
    fn test_string_comparisons() {
        assert!(eval("Flavor = \"Pro\""));
        assert!(!eval("Flavor = \"pro\""));
        assert!(eval("Flavor ~= \"pro\""));
        assert!(eval("Flavor << \"P\""));
        assert!(eval("Flavor >> \"ro\""));
        assert!(eval("Flavor >< \"r\""));
    }

    #[test]
    fn test_version_comparisons() {
        assert!(eval("Installed < v3.0"));
        assert!(eval("Installed >= v2.5.1"));
        assert!(!eval("Installed = v2.5"));
    }

    #[test]
    fn test_boolean_logic_and_precedence() {
        assert!(eval("Missing OR VersionNT AND Flavor = \"Pro\""));
        assert!(!eval("(Missing OR Zero) AND VersionNT"));
        assert!(eval("NOT (Zero AND VersionNT)"));
    }

    #[test]
    fn test_syntax_errors() {
        let mut v = vars();
        assert!(evaluate("(VersionNT", &mut v).is_err());
        assert!(evaluate("Flavor = ", &mut v).is_err());
        assert!(evaluate("\"open", &mut v).is_err());
        assert!(evaluate("A B", &mut v).is_err());
    }

    #[test]
    fn test_optional_condition() {
        let mut v = vars();
        assert!(evaluate_optional(None, &mut v).unwrap());
        assert!(evaluate_optional(Some("  "), &mut v).unwrap());
        assert!(!evaluate_optional(Some("Zero"), &mut v).unwrap());
    }
}
