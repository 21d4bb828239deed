//! Column visibility expressions and reader authorizations.
//!
//! A visibility expression is a boolean formula over labels, for example
//! `admin|(audit&"pii:read")`. Labels are runs of `[A-Za-z0-9_\-:./]` or
//! double-quoted strings with `\"` and `\\` escapes. `&` and `|` may not be
//! mixed at one nesting level without parentheses. The empty expression
//! places no restriction on readers.
//!
//! The grammar lives in `visibility.pest`; operator mixing and nesting depth
//! are checked outside the grammar.

use crate::error::SerializationError;
use bytes::Bytes;
use pest::error::InputLocation;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use std::collections::BTreeSet;
use std::fmt;

/// Deepest parenthesis nesting accepted in an expression.
pub const MAX_NESTING: usize = 64;

#[derive(Parser)]
#[grammar = "src/visibility.pest"]
struct VisibilityParser;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Label(Vec<u8>),
    And(Vec<Node>),
    Or(Vec<Node>),
}

impl Node {
    fn evaluate(&self, auths: &Authorizations) -> bool {
        match self {
            Node::Label(label) => auths.contains(label),
            Node::And(children) => children.iter().all(|c| c.evaluate(auths)),
            Node::Or(children) => children.iter().any(|c| c.evaluate(auths)),
        }
    }
}

/// A parsed, validated column visibility expression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnVisibility {
    expression: Bytes,
    root: Option<Node>,
}

impl ColumnVisibility {
    /// The empty expression, visible to every reader.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse and validate an expression.
    pub fn parse(expression: impl Into<Bytes>) -> Result<Self, SerializationError> {
        let expression = expression.into();
        if expression.is_empty() {
            return Ok(Self::empty());
        }

        let text = std::str::from_utf8(&expression).map_err(|e| {
            invalid(
                &String::from_utf8_lossy(&expression),
                e.valid_up_to(),
                "expression is not valid UTF-8",
            )
        })?;
        // The generated parser recurses once per group.
        check_nesting(text)?;

        let root = parse_root(text)?;
        Ok(Self {
            root: Some(root),
            expression,
        })
    }

    /// The original expression bytes.
    pub fn expression(&self) -> &Bytes {
        &self.expression
    }

    /// Whether this is the empty expression.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Whether a reader holding `auths` may see a cell with this visibility.
    pub fn evaluate(&self, auths: &Authorizations) -> bool {
        self.root.as_ref().map_or(true, |root| root.evaluate(auths))
    }
}

impl fmt::Display for ColumnVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.expression))
    }
}

fn invalid(expression: &str, position: usize, message: &str) -> SerializationError {
    SerializationError::InvalidVisibility {
        expression: expression.to_string(),
        position,
        message: message.to_string(),
    }
}

/// Reject expressions whose parentheses nest deeper than [`MAX_NESTING`].
fn check_nesting(text: &str) -> Result<(), SerializationError> {
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;

    for (position, c) in text.bytes().enumerate() {
        if in_quotes {
            match c {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_quotes = false,
                _ => {}
            }
            continue;
        }
        match c {
            b'"' => in_quotes = true,
            b'(' => {
                depth += 1;
                if depth > MAX_NESTING {
                    return Err(invalid(text, position, "expression nested too deeply"));
                }
            }
            b')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

fn parse_root(text: &str) -> Result<Node, SerializationError> {
    let mut pairs = VisibilityParser::parse(Rule::visibility, text).map_err(|e| {
        let position = match e.location {
            InputLocation::Pos(p) => p,
            InputLocation::Span((start, _)) => start,
        };
        invalid(text, position, &e.variant.message())
    })?;

    let term = pairs
        .next()
        .and_then(|visibility| visibility.into_inner().find(|p| p.as_rule() == Rule::term))
        .ok_or_else(|| invalid(text, 0, "empty expression"))?;
    parse_term(term, text)
}

fn parse_term(pair: Pair<'_, Rule>, text: &str) -> Result<Node, SerializationError> {
    let mut operands = Vec::new();
    let mut operator: Option<&str> = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::operator => {
                let op = inner.as_str();
                if operator.is_some_and(|current| current != op) {
                    return Err(invalid(
                        text,
                        inner.as_span().start(),
                        "cannot mix & and | without parentheses",
                    ));
                }
                operator = Some(op);
            }
            _ => operands.push(parse_operand(inner, text)?),
        }
    }

    match operator {
        None => operands
            .pop()
            .ok_or_else(|| invalid(text, 0, "empty expression")),
        Some("&") => Ok(Node::And(operands)),
        Some(_) => Ok(Node::Or(operands)),
    }
}

fn parse_operand(pair: Pair<'_, Rule>, text: &str) -> Result<Node, SerializationError> {
    let position = pair.as_span().start();
    match pair.as_rule() {
        Rule::group => {
            let term = pair
                .into_inner()
                .next()
                .ok_or_else(|| invalid(text, position, "empty parentheses"))?;
            parse_term(term, text)
        }
        Rule::label => Ok(Node::Label(pair.as_str().as_bytes().to_vec())),
        Rule::quoted => {
            let raw = pair
                .into_inner()
                .next()
                .ok_or_else(|| invalid(text, position, "empty quoted label"))?;
            Ok(Node::Label(unescape(raw.as_str())))
        }
        r => Err(invalid(text, position, &format!("unexpected rule: {r:?}"))),
    }
}

fn unescape(raw: &str) -> Vec<u8> {
    let mut label = Vec::with_capacity(raw.len());
    let mut escaped = false;
    for c in raw.bytes() {
        if c == b'\\' && !escaped {
            escaped = true;
            continue;
        }
        escaped = false;
        label.push(c);
    }
    label
}

/// The set of labels a reader holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorizations {
    labels: BTreeSet<Vec<u8>>,
}

impl Authorizations {
    /// Authorizations holding the given labels.
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            labels: labels.into_iter().map(|l| l.as_ref().to_vec()).collect(),
        }
    }

    /// No labels; only unrestricted cells are visible.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the label is held.
    pub fn contains(&self, label: &[u8]) -> bool {
        self.labels.contains(label)
    }

    /// Number of labels held.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether no labels are held.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(expr: &str) -> Result<ColumnVisibility, SerializationError> {
        ColumnVisibility::parse(expr.as_bytes().to_vec())
    }

    #[test]
    fn test_empty_expression() {
        let vis = parse("").unwrap();
        assert!(vis.is_empty());
        assert!(vis.evaluate(&Authorizations::empty()));
        assert_eq!(vis, ColumnVisibility::empty());
    }

    #[test]
    fn test_accepts_valid_expressions() {
        for expr in [
            "public",
            "a&b",
            "a|b|c",
            "(a&b)|c",
            "a&(b|c)&d",
            "((a))",
            "\"pii:read\"&admin",
            "\"quote\\\"d\"",
            "dept-1/team.x:ro",
        ] {
            let vis = parse(expr).unwrap_or_else(|e| panic!("{expr}: {e}"));
            assert_eq!(vis.expression().as_ref(), expr.as_bytes());
            assert!(!vis.is_empty());
        }
    }

    #[test]
    fn test_rejects_invalid_expressions() {
        for expr in [
            "a&b|c", "a&", "|a", "()", "(a", "a)", "a b", "a&&b", "\"\"", "\"open", "a#b",
        ] {
            assert!(parse(expr).is_err(), "{expr} should be rejected");
        }
    }

    #[test]
    fn test_error_reports_position() {
        let err = parse("a&b|c").unwrap_err();
        match err {
            SerializationError::InvalidVisibility {
                expression,
                position,
                ..
            } => {
                assert_eq!(expression, "a&b|c");
                assert_eq!(position, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_evaluate_and_or() {
        let vis = parse("(a&b)|c").unwrap();
        assert!(vis.evaluate(&Authorizations::new(["a", "b"])));
        assert!(vis.evaluate(&Authorizations::new(["c"])));
        assert!(!vis.evaluate(&Authorizations::new(["a"])));
        assert!(!vis.evaluate(&Authorizations::empty()));
    }

    #[test]
    fn test_evaluate_quoted_label() {
        let vis = parse("\"pii:read\"&admin").unwrap();
        assert!(vis.evaluate(&Authorizations::new(["pii:read", "admin"])));
        assert!(!vis.evaluate(&Authorizations::new(["admin"])));

        let escaped = parse("\"say \\\"hi\\\"\"").unwrap();
        assert!(escaped.evaluate(&Authorizations::new(["say \"hi\""])));
    }

    #[test]
    fn test_nesting_limit() {
        let at_limit = format!("{}a{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(parse(&at_limit).is_ok());

        let deep = format!("{}a{}", "(".repeat(5000), ")".repeat(5000));
        match parse(&deep).unwrap_err() {
            SerializationError::InvalidVisibility {
                position, message, ..
            } => {
                assert_eq!(position, MAX_NESTING);
                assert_eq!(message, "expression nested too deeply");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parentheses_inside_quotes_do_not_nest() {
        let label = "(".repeat(MAX_NESTING + 10);
        let vis = parse(&format!("\"{label}\"")).unwrap();
        assert!(vis.evaluate(&Authorizations::new([label.as_str()])));
    }

    #[test]
    fn test_rejects_non_utf8() {
        assert!(ColumnVisibility::parse(vec![b'a', 0xff]).is_err());
    }

    #[test]
    fn test_authorizations() {
        let auths = Authorizations::new(["public", "admin", "public"]);
        assert_eq!(auths.len(), 2);
        assert!(auths.contains(b"admin"));
        assert!(!auths.contains(b"audit"));
        assert!(Authorizations::empty().is_empty());
    }
}
