//! LDAP filter engine for the Gantry service runtime.
//!
//! Filters follow the classic RFC-style grammar:
//!
//! ```text
//! filter     := '(' (op filter+ | criterion) ')'
//! op         := '&' | '|' | '!'
//! criterion  := attr comparator value
//! comparator := '=' | '<=' | '>=' | '<' | '>' | '~='
//! ```
//!
//! A bare `=*` is a presence test; any other `*` occurrence in a value —
//! escaped or not — is a substring hole, the comparator being chosen on
//! the raw text before unescaping. Parsed filters are normalized: single-child
//! `&`/`|` groups collapse, duplicate children are removed, and the
//! canonical string form ([`std::fmt::Display`]) re-parses to a
//! structurally equal filter.

use gantry_model::{Properties, Value};
use thiserror::Error;

mod parse;

#[cfg(test)]
mod str_tests;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid criterion ({0}, {1})")]
    InvalidCriterion(String, String),

    #[error("A 'not' group takes exactly one operand")]
    NotArity,
}

/// The characters that must be escaped in an LDAP string, besides the
/// escape character itself.
const ESCAPED_CHARACTERS: &str = "()&|=<>~*+#,;'\"";

/// Escapes a string so it can be embedded in a filter.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let chars: Vec<char> = value.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        let boundary_space = *c == ' ' && (i == 0 || i == chars.len() - 1);
        if *c == '\\' || boundary_space || ESCAPED_CHARACTERS.contains(*c) {
            out.push('\\');
        }
        out.push(*c);
    }
    out
}

/// Reverts [`escape`]: drops each escape character, keeping what follows.
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut escaped = false;
    for c in value.chars() {
        if !escaped && c == '\\' {
            escaped = true;
        } else {
            escaped = false;
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
    Not,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Operator::And => "&",
            Operator::Or => "|",
            Operator::Not => "!",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Approx,
    Lt,
    Le,
    Gt,
    Ge,
    Present,
    Substring,
    ApproxSubstring,
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Comparator::Eq | Comparator::Substring | Comparator::Present => "=",
            Comparator::Approx | Comparator::ApproxSubstring => "~=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        })
    }
}

/// A single `attr comparator value` test.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    name: String,
    value: String,
    comparator: Comparator,
    /// Substring segments (the value split on unescaped `*`), empty for
    /// non-substring comparators.
    parts: Vec<String>,
}

impl Criterion {
    /// Builds a plain criterion. Empty names and values are refused;
    /// substring and presence forms are derived from unescaped `*`s by
    /// the parser, not here.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        comparator: Comparator,
    ) -> Result<Self, Error> {
        let (name, value) = (name.into(), value.into());
        if name.is_empty() || value.is_empty() {
            return Err(Error::InvalidCriterion(name, value));
        }
        Ok(Self {
            name,
            value,
            comparator,
            parts: Vec::new(),
        })
    }

    pub(crate) fn substring(name: String, parts: Vec<String>, approx: bool) -> Self {
        Self {
            name,
            value: parts.join("*"),
            comparator: if approx {
                Comparator::ApproxSubstring
            } else {
                Comparator::Substring
            },
            parts,
        }
    }

    pub(crate) fn presence(name: String) -> Self {
        Self {
            name,
            value: "*".to_string(),
            comparator: Comparator::Present,
            parts: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn comparator(&self) -> Comparator {
        self.comparator
    }

    pub fn matches(&self, properties: &Properties) -> bool {
        let Some(tested) = properties.get(&self.name) else {
            return false;
        };

        match self.comparator {
            Comparator::Eq => compare_eq(&self.value, tested),
            Comparator::Approx => compare_approx(&self.value, tested),
            Comparator::Substring => compare_star(&self.parts, tested),
            Comparator::ApproxSubstring => compare_approx_star(&self.parts, tested),
            Comparator::Present => !tested.is_empty(),
            Comparator::Lt => compare_lt(&self.value, tested),
            Comparator::Le => compare_lt(&self.value, tested) || compare_eq(&self.value, tested),
            Comparator::Gt => compare_gt(&self.value, tested),
            Comparator::Ge => compare_gt(&self.value, tested) || compare_eq(&self.value, tested),
        }
    }
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}{}", escape(&self.name), self.comparator)?;
        match self.comparator {
            Comparator::Present => f.write_str("*")?,
            Comparator::Substring | Comparator::ApproxSubstring => {
                for (i, part) in self.parts.iter().enumerate() {
                    if i != 0 {
                        f.write_str("*")?;
                    }
                    f.write_str(&escape(part))?;
                }
            }
            _ => f.write_str(&escape(&self.value))?,
        }
        f.write_str(")")
    }
}

/// A normalized LDAP filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Criterion(Criterion),
    Group {
        operator: Operator,
        children: Vec<Filter>,
    },
}

impl Filter {
    /// Parses a filter string. Blank input yields `None`.
    pub fn parse(input: &str) -> Result<Option<Filter>, Error> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(None);
        }
        parse::parse_filter(input).map(Filter::normalize)
    }

    /// Conjunction of the given filters, normalized. `None` if empty.
    pub fn and(children: Vec<Filter>) -> Option<Filter> {
        Filter::Group {
            operator: Operator::And,
            children,
        }
        .normalize()
    }

    /// Disjunction of the given filters, normalized. `None` if empty.
    pub fn or(children: Vec<Filter>) -> Option<Filter> {
        Filter::Group {
            operator: Operator::Or,
            children,
        }
        .normalize()
    }

    /// Negation of a filter.
    pub fn not(child: Filter) -> Filter {
        Filter::Group {
            operator: Operator::Not,
            children: vec![child],
        }
    }

    /// Combines filters under the given operator: absent entries are
    /// skipped, a single survivor is returned unchanged, anything more is
    /// wrapped and normalized.
    pub fn combine(
        filters: impl IntoIterator<Item = Option<Filter>>,
        operator: Operator,
    ) -> Option<Filter> {
        let mut children: Vec<Filter> = filters.into_iter().flatten().collect();
        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Filter::Group { operator, children }.normalize(),
        }
    }

    /// Tests the filter against a property map.
    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Filter::Criterion(criterion) => criterion.matches(properties),
            Filter::Group { operator, children } => match operator {
                Operator::And => children.iter().all(|c| c.matches(properties)),
                Operator::Or => children.iter().any(|c| c.matches(properties)),
                Operator::Not => !children.iter().all(|c| c.matches(properties)),
            },
        }
    }

    /// Structural normalization: empty groups vanish, duplicate children
    /// are dropped, and a non-`not` group with a single child collapses
    /// into that child. Idempotent.
    pub fn normalize(self) -> Option<Filter> {
        match self {
            Filter::Criterion(_) => Some(self),
            Filter::Group { operator, children } => {
                let mut normalized: Vec<Filter> = Vec::with_capacity(children.len());
                for child in children {
                    if let Some(child) = child.normalize() {
                        if !normalized.contains(&child) {
                            normalized.push(child);
                        }
                    }
                }

                match normalized.len() {
                    0 => None,
                    1 if operator != Operator::Not => normalized.pop(),
                    _ => Some(Filter::Group {
                        operator,
                        children: normalized,
                    }),
                }
            }
        }
    }
}

impl From<Criterion> for Filter {
    fn from(value: Criterion) -> Self {
        Filter::Criterion(value)
    }
}

impl std::str::FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)?.ok_or_else(|| Error::Parse("empty filter".to_string()))
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Criterion(criterion) => write!(f, "{criterion}"),
            Filter::Group { operator, children } => {
                write!(f, "({operator}")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
        }
    }
}

// Comparator implementations. Filter values are strings; the tested value
// drives the interpretation.

fn string_form(value: &Value) -> String {
    value.to_string()
}

fn compare_eq(filter_value: &str, tested: &Value) -> bool {
    match tested {
        Value::List(items) => items.iter().any(|item| compare_eq(filter_value, item)),
        Value::Str(s) => filter_value == s,
        Value::Bool(b) => filter_value.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
        other => filter_value == string_form(other),
    }
}

fn compare_approx(filter_value: &str, tested: &Value) -> bool {
    let lower = filter_value.to_lowercase();
    let lowered = match tested {
        Value::Str(s) => Some(Value::Str(s.to_lowercase())),
        Value::List(items) => Some(Value::List(
            items
                .iter()
                .map(|item| match item {
                    Value::Str(s) => Value::Str(s.to_lowercase()),
                    other => other.clone(),
                })
                .collect(),
        )),
        _ => None,
    };

    if let Some(lowered) = &lowered {
        if compare_eq(&lower, lowered) {
            return true;
        }
    }

    // Fall back on the raw values
    compare_eq(filter_value, tested) || compare_eq(&lower, tested)
}

fn star_match(parts: &[String], tested: &str) -> bool {
    let mut idx = 0;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        let Some(found) = tested[idx..].find(part.as_str()) else {
            return false;
        };
        let at = idx + found;

        if i == 0 && !part.is_empty() && at != 0 {
            // First segment is anchored to the start
            return false;
        }
        if i == last && !part.is_empty() && at + part.len() != tested.len() {
            // Last segment is anchored to the end
            return false;
        }
        idx = at + part.len();
    }
    true
}

fn compare_star(parts: &[String], tested: &Value) -> bool {
    match tested {
        Value::List(items) => items.iter().any(|item| compare_star(parts, item)),
        Value::Str(s) => star_match(parts, s),
        _ => false,
    }
}

fn compare_approx_star(parts: &[String], tested: &Value) -> bool {
    let lower: Vec<String> = parts.iter().map(|p| p.to_lowercase()).collect();
    match tested {
        Value::List(items) => items.iter().any(|item| compare_approx_star(parts, item)),
        Value::Str(s) => star_match(&lower, &s.to_lowercase()) || star_match(parts, s),
        _ => false,
    }
}

/// `tested < filter_value`, with the filter value coerced to the tested
/// value's numeric type; integer comparisons fall back on floats. A failed
/// coercion compares false rather than raising.
fn compare_lt(filter_value: &str, tested: &Value) -> bool {
    match tested {
        Value::Int(i) => match filter_value.parse::<i64>() {
            Ok(fv) => *i < fv,
            Err(_) => match filter_value.parse::<f64>() {
                Ok(fv) => (*i as f64) < fv,
                Err(_) => false,
            },
        },
        Value::Float(f) => filter_value.parse::<f64>().is_ok_and(|fv| *f < fv),
        Value::Str(s) => s.as_str() < filter_value,
        _ => false,
    }
}

fn compare_gt(filter_value: &str, tested: &Value) -> bool {
    match tested {
        Value::Int(i) => match filter_value.parse::<i64>() {
            Ok(fv) => *i > fv,
            Err(_) => match filter_value.parse::<f64>() {
                Ok(fv) => (*i as f64) > fv,
                Err(_) => false,
            },
        },
        Value::Float(f) => filter_value.parse::<f64>().is_ok_and(|fv| *f > fv),
        Value::Str(s) => s.as_str() > filter_value,
        _ => false,
    }
}
