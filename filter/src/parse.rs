use super::{Comparator, Criterion, Error, Filter, Operator};
use winnow::{
    ModalResult, Parser,
    ascii::multispace0,
    combinator::{alt, delimited, preceded, repeat},
    token::{any, none_of, one_of},
};

pub(crate) fn parse_filter(input: &str) -> Result<Filter, Error> {
    parse_expr
        .parse(input)
        .map_err(|e| Error::Parse(e.to_string()))
}

// filter := '(' (op filter+ | criterion) ')'
fn parse_expr(input: &mut &str) -> ModalResult<Filter> {
    delimited(
        ('(', multispace0),
        alt((parse_group, parse_criterion)),
        (multispace0, ')'),
    )
    .parse_next(input)
}

fn parse_group(input: &mut &str) -> ModalResult<Filter> {
    (
        one_of(['&', '|', '!']),
        repeat(1.., preceded(multispace0, parse_expr)),
    )
        .verify(|(operator, children): &(char, Vec<Filter>)| {
            *operator != '!' || children.len() == 1
        })
        .map(|(operator, children)| Filter::Group {
            operator: match operator {
                '&' => Operator::And,
                '|' => Operator::Or,
                _ => Operator::Not,
            },
            children,
        })
        .parse_next(input)
}

// Characters are collected together with their escaped-ness, so that
// `\ ` and friends survive trimming and the presence test.
fn escaped_char(input: &mut &str) -> ModalResult<(char, bool)> {
    preceded('\\', any).map(|c| (c, true)).parse_next(input)
}

fn attr_char(input: &mut &str) -> ModalResult<(char, bool)> {
    alt((
        escaped_char,
        none_of(['=', '<', '>', '~', '(', ')']).map(|c| (c, false)),
    ))
    .parse_next(input)
}

fn value_char(input: &mut &str) -> ModalResult<(char, bool)> {
    alt((escaped_char, none_of(['(', ')']).map(|c| (c, false)))).parse_next(input)
}

fn parse_comparator(input: &mut &str) -> ModalResult<Comparator> {
    alt((
        "<=".value(Comparator::Le),
        ">=".value(Comparator::Ge),
        "~=".value(Comparator::Approx),
        "=".value(Comparator::Eq),
        "<".value(Comparator::Lt),
        ">".value(Comparator::Gt),
    ))
    .parse_next(input)
}

fn parse_criterion(input: &mut &str) -> ModalResult<Filter> {
    (
        repeat(1.., attr_char),
        parse_comparator,
        repeat(0.., value_char),
    )
        .try_map(
            |(name, comparator, value): (Vec<(char, bool)>, _, Vec<(char, bool)>)| {
                build_criterion(&name, comparator, &value)
            },
        )
        .parse_next(input)
}

/// Trims unescaped whitespace from both ends.
fn trim(raw: &[(char, bool)]) -> &[(char, bool)] {
    let start = raw
        .iter()
        .position(|&(c, escaped)| escaped || !c.is_whitespace())
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|&(c, escaped)| escaped || !c.is_whitespace())
        .map_or(start, |p| p + 1);
    &raw[start..end]
}

fn collect(raw: &[(char, bool)]) -> String {
    raw.iter().map(|&(c, _)| c).collect()
}

fn build_criterion(
    name: &[(char, bool)],
    comparator: Comparator,
    value: &[(char, bool)],
) -> Result<Filter, Error> {
    let name = collect(trim(name));
    let value = trim(value);
    if name.is_empty() || value.is_empty() {
        return Err(Error::InvalidCriterion(name, collect(value)));
    }

    // A bare unescaped star is a presence test
    if value == [('*', false)] {
        return Ok(Criterion::presence(name).into());
    }

    // Any other star switches the equality-shaped comparators to
    // substring matching. The decision is made on the raw value, before
    // unescaping: escaping a star does not defuse it. Ordering
    // comparators keep stars as literals.
    if value.iter().any(|&(c, _)| c == '*')
        && matches!(comparator, Comparator::Eq | Comparator::Approx)
    {
        let mut parts = Vec::new();
        let mut current = String::new();
        for &(c, _) in value {
            if c == '*' {
                parts.push(std::mem::take(&mut current));
            } else {
                current.push(c);
            }
        }
        parts.push(current);

        return Ok(Criterion::substring(name, parts, comparator == Comparator::Approx).into());
    }

    Criterion::new(name, collect(value), comparator).map(Into::into)
}
