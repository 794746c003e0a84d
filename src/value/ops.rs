use std::cmp::Ordering;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Value;
use crate::error::{Error, Result};

/// Built-in binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Or,
    And,
    Xor,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Ne,
    Lt,
    Gt,
    Ge,
    Le,
    Spaceship,
    In,
    NotIn,
    Matches,
    StartsWith,
    EndsWith,
    Range,
    Add,
    Sub,
    Concat,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinaryOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Or => "or",
            Self::And => "and",
            Self::Xor => "xor",
            Self::BitOr => "b-or",
            Self::BitXor => "b-xor",
            Self::BitAnd => "b-and",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Spaceship => "<=>",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Matches => "matches",
            Self::StartsWith => "starts with",
            Self::EndsWith => "ends with",
            Self::Range => "..",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Concat => "~",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    const fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

/// Parses strings the way arithmetic sees them: optional surrounding
/// whitespace, an optional sign, digits with an optional fraction and
/// exponent. Words such as `inf` or `nan` are not numbers.
fn parse_numeric(s: &str) -> Option<Number> {
    let s = s.trim();
    let body = s.strip_prefix(['+', '-']).unwrap_or(s);
    if body.is_empty()
        || !body.starts_with(|c: char| c.is_ascii_digit() || c == '.')
        || !body
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::Int(i));
    }
    s.parse::<f64>().ok().map(Number::Float)
}

fn to_number(value: &Value) -> Option<Number> {
    match value {
        Value::Null => Some(Number::Int(0)),
        Value::Bool(b) => Some(Number::Int(i64::from(*b))),
        Value::Int(i) => Some(Number::Int(*i)),
        Value::Float(f) => Some(Number::Float(*f)),
        Value::String(s) | Value::Markup(s) => parse_numeric(s),
        Value::Seq(_) | Value::Map(_) | Value::Iter(_) | Value::Object(_) | Value::Template(_) => {
            None
        }
    }
}

fn operand_error(op: BinaryOp, a: &Value, b: &Value) -> Error {
    Error::runtime(format!(
        "Unsupported operand types: {} {} {}.",
        a.kind_name(),
        op.symbol(),
        b.kind_name()
    ))
}

fn numbers(op: BinaryOp, a: &Value, b: &Value) -> Result<(Number, Number)> {
    match (to_number(a), to_number(b)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(operand_error(op, a, b)),
    }
}

fn integers(op: BinaryOp, a: &Value, b: &Value) -> Result<(i64, i64)> {
    let (x, y) = numbers(op, a, b)?;
    let int = |n: Number| match n {
        Number::Int(i) => i,
        Number::Float(f) => f as i64,
    };
    Ok((int(x), int(y)))
}

fn arithmetic(
    op: BinaryOp,
    a: &Value,
    b: &Value,
    checked: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Value> {
    Ok(match numbers(op, a, b)? {
        (Number::Int(x), Number::Int(y)) => checked(x, y)
            .map_or_else(|| Value::Float(float(x as f64, y as f64)), Value::Int),
        (x, y) => Value::Float(float(x.as_f64(), y.as_f64())),
    })
}

fn is_scalar_string(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Markup(_))
}

/// Equality with the loose conversions templates expect: numeric strings
/// equal the numbers they spell, `null` equals `false`, `0` and `""`.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Seq(x), Value::Seq(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| loose_eq(l, r))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| loose_eq(v, other)))
        }
        (Value::Object(x), Value::Object(y)) => Arc::ptr_eq(x, y),
        (Value::Template(x), Value::Template(y)) => Arc::ptr_eq(x, y),
        _ => compare(a, b) == Some(Ordering::Equal),
    }
}

/// Ordering used by the comparison operators; `None` when the values cannot
/// be compared.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Bool(_), _) | (_, Value::Bool(_)) => Some(a.is_true().cmp(&b.is_true())),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, other) | (other, Value::Null) if is_scalar_string(other) => {
            let s = other.as_str().unwrap_or("");
            let ordering = "".cmp(s);
            Some(if matches!(a, Value::Null) {
                ordering
            } else {
                ordering.reverse()
            })
        }
        (Value::Null, Value::Seq(_) | Value::Map(_)) | (Value::Seq(_) | Value::Map(_), Value::Null) => {
            Some(a.is_true().cmp(&b.is_true()))
        }
        (Value::Seq(x), Value::Seq(y)) => {
            if x.len() != y.len() {
                return Some(x.len().cmp(&y.len()));
            }
            for (l, r) in x.iter().zip(y.iter()) {
                let ordering = compare(l, r)?;
                if ordering != Ordering::Equal {
                    return Some(ordering);
                }
            }
            Some(Ordering::Equal)
        }
        (Value::String(x) | Value::Markup(x), Value::String(y) | Value::Markup(y)) => {
            match (parse_numeric(x), parse_numeric(y)) {
                (Some(l), Some(r)) => compare_numbers(l, r),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Int(_) | Value::Float(_), Value::String(s) | Value::Markup(s)) => {
            match parse_numeric(s) {
                Some(r) => compare_numbers(to_number(a)?, r),
                None => Some(a.to_string().as_str().cmp(&**s)),
            }
        }
        (Value::String(s) | Value::Markup(s), Value::Int(_) | Value::Float(_)) => {
            match parse_numeric(s) {
                Some(l) => compare_numbers(l, to_number(b)?),
                None => Some((**s).cmp(b.to_string().as_str())),
            }
        }
        _ => compare_numbers(to_number(a)?, to_number(b)?),
    }
}

fn compare_numbers(a: Number, b: Number) -> Option<Ordering> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => Some(x.cmp(&y)),
        (x, y) => x.as_f64().partial_cmp(&y.as_f64()),
    }
}

/// `needle in haystack`.
fn contains(needle: &Value, haystack: &Value) -> bool {
    match haystack {
        Value::Seq(items) => items.iter().any(|item| loose_eq(needle, item)),
        Value::Map(map) => map.values().any(|item| loose_eq(needle, item)),
        Value::String(s) | Value::Markup(s) => {
            matches!(needle, Value::String(_) | Value::Markup(_) | Value::Int(_) | Value::Float(_))
                && s.contains(needle.to_string().as_str())
        }
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Iter(_)
        | Value::Object(_)
        | Value::Template(_) => false,
    }
}

/// Compiles a delimited pattern such as `/^a.+$/i`.
fn compile_pattern(pattern: &str) -> Result<Regex> {
    let invalid = || Error::runtime(format!("Invalid regular expression \"{pattern}\"."));
    let trimmed = pattern.trim_start();
    let open = trimmed.chars().next().ok_or_else(invalid)?;
    if open.is_alphanumeric() || open == '\\' {
        return Err(invalid());
    }
    let close = match open {
        '(' => ')',
        '[' => ']',
        '{' => '}',
        '<' => '>',
        other => other,
    };
    let body = trimmed.get(open.len_utf8()..).ok_or_else(invalid)?;
    let end = body.rfind(close).ok_or_else(invalid)?;
    let expression = body.get(..end).ok_or_else(invalid)?;
    let flags = body.get(end.saturating_add(close.len_utf8())..).unwrap_or("");

    let mut inline = String::new();
    for flag in flags.chars() {
        match flag {
            'i' | 'm' | 's' | 'x' => inline.push(flag),
            'u' | 'D' => {}
            _ => return Err(invalid()),
        }
    }
    let source = if inline.is_empty() {
        expression.to_owned()
    } else {
        format!("(?{inline}){expression}")
    };
    Regex::new(&source).map_err(|e| {
        Error::Runtime(crate::error::RuntimeError::with_source(
            format!("Invalid regular expression \"{pattern}\"."),
            e,
        ))
    })
}

/// `low..high` for integers and single characters.
pub(crate) fn range(low: &Value, high: &Value, step: i64) -> Result<Value> {
    if step == 0 {
        return Err(Error::runtime("The step of a range cannot be zero."));
    }
    let step = step.unsigned_abs();
    let chars = |v: &Value| {
        v.as_str()
            .filter(|s| s.chars().count() == 1 && parse_numeric(s).is_none())
            .and_then(|s| s.chars().next())
    };
    if let (Some(a), Some(b)) = (chars(low), chars(high)) {
        let (a, b) = (u32::from(a), u32::from(b));
        let step = usize::try_from(step).unwrap_or(usize::MAX);
        let items: Vec<Value> = if a <= b {
            (a..=b).step_by(step).filter_map(char::from_u32).map(|c| Value::from(c.to_string())).collect()
        } else {
            (b..=a).rev().step_by(step).filter_map(char::from_u32).map(|c| Value::from(c.to_string())).collect()
        };
        return Ok(Value::from_seq(items));
    }

    let (a, b) = integers(BinaryOp::Range, low, high)?;
    let step = usize::try_from(step).unwrap_or(usize::MAX);
    let items: Vec<Value> = if a <= b {
        (a..=b).step_by(step).map(Value::Int).collect()
    } else {
        (b..=a).rev().step_by(step).map(Value::Int).collect()
    };
    Ok(Value::from_seq(items))
}

/// Applies a built-in binary operator to two evaluated operands.
///
/// `and`/`or` never reach here from compiled code (they short-circuit), but
/// are handled for completeness.
///
/// # Errors
///
/// Arithmetic on values that are not numbers, division or modulo by zero, and
/// invalid `matches` patterns.
pub fn binary_op(op: BinaryOp, a: &Value, b: &Value) -> Result<Value> {
    Ok(match op {
        BinaryOp::Or => Value::Bool(a.is_true() || b.is_true()),
        BinaryOp::And => Value::Bool(a.is_true() && b.is_true()),
        BinaryOp::Xor => Value::Bool(a.is_true() ^ b.is_true()),
        BinaryOp::BitOr => {
            let (x, y) = integers(op, a, b)?;
            Value::Int(x | y)
        }
        BinaryOp::BitXor => {
            let (x, y) = integers(op, a, b)?;
            Value::Int(x ^ y)
        }
        BinaryOp::BitAnd => {
            let (x, y) = integers(op, a, b)?;
            Value::Int(x & y)
        }
        BinaryOp::Eq => Value::Bool(loose_eq(a, b)),
        BinaryOp::Ne => Value::Bool(!loose_eq(a, b)),
        BinaryOp::Lt => Value::Bool(compare(a, b) == Some(Ordering::Less)),
        BinaryOp::Gt => Value::Bool(compare(a, b) == Some(Ordering::Greater)),
        BinaryOp::Le => Value::Bool(matches!(
            compare(a, b),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Ge => Value::Bool(matches!(
            compare(a, b),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::Spaceship => Value::Int(match compare(a, b) {
            Some(Ordering::Less) => -1,
            Some(Ordering::Greater) => 1,
            Some(Ordering::Equal) | None => 0,
        }),
        BinaryOp::In => Value::Bool(contains(a, b)),
        BinaryOp::NotIn => Value::Bool(!contains(a, b)),
        BinaryOp::Matches => {
            let pattern = b.to_string();
            Value::Bool(compile_pattern(&pattern)?.is_match(&a.to_string()))
        }
        BinaryOp::StartsWith => Value::Bool(match (a.as_str(), b.as_str()) {
            (Some(s), Some(prefix)) => s.starts_with(prefix),
            _ => false,
        }),
        BinaryOp::EndsWith => Value::Bool(match (a.as_str(), b.as_str()) {
            (Some(s), Some(suffix)) => s.ends_with(suffix),
            _ => false,
        }),
        BinaryOp::Range => range(a, b, 1)?,
        BinaryOp::Add => arithmetic(op, a, b, i64::checked_add, |x, y| x + y)?,
        BinaryOp::Sub => arithmetic(op, a, b, i64::checked_sub, |x, y| x - y)?,
        BinaryOp::Mul => arithmetic(op, a, b, i64::checked_mul, |x, y| x * y)?,
        BinaryOp::Concat => Value::from(format!("{a}{b}")),
        BinaryOp::Div => {
            let (x, y) = numbers(op, a, b)?;
            if y.as_f64() == 0.0 {
                return Err(Error::runtime("Division by zero."));
            }
            match (x, y) {
                (Number::Int(x), Number::Int(y)) if x.checked_rem(y) == Some(0) => {
                    x.checked_div(y).map_or(Value::Float(x as f64 / y as f64), Value::Int)
                }
                (x, y) => Value::Float(x.as_f64() / y.as_f64()),
            }
        }
        BinaryOp::FloorDiv => {
            let (x, y) = numbers(op, a, b)?;
            if y.as_f64() == 0.0 {
                return Err(Error::runtime("Division by zero."));
            }
            match (x, y) {
                (Number::Int(x), Number::Int(y)) => x
                    .checked_div_euclid(y)
                    .map_or(Value::Float((x as f64 / y as f64).floor()), |q| {
                        Value::Int(if y < 0 && x.rem_euclid(y) != 0 { q.saturating_sub(1) } else { q })
                    }),
                (x, y) => Value::Int((x.as_f64() / y.as_f64()).floor() as i64),
            }
        }
        BinaryOp::Mod => {
            let (x, y) = integers(op, a, b)?;
            if y == 0 {
                return Err(Error::runtime("Modulo by zero."));
            }
            Value::Int(x.checked_rem(y).unwrap_or(0))
        }
        BinaryOp::Pow => match numbers(op, a, b)? {
            (Number::Int(x), Number::Int(y)) if y >= 0 => u32::try_from(y)
                .ok()
                .and_then(|y| x.checked_pow(y))
                .map_or_else(|| Value::Float((x as f64).powf(y as f64)), Value::Int),
            (x, y) => Value::Float(x.as_f64().powf(y.as_f64())),
        },
    })
}

/// Applies a built-in unary operator.
///
/// # Errors
///
/// Negating or taking the numeric value of something that is not a number.
pub fn unary_op(op: UnaryOp, value: &Value) -> Result<Value> {
    let number = || {
        to_number(value).ok_or_else(|| {
            Error::runtime(format!(
                "Unsupported operand type for unary operator: {}.",
                value.kind_name()
            ))
        })
    };
    Ok(match op {
        UnaryOp::Not => Value::Bool(!value.is_true()),
        UnaryOp::Neg => match number()? {
            Number::Int(i) => i.checked_neg().map_or(Value::Float(-(i as f64)), Value::Int),
            Number::Float(f) => Value::Float(-f),
        },
        UnaryOp::Pos => match number()? {
            Number::Int(i) => Value::Int(i),
            Number::Float(f) => Value::Float(f),
        },
    })
}

