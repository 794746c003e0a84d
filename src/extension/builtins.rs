//! The extensions every environment starts with.

use indexmap::IndexMap;

use super::{
    Associativity, BinaryKind, BinaryOperator, Builtin, Callable, CallableKind, CoreTag, Extension,
    TagHandler, UnaryOperator, VisitorKind,
};
use crate::ast::Node;
use crate::error::{Error, Result};
use crate::runtime::{State, escape};
use crate::value::{BinaryOp, UnaryOp, Value, compare, loose_eq, range};

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn string_arg(args: &[Value], index: usize) -> String {
    args.get(index).map(ToString::to_string).unwrap_or_default()
}

/// Tags, operators, and the filters, functions and tests the compiler and
/// runtime depend on.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreExtension;

impl Extension for CoreExtension {
    fn name(&self) -> &str {
        "core"
    }

    fn token_parsers(&self) -> Vec<TagHandler> {
        [
            CoreTag::Apply,
            CoreTag::Block,
            CoreTag::Deprecated,
            CoreTag::Do,
            CoreTag::Embed,
            CoreTag::Extends,
            CoreTag::Flush,
            CoreTag::For,
            CoreTag::From,
            CoreTag::Guard,
            CoreTag::If,
            CoreTag::Import,
            CoreTag::Include,
            CoreTag::Macro,
            CoreTag::Set,
            CoreTag::Use,
            CoreTag::With,
        ]
        .into_iter()
        .map(TagHandler::Core)
        .collect()
    }

    fn filters(&self) -> Vec<Callable> {
        vec![
            Callable::builtin(CallableKind::Filter, "default", Builtin::Default).arguments(&["default"]),
            Callable::filter("upper", |_, args| Ok(Value::from(arg(args, 0).to_string().to_uppercase()))),
            Callable::filter("lower", |_, args| Ok(Value::from(arg(args, 0).to_string().to_lowercase()))),
            Callable::filter("trim", |_, args| trim(args)).arguments(&["character_mask", "side"]),
            Callable::filter("length", |_, args| length(&arg(args, 0))),
            Callable::filter("join", |_, args| join(args)).arguments(&["glue", "and"]),
            Callable::filter("keys", |_, args| {
                let value = arg(args, 0);
                if !value.is_iterable() {
                    return Ok(Value::from_seq(Vec::new()));
                }
                Ok(Value::from_seq(value.iterate()?.map(|(k, _)| k).collect()))
            }),
            Callable::filter("first", |_, args| Ok(edge(&arg(args, 0), true))),
            Callable::filter("last", |_, args| Ok(edge(&arg(args, 0), false))),
            Callable::filter("slice", |_, args| slice(args)).arguments(&["start", "length", "preserve_keys"]),
            Callable::filter("merge", |_, args| merge(&arg(args, 0), &arg(args, 1))),
            Callable::filter("map", |state, args| map(state, args)).arguments(&["arrow"]),
            Callable::filter("filter", |state, args| filter(state, args)).arguments(&["arrow"]),
            Callable::filter("reduce", |state, args| reduce(state, args)).arguments(&["arrow", "initial"]),
        ]
    }

    fn functions(&self) -> Vec<Callable> {
        vec![
            Callable::function("range", |_, args| {
                let step = args.get(2).and_then(Value::as_int).unwrap_or(1);
                range(&arg(args, 0), &arg(args, 1), step)
            })
            .arguments(&["low", "high", "step"]),
            Callable::builtin(CallableKind::Function, "include", Builtin::Include)
                .arguments(&["template", "variables", "with_context", "ignore_missing", "sandboxed"])
                .safe(&["all"]),
            Callable::function("source", |state, args| source(state, args))
                .needs_environment()
                .arguments(&["name", "ignore_missing"])
                .safe(&["all"]),
            Callable::builtin(CallableKind::Function, "block", Builtin::Block).safe(&["all"]),
            Callable::builtin(CallableKind::Function, "parent", Builtin::Parent).safe(&["all"]),
            Callable::builtin(CallableKind::Function, "attribute", Builtin::Attribute),
            Callable::function("max", |_, args| Ok(extreme(args, std::cmp::Ordering::Greater))).variadic(),
            Callable::function("min", |_, args| Ok(extreme(args, std::cmp::Ordering::Less))).variadic(),
            Callable::function("cycle", |_, args| cycle(&arg(args, 0), &arg(args, 1))).arguments(&["values", "position"]),
        ]
    }

    fn tests(&self) -> Vec<Callable> {
        vec![
            Callable::builtin(CallableKind::Test, "defined", Builtin::Defined),
            Callable::test("null", |_, args| Ok(Value::Bool(arg(args, 0).is_null()))),
            Callable::test("none", |_, args| Ok(Value::Bool(arg(args, 0).is_null()))),
            Callable::test("empty", |_, args| Ok(Value::Bool(arg(args, 0).is_empty()))),
            Callable::test("even", |_, args| {
                Ok(Value::Bool(arg(args, 0).as_int().is_some_and(|i| i.checked_rem(2) == Some(0))))
            }),
            Callable::test("odd", |_, args| {
                Ok(Value::Bool(arg(args, 0).as_int().is_some_and(|i| i.checked_rem(2) != Some(0))))
            }),
            Callable::test("iterable", |_, args| Ok(Value::Bool(arg(args, 0).is_iterable()))),
            Callable::test("same as", |_, args| Ok(Value::Bool(same_as(&arg(args, 0), &arg(args, 1)))))
                .one_mandatory_argument(),
            Callable::test("divisible by", |_, args| {
                let divisor = arg(args, 1).as_int().unwrap_or(0);
                if divisor == 0 {
                    return Err(Error::runtime("Modulo by zero."));
                }
                Ok(Value::Bool(arg(args, 0).as_int().is_some_and(|i| i.checked_rem(divisor) == Some(0))))
            })
            .one_mandatory_argument(),
            Callable::test("sequence", |_, args| Ok(Value::Bool(matches!(arg(args, 0), Value::Seq(_))))),
            Callable::test("mapping", |_, args| {
                Ok(Value::Bool(matches!(arg(args, 0), Value::Map(_) | Value::Object(_))))
            }),
        ]
    }

    fn unary_operators(&self) -> Vec<UnaryOperator> {
        vec![
            UnaryOperator::builtin("not", 50, UnaryOp::Not),
            UnaryOperator::builtin("-", 500, UnaryOp::Neg),
            UnaryOperator::builtin("+", 500, UnaryOp::Pos),
        ]
    }

    fn binary_operators(&self) -> Vec<BinaryOperator> {
        let mut ops = vec![
            BinaryOperator::builtin(BinaryOp::Or, 10),
            BinaryOperator::builtin(BinaryOp::Xor, 12),
            BinaryOperator::builtin(BinaryOp::And, 15),
            BinaryOperator::builtin(BinaryOp::BitOr, 16),
            BinaryOperator::builtin(BinaryOp::BitXor, 17),
            BinaryOperator::builtin(BinaryOp::BitAnd, 18),
        ];
        ops.extend(
            [
                BinaryOp::Eq,
                BinaryOp::Ne,
                BinaryOp::Spaceship,
                BinaryOp::Lt,
                BinaryOp::Gt,
                BinaryOp::Ge,
                BinaryOp::Le,
                BinaryOp::NotIn,
                BinaryOp::In,
                BinaryOp::Matches,
                BinaryOp::StartsWith,
                BinaryOp::EndsWith,
            ]
            .into_iter()
            .map(|op| BinaryOperator::builtin(op, 20)),
        );
        ops.extend([
            BinaryOperator::builtin(BinaryOp::Range, 25),
            BinaryOperator::builtin(BinaryOp::Add, 30),
            BinaryOperator::builtin(BinaryOp::Sub, 30),
            BinaryOperator::builtin(BinaryOp::Concat, 40),
            BinaryOperator::builtin(BinaryOp::Mul, 60),
            BinaryOperator::builtin(BinaryOp::Div, 60),
            BinaryOperator::builtin(BinaryOp::FloorDiv, 60),
            BinaryOperator::builtin(BinaryOp::Mod, 60),
            BinaryOperator::new("is", 100, Associativity::Left, BinaryKind::Is),
            BinaryOperator::new("is not", 100, Associativity::Left, BinaryKind::IsNot),
            BinaryOperator::new(BinaryOp::Pow.symbol(), 200, Associativity::Right, BinaryKind::Builtin(BinaryOp::Pow)),
            BinaryOperator::new("??", 300, Associativity::Right, BinaryKind::NullCoalesce),
        ]);
        ops
    }
}

/// Output escaping: the `escape` filter family and the autoescape pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct EscaperExtension;

/// The `escape` filter is safe for the strategy it was given.
fn escape_is_safe(arguments: &Node) -> Vec<String> {
    match arguments.get_node("0").or_else(|| arguments.get_node("strategy")) {
        Some(strategy) => strategy
            .constant_value()
            .map(|v| vec![v.to_string()])
            .unwrap_or_default(),
        None => vec!["html".to_owned()],
    }
}

fn escape_filter(state: &State<'_>, args: &[Value]) -> Result<Value> {
    let env = state
        .environment()
        .ok_or_else(|| Error::runtime("The \"escape\" filter needs the environment."))?;
    let strategy = match args.get(1) {
        Some(Value::Null) | None => "html".to_owned(),
        Some(v) => v.to_string(),
    };
    let charset = match args.get(2) {
        Some(Value::Null) | None => None,
        Some(v) => Some(v.to_string()),
    };
    let autoescape = args.get(3).is_some_and(Value::is_true);
    escape::escape(env, &arg(args, 0), &strategy, charset.as_deref(), autoescape)
}

impl Extension for EscaperExtension {
    fn name(&self) -> &str {
        "escaper"
    }

    fn token_parsers(&self) -> Vec<TagHandler> {
        vec![TagHandler::Core(CoreTag::AutoEscape)]
    }

    fn node_visitors(&self) -> Vec<VisitorKind> {
        vec![VisitorKind::Escaper]
    }

    fn filters(&self) -> Vec<Callable> {
        let escape = |name: &str| {
            Callable::filter(name, escape_filter)
                .needs_environment()
                .arguments(&["strategy", "charset", "autoescape"])
                .safe_callback(escape_is_safe)
        };
        vec![
            escape("escape"),
            escape("e"),
            Callable::filter("raw", |_, args| Ok(arg(args, 0))).safe(&["all"]),
        ]
    }
}

/// Compile-time tree simplification.
#[derive(Debug, Default, Clone, Copy)]
pub struct OptimizerExtension;

impl Extension for OptimizerExtension {
    fn name(&self) -> &str {
        "optimizer"
    }

    fn node_visitors(&self) -> Vec<VisitorKind> {
        vec![VisitorKind::Optimizer]
    }
}

fn trim(args: &[Value]) -> Result<Value> {
    let value = string_arg(args, 0);
    let mask: Vec<char> = match args.get(1) {
        Some(Value::Null) | None => vec![' ', '\t', '\n', '\r', '\0', '\x0B'],
        Some(v) => v.to_string().chars().collect(),
    };
    let trimmed = match args.get(2).map(ToString::to_string).as_deref() {
        None | Some("both") => value.trim_matches(mask.as_slice()),
        Some("left") => value.trim_start_matches(mask.as_slice()),
        Some("right") => value.trim_end_matches(mask.as_slice()),
        Some(other) => {
            return Err(Error::runtime(format!(
                "Trimming side must be \"left\", \"right\" or \"both\", \"{other}\" given."
            )));
        }
    };
    Ok(Value::from(trimmed))
}

fn length(value: &Value) -> Result<Value> {
    if let Some(len) = value.len() {
        return Ok(Value::from(len));
    }
    match value {
        Value::Iter(_) => Ok(Value::from(value.iterate()?.count())),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::Object(_) | Value::Template(_) => {
            Ok(Value::from(value.to_string().chars().count()))
        }
        Value::Null | Value::String(_) | Value::Markup(_) | Value::Seq(_) | Value::Map(_) => {
            Ok(Value::Int(0))
        }
    }
}

fn join(args: &[Value]) -> Result<Value> {
    let value = arg(args, 0);
    if !value.is_iterable() {
        return Ok(Value::from(""));
    }
    let glue = string_arg(args, 1);
    let items: Vec<String> = value.iterate()?.map(|(_, v)| v.to_string()).collect();
    let last_glue = match args.get(2) {
        Some(Value::Null) | None => None,
        Some(v) => Some(v.to_string()),
    };
    let joined = match (last_glue, items.split_last()) {
        (Some(and), Some((last, rest))) if !rest.is_empty() => {
            format!("{}{and}{last}", rest.join(&glue))
        }
        _ => items.join(&glue),
    };
    Ok(Value::from(joined))
}

/// First or last element of a sequence, mapping or string.
fn edge(value: &Value, first: bool) -> Value {
    match value {
        Value::Seq(items) => {
            let item = if first { items.first() } else { items.last() };
            item.cloned().unwrap_or_default()
        }
        Value::Map(map) => {
            let entry = if first { map.first() } else { map.last() };
            entry.map(|(_, v)| v.clone()).unwrap_or_default()
        }
        Value::String(s) | Value::Markup(s) => {
            let c = if first { s.chars().next() } else { s.chars().last() };
            c.map_or_else(|| Value::from(""), |c| Value::from(c.to_string()))
        }
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Iter(_)
        | Value::Object(_)
        | Value::Template(_) => Value::Null,
    }
}

/// Resolves `start`/`length` the way array slicing does: negative values
/// count from the end.
fn slice_bounds(len: usize, start: i64, length: Option<i64>) -> (usize, usize) {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let start = if start < 0 { len_i.saturating_add(start).max(0) } else { start.min(len_i) };
    let end = match length {
        None => len_i,
        Some(l) if l < 0 => len_i.saturating_add(l).max(start),
        Some(l) => start.saturating_add(l).min(len_i),
    };
    (
        usize::try_from(start).unwrap_or(0),
        usize::try_from(end).unwrap_or(0),
    )
}

fn slice(args: &[Value]) -> Result<Value> {
    let value = arg(args, 0);
    let start = arg(args, 1).as_int().unwrap_or(0);
    let length = args.get(2).filter(|v| !v.is_null()).and_then(Value::as_int);
    let preserve_keys = args.get(3).is_some_and(Value::is_true);
    match &value {
        Value::String(s) | Value::Markup(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (from, to) = slice_bounds(chars.len(), start, length);
            Ok(Value::from(chars.get(from..to).unwrap_or_default().iter().collect::<String>()))
        }
        Value::Seq(items) => {
            let (from, to) = slice_bounds(items.len(), start, length);
            let part = items.get(from..to).unwrap_or_default();
            if preserve_keys {
                return Ok(part
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.saturating_add(from).to_string(), v.clone()))
                    .collect());
            }
            Ok(Value::from_seq(part.to_vec()))
        }
        Value::Map(map) => {
            let (from, to) = slice_bounds(map.len(), start, length);
            Ok(Value::from_map(
                map.iter()
                    .skip(from)
                    .take(to.saturating_sub(from))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
        }
        Value::Iter(_) => {
            let items: Vec<Value> = value.iterate()?.map(|(_, v)| v).collect();
            slice(&[Value::from_seq(items), arg(args, 1), arg(args, 2), arg(args, 3)])
        }
        Value::Null => Ok(Value::Null),
        Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Object(_) | Value::Template(_) => {
            slice(&[Value::from(value.to_string()), arg(args, 1), arg(args, 2)])
        }
    }
}

fn merge(base: &Value, other: &Value) -> Result<Value> {
    match (base, other) {
        (Value::Seq(a), Value::Seq(b)) => {
            Ok(Value::from_seq(a.iter().chain(b.iter()).cloned().collect()))
        }
        (Value::Null, _) | (_, Value::Null) if base.is_iterable() || other.is_iterable() => {
            Ok(if base.is_null() { other.clone() } else { base.clone() })
        }
        _ if base.is_iterable() && other.is_iterable() => {
            let mut merged = IndexMap::new();
            for (k, v) in base.iterate()?.chain(other.iterate()?) {
                merged.insert(k.to_string(), v);
            }
            Ok(Value::from_map(merged))
        }
        _ => Err(Error::runtime(format!(
            "The merge filter only works with sequences or mappings, got \"{}\" and \"{}\".",
            base.kind_name(),
            other.kind_name()
        ))),
    }
}

/// The items and the arrow function handed to `map`, `filter` or `reduce`.
fn arrow_input(filter: &str, args: &[Value]) -> Result<(Value, Value)> {
    let items = arg(args, 0);
    if !items.is_iterable() && !items.is_null() {
        return Err(Error::runtime(format!(
            "The \"{filter}\" filter expects a sequence or a mapping, got \"{}\".",
            items.kind_name()
        )));
    }
    let arrow = arg(args, 1);
    if !arrow.is_callable() {
        return Err(Error::runtime(format!(
            "The \"{filter}\" filter expects an arrow function, got \"{}\".",
            arrow.kind_name()
        )));
    }
    Ok((items, arrow))
}

/// Rebuilds the shape of `items`: mappings keep their keys, everything else
/// becomes a sequence.
fn collect_like(items: &Value, pairs: Vec<(Value, Value)>) -> Value {
    if let Value::Map(_) = items {
        Value::from_map(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    } else {
        Value::from_seq(pairs.into_iter().map(|(_, v)| v).collect())
    }
}

/// `items|map((value, key) => ...)`.
fn map(state: &State<'_>, args: &[Value]) -> Result<Value> {
    let (items, arrow) = arrow_input("map", args)?;
    let mut mapped = Vec::new();
    for (key, value) in items.iterate()? {
        let result = arrow.call(state, &[value, key.clone()])?;
        mapped.push((key, result));
    }
    Ok(collect_like(&items, mapped))
}

/// `items|filter((value, key) => ...)`, keeping the items the arrow accepts.
fn filter(state: &State<'_>, args: &[Value]) -> Result<Value> {
    let (items, arrow) = arrow_input("filter", args)?;
    let mut kept = Vec::new();
    for (key, value) in items.iterate()? {
        if arrow.call(state, &[value.clone(), key.clone()])?.is_true() {
            kept.push((key, value));
        }
    }
    Ok(collect_like(&items, kept))
}

/// `items|reduce((carry, value, key) => ..., initial)`.
fn reduce(state: &State<'_>, args: &[Value]) -> Result<Value> {
    let (items, arrow) = arrow_input("reduce", args)?;
    let mut carry = arg(args, 2);
    for (key, value) in items.iterate()? {
        carry = arrow.call(state, &[carry, value, key])?;
    }
    Ok(carry)
}

fn source(state: &State<'_>, args: &[Value]) -> Result<Value> {
    let env = state
        .environment()
        .ok_or_else(|| Error::runtime("The \"source\" function needs the environment."))?;
    let name = string_arg(args, 0);
    match env.loader().source(&name) {
        Ok(source) => Ok(Value::from(source.code())),
        Err(Error::Loader(_)) if args.get(1).is_some_and(Value::is_true) => Ok(Value::from("")),
        Err(e) => Err(e),
    }
}

/// `max`/`min` over either a single iterable argument or the arguments.
fn extreme(args: &[Value], wanted: std::cmp::Ordering) -> Value {
    let items: Vec<Value> = match args {
        [single] if single.is_iterable() => single
            .iterate()
            .map(|it| it.map(|(_, v)| v).collect())
            .unwrap_or_default(),
        _ => args.to_vec(),
    };
    items
        .into_iter()
        .reduce(|best, item| if compare(&item, &best) == Some(wanted) { item } else { best })
        .unwrap_or_default()
}

fn cycle(values: &Value, position: &Value) -> Result<Value> {
    let items: Vec<Value> = match values {
        Value::Seq(items) => items.to_vec(),
        Value::Map(_) | Value::Iter(_) => values.iterate()?.map(|(_, v)| v).collect(),
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::String(_)
        | Value::Markup(_)
        | Value::Object(_)
        | Value::Template(_) => return Ok(values.clone()),
    };
    if items.is_empty() {
        return Err(Error::runtime("The \"cycle\" function does not work on empty sequences."));
    }
    let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
    let index = position.as_int().unwrap_or(0).rem_euclid(len);
    Ok(usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i).cloned())
        .unwrap_or_default())
}

/// Identity: same type and same value.
fn same_as(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::String(x) | Value::Markup(x), Value::String(y) | Value::Markup(y)) => x == y,
        (Value::Seq(x), Value::Seq(y)) => x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| same_as(p, q)),
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|((kp, p), (kq, q))| kp == kq && same_as(p, q))
        }
        (Value::Object(x), Value::Object(y)) => std::sync::Arc::ptr_eq(x, y),
        (Value::Template(x), Value::Template(y)) => std::sync::Arc::ptr_eq(x, y),
        _ => loose_eq(a, b) && a.kind_name() == b.kind_name(),
    }
}
