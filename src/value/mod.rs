mod ops;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::runtime::{State, Template};

pub use ops::{BinaryOp, UnaryOp, binary_op, compare, loose_eq, unary_op};
pub(crate) use ops::range;

/// A host value exposed to templates.
///
/// Attribute access (`obj.name`, `obj.name(...)`) goes through this trait, and
/// so do the sandbox's method and property checks, which match on
/// [`Object::class_name`].
pub trait Object: fmt::Debug + Send + Sync {
    fn class_name(&self) -> &str;

    /// Returns `None` when the object has no such property.
    fn get_property(&self, _name: &str) -> Option<Value> {
        None
    }

    fn has_method(&self, _name: &str) -> bool {
        false
    }

    /// Calls a method. Only invoked when [`Object::has_method`] returned true.
    ///
    /// # Errors
    ///
    /// Whatever the host method raises, surfaced to the template as a runtime
    /// error.
    fn call_method(&self, name: &str, _args: &[Value]) -> Result<Value> {
        Err(crate::error::Error::runtime(format!(
            "Method \"{name}\" does not exist on a \"{}\" object.",
            self.class_name()
        )))
    }

    fn is_callable(&self) -> bool {
        false
    }

    /// Invokes the object as a function, for objects that are callable.
    ///
    /// # Errors
    ///
    /// The default implementation always fails.
    fn call(&self, _state: &State<'_>, _args: &[Value]) -> Result<Value> {
        Err(crate::error::Error::runtime(format!(
            "A \"{}\" object is not callable.",
            self.class_name()
        )))
    }

    /// String form used when the object is printed, if it has one.
    fn to_display(&self) -> Option<String> {
        None
    }
}

/// A single-use, non-countable sequence: loops over it cannot know their
/// length up front.
#[derive(Clone)]
pub struct ValueIter(Arc<Mutex<Option<Box<dyn Iterator<Item = Value> + Send>>>>);

impl ValueIter {
    fn take(&self) -> Option<Box<dyn Iterator<Item = Value> + Send>> {
        self.0.lock().take()
    }
}

impl fmt::Debug for ValueIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueIter")
    }
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    /// A string that is already safe and must not be escaped again.
    Markup(Arc<str>),
    Seq(Arc<Vec<Value>>),
    Map(Arc<IndexMap<String, Value>>),
    Iter(ValueIter),
    Object(Arc<dyn Object>),
    Template(Arc<Template>),
}

impl Value {
    pub fn markup<S: AsRef<str>>(s: S) -> Self {
        Self::Markup(Arc::from(s.as_ref()))
    }

    pub fn from_seq(items: Vec<Self>) -> Self {
        Self::Seq(Arc::new(items))
    }

    pub fn from_map(map: IndexMap<String, Self>) -> Self {
        Self::Map(Arc::new(map))
    }

    pub fn from_object<O: Object + 'static>(object: O) -> Self {
        Self::Object(Arc::new(object))
    }

    /// Whether [`Value::call`] can invoke this value.
    pub fn is_callable(&self) -> bool {
        if let Self::Object(object) = self {
            object.is_callable()
        } else {
            false
        }
    }

    /// Calls an arrow function (or any callable host object) from inside a
    /// filter, function or test.
    ///
    /// # Errors
    ///
    /// When the value is not callable, or whatever the call itself raises.
    pub fn call(&self, state: &State<'_>, args: &[Self]) -> Result<Self> {
        if let Self::Object(object) = self {
            object.call(state, args)
        } else {
            Err(crate::error::Error::runtime(format!(
                "A \"{}\" value is not callable.",
                self.kind_name()
            )))
        }
    }

    /// Wraps an iterator whose length is unknown.
    pub fn from_iter_uncounted<I>(iter: I) -> Self
    where
        I: Iterator<Item = Self> + Send + 'static,
    {
        Self::Iter(ValueIter(Arc::new(Mutex::new(Some(Box::new(iter))))))
    }

    pub fn kind_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Markup(_) => "markup",
            Self::Seq(_) => "sequence",
            Self::Map(_) => "mapping",
            Self::Iter(_) => "iterator",
            Self::Object(o) => o.class_name(),
            Self::Template(_) => "template",
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn is_markup(&self) -> bool {
        matches!(self, Self::Markup(_))
    }

    /// Template truthiness.
    pub fn is_true(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) | Self::Markup(s) => !s.is_empty() && &**s != "0",
            Self::Seq(s) => !s.is_empty(),
            Self::Map(m) => !m.is_empty(),
            Self::Iter(_) | Self::Object(_) | Self::Template(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Self::String(s) | Self::Markup(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Self::String(s) => s.trim().parse().ok(),
            Self::Null
            | Self::Float(_)
            | Self::Markup(_)
            | Self::Seq(_)
            | Self::Map(_)
            | Self::Iter(_)
            | Self::Object(_)
            | Self::Template(_) => None,
        }
    }

    /// Number of items, for countable values only.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::String(s) | Self::Markup(s) => Some(s.chars().count()),
            Self::Seq(s) => Some(s.len()),
            Self::Map(m) => Some(m.len()),
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Iter(_) | Self::Object(_) | Self::Template(_) => {
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(b) => !*b,
            Self::String(s) | Self::Markup(s) => s.is_empty(),
            Self::Seq(s) => s.is_empty(),
            Self::Map(m) => m.is_empty(),
            Self::Int(_) | Self::Float(_) | Self::Iter(_) | Self::Object(_) | Self::Template(_) => {
                false
            }
        }
    }

    pub const fn is_iterable(&self) -> bool {
        matches!(self, Self::Seq(_) | Self::Map(_) | Self::Iter(_))
    }

    /// Looks up `key` for `[]` access: sequences by position, mappings by key.
    pub fn get_item(&self, key: &Self) -> Option<Self> {
        if let Self::Seq(items) = self {
            let index = usize::try_from(key.as_int()?).ok()?;
            items.get(index).cloned()
        } else if let Self::Map(map) = self {
            map.get(key.to_string().as_str()).cloned()
        } else {
            None
        }
    }

    /// Starts iterating, yielding `(key, value)` pairs.
    pub(crate) fn iterate(&self) -> Result<Iteration> {
        match self {
            Self::Seq(items) => Ok(Iteration::Seq(Arc::clone(items), 0)),
            Self::Map(map) => Ok(Iteration::Map(Arc::clone(map), 0)),
            Self::Iter(iter) => Ok(iter.take().map_or(Iteration::Empty, |it| Iteration::Dyn(it, 0))),
            Self::Null => Ok(Iteration::Empty),
            Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::String(_)
            | Self::Markup(_)
            | Self::Object(_)
            | Self::Template(_) => Err(crate::error::Error::runtime(format!(
                "Value of type \"{}\" is not iterable.",
                self.kind_name()
            ))),
        }
    }
}

/// Cursor over an iterable value.
pub(crate) enum Iteration {
    Seq(Arc<Vec<Value>>, usize),
    Map(Arc<IndexMap<String, Value>>, usize),
    Dyn(Box<dyn Iterator<Item = Value> + Send>, i64),
    Empty,
}

impl Iteration {
    /// Total length, when known without consuming anything.
    pub(crate) fn len(&self) -> Option<usize> {
        match self {
            Self::Seq(items, _) => Some(items.len()),
            Self::Map(map, _) => Some(map.len()),
            Self::Dyn(..) => None,
            Self::Empty => Some(0),
        }
    }
}

impl Iterator for Iteration {
    type Item = (Value, Value);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Seq(items, pos) => {
                let item = items.get(*pos)?.clone();
                let key = Value::from(*pos);
                *pos = pos.saturating_add(1);
                Some((key, item))
            }
            Self::Map(map, pos) => {
                let (k, v) = map.get_index(*pos)?;
                *pos = pos.saturating_add(1);
                Some((map_key_value(k), v.clone()))
            }
            Self::Dyn(iter, pos) => {
                let item = iter.next()?;
                let key = Value::Int(*pos);
                *pos = pos.saturating_add(1);
                Some((key, item))
            }
            Self::Empty => None,
        }
    }
}

/// Mapping keys are stored as strings; integer-looking keys come back out as
/// integers.
fn map_key_value(key: &str) -> Value {
    key.parse::<i64>()
        .ok()
        .filter(|i| i.to_string() == key)
        .map_or_else(|| Value::from(key), Value::Int)
}

pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NAN".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "INF" } else { "-INF" }.to_owned();
    }
    if f.fract() == 0.0 && f.abs() < 1e15 {
        return format!("{f:.0}");
    }
    let magnitude = f.abs().log10().floor();
    let digits = (13.0 - magnitude).clamp(0.0, 17.0);
    let mut s = format!("{f:.prec$}", prec = digits as usize);
    if s.contains('.') {
        let trimmed = s.trim_end_matches('0').trim_end_matches('.').len();
        s.truncate(trimmed);
    }
    s
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null | Self::Bool(false) => Ok(()),
            Self::Bool(true) => f.write_str("1"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => f.write_str(&format_float(*v)),
            Self::String(s) | Self::Markup(s) => f.write_str(s),
            Self::Seq(_) | Self::Map(_) => f.write_str("Array"),
            Self::Iter(_) => f.write_str("Iterator"),
            Self::Object(o) => match o.to_display() {
                Some(s) => f.write_str(&s),
                None => f.write_str(o.class_name()),
            },
            Self::Template(t) => f.write_str(t.name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        loose_eq(self, other)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(Arc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(Arc::from(value))
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Self::from_seq(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<IndexMap<String, Self>> for Value {
    fn from(value: IndexMap<String, Self>) -> Self {
        Self::from_map(value)
    }
}

impl From<Arc<Template>> for Value {
    fn from(value: Arc<Template>) -> Self {
        Self::Template(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            serde_json::Value::String(s) => Self::from(s),
            serde_json::Value::Array(items) => {
                Self::from_seq(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::from_map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl<K: Into<String>, V: Into<Self>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A compile-time constant, as stored in compiled programs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConstValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Seq(Vec<ConstValue>),
    Map(Vec<(String, ConstValue)>),
}

impl ConstValue {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Int(*i),
            Self::Float(f) => Value::Float(*f),
            Self::String(s) => Value::from(s.as_str()),
            Self::Seq(items) => Value::from_seq(items.iter().map(Self::to_value).collect()),
            Self::Map(pairs) => {
                Value::from_map(pairs.iter().map(|(k, v)| (k.clone(), v.to_value())).collect())
            }
        }
    }

    /// Parses a number literal token.
    pub fn from_number_literal(literal: &str) -> Option<Self> {
        if literal.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(i) = literal.parse() {
                return Some(Self::Int(i));
            }
        }
        literal.parse().ok().map(Self::Float)
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Self::String(s) = self { Some(s) } else { None }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}
