use indexmap::IndexMap;

use crate::value::Value;

/// Variables a template is rendered with.
///
/// # Examples
///
/// ```
/// use twiglet::{Context, Value};
///
/// let mut context = Context::new();
/// context.insert("name", "World").insert("count", 3);
///
/// assert!(context.contains("name"));
/// assert_eq!(context.get("count"), Some(&Value::from(3)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    data: IndexMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: AsRef<str>, V: Into<Value>>(&mut self, name: N, value: V) -> &mut Self {
        self.data.insert(name.as_ref().to_owned(), value.into());
        self
    }

    pub fn get<N: AsRef<str>>(&self, name: N) -> Option<&Value> {
        self.data.get(name.as_ref())
    }

    pub fn contains<N: AsRef<str>>(&self, name: N) -> bool {
        self.data.contains_key(name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn into_inner(self) -> IndexMap<String, Value> {
        self.data
    }
}

impl From<IndexMap<String, Value>> for Context {
    fn from(data: IndexMap<String, Value>) -> Self {
        Self { data }
    }
}

/// Top-level keys of a JSON object become variables; any other JSON value
/// gives an empty context.
impl From<serde_json::Value> for Context {
    fn from(value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = value {
            Self {
                data: map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            }
        } else {
            Self::default()
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
