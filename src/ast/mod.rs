//! The template syntax tree.
//!
//! Every construct is a [`Node`]: a kind, an ordered map of named children, a
//! separate map of scalar attributes, a source line and the tag that produced
//! it. Passes and the compiler `match` on [`NodeKind`] and read the children
//! and attributes each kind is documented to carry.

use std::borrow::Cow;

use indexmap::IndexMap;

use crate::error::SyntaxError;
use crate::value::ConstValue;

/// Name reserved for the catch-all argument list of macros.
pub const VARARGS_NAME: &str = "varargs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Plain list of statements keyed `"0"`, `"1"`, ...
    Nodes,
    /// Root node. Children: `body`, `blocks`, `macros`, `traits`, optional
    /// `parent` and `security_check`. Attributes: `index`, `embedded_templates`, `name`.
    Module,
    /// Wraps the statements of a module, block or macro. Child: `0`.
    Body,
    /// Attribute `data`.
    Text,
    /// Child `expr`.
    Print,
    /// Consecutive text and print statements merged into one output statement.
    Output,
    /// Child `tests` (cond, body, cond, body...) and optional `else`.
    If,
    /// Children `key_target`, `value_target`, `seq`, `body`, optional `else`.
    /// Attribute `with_loop`.
    For,
    /// Children `names`, `values` (expressions, or the captured body).
    /// Attribute `capture`.
    Set,
    /// Attribute `name`, child `body`.
    Block,
    /// Output of a block at its definition site. Attribute `name`.
    BlockReference,
    /// Attribute `name`, children `body`, `arguments`.
    Macro,
    /// Child `expr`, attributes `var`, `global`.
    Import,
    /// Children `expr`, optional `variables`. Attributes `only`,
    /// `ignore_missing`.
    Include,
    /// Include of an embedded template: attributes as for `Include` plus
    /// `index`.
    Embed,
    /// Attribute `value` (strategy name or false), child `body`.
    AutoEscape,
    /// Child `body`.
    Sandbox,
    /// Children `variables` (optional), `body`. Attribute `only`.
    With,
    /// Child `expr`.
    Do,
    Flush,
    /// Child `expr`, optional children `package`, `version`.
    Deprecated,
    /// Child `template`, child `targets` (block name to alias constant).
    Trait,

    /// Attribute `value`.
    Constant,
    /// Attribute `name`.
    Name,
    /// Target of an assignment. Attribute `name`.
    AssignName,
    /// Sequence or mapping literal. Children come in key/value pairs
    /// (`"0"`/`"1"`, `"2"`/`"3"`, ...). Attribute `sequence`.
    Array,
    /// Children `left`, `right`. Attribute `operator`.
    Binary,
    /// Child `node`. Attribute `operator`.
    Unary,
    /// Children `expr1` (condition), `expr2`, `expr3`.
    Conditional,
    /// Children `left`, `right`.
    NullCoalesce,
    /// Children `node`, `arguments`. Attribute `name`.
    Filter,
    /// Child `arguments`. Attribute `name`.
    Function,
    /// Children `node`, `arguments`. Attribute `name`.
    Test,
    /// Children `node`, `attribute`, `arguments`. Attributes `type`,
    /// `is_defined_test`, `ignore_strict_check`, `optimizable`.
    GetAttr,
    /// Macro call. Child `arguments`. Attributes `template` (variable
    /// holding the macro's template, `_self` for the current one),
    /// `name`, `is_defined_test`.
    MacroCall,
    /// `parent()`. Attributes `name`, `output`.
    Parent,
    /// `block("name", template?)`. Children `name`, optional `template`.
    /// Attributes `output`, `is_defined_test`.
    BlockFunction,
    /// Checks an object's string conversion under the sandbox. Child `expr`.
    CheckToString,
    /// `x => expr` or `(a, b) => expr`. Child `expr`, attribute `names`.
    Arrow,

    /// First use of each tag, filter and function in a module, checked
    /// against the sandbox policy before rendering. Children `tags`,
    /// `filters`, `functions`: lists keyed by name holding the line as a
    /// constant.
    SecurityCheck,
}

impl NodeKind {
    pub const fn is_expression(self) -> bool {
        matches!(
            self,
            Self::Constant
                | Self::Name
                | Self::AssignName
                | Self::Array
                | Self::Binary
                | Self::Unary
                | Self::Conditional
                | Self::NullCoalesce
                | Self::Filter
                | Self::Function
                | Self::Test
                | Self::GetAttr
                | Self::MacroCall
                | Self::Parent
                | Self::BlockFunction
                | Self::CheckToString
                | Self::Arrow
        )
    }
}

/// Scalar and list attributes of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Strings(Vec<String>),
    Const(ConstValue),
    /// Fully parsed embedded templates, kept out of the child map so passes
    /// over the outer module do not visit them a second time.
    Modules(Vec<Node>),
}

impl From<bool> for Attribute {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Attribute {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Attribute {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<String>> for Attribute {
    fn from(value: Vec<String>) -> Self {
        Self::Strings(value)
    }
}

impl From<i64> for Attribute {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<ConstValue> for Attribute {
    fn from(value: ConstValue) -> Self {
        Self::Const(value)
    }
}

pub type NodeKey = Cow<'static, str>;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    kind: NodeKind,
    nodes: IndexMap<NodeKey, Node>,
    attributes: IndexMap<NodeKey, Attribute>,
    line: usize,
    tag: Option<String>,
}

impl Node {
    pub fn new(kind: NodeKind, line: usize) -> Self {
        Self {
            kind,
            nodes: IndexMap::new(),
            attributes: IndexMap::new(),
            line,
            tag: None,
        }
    }

    /// A `Nodes` list keyed by position.
    pub fn list(items: Vec<Self>, line: usize) -> Self {
        let mut node = Self::new(NodeKind::Nodes, line);
        for (i, item) in items.into_iter().enumerate() {
            node.set_node(i.to_string(), item);
        }
        node
    }

    pub fn text<S: Into<String>>(data: S, line: usize) -> Self {
        Self::new(NodeKind::Text, line).with_attribute("data", Attribute::Str(data.into()))
    }

    pub fn print(expr: Self, line: usize) -> Self {
        Self::new(NodeKind::Print, line).with_node("expr", expr)
    }

    pub fn constant(value: ConstValue, line: usize) -> Self {
        Self::new(NodeKind::Constant, line).with_attribute("value", Attribute::Const(value))
    }

    pub fn string<S: Into<String>>(value: S, line: usize) -> Self {
        Self::constant(ConstValue::String(value.into()), line)
    }

    pub fn name<S: Into<String>>(name: S, line: usize) -> Self {
        Self::new(NodeKind::Name, line).with_attribute("name", Attribute::Str(name.into()))
    }

    /// # Errors
    ///
    /// Literal names (`true`, `null`, ...) and `_self` cannot be assigned to.
    pub fn assign_name(name: &str, line: usize) -> Result<Self, SyntaxError> {
        check_assignable(name, line)?;
        Ok(Self::new(NodeKind::AssignName, line).with_attribute("name", name))
    }

    pub fn body(statements: Self) -> Self {
        let line = statements.line;
        Self::new(NodeKind::Body, line).with_node("0", statements)
    }

    /// Builds a macro definition.
    ///
    /// `arguments` is a `Nodes` list keyed by parameter name whose children are
    /// the default values.
    ///
    /// # Errors
    ///
    /// Fails when a parameter uses the reserved variadic name.
    pub fn macro_node(name: &str, body: Self, arguments: Self, line: usize) -> Result<Self, SyntaxError> {
        if let Some(default) = arguments.get_node(VARARGS_NAME) {
            return Err(SyntaxError::new(
                format!(
                    "The argument \"{VARARGS_NAME}\" in macro \"{name}\" cannot be defined because the variable \"{VARARGS_NAME}\" is reserved for arbitrary arguments."
                ),
                default.line(),
            ));
        }
        Ok(Self::new(NodeKind::Macro, line)
            .with_attribute("name", name)
            .with_node("body", body)
            .with_node("arguments", arguments))
    }

    /// # Errors
    ///
    /// The alias must be assignable.
    pub fn import(expr: Self, var: &str, global: bool, line: usize) -> Result<Self, SyntaxError> {
        check_assignable(var, line)?;
        Ok(Self::new(NodeKind::Import, line)
            .with_node("expr", expr)
            .with_attribute("var", var)
            .with_attribute("global", global))
    }

    #[must_use]
    pub fn with_node<K: Into<NodeKey>>(mut self, name: K, node: Self) -> Self {
        self.set_node(name, node);
        self
    }

    #[must_use]
    pub fn with_attribute<K: Into<NodeKey>, A: Into<Attribute>>(mut self, name: K, value: A) -> Self {
        self.set_attribute(name, value);
        self
    }

    #[must_use]
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    pub const fn line(&self) -> usize {
        self.line
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn set_tag<S: Into<String>>(&mut self, tag: S) {
        self.tag = Some(tag.into());
    }

    /// Replaces the kind of a node, keeping its children and attributes.
    pub fn set_kind(&mut self, kind: NodeKind) {
        self.kind = kind;
    }

    /// Sets a child node.
    ///
    /// # Panics
    ///
    /// When an attribute already uses the same key: children and attributes
    /// share one namespace per node.
    pub fn set_node<K: Into<NodeKey>>(&mut self, name: K, node: Self) {
        let name = name.into();
        assert!(
            !self.attributes.contains_key(&name),
            "node key \"{name}\" is already used by an attribute on a {:?} node",
            self.kind
        );
        self.nodes.insert(name, node);
    }

    /// Sets an attribute.
    ///
    /// # Panics
    ///
    /// When a child node already uses the same key.
    pub fn set_attribute<K: Into<NodeKey>, A: Into<Attribute>>(&mut self, name: K, value: A) {
        let name = name.into();
        assert!(
            !self.nodes.contains_key(&name),
            "attribute key \"{name}\" is already used by a child node on a {:?} node",
            self.kind
        );
        self.attributes.insert(name, value.into());
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get_node(&self, name: &str) -> Option<&Self> {
        self.nodes.get(name)
    }

    pub fn get_node_mut(&mut self, name: &str) -> Option<&mut Self> {
        self.nodes.get_mut(name)
    }

    /// Returns a child that the node kind guarantees.
    ///
    /// # Panics
    ///
    /// When the node is malformed, which is an internal invariant violation.
    pub fn node(&self, name: &str) -> &Self {
        self.nodes
            .get(name)
            .unwrap_or_else(|| panic!("{:?} node has no \"{name}\" child", self.kind))
    }

    pub fn remove_node(&mut self, name: &str) -> Option<Self> {
        self.nodes.shift_remove(name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn take_attribute(&mut self, name: &str) -> Option<Attribute> {
        self.attributes.shift_remove(name)
    }

    /// A string attribute; empty when missing or of another type.
    pub fn attr_str(&self, name: &str) -> &str {
        if let Some(Attribute::Str(s) | Attribute::Const(ConstValue::String(s))) = self.attributes.get(name) {
            s
        } else {
            ""
        }
    }

    pub fn attr_strings(&self, name: &str) -> &[String] {
        if let Some(Attribute::Strings(strings)) = self.attributes.get(name) {
            strings
        } else {
            &[]
        }
    }

    /// A boolean attribute; `false` when missing.
    pub fn attr_bool(&self, name: &str) -> bool {
        matches!(self.attributes.get(name), Some(Attribute::Bool(true)))
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        if let Some(Attribute::Int(i)) = self.attributes.get(name) {
            Some(*i)
        } else {
            None
        }
    }

    /// The value of a `Constant` node.
    pub fn constant_value(&self) -> Option<&ConstValue> {
        if self.kind != NodeKind::Constant {
            return None;
        }
        if let Some(Attribute::Const(value)) = self.attributes.get("value") {
            Some(value)
        } else {
            None
        }
    }

    pub fn constant_str(&self) -> Option<&str> {
        self.constant_value().and_then(ConstValue::as_str)
    }

    /// Child nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Self)> {
        self.nodes.iter().map(|(k, v)| (k.as_ref(), v))
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&str, &mut Self)> {
        self.nodes.iter_mut().map(|(k, v)| (k.as_ref(), v))
    }

    pub fn children(&self) -> impl Iterator<Item = &Self> {
        self.nodes.values()
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.attributes.iter().map(|(k, v)| (k.as_ref(), v))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Removes and returns all children, leaving the node empty.
    pub fn take_nodes(&mut self) -> Vec<(NodeKey, Self)> {
        self.nodes.drain(..).collect()
    }

    /// Reinstalls children previously taken with [`Node::take_nodes`].
    pub fn restore_nodes(&mut self, nodes: Vec<(NodeKey, Self)>) {
        for (key, node) in nodes {
            self.set_node(key, node);
        }
    }

    /// Appends a child to a list node, keyed by the next free position.
    pub fn push(&mut self, node: Self) {
        let index = (self.nodes.len()..)
            .find(|index| !self.nodes.contains_key(index.to_string().as_str()))
            .unwrap_or_default();
        self.set_node(index.to_string(), node);
    }

    /// Key/value pairs of an `Array` node.
    pub fn array_pairs(&self) -> impl Iterator<Item = (&Self, &Self)> {
        let values: Vec<&Self> = self.nodes.values().collect();
        let pairs: Vec<(&Self, &Self)> = values
            .chunks_exact(2)
            .filter_map(|pair| match pair {
                [key, value] => Some((*key, *value)),
                _ => None,
            })
            .collect();
        pairs.into_iter()
    }

    /// Appends a key/value pair to an `Array` node.
    pub fn add_element(&mut self, key: Self, value: Self) {
        let index = self.nodes.len();
        self.set_node(index.to_string(), key);
        self.set_node(index.saturating_add(1).to_string(), value);
    }

    /// Whether an expression is made of literals only, the rule for macro
    /// argument defaults.
    pub fn is_constant_expression(&self) -> bool {
        if self.kind == NodeKind::Constant {
            true
        } else if self.kind == NodeKind::Array {
            self.children()
                .all(|child| !child.attr_bool("spread") && child.is_constant_expression())
        } else if self.kind == NodeKind::Unary {
            matches!(self.attr_str("operator"), "-" | "+") && self.node("node").is_constant_expression()
        } else {
            false
        }
    }

    /// Folds a constant expression into its value.
    pub fn to_const_value(&self) -> Option<ConstValue> {
        if self.kind == NodeKind::Constant {
            self.constant_value().cloned()
        } else if self.kind == NodeKind::Array {
            if self.attr_bool("sequence") {
                self.array_pairs()
                    .map(|(_, value)| value.to_const_value())
                    .collect::<Option<Vec<_>>>()
                    .map(ConstValue::Seq)
            } else {
                self.array_pairs()
                    .map(|(key, value)| {
                        let key = key.constant_value()?.to_string();
                        Some((key, value.to_const_value()?))
                    })
                    .collect::<Option<Vec<_>>>()
                    .map(ConstValue::Map)
            }
        } else if self.kind == NodeKind::Unary {
            let inner = self.node("node").to_const_value()?;
            match (self.attr_str("operator"), inner) {
                ("+", value @ (ConstValue::Int(_) | ConstValue::Float(_))) => Some(value),
                ("-", ConstValue::Int(i)) => i.checked_neg().map(ConstValue::Int),
                ("-", ConstValue::Float(f)) => Some(ConstValue::Float(-f)),
                _ => None,
            }
        } else {
            None
        }
    }
}

fn check_assignable(name: &str, line: usize) -> Result<(), SyntaxError> {
    let lower = name.to_ascii_lowercase();
    if matches!(lower.as_str(), "true" | "false" | "none" | "null") || name == "_self" {
        return Err(SyntaxError::new(
            format!("You cannot assign a value to \"{name}\"."),
            line,
        ));
    }
    Ok(())
}
