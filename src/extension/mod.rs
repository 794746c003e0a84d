//! Extensions contribute tags, filters, functions, tests, operators, globals
//! and tree passes. The [`ExtensionSet`] merges them into a [`Registry`] that
//! is frozen the first time anything is tokenized or parsed.

pub mod builtins;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::ast::Node;
use crate::error::{Error, Result, SyntaxError};
use crate::parser::Parser;
use crate::runtime::State;
use crate::sandbox::SecurityPolicy;
use crate::token::Token;
use crate::value::{BinaryOp, UnaryOp, Value};
use crate::visitor::NodeVisitor;

pub use self::builtins::CoreExtension;

/// Host implementation of a filter, function or test.
///
/// Filters receive the filtered value as their first argument, tests the
/// tested value.
pub type CallableFn = Arc<dyn Fn(&State<'_>, &[Value]) -> Result<Value> + Send + Sync>;

/// Works out the strategies a filter or function output is safe for from its
/// (unevaluated) argument list.
pub type SafeCallback = Arc<dyn Fn(&Node) -> Vec<String> + Send + Sync>;

pub type CustomBinaryFn = Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>;
pub type CustomUnaryFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Builds a fresh visitor for each traversal.
pub type VisitorFactory = Arc<dyn Fn() -> Box<dyn NodeVisitor> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallableKind {
    Filter,
    Function,
    Test,
}

impl fmt::Display for CallableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Filter => "filter",
            Self::Function => "function",
            Self::Test => "test",
        })
    }
}

/// Callables the code generator expands inline instead of calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// `default` filter: its input is looked up without strict checks.
    Default,
    /// `defined` test.
    Defined,
    /// `block()` function.
    Block,
    /// `parent()` function.
    Parent,
    /// `attribute()` function.
    Attribute,
    /// `include()` function.
    Include,
}

#[derive(Clone)]
pub enum Implementation {
    Host(CallableFn),
    Builtin(Builtin),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deprecation {
    pub since: String,
    pub package: Option<String>,
    pub alternative: Option<String>,
}

impl Deprecation {
    pub fn new<S: Into<String>>(since: S) -> Self {
        Self {
            since: since.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_alternative<S: Into<String>>(mut self, alternative: S) -> Self {
        self.alternative = Some(alternative.into());
        self
    }

    #[must_use]
    pub fn with_package<S: Into<String>>(mut self, package: S) -> Self {
        self.package = Some(package.into());
        self
    }
}

/// A named filter, function or test with its compile-time options.
///
/// # Examples
///
/// ```rust
/// use twiglet::{Callable, Value};
///
/// let shout = Callable::filter("shout", |_, args| {
///     Ok(Value::from(format!("{}!", args.first().cloned().unwrap_or_default())))
/// })
/// .safe(&["html"]);
/// assert_eq!(shout.name(), "shout");
/// ```
#[derive(Clone)]
pub struct Callable {
    kind: CallableKind,
    name: String,
    implementation: Implementation,
    needs_environment: bool,
    needs_context: bool,
    variadic: bool,
    is_safe: Option<Vec<String>>,
    safe_callback: Option<SafeCallback>,
    pre_escape: Option<String>,
    preserves_safety: Vec<String>,
    deprecation: Option<Deprecation>,
    arguments: Vec<String>,
    one_mandatory_argument: bool,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("is_safe", &self.is_safe)
            .field("deprecation", &self.deprecation)
            .finish_non_exhaustive()
    }
}

impl Callable {
    fn new(kind: CallableKind, name: &str, implementation: Implementation) -> Self {
        Self {
            kind,
            name: name.to_owned(),
            implementation,
            needs_environment: false,
            needs_context: false,
            variadic: false,
            is_safe: None,
            safe_callback: None,
            pre_escape: None,
            preserves_safety: Vec::new(),
            deprecation: None,
            arguments: Vec::new(),
            one_mandatory_argument: false,
        }
    }

    pub fn filter<F>(name: &str, func: F) -> Self
    where
        F: Fn(&State<'_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(CallableKind::Filter, name, Implementation::Host(Arc::new(func)))
    }

    pub fn function<F>(name: &str, func: F) -> Self
    where
        F: Fn(&State<'_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(CallableKind::Function, name, Implementation::Host(Arc::new(func)))
    }

    pub fn test<F>(name: &str, func: F) -> Self
    where
        F: Fn(&State<'_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(CallableKind::Test, name, Implementation::Host(Arc::new(func)))
    }

    pub(crate) fn builtin(kind: CallableKind, name: &str, builtin: Builtin) -> Self {
        Self::new(kind, name, Implementation::Builtin(builtin))
    }

    /// The callable is handed the environment through [`State::environment`].
    #[must_use]
    pub const fn needs_environment(mut self) -> Self {
        self.needs_environment = true;
        self
    }

    /// The callable is handed the render context through [`State::context`].
    #[must_use]
    pub const fn needs_context(mut self) -> Self {
        self.needs_context = true;
        self
    }

    /// Accepts more positional arguments than it declares.
    #[must_use]
    pub const fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Output is safe for the given escaping strategies (`"all"` for every
    /// strategy).
    #[must_use]
    pub fn safe(mut self, strategies: &[&str]) -> Self {
        self.is_safe = Some(strategies.iter().map(|s| (*s).to_owned()).collect());
        self
    }

    #[must_use]
    pub fn safe_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Node) -> Vec<String> + Send + Sync + 'static,
    {
        self.safe_callback = Some(Arc::new(callback));
        self
    }

    /// Escape the input with `strategy` before filtering when it is not safe.
    #[must_use]
    pub fn pre_escape<S: Into<String>>(mut self, strategy: S) -> Self {
        self.pre_escape = Some(strategy.into());
        self
    }

    /// Output keeps the safety of the input for these strategies.
    #[must_use]
    pub fn preserves_safety(mut self, strategies: &[&str]) -> Self {
        self.preserves_safety = strategies.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn deprecated(mut self, deprecation: Deprecation) -> Self {
        self.deprecation = Some(deprecation);
        self
    }

    /// Declares argument names (after the filtered or tested value), which
    /// enables named arguments.
    #[must_use]
    pub fn arguments(mut self, names: &[&str]) -> Self {
        self.arguments = names.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    /// For tests: a single argument may follow without parentheses, as in
    /// `is divisible by 3`.
    #[must_use]
    pub const fn one_mandatory_argument(mut self) -> Self {
        self.one_mandatory_argument = true;
        self
    }

    pub const fn kind(&self) -> CallableKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn implementation(&self) -> &Implementation {
        &self.implementation
    }

    pub const fn builtin_kind(&self) -> Option<Builtin> {
        match &self.implementation {
            Implementation::Builtin(b) => Some(*b),
            Implementation::Host(_) => None,
        }
    }

    pub const fn wants_environment(&self) -> bool {
        self.needs_environment
    }

    pub const fn wants_context(&self) -> bool {
        self.needs_context
    }

    pub const fn is_variadic(&self) -> bool {
        self.variadic
    }

    pub fn pre_escape_strategy(&self) -> Option<&str> {
        self.pre_escape.as_deref()
    }

    pub fn preserved_safety(&self) -> &[String] {
        &self.preserves_safety
    }

    pub const fn deprecation(&self) -> Option<&Deprecation> {
        self.deprecation.as_ref()
    }

    pub fn argument_names(&self) -> &[String] {
        &self.arguments
    }

    pub const fn has_one_mandatory_argument(&self) -> bool {
        self.one_mandatory_argument
    }

    /// Strategies the output is safe for, given the call's argument node.
    /// `None` means the callable makes no claim.
    pub fn safe_for(&self, arguments: &Node) -> Option<Vec<String>> {
        if let Some(callback) = &self.safe_callback {
            return Some(callback(arguments));
        }
        self.is_safe.clone()
    }

    /// Invokes a host implementation.
    ///
    /// # Errors
    ///
    /// Whatever the host function returns; builtins cannot be called this way.
    pub fn call(&self, state: &State<'_>, args: &[Value]) -> Result<Value> {
        match &self.implementation {
            Implementation::Host(func) => {
                let scoped = state.scoped(self.needs_environment, self.needs_context);
                func(&scoped, args)
            }
            Implementation::Builtin(_) => Err(Error::runtime(format!(
                "The \"{}\" {} cannot be called dynamically.",
                self.name, self.kind
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Associativity {
    Left,
    Right,
}

#[derive(Clone)]
pub enum UnaryKind {
    Builtin(UnaryOp),
    Custom(CustomUnaryFn),
}

#[derive(Clone)]
pub struct UnaryOperator {
    pub name: String,
    pub precedence: u32,
    pub kind: UnaryKind,
}

impl UnaryOperator {
    pub fn builtin(name: &str, precedence: u32, op: UnaryOp) -> Self {
        Self {
            name: name.to_owned(),
            precedence,
            kind: UnaryKind::Builtin(op),
        }
    }

    pub fn custom<F>(name: &str, precedence: u32, func: F) -> Self
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_owned(),
            precedence,
            kind: UnaryKind::Custom(Arc::new(func)),
        }
    }
}

#[derive(Clone)]
pub enum BinaryKind {
    Builtin(BinaryOp),
    /// `is`, followed by a test.
    Is,
    /// `is not`, followed by a test.
    IsNot,
    NullCoalesce,
    Custom(CustomBinaryFn),
}

#[derive(Clone)]
pub struct BinaryOperator {
    pub name: String,
    pub precedence: u32,
    pub associativity: Associativity,
    pub kind: BinaryKind,
}

impl BinaryOperator {
    pub fn new(name: &str, precedence: u32, associativity: Associativity, kind: BinaryKind) -> Self {
        Self {
            name: name.to_owned(),
            precedence,
            associativity,
            kind,
        }
    }

    pub fn builtin(op: BinaryOp, precedence: u32) -> Self {
        Self::new(op.symbol(), precedence, Associativity::Left, BinaryKind::Builtin(op))
    }

    pub fn custom<F>(name: &str, precedence: u32, associativity: Associativity, func: F) -> Self
    where
        F: Fn(&Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(name, precedence, associativity, BinaryKind::Custom(Arc::new(func)))
    }
}

/// Parses the body of a tag contributed by an extension.
pub trait TokenParser: Send + Sync {
    fn tag(&self) -> &str;

    /// Called with the stream positioned right after the tag name.
    ///
    /// Returning `None` means the tag produces no output node (it may still
    /// have registered blocks or macros on the parser).
    ///
    /// # Errors
    ///
    /// Syntax errors in the tag's arguments or body.
    fn parse(&self, token: &Token, parser: &mut Parser<'_>) -> std::result::Result<Option<Node>, SyntaxError>;
}

/// Tags implemented by the parser itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreTag {
    Apply,
    AutoEscape,
    Block,
    Deprecated,
    Do,
    Embed,
    Extends,
    Flush,
    For,
    From,
    Guard,
    If,
    Import,
    Include,
    Macro,
    Sandbox,
    Set,
    Use,
    With,
}

impl CoreTag {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::AutoEscape => "autoescape",
            Self::Block => "block",
            Self::Deprecated => "deprecated",
            Self::Do => "do",
            Self::Embed => "embed",
            Self::Extends => "extends",
            Self::Flush => "flush",
            Self::For => "for",
            Self::From => "from",
            Self::Guard => "guard",
            Self::If => "if",
            Self::Import => "import",
            Self::Include => "include",
            Self::Macro => "macro",
            Self::Sandbox => "sandbox",
            Self::Set => "set",
            Self::Use => "use",
            Self::With => "with",
        }
    }
}

#[derive(Clone)]
pub enum TagHandler {
    Core(CoreTag),
    Custom(Arc<dyn TokenParser>),
}

impl TagHandler {
    pub fn tag(&self) -> &str {
        match self {
            Self::Core(tag) => tag.name(),
            Self::Custom(parser) => parser.tag(),
        }
    }
}

/// A pass over the syntax tree.
#[derive(Clone)]
pub enum VisitorKind {
    Optimizer,
    Escaper,
    Sandbox,
    Custom(VisitorFactory),
}

/// A bundle of template features.
///
/// Every method has an empty default, so an extension only implements what
/// it contributes.
pub trait Extension: Send + Sync {
    /// Unique name of the extension within an environment.
    fn name(&self) -> &str;

    fn token_parsers(&self) -> Vec<TagHandler> {
        Vec::new()
    }

    fn node_visitors(&self) -> Vec<VisitorKind> {
        Vec::new()
    }

    fn filters(&self) -> Vec<Callable> {
        Vec::new()
    }

    fn functions(&self) -> Vec<Callable> {
        Vec::new()
    }

    fn tests(&self) -> Vec<Callable> {
        Vec::new()
    }

    fn unary_operators(&self) -> Vec<UnaryOperator> {
        Vec::new()
    }

    fn binary_operators(&self) -> Vec<BinaryOperator> {
        Vec::new()
    }

    fn globals(&self) -> IndexMap<String, Value> {
        IndexMap::new()
    }

    /// Sandbox policy, for extensions that provide one.
    fn security_policy(&self) -> Option<Arc<dyn SecurityPolicy>> {
        None
    }
}

/// Holds additions made directly on the environment. It is merged last.
#[derive(Default)]
struct StagingExtension {
    token_parsers: Vec<TagHandler>,
    visitors: Vec<VisitorKind>,
    filters: Vec<Callable>,
    functions: Vec<Callable>,
    tests: Vec<Callable>,
    globals: IndexMap<String, Value>,
}

impl Extension for StagingExtension {
    fn name(&self) -> &str {
        "staging"
    }

    fn token_parsers(&self) -> Vec<TagHandler> {
        self.token_parsers.clone()
    }

    fn node_visitors(&self) -> Vec<VisitorKind> {
        self.visitors.clone()
    }

    fn filters(&self) -> Vec<Callable> {
        self.filters.clone()
    }

    fn functions(&self) -> Vec<Callable> {
        self.functions.clone()
    }

    fn tests(&self) -> Vec<Callable> {
        self.tests.clone()
    }

    fn globals(&self) -> IndexMap<String, Value> {
        self.globals.clone()
    }
}

/// The merged, read-only view of every registered extension.
pub struct Registry {
    extension_names: Vec<String>,
    tags: IndexMap<String, TagHandler>,
    visitors: Vec<VisitorKind>,
    filters: IndexMap<String, Callable>,
    functions: IndexMap<String, Callable>,
    tests: IndexMap<String, Callable>,
    unary_operators: IndexMap<String, UnaryOperator>,
    binary_operators: IndexMap<String, BinaryOperator>,
    globals: IndexMap<String, Value>,
    policy: Option<Arc<dyn SecurityPolicy>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("extensions", &self.extension_names)
            .field("tags", &self.tags.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("tests", &self.tests.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Inserts `item` under `name`, logging when it replaces an earlier entry.
fn insert_named<T>(map: &mut IndexMap<String, T>, category: &str, name: &str, item: T) {
    if map.insert(name.to_owned(), item).is_some() {
        debug!(category, name, "registration replaces an earlier one");
    }
}

impl Registry {
    fn build(extensions: &[&dyn Extension]) -> Self {
        let mut registry = Self {
            extension_names: Vec::new(),
            tags: IndexMap::new(),
            visitors: Vec::new(),
            filters: IndexMap::new(),
            functions: IndexMap::new(),
            tests: IndexMap::new(),
            unary_operators: IndexMap::new(),
            binary_operators: IndexMap::new(),
            globals: IndexMap::new(),
            policy: None,
        };
        for extension in extensions {
            registry.extension_names.push(extension.name().to_owned());
            for handler in extension.token_parsers() {
                let tag = handler.tag().to_owned();
                insert_named(&mut registry.tags, "tag", &tag, handler);
            }
            registry.visitors.extend(extension.node_visitors());
            for filter in extension.filters() {
                let name = filter.name().to_owned();
                insert_named(&mut registry.filters, "filter", &name, filter);
            }
            for function in extension.functions() {
                let name = function.name().to_owned();
                insert_named(&mut registry.functions, "function", &name, function);
            }
            for test in extension.tests() {
                let name = test.name().to_owned();
                insert_named(&mut registry.tests, "test", &name, test);
            }
            for op in extension.unary_operators() {
                let name = op.name.clone();
                insert_named(&mut registry.unary_operators, "unary operator", &name, op);
            }
            for op in extension.binary_operators() {
                let name = op.name.clone();
                insert_named(&mut registry.binary_operators, "binary operator", &name, op);
            }
            for (name, value) in extension.globals() {
                registry.globals.insert(name, value);
            }
            if let Some(policy) = extension.security_policy() {
                registry.policy = Some(policy);
            }
        }
        debug!(
            extensions = registry.extension_names.len(),
            tags = registry.tags.len(),
            filters = registry.filters.len(),
            functions = registry.functions.len(),
            tests = registry.tests.len(),
            "extensions initialized"
        );
        registry
    }

    pub fn extension_names(&self) -> &[String] {
        &self.extension_names
    }

    pub fn tag(&self, name: &str) -> Option<&TagHandler> {
        self.tags.get(name)
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    pub fn visitors(&self) -> &[VisitorKind] {
        &self.visitors
    }

    pub fn filter(&self, name: &str) -> Option<&Callable> {
        self.filters.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&Callable> {
        self.functions.get(name)
    }

    pub fn test(&self, name: &str) -> Option<&Callable> {
        self.tests.get(name)
    }

    pub fn callable(&self, kind: CallableKind, name: &str) -> Option<&Callable> {
        match kind {
            CallableKind::Filter => self.filter(name),
            CallableKind::Function => self.function(name),
            CallableKind::Test => self.test(name),
        }
    }

    pub fn callable_names(&self, kind: CallableKind) -> impl Iterator<Item = &str> {
        let map = match kind {
            CallableKind::Filter => &self.filters,
            CallableKind::Function => &self.functions,
            CallableKind::Test => &self.tests,
        };
        map.keys().map(String::as_str)
    }

    pub fn unary_operator(&self, name: &str) -> Option<&UnaryOperator> {
        self.unary_operators.get(name)
    }

    pub fn binary_operator(&self, name: &str) -> Option<&BinaryOperator> {
        self.binary_operators.get(name)
    }

    /// Every operator name, for the lexer.
    pub fn operator_names(&self) -> impl Iterator<Item = &str> {
        self.unary_operators
            .keys()
            .chain(self.binary_operators.keys())
            .map(String::as_str)
    }

    pub const fn globals(&self) -> &IndexMap<String, Value> {
        &self.globals
    }

    pub fn security_policy(&self) -> Option<&Arc<dyn SecurityPolicy>> {
        self.policy.as_ref()
    }
}

/// Registered extensions, frozen into a [`Registry`] on first use.
pub struct ExtensionSet {
    extensions: IndexMap<String, Arc<dyn Extension>>,
    staging: StagingExtension,
    registry: OnceCell<Registry>,
}

impl Default for ExtensionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExtensionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionSet")
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl ExtensionSet {
    pub fn new() -> Self {
        Self {
            extensions: IndexMap::new(),
            staging: StagingExtension::default(),
            registry: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.get().is_some()
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    fn ensure_open(&self, what: &str) -> Result<()> {
        if self.is_initialized() {
            return Err(Error::logic(format!(
                "Unable to add {what} as extensions have already been initialized."
            )));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// After the registry is frozen, or when an extension with the same name
    /// is already registered.
    pub fn add_extension<E: Extension + 'static>(&mut self, extension: E) -> Result<()> {
        let name = extension.name().to_owned();
        if self.is_initialized() {
            return Err(Error::logic(format!(
                "Unable to register extension \"{name}\" as extensions have already been initialized."
            )));
        }
        if self.extensions.contains_key(&name) {
            return Err(Error::logic(format!(
                "Unable to register extension \"{name}\" as it is already registered."
            )));
        }
        self.extensions.insert(name, Arc::new(extension));
        Ok(())
    }

    /// Registers one of the extensions every environment starts with.
    pub(crate) fn add_builtin<E: Extension + 'static>(&mut self, extension: E) {
        self.extensions
            .insert(extension.name().to_owned(), Arc::new(extension));
    }

    /// # Errors
    ///
    /// After the registry is frozen.
    pub fn add_filter(&mut self, filter: Callable) -> Result<()> {
        self.ensure_open(&format!("filter \"{}\"", filter.name()))?;
        self.staging.filters.push(filter);
        Ok(())
    }

    /// # Errors
    ///
    /// After the registry is frozen.
    pub fn add_function(&mut self, function: Callable) -> Result<()> {
        self.ensure_open(&format!("function \"{}\"", function.name()))?;
        self.staging.functions.push(function);
        Ok(())
    }

    /// # Errors
    ///
    /// After the registry is frozen.
    pub fn add_test(&mut self, test: Callable) -> Result<()> {
        self.ensure_open(&format!("test \"{}\"", test.name()))?;
        self.staging.tests.push(test);
        Ok(())
    }

    /// # Errors
    ///
    /// After the registry is frozen.
    pub fn add_token_parser(&mut self, parser: Arc<dyn TokenParser>) -> Result<()> {
        self.ensure_open(&format!("token parser \"{}\"", parser.tag()))?;
        self.staging.token_parsers.push(TagHandler::Custom(parser));
        Ok(())
    }

    /// # Errors
    ///
    /// After the registry is frozen.
    pub fn add_node_visitor(&mut self, factory: VisitorFactory) -> Result<()> {
        self.ensure_open("a node visitor")?;
        self.staging.visitors.push(VisitorKind::Custom(factory));
        Ok(())
    }

    /// # Errors
    ///
    /// After the registry is frozen.
    pub fn add_global<V: Into<Value>>(&mut self, name: &str, value: V) -> Result<()> {
        self.ensure_open(&format!("global \"{name}\""))?;
        self.staging.globals.insert(name.to_owned(), value.into());
        Ok(())
    }

    /// Returns the registry, freezing the set on first call.
    pub fn registry(&self) -> &Registry {
        self.registry.get_or_init(|| {
            let mut all: Vec<&dyn Extension> = self.extensions.values().map(|e| &**e).collect();
            all.push(&self.staging);
            Registry::build(&all)
        })
    }
}
