use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::Node;
use crate::cache::{self, Cache, NullCache};
use crate::compiler::{self, program::CompiledTemplate};
use crate::error::{Error, Result};
use crate::extension::builtins::{EscaperExtension, OptimizerExtension};
use crate::extension::{
    Callable, CoreExtension, Extension, ExtensionSet, Registry, TokenParser, VisitorFactory,
};
use crate::lexer::{Lexer, LexerOptions};
use crate::loader::Loader;
use crate::parser::Parser;
use crate::runtime::escape::EscaperFn;
use crate::runtime::{Context, Template};
use crate::source::Source;
use crate::token::TokenStream;
use crate::value::Value;
use crate::visitor;

/// Picks the autoescaping strategy from a template name.
pub type AutoescapeCallback = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Default escaping for templates without an `{% autoescape %}` tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Autoescape {
    Disabled,
    /// One strategy for every template.
    Strategy(String),
    /// Guessed from the file extension, see [`guess_strategy`].
    #[default]
    Name,
}

/// Environment settings. Every field has a default, so partial JSON works.
///
/// # Examples
///
/// ```rust
/// use twiglet::EnvironmentOptions;
///
/// let options: EnvironmentOptions =
///     serde_json::from_str(r#"{"strict_variables": true}"#).unwrap();
/// assert!(options.strict_variables);
/// assert!(options.optimizations);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentOptions {
    pub debug: bool,
    /// Only UTF-8 is supported.
    pub charset: String,
    /// Undefined variables and attributes are errors instead of null.
    pub strict_variables: bool,
    pub autoescape: Autoescape,
    pub optimizations: bool,
    /// Recompile templates whose source changed. Follows `debug` when unset.
    pub auto_reload: Option<bool>,
    /// Report render errors at the outermost template instead of where
    /// they were raised.
    pub rewrite_errors: bool,
    /// Sandbox every template, not just `{% sandbox %}` bodies.
    pub sandboxed: bool,
    pub lexer: LexerOptions,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            debug: false,
            charset: "UTF-8".to_owned(),
            strict_variables: false,
            autoescape: Autoescape::Name,
            optimizations: true,
            auto_reload: None,
            rewrite_errors: false,
            sandboxed: false,
            lexer: LexerOptions::default(),
        }
    }
}

impl EnvironmentOptions {
    pub fn auto_reload(&self) -> bool {
        self.auto_reload.unwrap_or(self.debug)
    }
}

/// The strategy for a template name: `html` unless the extension (after
/// dropping a trailing `.twig`) says `js` or `css`, and none for `txt`.
///
/// # Examples
///
/// ```rust
/// use twiglet::guess_strategy;
///
/// assert_eq!(guess_strategy("page.html.twig").as_deref(), Some("html"));
/// assert_eq!(guess_strategy("app.js").as_deref(), Some("js"));
/// assert_eq!(guess_strategy("notes.txt"), None);
/// ```
pub fn guess_strategy(name: &str) -> Option<String> {
    if name.ends_with('/') || name.ends_with('\\') {
        return Some("html".to_owned());
    }
    let name = name.strip_suffix(".twig").unwrap_or(name);
    match Path::new(name).extension().and_then(OsStr::to_str).unwrap_or_default() {
        "js" => Some("js".to_owned()),
        "css" => Some("css".to_owned()),
        "txt" => None,
        _ => Some("html".to_owned()),
    }
}

struct LoadedTemplate {
    template: Arc<Template>,
    loaded_at: SystemTime,
}

/// Owns the configuration, the extensions, the loader and the cache, and
/// loads templates.
///
/// Templates are compiled once and shared: [`Environment::load_template`]
/// hands out the same [`Arc<Template>`] until the source changes (with
/// auto-reload on).
///
/// # Examples
///
/// ```rust
/// use twiglet::{ArrayLoader, Callable, Context, Environment, Value};
///
/// let loader = ArrayLoader::new([("greet.html", "{{ name|shout }}")]);
/// let mut env = Environment::new(loader);
/// env.add_filter(Callable::filter("shout", |_, args| {
///     let text = args.first().map(ToString::to_string).unwrap_or_default();
///     Ok(Value::from(text.to_uppercase()))
/// }))
/// .unwrap();
///
/// let mut context = Context::new();
/// context.insert("name", "<b>bob</b>");
/// assert_eq!(env.render("greet.html", context).unwrap(), "&lt;B&gt;BOB&lt;/B&gt;");
/// ```
pub struct Environment {
    options: EnvironmentOptions,
    loader: Box<dyn Loader>,
    cache: Box<dyn Cache>,
    extensions: ExtensionSet,
    lexer: OnceCell<Lexer>,
    signature: OnceCell<String>,
    escapers: IndexMap<String, EscaperFn>,
    autoescape_callback: Option<AutoescapeCallback>,
    templates: RwLock<HashMap<String, LoadedTemplate>>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("options", &self.options)
            .field("extensions", &self.extensions)
            .field("escapers", &self.escapers.keys().collect::<Vec<_>>())
            .field("loaded", &self.templates.read().len())
            .finish_non_exhaustive()
    }
}

impl Environment {
    pub fn new<L: Loader + 'static>(loader: L) -> Self {
        Self::with_options(loader, EnvironmentOptions::default())
    }

    pub fn with_options<L: Loader + 'static>(loader: L, options: EnvironmentOptions) -> Self {
        let mut extensions = ExtensionSet::new();
        extensions.add_builtin(CoreExtension);
        extensions.add_builtin(EscaperExtension);
        if options.optimizations {
            extensions.add_builtin(OptimizerExtension);
        }
        Self {
            options,
            loader: Box::new(loader),
            cache: Box::new(NullCache),
            extensions,
            lexer: OnceCell::new(),
            signature: OnceCell::new(),
            escapers: IndexMap::new(),
            autoescape_callback: None,
            templates: RwLock::new(HashMap::new()),
        }
    }

    pub const fn options(&self) -> &EnvironmentOptions {
        &self.options
    }

    pub fn loader(&self) -> &dyn Loader {
        self.loader.as_ref()
    }

    /// The merged extensions. The first call freezes them.
    pub fn registry(&self) -> &Registry {
        self.extensions.registry()
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.has_extension(name)
    }

    /// # Errors
    ///
    /// [`Error::Logic`] once templates have been parsed, or when the name is
    /// taken.
    pub fn add_extension<E: Extension + 'static>(&mut self, extension: E) -> Result<()> {
        self.extensions.add_extension(extension)
    }

    /// # Errors
    ///
    /// [`Error::Logic`] once templates have been parsed.
    pub fn add_filter(&mut self, filter: Callable) -> Result<()> {
        self.extensions.add_filter(filter)
    }

    /// # Errors
    ///
    /// [`Error::Logic`] once templates have been parsed.
    pub fn add_function(&mut self, function: Callable) -> Result<()> {
        self.extensions.add_function(function)
    }

    /// # Errors
    ///
    /// [`Error::Logic`] once templates have been parsed.
    pub fn add_test(&mut self, test: Callable) -> Result<()> {
        self.extensions.add_test(test)
    }

    /// # Errors
    ///
    /// [`Error::Logic`] once templates have been parsed.
    pub fn add_global<V: Into<Value>>(&mut self, name: &str, value: V) -> Result<()> {
        self.extensions.add_global(name, value)
    }

    /// # Errors
    ///
    /// [`Error::Logic`] once templates have been parsed.
    pub fn add_token_parser<P: TokenParser + 'static>(&mut self, parser: P) -> Result<()> {
        self.extensions.add_token_parser(Arc::new(parser))
    }

    /// # Errors
    ///
    /// [`Error::Logic`] once templates have been parsed.
    pub fn add_node_visitor(&mut self, factory: VisitorFactory) -> Result<()> {
        self.extensions.add_node_visitor(factory)
    }

    /// Registers a custom escaping strategy.
    pub fn set_escaper<F>(&mut self, strategy: &str, escaper: F)
    where
        F: Fn(&str, &str) -> Result<String> + Send + Sync + 'static,
    {
        self.escapers.insert(strategy.to_owned(), Arc::new(escaper));
    }

    pub fn escaper(&self, strategy: &str) -> Option<&EscaperFn> {
        self.escapers.get(strategy)
    }

    pub fn escaper_names(&self) -> impl Iterator<Item = &str> {
        self.escapers.keys().map(String::as_str)
    }

    /// Replaces the compiled-program cache. Templates already loaded stay
    /// loaded.
    pub fn set_cache<C: Cache + 'static>(&mut self, cache: C) {
        self.cache = Box::new(cache);
    }

    /// Picks the autoescape strategy per template name, overriding
    /// [`EnvironmentOptions::autoescape`].
    pub fn set_autoescape_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.autoescape_callback = Some(Arc::new(callback));
        self.signature = OnceCell::new();
    }

    /// The strategy autoescaping starts with in template `name`.
    pub fn default_escaping_strategy(&self, name: &str) -> Option<String> {
        if let Some(callback) = &self.autoescape_callback {
            return callback(name);
        }
        match &self.options.autoescape {
            Autoescape::Disabled => None,
            Autoescape::Strategy(strategy) => Some(strategy.clone()),
            Autoescape::Name => guess_strategy(name),
        }
    }

    fn lexer(&self) -> &Lexer {
        self.lexer.get_or_init(|| {
            Lexer::new(self.options.lexer.clone(), self.registry().operator_names())
        })
    }

    /// # Errors
    ///
    /// Syntax errors from the lexer.
    pub fn tokenize(&self, source: &Source) -> Result<TokenStream> {
        self.lexer()
            .tokenize(source)
            .map_err(|e| Error::Syntax(e).locate(source.name(), None))
    }

    /// Parses a token stream and runs the tree passes over the result.
    ///
    /// # Errors
    ///
    /// Syntax errors from the parser and errors raised by the passes.
    pub fn parse(&self, stream: TokenStream) -> Result<Node> {
        let name = stream.source().name().to_owned();
        let module = Parser::new(self, stream)
            .parse()
            .map_err(|e| Error::Syntax(e).locate(&name, None))?;
        visitor::traverse(module, self).map_err(|e| e.locate(&name, None))
    }

    /// # Errors
    ///
    /// Code generation errors such as misused named arguments.
    pub fn compile(&self, module: &Node) -> Result<CompiledTemplate> {
        let name = module.attr_str("name").to_owned();
        compiler::compile(self.registry(), module).map_err(|e| e.locate(&name, None))
    }

    /// Tokenizes, parses and compiles a source.
    ///
    /// # Errors
    ///
    /// The first error of any stage, located in the source.
    pub fn compile_source(&self, source: &Source) -> Result<CompiledTemplate> {
        let stream = self.tokenize(source)?;
        let module = self.parse(stream)?;
        let program = self.compile(&module)?;
        debug!(
            template = source.name(),
            instructions = program.instruction_count(),
            "compiled template"
        );
        Ok(program)
    }

    /// Everything besides the source that changes what a template compiles
    /// to.
    fn signature(&self) -> &str {
        self.signature.get_or_init(|| {
            let options = serde_json::to_string(&self.options).unwrap_or_default();
            format!(
                "{}|{options}|{}|{}",
                env!("CARGO_PKG_VERSION"),
                self.registry().extension_names().join(","),
                self.autoescape_callback.is_some()
            )
        })
    }

    /// Compiles `source`, going through the cache.
    fn program(&self, source: &Source) -> Result<CompiledTemplate> {
        let fingerprint = cache::fingerprint([self.signature(), source.code()]);
        let key = self.cache.generate_key(source.name(), &fingerprint);
        if key.is_empty() {
            return self.compile_source(source);
        }

        let fresh = !self.options.auto_reload()
            || self
                .cache
                .timestamp(&key)
                .is_some_and(|time| self.loader.is_fresh(source.name(), time).unwrap_or(false));
        if fresh {
            if let Some(code) = self.cache.load(&key) {
                match serde_json::from_str::<CompiledTemplate>(&code) {
                    Ok(program) => {
                        debug!(template = source.name(), key = %key, "compiled-code cache hit");
                        return Ok(program);
                    }
                    Err(e) => {
                        debug!(template = source.name(), error = %e, "discarding unreadable cache entry");
                    }
                }
            }
        }
        debug!(template = source.name(), key = %key, "compiled-code cache miss");

        let program = self.compile_source(source)?;
        let code = serde_json::to_string(&program)
            .map_err(|e| Error::runtime(format!("Unable to serialize a compiled template: {e}.")))?;
        self.cache.write(&key, &code)?;
        debug!(template = source.name(), key = %key, bytes = code.len(), "compiled-code cache write");
        Ok(program)
    }

    fn cached(&self, key: &str) -> Option<Arc<Template>> {
        let templates = self.templates.read();
        let loaded = templates.get(key)?;
        if self.options.auto_reload() && loaded.template.index().is_none() {
            let fresh = self
                .loader
                .is_fresh(loaded.template.name(), loaded.loaded_at)
                .unwrap_or(false);
            if !fresh {
                return None;
            }
        }
        Some(Arc::clone(&loaded.template))
    }

    fn remember(&self, key: String, template: &Arc<Template>) {
        self.templates.write().insert(
            key,
            LoadedTemplate {
                template: Arc::clone(template),
                loaded_at: SystemTime::now(),
            },
        );
    }

    /// Loads (compiling if needed) the named template.
    ///
    /// # Errors
    ///
    /// [`Error::Loader`] when the loader cannot find it, or whatever
    /// compiling it or its static parent and traits raises.
    pub fn load_template(&self, name: &str) -> Result<Arc<Template>> {
        self.load_template_chained(name, &mut Vec::new())
    }

    /// `chain` lists the templates whose loading led here.
    pub(crate) fn load_template_chained(&self, name: &str, chain: &mut Vec<String>) -> Result<Arc<Template>> {
        if let Some(template) = self.cached(name) {
            return Ok(template);
        }
        if chain.iter().any(|loading| loading == name) {
            let mut names: Vec<String> = chain.iter().map(|n| format!("\"{n}\"")).collect();
            names.push(format!("\"{name}\""));
            return Err(Error::runtime(format!(
                "Circular template inheritance detected ({}).",
                names.join(" -> ")
            )));
        }

        chain.push(name.to_owned());
        let loaded = self.load_uncached(name, chain);
        chain.pop();
        let template = Arc::new(loaded?);
        self.remember(name.to_owned(), &template);
        Ok(template)
    }

    fn load_uncached(&self, name: &str, chain: &mut Vec<String>) -> Result<Template> {
        let source = self.loader.source(name)?;
        let program = Arc::new(self.program(&source)?);
        Template::load(self, Arc::clone(&program), program, Some(source), chain)
    }

    /// Loads embedded template `index` of the file compiled to `root`.
    pub(crate) fn load_embedded(
        &self,
        root: &Arc<CompiledTemplate>,
        source: Option<&Source>,
        index: usize,
    ) -> Result<Arc<Template>> {
        let key = format!("{}#{index}", root.name);
        if let Some(template) = self.cached(&key) {
            if Arc::ptr_eq(template.root(), root) {
                return Ok(template);
            }
        }
        let program = root
            .embedded
            .iter()
            .find(|embedded| embedded.index == Some(index))
            .cloned()
            .ok_or_else(|| {
                Error::runtime(format!(
                    "Embedded template {index} does not exist in \"{}\".",
                    root.name
                ))
            })?;
        let template = Arc::new(Template::load(
            self,
            Arc::new(program),
            Arc::clone(root),
            source.cloned(),
            &mut vec![key.clone()],
        )?);
        self.remember(key, &template);
        Ok(template)
    }

    /// Loads the first of `names` the loader has.
    ///
    /// # Errors
    ///
    /// [`Error::Loader`] when none exists.
    pub fn resolve_template<S: AsRef<str>>(&self, names: &[S]) -> Result<Arc<Template>> {
        if let [single] = names {
            return self.load_template(single.as_ref());
        }
        for name in names {
            if self.loader.exists(name.as_ref()) {
                return self.load_template(name.as_ref());
            }
        }
        let names: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        Err(Error::loader(format!(
            "Unable to find one of the following templates: \"{}\".",
            names.join("\", \"")
        )))
    }

    /// Compiles a template from a string. The result is not cached; it may
    /// extend or include templates from the loader.
    ///
    /// # Errors
    ///
    /// Whatever compiling the code raises.
    pub fn template_from_string(&self, code: &str, name: Option<&str>) -> Result<Arc<Template>> {
        let hash = cache::fingerprint([code]);
        let name = match name {
            Some(name) => format!("{name} (string template {hash})"),
            None => format!("__string_template__{hash}"),
        };
        let source = Source::new(code, name);
        let program = Arc::new(self.compile_source(&source)?);
        Ok(Arc::new(Template::load(
            self,
            Arc::clone(&program),
            program,
            Some(source),
            &mut Vec::new(),
        )?))
    }

    /// Loads and renders a template.
    ///
    /// # Errors
    ///
    /// Loading and rendering errors.
    pub fn render(&self, name: &str, context: Context) -> Result<String> {
        self.load_template(name)?.render(self, context)
    }

    /// Loads a template and renders it into `out`.
    ///
    /// # Errors
    ///
    /// Loading and rendering errors.
    pub fn render_to(&self, name: &str, context: Context, out: &mut dyn fmt::Write) -> Result<()> {
        self.load_template(name)?.display(self, context, out)
    }
}
