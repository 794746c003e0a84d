//! Recursive-descent parser turning a [`TokenStream`] into a module [`Node`].
//!
//! Statement tags are looked up in the frozen extension registry; expressions
//! are handled by the precedence-climbing parser in [`expression`], and the
//! built-in tags live in [`tags`].

mod expression;
mod tags;

use indexmap::IndexMap;
use tracing::trace;

use crate::ast::{Attribute, Node, NodeKind};
use crate::environment::Environment;
use crate::error::SyntaxError;
use crate::extension::{CallableKind, Registry, TagHandler};
use crate::token::{Token, TokenKind, TokenStream};

pub type ParseResult<T> = Result<T, SyntaxError>;

/// What a [`Parser::subparse`] call stops at: one of `names` as the first
/// word of a statement. `tag` and `line` describe the enclosing tag for error
/// messages.
#[derive(Debug, Clone, Copy)]
pub struct EndTest<'a> {
    pub tag: &'a str,
    pub line: usize,
    pub names: &'a [&'a str],
}

impl EndTest<'_> {
    fn matches(&self, token: &Token) -> bool {
        token.test_any(TokenKind::Name, self.names)
    }
}

/// A macro made callable as a plain function through `from ... import`.
#[derive(Debug, Clone)]
struct ImportedMacro {
    template_var: String,
    name: String,
}

#[derive(Debug, Default)]
struct Scope {
    templates: Vec<String>,
    functions: IndexMap<String, ImportedMacro>,
}

/// Per-module parse state. Embedded templates get a fresh one.
#[derive(Debug)]
struct ModuleState {
    parent: Option<Node>,
    blocks: IndexMap<String, Node>,
    block_stack: Vec<String>,
    macros: IndexMap<String, Node>,
    traits: Vec<Node>,
    embedded: Vec<Node>,
    scopes: Vec<Scope>,
    /// Function-style calls that may name a macro defined later in the file.
    tentative_macros: Vec<(String, usize)>,
}

impl Default for ModuleState {
    fn default() -> Self {
        Self {
            parent: None,
            blocks: IndexMap::new(),
            block_stack: Vec::new(),
            macros: IndexMap::new(),
            traits: Vec::new(),
            embedded: Vec::new(),
            scopes: vec![Scope::default()],
            tentative_macros: Vec::new(),
        }
    }
}

pub struct Parser<'env> {
    env: &'env Environment,
    registry: &'env Registry,
    stream: TokenStream,
    module: ModuleState,
    saved: Vec<ModuleState>,
    embed_counter: usize,
    var_counter: usize,
    /// Expressions currently being parsed, innermost last.
    expression_depth: usize,
    ignore_unknown_callables: bool,
}

impl<'env> Parser<'env> {
    pub fn new(env: &'env Environment, stream: TokenStream) -> Self {
        Self {
            env,
            registry: env.registry(),
            stream,
            module: ModuleState::default(),
            saved: Vec::new(),
            embed_counter: 0,
            var_counter: 0,
            expression_depth: 0,
            ignore_unknown_callables: false,
        }
    }

    pub const fn environment(&self) -> &'env Environment {
        self.env
    }

    pub const fn registry(&self) -> &'env Registry {
        self.registry
    }

    pub fn stream(&mut self) -> &mut TokenStream {
        &mut self.stream
    }

    pub const fn current_stream(&self) -> &TokenStream {
        &self.stream
    }

    /// Parses the whole stream into a module node.
    ///
    /// # Errors
    ///
    /// Any syntax error; parsing stops at the first one.
    pub fn parse(mut self) -> ParseResult<Node> {
        let module = self.parse_module(None)?;
        trace!(
            template = self.stream.source().name(),
            tokens = self.stream.len(),
            "parsed template"
        );
        Ok(module)
    }

    /// Parses a module up to `end` (or the end of the stream), with a fresh
    /// module state.
    fn parse_module(&mut self, end: Option<&EndTest<'_>>) -> ParseResult<Node> {
        let body = self.subparse(end, true)?;
        self.finish_module(body)
    }

    /// Parses an embedded template in place. The outer module state is set
    /// aside until the nested module is complete.
    pub(crate) fn parse_embedded(&mut self, end: &EndTest<'_>) -> ParseResult<Node> {
        let outer = std::mem::take(&mut self.module);
        self.saved.push(outer);
        let result = self.parse_module(Some(end));
        if let Some(outer) = self.saved.pop() {
            self.module = outer;
        }
        let index = self.embed_counter;
        self.embed_counter = self.embed_counter.saturating_add(1);
        let mut module = result?;
        module.set_attribute("index", i64::try_from(index).unwrap_or(i64::MAX));
        Ok(module)
    }

    fn finish_module(&mut self, body: Node) -> ParseResult<Node> {
        let state = std::mem::take(&mut self.module);
        for (name, line) in &state.tentative_macros {
            if !state.macros.contains_key(name) {
                return Err(SyntaxError::new(format!("Unknown \"{name}\" function."), *line)
                    .with_suggestions(name, self.registry.callable_names(CallableKind::Function)));
            }
        }

        let body = if state.parent.is_some() {
            filter_body_nodes(body, false)?.unwrap_or_else(|| Node::list(Vec::new(), 1))
        } else {
            body
        };

        let mut blocks = Node::new(NodeKind::Nodes, 1);
        for (name, block) in state.blocks {
            blocks.set_node(name, block);
        }
        let mut macros = Node::new(NodeKind::Nodes, 1);
        for (name, node) in state.macros {
            macros.set_node(name, node);
        }

        let mut module = Node::new(NodeKind::Module, 1)
            .with_attribute("name", self.stream.source().name())
            .with_attribute("embedded_templates", Attribute::Modules(state.embedded));
        if let Some(parent) = state.parent {
            module.set_node("parent", parent);
        }
        module.set_node("body", Node::body(body));
        module.set_node("blocks", blocks);
        module.set_node("macros", macros);
        module.set_node("traits", Node::list(state.traits, 1));
        Ok(module)
    }

    /// Parses statements until `end` matches the first word of a statement
    /// (consuming it when `drop_needle` is set) or the stream ends.
    ///
    /// # Errors
    ///
    /// Unknown tags, unexpected end of template and anything the tag parsers
    /// reject.
    pub fn subparse(&mut self, end: Option<&EndTest<'_>>, drop_needle: bool) -> ParseResult<Node> {
        let line = self.stream.current().line();
        let mut nodes = Vec::new();
        loop {
            let token = self.stream.current().clone();
            match token.kind() {
                TokenKind::Eof => {
                    if let Some(end) = end {
                        return Err(SyntaxError::new(
                            format!(
                                "Unexpected end of template (expecting closing tag for the \"{}\" tag defined near line {}).",
                                end.tag, end.line
                            ),
                            token.line(),
                        ));
                    }
                    return Ok(Node::list(nodes, line));
                }
                TokenKind::Text => {
                    self.stream.next()?;
                    nodes.push(Node::text(token.value(), token.line()));
                }
                TokenKind::VarStart => {
                    self.stream.next()?;
                    let expr = self.parse_expression()?;
                    self.stream.expect(TokenKind::VarEnd)?;
                    nodes.push(Node::print(expr, token.line()));
                }
                TokenKind::BlockStart => {
                    self.stream.next()?;
                    let tag = self.stream.current().clone();
                    if !tag.test(TokenKind::Name) {
                        return Err(SyntaxError::new("A block must start with a tag name.", tag.line()));
                    }
                    if let Some(end) = end {
                        if end.matches(&tag) {
                            if drop_needle {
                                self.stream.next()?;
                            }
                            return Ok(Node::list(nodes, line));
                        }
                    }
                    let Some(handler) = self.registry.tag(tag.value()).cloned() else {
                        return Err(self.unknown_tag(&tag, end));
                    };
                    self.stream.next()?;
                    let node = match &handler {
                        TagHandler::Core(core) => self.parse_core_tag(*core, &tag)?,
                        TagHandler::Custom(parser) => parser.parse(&tag, self)?,
                    };
                    let node = node.unwrap_or_else(|| Node::list(Vec::new(), tag.line()));
                    nodes.push(node.with_tag(tag.value()));
                }
                TokenKind::BlockEnd
                | TokenKind::VarEnd
                | TokenKind::Name
                | TokenKind::Number
                | TokenKind::String
                | TokenKind::Operator
                | TokenKind::Punctuation
                | TokenKind::InterpolationStart
                | TokenKind::InterpolationEnd
                | TokenKind::Spread
                | TokenKind::Arrow => {
                    return Err(SyntaxError::new(
                        "The lexer or the parser ended up in an unsupported state.",
                        token.line(),
                    ));
                }
            }
        }
    }

    fn unknown_tag(&self, tag: &Token, end: Option<&EndTest<'_>>) -> SyntaxError {
        match end {
            Some(end) => SyntaxError::new(
                format!(
                    "Unexpected \"{}\" tag (expecting closing tag for the \"{}\" tag defined near line {}).",
                    tag.value(),
                    end.tag,
                    end.line
                ),
                tag.line(),
            ),
            None => SyntaxError::new(format!("Unknown \"{}\" tag.", tag.value()), tag.line())
                .with_suggestions(tag.value(), self.registry.tag_names()),
        }
    }

    /// A fresh variable name for compiler-generated temporaries.
    pub fn next_var_name(&mut self, prefix: &str) -> String {
        let name = format!("__internal_{prefix}_{}", self.var_counter);
        self.var_counter = self.var_counter.saturating_add(1);
        name
    }

    pub fn peek_block_stack(&self) -> Option<&str> {
        self.module.block_stack.last().map(String::as_str)
    }

    pub fn is_main_scope(&self) -> bool {
        self.module.scopes.len() == 1
    }

    pub fn push_local_scope(&mut self) {
        self.module.scopes.push(Scope::default());
    }

    pub fn pop_local_scope(&mut self) {
        if self.module.scopes.len() > 1 {
            self.module.scopes.pop();
        }
    }

    pub const fn has_parent(&self) -> bool {
        self.module.parent.is_some()
    }

    pub fn has_traits(&self) -> bool {
        !self.module.traits.is_empty()
    }

    pub fn has_macro(&self, name: &str) -> bool {
        self.module.macros.contains_key(name)
    }

    fn add_imported_template(&mut self, alias: &str) {
        if let Some(scope) = self.module.scopes.last_mut() {
            scope.templates.push(alias.to_owned());
        }
    }

    fn add_imported_function(&mut self, alias: &str, name: &str, template_var: &str) {
        if let Some(scope) = self.module.scopes.last_mut() {
            scope.functions.insert(
                alias.to_owned(),
                ImportedMacro {
                    template_var: template_var.to_owned(),
                    name: name.to_owned(),
                },
            );
        }
    }

    fn is_imported_template(&self, alias: &str) -> bool {
        let scopes = &self.module.scopes;
        scopes.last().is_some_and(|s| s.templates.iter().any(|t| t == alias))
            || scopes.first().is_some_and(|s| s.templates.iter().any(|t| t == alias))
    }

    fn imported_function(&self, alias: &str) -> Option<ImportedMacro> {
        let scopes = &self.module.scopes;
        scopes
            .last()
            .and_then(|s| s.functions.get(alias))
            .or_else(|| scopes.first().and_then(|s| s.functions.get(alias)))
            .cloned()
    }
}

/// Node kinds that write output directly.
const fn is_output(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Text | NodeKind::Print | NodeKind::BlockReference | NodeKind::Include | NodeKind::Embed
    )
}

/// Strips the body of a child template down to the statements that still
/// matter once the parent takes over rendering.
fn filter_body_nodes(mut node: Node, nested: bool) -> ParseResult<Option<Node>> {
    let kind = node.kind();
    let is_text = kind == NodeKind::Text;
    if (is_text && !node.attr_str("data").chars().all(char::is_whitespace))
        || (!is_text && kind != NodeKind::BlockReference && is_output(kind))
    {
        let message = if node.attr_str("data").starts_with('\u{feff}') {
            "A template that extends another one cannot start with a byte order mark (BOM); it must be removed."
        } else {
            "A template that extends another one cannot include content outside Twig blocks. Did you forget to put the content inside a {% block %} tag?"
        };
        return Err(SyntaxError::new(message, node.line()));
    }

    if kind == NodeKind::Set && node.attr_bool("capture") {
        return Ok(Some(node));
    }

    if nested && kind == NodeKind::BlockReference {
        return Err(SyntaxError::new(
            "A block definition cannot be nested under non-capturing nodes.",
            node.line(),
        ));
    }

    if is_output(kind) {
        return Ok(None);
    }

    let nested = nested || kind != NodeKind::Nodes;
    let children = node.take_nodes();
    let mut kept = Vec::with_capacity(children.len());
    for (key, child) in children {
        if let Some(child) = filter_body_nodes(child, nested)? {
            kept.push((key, child));
        }
    }
    node.restore_nodes(kept);
    Ok(Some(node))
}
