use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::trace;

use super::context::Context;
use super::vm::{self, Output};
use crate::compiler::program::{CompiledTemplate, ParentRef};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::source::Source;

/// Where a block's code lives.
#[derive(Clone)]
pub(crate) struct BlockRef {
    pub(crate) template: Arc<Template>,
    pub(crate) name: String,
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.template.name(), self.name)
    }
}

pub(crate) type BlockMap = IndexMap<String, BlockRef>;

/// A loaded template, ready to render.
///
/// Statically named parents and every trait are loaded with the template;
/// parents given as expressions are resolved on each render.
///
/// # Examples
///
/// ```rust
/// use twiglet::{ArrayLoader, Context, Environment};
///
/// let loader = ArrayLoader::new([("hello.html", "Hello {{ name }}!")]);
/// let env = Environment::new(loader);
/// let template = env.load_template("hello.html").unwrap();
///
/// let mut context = Context::new();
/// context.insert("name", "World");
/// assert_eq!(template.render(&env, context).unwrap(), "Hello World!");
/// ```
pub struct Template {
    name: String,
    index: Option<usize>,
    program: Arc<CompiledTemplate>,
    /// Program of the file this template was found in; holds the embedded
    /// templates.
    root: Arc<CompiledTemplate>,
    source: Option<Source>,
    parent: Option<Arc<Template>>,
    trait_blocks: BlockMap,
    traits: Vec<Arc<Template>>,
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("parent", &self.parent.as_ref().map(|p| p.name()))
            .field("blocks", &self.block_names())
            .finish_non_exhaustive()
    }
}

impl Template {
    /// Wires a compiled program to its static parent and traits.
    ///
    /// `chain` holds the names being loaded further up, to catch templates
    /// that extend or use themselves.
    pub(crate) fn load(
        env: &Environment,
        program: Arc<CompiledTemplate>,
        root: Arc<CompiledTemplate>,
        source: Option<Source>,
        chain: &mut Vec<String>,
    ) -> Result<Self> {
        let name = program.name.clone();

        let parent = match &program.parent {
            Some(ParentRef::Static { name: parent, line }) if env.loader().exists(parent) => Some(
                env.load_template_chained(parent, chain)
                    .map_err(|e| e.locate(&name, Some(*line)))?,
            ),
            Some(ParentRef::Static { .. } | ParentRef::Dynamic { .. }) | None => None,
        };

        let mut trait_blocks = BlockMap::new();
        let mut traits = Vec::with_capacity(program.traits.len());
        for used in &program.traits {
            let located = |e: Error| e.locate(&name, Some(used.line));
            let template = env.load_template_chained(&used.template, chain).map_err(located)?;
            if !template.program.is_traitable {
                return Err(located(Error::runtime(format!(
                    "Template \"{}\" cannot be used as a trait.",
                    used.template
                ))));
            }
            let mut blocks = template.block_map();
            for (source_name, alias) in &used.renames {
                let Some(block) = blocks.shift_remove(source_name) else {
                    return Err(located(Error::runtime(format!(
                        "Block \"{source_name}\" is not defined in trait \"{}\".",
                        used.template
                    ))));
                };
                blocks.insert(alias.clone(), block);
            }
            trait_blocks.extend(blocks);
            traits.push(template);
        }

        trace!(
            template = %name,
            index = ?program.index,
            parent = ?parent.as_ref().map(|p| p.name()),
            traits = traits.len(),
            "template loaded"
        );

        Ok(Self {
            name,
            index: program.index,
            program,
            root,
            source,
            parent,
            trait_blocks,
            traits,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position among the file's embedded templates, `None` for the file
    /// itself.
    pub const fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    /// Unique within an environment: embedded templates share the file name.
    pub(crate) fn key(&self) -> String {
        match self.index {
            Some(index) => format!("{}#{index}", self.name),
            None => self.name.clone(),
        }
    }

    pub(crate) fn program(&self) -> &CompiledTemplate {
        &self.program
    }

    pub(crate) fn root(&self) -> &Arc<CompiledTemplate> {
        &self.root
    }

    pub(crate) fn static_parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    pub(crate) fn trait_blocks(&self) -> &BlockMap {
        &self.trait_blocks
    }

    pub(crate) fn traits(&self) -> &[Arc<Self>] {
        &self.traits
    }

    /// Blocks defined here or pulled in from traits, own blocks winning.
    pub(crate) fn block_map(self: &Arc<Self>) -> BlockMap {
        let mut blocks = self.trait_blocks.clone();
        for name in self.program.blocks.keys() {
            blocks.insert(
                name.clone(),
                BlockRef {
                    template: Arc::clone(self),
                    name: name.clone(),
                },
            );
        }
        blocks
    }

    /// Blocks this template defines or uses from traits.
    pub fn block_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.trait_blocks.keys().map(String::as_str).collect();
        for name in self.program.blocks.keys() {
            if !self.trait_blocks.contains_key(name) {
                names.push(name);
            }
        }
        names
    }

    /// Whether the block exists here, in a trait, or up the statically
    /// known parent chain.
    pub fn has_block(&self, name: &str) -> bool {
        self.program.blocks.contains_key(name)
            || self.trait_blocks.contains_key(name)
            || self.parent.as_ref().is_some_and(|p| p.has_block(name))
    }

    pub fn has_macro(&self, name: &str) -> bool {
        self.program.macros.contains_key(name)
    }

    pub fn macro_names(&self) -> Vec<&str> {
        self.program.macros.keys().map(String::as_str).collect()
    }

    /// Renders the template to a string.
    ///
    /// # Errors
    ///
    /// Any runtime, loader or security error raised while rendering, located
    /// at the template and line it happened on.
    pub fn render(self: &Arc<Self>, env: &Environment, context: Context) -> Result<String> {
        let mut out = String::new();
        self.display(env, context, &mut out)?;
        Ok(out)
    }

    /// Renders the template into `out`.
    ///
    /// # Errors
    ///
    /// See [`Template::render`].
    pub fn display(
        self: &Arc<Self>,
        env: &Environment,
        context: Context,
        out: &mut dyn fmt::Write,
    ) -> Result<()> {
        let mut output = Output::new(out);
        vm::render(env, self, context.into_inner(), None, &mut output)
    }

    /// Renders a single block with the template's inheritance applied.
    ///
    /// # Errors
    ///
    /// When the block does not exist, plus anything [`Template::render`]
    /// can raise.
    pub fn render_block(
        self: &Arc<Self>,
        env: &Environment,
        name: &str,
        context: Context,
    ) -> Result<String> {
        let mut out = String::new();
        let mut output = Output::new(&mut out);
        vm::render(env, self, context.into_inner(), Some(name), &mut output)?;
        Ok(out)
    }
}
