//! Rendering: loaded templates, the render context and the virtual machine
//! that runs compiled programs.

mod context;
pub mod escape;
mod template;
mod vm;

use indexmap::IndexMap;

use crate::environment::Environment;
use crate::value::Value;

pub use context::Context;
pub use template::Template;

/// What a host filter, function or test can see of the running template.
///
/// The environment and the variables are only handed over to callables that
/// asked for them.
#[derive(Clone, Copy)]
pub struct State<'a> {
    env: Option<&'a Environment>,
    /// The rendering environment, kept even when `env` is hidden so that
    /// arrow functions handed to any callable can run.
    renderer: Option<&'a Environment>,
    context: Option<&'a IndexMap<String, Value>>,
    template: &'a str,
}

impl<'a> State<'a> {
    pub(crate) const fn new(
        env: &'a Environment,
        context: &'a IndexMap<String, Value>,
        template: &'a str,
    ) -> Self {
        Self {
            env: Some(env),
            renderer: Some(env),
            context: Some(context),
            template,
        }
    }

    /// A state with nothing in it, for calling host functions outside a
    /// render.
    pub const fn detached() -> Self {
        Self {
            env: None,
            renderer: None,
            context: None,
            template: "",
        }
    }

    pub(crate) const fn scoped(&self, env: bool, context: bool) -> Self {
        Self {
            env: if env { self.env } else { None },
            renderer: self.renderer,
            context: if context { self.context } else { None },
            template: self.template,
        }
    }

    pub const fn environment(&self) -> Option<&'a Environment> {
        self.env
    }

    pub const fn context(&self) -> Option<&'a IndexMap<String, Value>> {
        self.context
    }

    pub(crate) const fn renderer(&self) -> Option<&'a Environment> {
        self.renderer
    }

    /// Name of the template being rendered.
    pub const fn template_name(&self) -> &'a str {
        self.template
    }
}
