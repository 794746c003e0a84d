//! A Twig-compatible template engine.
//!
//! Templates go through a lexer, a recursive-descent parser, a pipeline of
//! tree passes (optimizer, autoescaper, sandbox), and a compiler that emits
//! a serializable stack-machine program. The runtime executes programs with
//! template inheritance, blocks, macros, includes and an optional sandbox.
//!
//! ```rust
//! use twiglet::{ArrayLoader, Context, Environment};
//!
//! let loader = ArrayLoader::new([
//!     ("base.html", "<title>{% block title %}{% endblock %}</title>"),
//!     ("page.html", "{% extends 'base.html' %}{% block title %}{{ name }}{% endblock %}"),
//! ]);
//! let env = Environment::new(loader);
//!
//! let mut context = Context::new();
//! context.insert("name", "Tom & Jerry");
//! assert_eq!(
//!     env.render("page.html", context).unwrap(),
//!     "<title>Tom &amp; Jerry</title>"
//! );
//! ```

pub mod ast;
pub mod cache;
pub mod compiler;
mod environment;
pub mod error;
pub mod extension;
pub mod lexer;
pub mod loader;
pub mod parser;
pub mod runtime;
pub mod sandbox;
mod source;
pub mod token;
pub mod value;
pub mod visitor;

// Public exports.
pub use cache::{Cache, FilesystemCache, MemoryCache, NullCache};
pub use environment::{Autoescape, AutoescapeCallback, Environment, EnvironmentOptions, guess_strategy};
pub use error::{Error, ErrorLocation, Result};
pub use extension::{Callable, Deprecation, Extension};
pub use loader::{ArrayLoader, ChainLoader, FilesystemLoader, Loader};
pub use runtime::{Context, State, Template};
pub use source::Source;
pub use value::{Object, Value};
