//! Passes over the syntax tree, run between parsing and compilation.

mod escaper;
mod optimizer;
mod sandbox;

pub use self::escaper::EscaperVisitor;
pub use self::optimizer::OptimizerVisitor;
pub use self::sandbox::SandboxVisitor;

use crate::ast::{Attribute, Node};
use crate::environment::Environment;
use crate::error::Result;
use crate::extension::VisitorKind;

/// A depth-first rewrite of the tree.
///
/// `enter_node` sees a node before its children, `leave_node` after; returning
/// `None` from `leave_node` removes the node from its parent.
pub trait NodeVisitor {
    /// Lower priorities run first.
    fn priority(&self) -> i32 {
        0
    }

    /// # Errors
    ///
    /// Aborts compilation.
    fn enter_node(&mut self, node: Node, env: &Environment) -> Result<Node>;

    /// # Errors
    ///
    /// Aborts compilation.
    fn leave_node(&mut self, node: Node, env: &Environment) -> Result<Option<Node>>;
}

fn instantiate(kind: &VisitorKind) -> Box<dyn NodeVisitor> {
    match kind {
        VisitorKind::Optimizer => Box::new(OptimizerVisitor::default()),
        VisitorKind::Escaper => Box::new(EscaperVisitor::default()),
        VisitorKind::Sandbox => Box::new(SandboxVisitor::default()),
        VisitorKind::Custom(factory) => factory(),
    }
}

/// Runs every registered pass over a module, and over each embedded template
/// it carries.
///
/// # Errors
///
/// The first error raised by a pass.
pub fn traverse(mut module: Node, env: &Environment) -> Result<Node> {
    if let Some(Attribute::Modules(embedded)) = module.take_attribute("embedded_templates") {
        let embedded = embedded
            .into_iter()
            .map(|template| traverse(template, env))
            .collect::<Result<Vec<_>>>()?;
        module.set_attribute("embedded_templates", Attribute::Modules(embedded));
    }

    let mut visitors: Vec<Box<dyn NodeVisitor>> =
        env.registry().visitors().iter().map(instantiate).collect();
    visitors.sort_by_key(|visitor| visitor.priority());

    for visitor in &mut visitors {
        let line = module.line();
        module = traverse_node(visitor.as_mut(), module, env)?
            .unwrap_or_else(|| Node::list(Vec::new(), line));
    }
    Ok(module)
}

fn traverse_node(visitor: &mut dyn NodeVisitor, node: Node, env: &Environment) -> Result<Option<Node>> {
    let mut node = visitor.enter_node(node, env)?;
    let children = node.take_nodes();
    let mut kept = Vec::with_capacity(children.len());
    for (key, child) in children {
        if let Some(child) = traverse_node(visitor, child, env)? {
            kept.push((key, child));
        }
    }
    node.restore_nodes(kept);
    visitor.leave_node(node, env)
}
