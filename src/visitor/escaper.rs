use std::collections::HashMap;

use super::NodeVisitor;
use crate::ast::{Attribute, Node, NodeKind};
use crate::environment::Environment;
use crate::error::Result;
use crate::value::ConstValue;

/// Escaping status: a strategy name, or `None` when escaping is off.
type Status = Option<String>;

/// Wraps every print whose expression is not already safe for the active
/// strategy in an `escape` filter.
///
/// The active strategy comes from the innermost `autoescape` tag, from the
/// block being defined, or from the environment's default for the
/// template's name.
#[derive(Debug, Default)]
pub struct EscaperVisitor {
    default_strategy: Status,
    status_stack: Vec<Status>,
    /// Escaping status at each block's point of use.
    blocks: HashMap<String, Status>,
    /// Variables holding imported templates.
    safe_vars: Vec<String>,
}

fn intersect(a: Option<Vec<String>>, b: Option<Vec<String>>) -> Vec<String> {
    let (Some(a), Some(b)) = (a, b) else {
        return Vec::new();
    };
    if a.iter().any(|s| s == "all") {
        return b;
    }
    if b.iter().any(|s| s == "all") {
        return a;
    }
    a.into_iter().filter(|s| b.contains(s)).collect()
}

impl EscaperVisitor {
    fn need_escaping(&self) -> Status {
        match self.status_stack.last() {
            Some(status) => status.clone(),
            None => self.default_strategy.clone(),
        }
    }

    /// Strategies an expression's value is already safe for.
    fn safe_for(&self, node: &Node, env: &Environment) -> Vec<String> {
        if let Some(Attribute::Strings(safe)) = node.get_attribute("safe") {
            return safe.clone();
        }
        let all = || vec!["all".to_owned()];
        let kind = node.kind();
        if matches!(
            kind,
            NodeKind::Constant | NodeKind::BlockFunction | NodeKind::Parent | NodeKind::MacroCall
        ) {
            all()
        } else if kind == NodeKind::Conditional {
            intersect(
                Some(self.safe_for(node.node("expr2"), env)),
                Some(self.safe_for(node.node("expr3"), env)),
            )
        } else if kind == NodeKind::Filter {
            let Some(filter) = env.registry().filter(node.attr_str("name")) else {
                return Vec::new();
            };
            match filter.safe_for(node.node("arguments")) {
                Some(safe) => safe,
                None => intersect(
                    Some(self.safe_for(node.node("node"), env)),
                    Some(filter.preserved_safety().to_vec()),
                ),
            }
        } else if kind == NodeKind::Function {
            env.registry()
                .function(node.attr_str("name"))
                .and_then(|function| function.safe_for(node.node("arguments")))
                .unwrap_or_default()
        } else if kind == NodeKind::Name && self.safe_vars.iter().any(|v| v == node.attr_str("name")) {
            all()
        } else {
            Vec::new()
        }
    }

    fn is_safe_for(&self, strategy: &str, node: &Node, env: &Environment) -> bool {
        self.safe_for(node, env)
            .iter()
            .any(|s| s == strategy || s == "all")
    }

    fn escape_inline(&self, strategy: &str, node: Node, env: &Environment) -> Node {
        if self.is_safe_for(strategy, &node, env) {
            node
        } else {
            escaper_filter(strategy, node)
        }
    }

    fn should_unwrap_conditional(&self, strategy: &str, node: &Node, env: &Environment) -> bool {
        self.is_safe_for(strategy, node.node("expr2"), env)
            != self.is_safe_for(strategy, node.node("expr3"), env)
    }

    /// `a ? b : c` becomes `a ? escape(b) : escape(c)` so that only the
    /// unsafe branch is escaped.
    fn unwrap_conditional(&self, strategy: &str, mut node: Node, env: &Environment) -> Node {
        for branch in ["expr2", "expr3"] {
            let Some(expr) = node.remove_node(branch) else {
                continue;
            };
            let expr = if expr.kind() == NodeKind::Conditional
                && self.should_unwrap_conditional(strategy, &expr, env)
            {
                self.unwrap_conditional(strategy, expr, env)
            } else {
                self.escape_inline(strategy, expr, env)
            };
            node.set_node(branch, expr);
        }
        node
    }

    fn escape_print(&self, strategy: &str, mut node: Node, env: &Environment) -> Node {
        let Some(expr) = node.remove_node("expr") else {
            return node;
        };
        let expr = if expr.kind() == NodeKind::Conditional
            && self.should_unwrap_conditional(strategy, &expr, env)
        {
            self.unwrap_conditional(strategy, expr, env)
        } else {
            self.escape_inline(strategy, expr, env)
        };
        node.set_node("expr", expr);
        node
    }

    /// Escapes the input of filters that declare a pre-escape strategy.
    fn pre_escape_filter(&self, mut node: Node, env: &Environment) -> Node {
        let Some(strategy) = env
            .registry()
            .filter(node.attr_str("name"))
            .and_then(|filter| filter.pre_escape_strategy())
        else {
            return node;
        };
        if let Some(input) = node.remove_node("node") {
            let input = self.escape_inline(strategy, input, env);
            node.set_node("node", input);
        }
        node
    }
}

/// The filter call the pass injects.
fn escaper_filter(strategy: &str, node: Node) -> Node {
    let line = node.line();
    let arguments = Node::list(
        vec![
            Node::string(strategy, line),
            Node::constant(ConstValue::Null, line),
            Node::constant(ConstValue::Bool(true), line),
        ],
        line,
    );
    Node::new(NodeKind::Filter, line)
        .with_node("node", node)
        .with_attribute("name", "escape")
        .with_node("arguments", arguments)
        .with_attribute("auto_injected", true)
}

impl NodeVisitor for EscaperVisitor {
    fn enter_node(&mut self, node: Node, env: &Environment) -> Result<Node> {
        let kind = node.kind();
        if kind == NodeKind::Module {
            self.default_strategy = env.default_escaping_strategy(node.attr_str("name"));
            self.safe_vars.clear();
            self.blocks.clear();
        } else if kind == NodeKind::AutoEscape {
            let status = if let Some(Attribute::Str(strategy)) = node.get_attribute("value") {
                Some(strategy.clone())
            } else {
                None
            };
            self.status_stack.push(status);
        } else if kind == NodeKind::Block {
            let status = match self.blocks.get(node.attr_str("name")) {
                Some(status) => status.clone(),
                None => self.need_escaping(),
            };
            self.status_stack.push(status);
        } else if kind == NodeKind::Import {
            self.safe_vars.push(node.attr_str("var").to_owned());
        }
        Ok(node)
    }

    fn leave_node(&mut self, node: Node, env: &Environment) -> Result<Option<Node>> {
        let kind = node.kind();
        if kind == NodeKind::Module {
            self.default_strategy = None;
            self.safe_vars.clear();
            self.blocks.clear();
        } else if kind == NodeKind::Filter {
            return Ok(Some(self.pre_escape_filter(node, env)));
        } else if kind == NodeKind::Print {
            if let Some(strategy) = self.need_escaping() {
                return Ok(Some(self.escape_print(&strategy, node, env)));
            }
        } else if kind == NodeKind::AutoEscape || kind == NodeKind::Block {
            self.status_stack.pop();
        } else if kind == NodeKind::BlockReference {
            self.blocks
                .insert(node.attr_str("name").to_owned(), self.need_escaping());
        }
        Ok(Some(node))
    }
}
