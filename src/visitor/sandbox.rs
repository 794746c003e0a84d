use indexmap::IndexMap;

use super::NodeVisitor;
use crate::ast::{Node, NodeKind};
use crate::environment::Environment;
use crate::error::Result;
use crate::value::ConstValue;

/// Records the first use of every tag, filter and function for the runtime
/// security check, marks attribute access for policy checks and wraps values
/// that may be converted to strings.
#[derive(Debug, Default)]
pub struct SandboxVisitor {
    in_module: bool,
    tags: IndexMap<String, usize>,
    filters: IndexMap<String, usize>,
    functions: IndexMap<String, usize>,
    needs_to_string_wrap: bool,
}

fn wrap_child(node: &mut Node, name: &str) {
    let wrap = node
        .get_node(name)
        .is_some_and(|child| matches!(child.kind(), NodeKind::Name | NodeKind::GetAttr));
    if !wrap {
        return;
    }
    if let Some(child) = node.remove_node(name) {
        let line = child.line();
        node.set_node(
            name.to_owned(),
            Node::new(NodeKind::CheckToString, line).with_node("expr", child),
        );
    }
}

fn wrap_arguments(node: &mut Node) {
    if let Some(arguments) = node.get_node_mut("arguments") {
        let keys: Vec<String> = arguments.nodes().map(|(key, _)| key.to_owned()).collect();
        for key in keys {
            wrap_child(arguments, &key);
        }
    }
}

fn manifest_list(entries: &IndexMap<String, usize>, line: usize) -> Node {
    let mut list = Node::new(NodeKind::Nodes, line);
    for (name, first_line) in entries {
        let first_line = i64::try_from(*first_line).unwrap_or(i64::MAX);
        list.set_node(name.clone(), Node::constant(ConstValue::Int(first_line), line));
    }
    list
}

impl NodeVisitor for SandboxVisitor {
    fn priority(&self) -> i32 {
        10
    }

    fn enter_node(&mut self, mut node: Node, _env: &Environment) -> Result<Node> {
        if node.kind() == NodeKind::Module {
            self.in_module = true;
            self.tags.clear();
            self.filters.clear();
            self.functions.clear();
            return Ok(node);
        }
        if !self.in_module {
            return Ok(node);
        }

        let line = node.line();
        if let Some(tag) = node.tag() {
            self.tags.entry(tag.to_owned()).or_insert(line);
        }
        let kind = node.kind();
        if kind == NodeKind::Filter && !node.attr_bool("auto_injected") {
            self.filters
                .entry(node.attr_str("name").to_owned())
                .or_insert(line);
        } else if kind == NodeKind::Function {
            self.functions
                .entry(node.attr_str("name").to_owned())
                .or_insert(line);
        } else if kind == NodeKind::Binary && node.attr_str("operator") == ".." {
            self.functions.entry("range".to_owned()).or_insert(line);
        } else if kind == NodeKind::GetAttr {
            node.set_attribute("sandboxed", true);
        }

        if kind == NodeKind::Print {
            self.needs_to_string_wrap = true;
            wrap_child(&mut node, "expr");
        } else if kind == NodeKind::Set && !node.attr_bool("capture") {
            self.needs_to_string_wrap = true;
        }

        if self.needs_to_string_wrap {
            if kind == NodeKind::Binary && node.attr_str("operator") == "~" {
                wrap_child(&mut node, "left");
                wrap_child(&mut node, "right");
            } else if kind == NodeKind::Filter {
                wrap_child(&mut node, "node");
                wrap_arguments(&mut node);
            } else if kind == NodeKind::Function {
                wrap_arguments(&mut node);
            }
        }
        Ok(node)
    }

    fn leave_node(&mut self, mut node: Node, _env: &Environment) -> Result<Option<Node>> {
        let kind = node.kind();
        if kind == NodeKind::Module {
            self.in_module = false;
            let line = node.line();
            let check = Node::new(NodeKind::SecurityCheck, line)
                .with_node("tags", manifest_list(&self.tags, line))
                .with_node("filters", manifest_list(&self.filters, line))
                .with_node("functions", manifest_list(&self.functions, line));
            node.set_node("security_check", check);
        } else if kind == NodeKind::Print || kind == NodeKind::Set {
            self.needs_to_string_wrap = false;
        }
        Ok(Some(node))
    }
}
