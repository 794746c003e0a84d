use super::NodeVisitor;
use crate::ast::{Attribute, Node, NodeKind};
use crate::environment::Environment;
use crate::error::Result;
use crate::value::ConstValue;

/// Conservative tree simplification:
///
/// * `raw` filters are dropped, leaving the input marked safe;
/// * prints of literals become text, and runs of text and prints are merged
///   into a single output statement;
/// * `{{ block(...) }}` and `{{ parent() }}` write directly instead of
///   producing a value first;
/// * loops that never look at `loop` skip building the loop variable.
#[derive(Debug, Default)]
pub struct OptimizerVisitor {
    /// One flag per enclosing `for`: whether it needs its loop variable.
    loops: Vec<bool>,
    /// Target names of the enclosing loops.
    loop_targets: Vec<String>,
}

impl OptimizerVisitor {
    fn add_loop_to_current(&mut self) {
        if let Some(current) = self.loops.last_mut() {
            *current = true;
        }
    }

    fn add_loop_to_all(&mut self) {
        for with_loop in &mut self.loops {
            *with_loop = true;
        }
    }

    fn enter_loop_analysis(&mut self, mut node: Node) -> Node {
        let kind = node.kind();
        if kind == NodeKind::For {
            self.loops.push(false);
            self.loop_targets
                .push(node.node("value_target").attr_str("name").to_owned());
            self.loop_targets
                .push(node.node("key_target").attr_str("name").to_owned());
        } else if self.loops.is_empty() {
            return node;
        } else if kind == NodeKind::Name {
            if node.attr_str("name") == "loop" {
                node.set_attribute("always_defined", true);
                self.add_loop_to_current();
            } else if self.loop_targets.iter().any(|t| t == node.attr_str("name")) {
                node.set_attribute("always_defined", true);
            }
        } else if kind == NodeKind::BlockReference || kind == NodeKind::BlockFunction {
            self.add_loop_to_current();
        } else if (kind == NodeKind::Include || kind == NodeKind::Embed) && !node.attr_bool("only") {
            self.add_loop_to_all();
        } else if kind == NodeKind::Function && node.attr_str("name") == "include" {
            self.add_loop_to_all();
        } else if kind == NodeKind::GetAttr {
            let dynamic = node
                .node("attribute")
                .constant_value()
                .is_none_or(|attribute| attribute.as_str() == Some("parent"));
            let on_loop = node.node("node").kind() == NodeKind::Name
                && node.node("node").attr_str("name") == "loop";
            if dynamic && (self.loops.last().copied().unwrap_or(false) || on_loop) {
                self.add_loop_to_all();
            }
        }
        node
    }
}

/// A print of a literal has a fixed output.
fn literal_output(expr: &Node) -> Option<String> {
    match expr.constant_value()? {
        ConstValue::String(s) => Some(s.clone()),
        value @ (ConstValue::Int(_) | ConstValue::Float(_) | ConstValue::Bool(_) | ConstValue::Null) => {
            Some(value.to_string())
        }
        ConstValue::Seq(_) | ConstValue::Map(_) => None,
    }
}

fn optimize_print(mut node: Node) -> Node {
    let expr = node.node("expr");
    let direct = expr.kind() == NodeKind::Parent
        || (expr.kind() == NodeKind::BlockFunction && !expr.attr_bool("is_defined_test"));
    if direct {
        if let Some(mut expr) = node.remove_node("expr") {
            expr.set_attribute("output", true);
            return expr;
        }
    }
    match literal_output(node.node("expr")) {
        Some(text) => Node::text(text, node.line()),
        None => node,
    }
}

fn is_mergeable(node: &Node) -> bool {
    matches!(node.kind(), NodeKind::Text | NodeKind::Print) && node.tag().is_none()
}

/// Groups consecutive text and print statements of a list into output nodes.
fn merge_output(mut list: Node) -> Node {
    let children: Vec<&Node> = list.children().collect();
    if !children.windows(2).any(|pair| pair.iter().all(|child| is_mergeable(child))) {
        return list;
    }

    let line = list.line();
    let mut merged: Vec<Node> = Vec::new();
    let mut run: Vec<Node> = Vec::new();

    let flush = |run: &mut Vec<Node>, merged: &mut Vec<Node>| match run.len() {
        0 => {}
        1 => merged.extend(run.drain(..)),
        _ => {
            let first_line = run.first().map_or(line, Node::line);
            let mut output = Node::list(std::mem::take(run), first_line);
            output.set_kind(NodeKind::Output);
            merged.push(output);
        }
    };

    for (_, child) in list.take_nodes() {
        if is_mergeable(&child) {
            run.push(child);
        } else {
            flush(&mut run, &mut merged);
            merged.push(child);
        }
    }
    flush(&mut run, &mut merged);

    for child in merged {
        list.push(child);
    }
    list
}

impl NodeVisitor for OptimizerVisitor {
    fn priority(&self) -> i32 {
        -10
    }

    fn enter_node(&mut self, mut node: Node, _env: &Environment) -> Result<Node> {
        if node.kind() == NodeKind::For {
            node.set_attribute("with_loop", false);
        }
        Ok(self.enter_loop_analysis(node))
    }

    fn leave_node(&mut self, mut node: Node, _env: &Environment) -> Result<Option<Node>> {
        let kind = node.kind();
        if kind == NodeKind::For {
            let with_loop = self.loops.pop().unwrap_or(true);
            self.loop_targets.truncate(self.loop_targets.len().saturating_sub(2));
            node.set_attribute("with_loop", with_loop);
            Ok(Some(node))
        } else if kind == NodeKind::Filter && node.attr_str("name") == "raw" {
            let line = node.line();
            let mut input = node
                .remove_node("node")
                .unwrap_or_else(|| Node::constant(ConstValue::Null, line));
            input.set_attribute("safe", Attribute::Strings(vec!["all".to_owned()]));
            Ok(Some(input))
        } else if kind == NodeKind::Print {
            Ok(Some(optimize_print(node)))
        } else if kind == NodeKind::Nodes {
            Ok(Some(merge_output(node)))
        } else {
            Ok(Some(node))
        }
    }
}
