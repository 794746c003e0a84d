//! Lowers a visited module tree into a [`CompiledTemplate`].

pub mod program;

use tracing::debug;

use self::program::{
    AttrKind, CompiledTemplate, Instr, MacroDef, Manifest, ParentRef, Routine, TraitRef,
};
use crate::ast::{Attribute, Node, NodeKind};
use crate::error::{Error, Result};
use crate::extension::{BinaryKind, Builtin, Callable, Registry, UnaryKind};
use crate::value::{BinaryOp, ConstValue};

/// Argument names of the `include()` function, with their defaults.
const INCLUDE_ARGUMENTS: [&str; 5] = [
    "template",
    "variables",
    "with_context",
    "ignore_missing",
    "sandboxed",
];

/// Builds one routine, keeping the line table in step with the code.
#[derive(Debug, Default)]
struct Emitter {
    code: Vec<Instr>,
    lines: Vec<(usize, usize)>,
}

impl Emitter {
    fn emit(&mut self, instr: Instr, line: usize) -> usize {
        let pc = self.code.len();
        if self.lines.last().is_none_or(|(_, last)| *last != line) {
            self.lines.push((pc, line));
        }
        self.code.push(instr);
        pc
    }

    /// Points the jump at `at` to the current end of the code.
    fn patch_here(&mut self, at: usize) {
        let here = self.code.len();
        if let Some(
            Instr::Jump { target }
            | Instr::JumpIfFalse { target }
            | Instr::JumpIfTrue { target }
            | Instr::JumpIfFalseOrPop { target }
            | Instr::JumpIfTrueOrPop { target }
            | Instr::JumpIfNotNullOrPop { target }
            | Instr::Iterate { exit: target, .. },
        ) = self.code.get_mut(at)
        {
            *target = here;
        }
    }

    fn finish(self) -> Routine {
        Routine {
            code: self.code,
            lines: self.lines,
        }
    }
}

/// Compiles a module produced by the parser and the visitor pipeline.
///
/// # Errors
///
/// Unknown operators or callables that slipped past the parser, and named
/// arguments that do not match the callable's declaration.
pub fn compile(registry: &Registry, module: &Node) -> Result<CompiledTemplate> {
    let compiler = Compiler { registry };
    let mut template = compiler.compile_module(module)?;

    let mut embedded = Vec::new();
    compiler.collect_embedded(module, &mut embedded)?;
    embedded.sort_by_key(|t| t.index);
    template.embedded = embedded;

    debug!(
        template = template.name.as_str(),
        instructions = template.instruction_count(),
        "compiled template"
    );
    Ok(template)
}

struct Compiler<'r> {
    registry: &'r Registry,
}

fn child_list(node: &Node) -> Vec<&Node> {
    node.children().collect()
}

fn as_line(value: Option<&ConstValue>) -> usize {
    if let Some(ConstValue::Int(i)) = value {
        usize::try_from(*i).unwrap_or_default()
    } else {
        0
    }
}

fn manifest(check: &Node) -> Manifest {
    let section = |name: &str| {
        check
            .get_node(name)
            .map(|list| {
                list.nodes()
                    .map(|(key, line)| (key.to_owned(), as_line(line.constant_value())))
                    .collect()
            })
            .unwrap_or_default()
    };
    Manifest {
        tags: section("tags"),
        filters: section("filters"),
        functions: section("functions"),
    }
}

/// A template can be used as a trait when it only defines blocks.
fn is_traitable(module: &Node) -> bool {
    if module.has_node("parent") || !module.node("macros").is_empty() {
        return false;
    }
    only_blocks(module.node("body"))
}

/// Whether `node` holds nothing but block references and blank text.
fn only_blocks(node: &Node) -> bool {
    let kind = node.kind();
    if kind == NodeKind::Body || kind == NodeKind::Nodes || kind == NodeKind::Output {
        node.children().all(only_blocks)
    } else if kind == NodeKind::Text {
        node.attr_str("data").chars().all(char::is_whitespace)
    } else {
        kind == NodeKind::BlockReference
    }
}

impl Compiler<'_> {
    fn compile_module(&self, module: &Node) -> Result<CompiledTemplate> {
        let name = module.attr_str("name").to_owned();
        let index = module
            .attr_int("index")
            .and_then(|i| usize::try_from(i).ok());

        let parent = match module.get_node("parent") {
            Some(parent) => Some(match parent.constant_str() {
                Some(name) => ParentRef::Static {
                    name: name.to_owned(),
                    line: parent.line(),
                },
                None => {
                    let mut e = Emitter::default();
                    self.expr(&mut e, parent)?;
                    ParentRef::Dynamic {
                        routine: e.finish(),
                        line: parent.line(),
                    }
                }
            }),
            None => None,
        };

        let traits = module
            .node("traits")
            .children()
            .map(|node| TraitRef {
                template: node
                    .node("template")
                    .constant_str()
                    .unwrap_or_default()
                    .to_owned(),
                renames: node
                    .node("targets")
                    .nodes()
                    .map(|(source, alias)| {
                        (
                            source.to_owned(),
                            alias.constant_str().unwrap_or(source).to_owned(),
                        )
                    })
                    .collect(),
                line: node.line(),
            })
            .collect();

        let mut display = Emitter::default();
        self.statement(&mut display, module.node("body"))?;
        if let Some(parent) = module.get_node("parent") {
            display.emit(Instr::DisplayParent, parent.line());
        }

        let mut blocks = indexmap::IndexMap::new();
        for (block_name, block) in module.node("blocks").nodes() {
            let mut e = Emitter::default();
            self.statement(&mut e, block.node("body"))?;
            blocks.insert(block_name.to_owned(), e.finish());
        }

        let mut macros = indexmap::IndexMap::new();
        for (macro_name, node) in module.node("macros").nodes() {
            let params = node
                .node("arguments")
                .nodes()
                .map(|(param, default)| {
                    (param.to_owned(), default.to_const_value().unwrap_or(ConstValue::Null))
                })
                .collect();
            let mut e = Emitter::default();
            self.statement(&mut e, node.node("body"))?;
            macros.insert(
                macro_name.to_owned(),
                MacroDef {
                    params,
                    body: e.finish(),
                    line: node.line(),
                },
            );
        }

        Ok(CompiledTemplate {
            name,
            index,
            parent,
            traits,
            display: display.finish(),
            blocks,
            macros,
            embedded: Vec::new(),
            manifest: module.get_node("security_check").map(manifest),
            is_traitable: is_traitable(module),
        })
    }

    /// Compiles every embedded template of `module`, nested ones included.
    fn collect_embedded(&self, module: &Node, out: &mut Vec<CompiledTemplate>) -> Result<()> {
        if let Some(Attribute::Modules(embedded)) = module.get_attribute("embedded_templates") {
            for template in embedded {
                out.push(self.compile_module(template)?);
                self.collect_embedded(template, out)?;
            }
        }
        Ok(())
    }

    fn statement(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        match node.kind() {
            NodeKind::Nodes | NodeKind::Body | NodeKind::Output => {
                for child in node.children() {
                    self.statement(e, child)?;
                }
            }
            NodeKind::Text => {
                let text = node.attr_str("data");
                if !text.is_empty() {
                    e.emit(Instr::EmitText { text: text.to_owned() }, line);
                }
            }
            NodeKind::Print => {
                self.expr(e, node.node("expr"))?;
                e.emit(Instr::Emit, line);
            }
            NodeKind::If => self.if_statement(e, node)?,
            NodeKind::For => self.for_statement(e, node)?,
            NodeKind::Set => self.set_statement(e, node)?,
            NodeKind::BlockReference => {
                e.emit(
                    Instr::Const {
                        value: ConstValue::String(node.attr_str("name").to_owned()),
                    },
                    line,
                );
                e.emit(Instr::DisplayBlock { has_template: false }, line);
            }
            NodeKind::Import => {
                self.expr(e, node.node("expr"))?;
                e.emit(
                    Instr::Import {
                        var: node.attr_str("var").to_owned(),
                        global: node.attr_bool("global"),
                    },
                    line,
                );
            }
            NodeKind::Include => {
                self.expr(e, node.node("expr"))?;
                let has_variables = self.optional(e, node.get_node("variables"))?;
                e.emit(
                    Instr::Include {
                        ignore_missing: node.attr_bool("ignore_missing"),
                        only: node.attr_bool("only"),
                        has_variables,
                    },
                    line,
                );
            }
            NodeKind::Embed => {
                let has_variables = self.optional(e, node.get_node("variables"))?;
                e.emit(
                    Instr::IncludeEmbedded {
                        index: node
                            .attr_int("index")
                            .and_then(|i| usize::try_from(i).ok())
                            .unwrap_or_default(),
                        ignore_missing: node.attr_bool("ignore_missing"),
                        only: node.attr_bool("only"),
                        has_variables,
                    },
                    line,
                );
            }
            NodeKind::AutoEscape => self.statement(e, node.node("body"))?,
            NodeKind::Sandbox => {
                e.emit(Instr::EnableSandbox, line);
                self.statement(e, node.node("body"))?;
                e.emit(Instr::DisableSandbox, line);
            }
            NodeKind::With => {
                let has_variables = self.optional(e, node.get_node("variables"))?;
                e.emit(
                    Instr::PushWith {
                        only: node.attr_bool("only"),
                        has_variables,
                    },
                    line,
                );
                self.statement(e, node.node("body"))?;
                e.emit(Instr::PopWith, line);
            }
            NodeKind::Do => {
                self.expr(e, node.node("expr"))?;
                e.emit(Instr::Pop, line);
            }
            NodeKind::Flush => {
                e.emit(Instr::Flush, line);
            }
            NodeKind::Deprecated => {
                self.expr(e, node.node("expr"))?;
                for option in ["package", "version"] {
                    match node.get_node(option) {
                        Some(value) => self.expr(e, value)?,
                        None => {
                            e.emit(Instr::Const { value: ConstValue::Null }, line);
                        }
                    }
                }
                e.emit(Instr::Deprecated, line);
            }
            NodeKind::Parent | NodeKind::BlockFunction if node.attr_bool("output") => {
                self.expr(e, node)?;
            }
            // Stored on the module rather than compiled in place.
            NodeKind::Block
            | NodeKind::Macro
            | NodeKind::Trait
            | NodeKind::Module
            | NodeKind::SecurityCheck => {}
            NodeKind::Constant
            | NodeKind::Name
            | NodeKind::AssignName
            | NodeKind::Array
            | NodeKind::Binary
            | NodeKind::Unary
            | NodeKind::Conditional
            | NodeKind::NullCoalesce
            | NodeKind::Filter
            | NodeKind::Function
            | NodeKind::Test
            | NodeKind::GetAttr
            | NodeKind::MacroCall
            | NodeKind::Parent
            | NodeKind::BlockFunction
            | NodeKind::CheckToString
            | NodeKind::Arrow => {
                self.expr(e, node)?;
                e.emit(Instr::Pop, line);
            }
        }
        Ok(())
    }

    /// Compiles an optional child, reporting whether it was there.
    fn optional(&self, e: &mut Emitter, node: Option<&Node>) -> Result<bool> {
        match node {
            Some(node) => {
                self.expr(e, node)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn if_statement(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let tests = child_list(node.node("tests"));
        let mut end_jumps = Vec::new();
        for pair in tests.chunks(2) {
            let [condition, body] = pair else {
                continue;
            };
            self.expr(e, condition)?;
            let skip = e.emit(Instr::JumpIfFalse { target: 0 }, condition.line());
            self.statement(e, body)?;
            end_jumps.push(e.emit(Instr::Jump { target: 0 }, body.line()));
            e.patch_here(skip);
        }
        if let Some(else_body) = node.get_node("else") {
            self.statement(e, else_body)?;
        }
        for jump in end_jumps {
            e.patch_here(jump);
        }
        Ok(())
    }

    fn for_statement(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        let key = node.node("key_target").attr_str("name").to_owned();
        let value = node.node("value_target").attr_str("name").to_owned();
        self.expr(e, node.node("seq"))?;
        e.emit(
            Instr::PushLoop {
                with_loop: node.attr_bool("with_loop"),
            },
            line,
        );
        let top = e.emit(
            Instr::Iterate {
                key: key.clone(),
                value: value.clone(),
                exit: 0,
            },
            line,
        );
        self.statement(e, node.node("body"))?;
        e.emit(Instr::Jump { target: top }, line);
        e.patch_here(top);

        match node.get_node("else") {
            Some(else_body) => {
                e.emit(Instr::LoopIterated, line);
                e.emit(Instr::PopLoop { key, value }, line);
                let skip = e.emit(Instr::JumpIfTrue { target: 0 }, line);
                self.statement(e, else_body)?;
                e.patch_here(skip);
            }
            None => {
                e.emit(Instr::PopLoop { key, value }, line);
            }
        }
        Ok(())
    }

    fn set_statement(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        let names: Vec<String> = node
            .node("names")
            .children()
            .map(|name| name.attr_str("name").to_owned())
            .collect();
        if node.attr_bool("capture") {
            e.emit(Instr::BeginCapture, line);
            self.statement(e, node.node("values"))?;
            e.emit(Instr::EndCapture, line);
        } else {
            for value in node.node("values").children() {
                self.expr(e, value)?;
            }
        }
        for name in names.into_iter().rev() {
            e.emit(Instr::Store { name }, line);
        }
        Ok(())
    }

    fn expr(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        match node.kind() {
            NodeKind::Constant => {
                let value = node.constant_value().cloned().unwrap_or(ConstValue::Null);
                e.emit(Instr::Const { value }, line);
            }
            NodeKind::Name => {
                let ignore_strict =
                    node.attr_bool("ignore_strict_check") || node.attr_bool("always_defined");
                self.name(e, node, ignore_strict);
            }
            NodeKind::Array => self.array(e, node)?,
            NodeKind::Binary => self.binary(e, node)?,
            NodeKind::Unary => {
                let name = node.attr_str("operator");
                let operator = self.registry.unary_operator(name).ok_or_else(|| {
                    Error::syntax(format!("Unknown unary operator \"{name}\"."), line)
                })?;
                self.expr(e, node.node("node"))?;
                match &operator.kind {
                    UnaryKind::Builtin(op) => e.emit(Instr::Unary { op: *op }, line),
                    UnaryKind::Custom(_) => e.emit(
                        Instr::CustomUnary {
                            name: name.to_owned(),
                        },
                        line,
                    ),
                };
            }
            NodeKind::Conditional => {
                self.expr(e, node.node("expr1"))?;
                let to_else = e.emit(Instr::JumpIfFalse { target: 0 }, line);
                self.expr(e, node.node("expr2"))?;
                let to_end = e.emit(Instr::Jump { target: 0 }, line);
                e.patch_here(to_else);
                self.expr(e, node.node("expr3"))?;
                e.patch_here(to_end);
            }
            NodeKind::NullCoalesce => {
                self.expr(e, node.node("left"))?;
                let to_end = e.emit(Instr::JumpIfNotNullOrPop { target: 0 }, line);
                self.expr(e, node.node("right"))?;
                e.patch_here(to_end);
            }
            NodeKind::Filter => self.filter(e, node)?,
            NodeKind::Function => self.function(e, node)?,
            NodeKind::Test => self.test(e, node)?,
            NodeKind::GetAttr => self.get_attr(e, node, false, false)?,
            NodeKind::MacroCall => self.macro_call(e, node)?,
            NodeKind::Parent => {
                let name = node.attr_str("name").to_owned();
                if node.attr_bool("output") {
                    e.emit(Instr::DisplayParentBlock { name }, line);
                } else {
                    e.emit(Instr::ParentBlockValue { name }, line);
                }
            }
            NodeKind::BlockFunction => {
                self.expr(e, node.node("name"))?;
                let has_template = self.optional(e, node.get_node("template"))?;
                let instr = if node.attr_bool("is_defined_test") {
                    Instr::HasBlock { has_template }
                } else if node.attr_bool("output") {
                    Instr::DisplayBlock { has_template }
                } else {
                    Instr::BlockValue { has_template }
                };
                e.emit(instr, line);
            }
            NodeKind::CheckToString => {
                self.expr(e, node.node("expr"))?;
                e.emit(Instr::CheckToString, line);
            }
            NodeKind::Arrow => {
                let mut body = Emitter::default();
                self.expr(&mut body, node.node("expr"))?;
                e.emit(
                    Instr::MakeArrow {
                        params: node.attr_strings("names").to_vec(),
                        body: body.finish(),
                    },
                    line,
                );
            }
            NodeKind::Nodes
            | NodeKind::Module
            | NodeKind::Body
            | NodeKind::Text
            | NodeKind::Print
            | NodeKind::Output
            | NodeKind::If
            | NodeKind::For
            | NodeKind::Set
            | NodeKind::Block
            | NodeKind::BlockReference
            | NodeKind::Macro
            | NodeKind::Import
            | NodeKind::Include
            | NodeKind::Embed
            | NodeKind::AutoEscape
            | NodeKind::Sandbox
            | NodeKind::With
            | NodeKind::Do
            | NodeKind::Flush
            | NodeKind::Deprecated
            | NodeKind::Trait
            | NodeKind::AssignName
            | NodeKind::SecurityCheck => {
                return Err(Error::syntax(
                    format!("A {:?} node cannot be used as an expression.", node.kind()),
                    line,
                ));
            }
        }
        Ok(())
    }

    fn name(&self, e: &mut Emitter, node: &Node, ignore_strict: bool) {
        let line = node.line();
        let name = node.attr_str("name");
        let instr = match name {
            "_self" => Instr::SelfTemplate,
            "_context" => Instr::ContextValue,
            "_charset" => Instr::Const {
                value: ConstValue::String("UTF-8".to_owned()),
            },
            _ if node.attr_bool("is_defined_test") => Instr::Defined {
                name: name.to_owned(),
            },
            _ => Instr::Lookup {
                name: name.to_owned(),
                ignore_strict,
            },
        };
        e.emit(instr, line);
    }

    fn array(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        let pairs: Vec<(&Node, &Node)> = node.array_pairs().collect();
        let spread = pairs.iter().any(|(_, value)| value.attr_bool("spread"));
        let sequence = node.attr_bool("sequence");

        if !spread {
            for (key, value) in &pairs {
                if !sequence {
                    self.expr(e, key)?;
                }
                self.expr(e, value)?;
            }
            let len = pairs.len();
            let instr = if sequence {
                Instr::BuildList { len }
            } else {
                Instr::BuildMap { len }
            };
            e.emit(instr, line);
            return Ok(());
        }

        if sequence {
            e.emit(Instr::BuildList { len: 0 }, line);
            for (_, value) in pairs {
                self.expr(e, value)?;
                let instr = if value.attr_bool("spread") {
                    Instr::ListExtend
                } else {
                    Instr::ListPush
                };
                e.emit(instr, value.line());
            }
        } else {
            e.emit(Instr::BuildMap { len: 0 }, line);
            for (key, value) in pairs {
                if value.attr_bool("spread") {
                    self.expr(e, value)?;
                    e.emit(Instr::MapExtend, value.line());
                } else {
                    self.expr(e, key)?;
                    self.expr(e, value)?;
                    e.emit(Instr::MapInsert, value.line());
                }
            }
        }
        Ok(())
    }

    fn binary(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        let name = node.attr_str("operator");
        let operator = self
            .registry
            .binary_operator(name)
            .ok_or_else(|| Error::syntax(format!("Unknown binary operator \"{name}\"."), line))?;

        self.expr(e, node.node("left"))?;
        match &operator.kind {
            BinaryKind::Builtin(op @ (BinaryOp::And | BinaryOp::Or)) => {
                let jump = if *op == BinaryOp::And {
                    Instr::JumpIfFalseOrPop { target: 0 }
                } else {
                    Instr::JumpIfTrueOrPop { target: 0 }
                };
                let at = e.emit(jump, line);
                self.expr(e, node.node("right"))?;
                e.patch_here(at);
                e.emit(Instr::ToBool, line);
            }
            BinaryKind::Builtin(op) => {
                self.expr(e, node.node("right"))?;
                e.emit(Instr::Binary { op: *op }, line);
            }
            BinaryKind::Custom(_) => {
                self.expr(e, node.node("right"))?;
                e.emit(
                    Instr::CustomBinary {
                        name: name.to_owned(),
                    },
                    line,
                );
            }
            BinaryKind::Is | BinaryKind::IsNot | BinaryKind::NullCoalesce => {
                return Err(Error::syntax(
                    format!("The \"{name}\" operator cannot be compiled as a binary expression."),
                    line,
                ));
            }
        }
        Ok(())
    }

    fn filter(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        let name = node.attr_str("name");
        let filter = self
            .registry
            .filter(name)
            .ok_or_else(|| Error::syntax(format!("Unknown \"{name}\" filter."), line))?;
        if filter.builtin_kind() == Some(Builtin::Default) {
            self.lenient(e, node.node("node"))?;
        } else {
            self.expr(e, node.node("node"))?;
        }
        let nargs = self.arguments(e, node.node("arguments"), Some(filter))?;
        e.emit(
            Instr::CallFilter {
                name: name.to_owned(),
                nargs,
            },
            line,
        );
        Ok(())
    }

    fn function(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        let name = node.attr_str("name");
        let function = self
            .registry
            .function(name)
            .ok_or_else(|| Error::syntax(format!("Unknown \"{name}\" function."), line))?;
        if function.builtin_kind() == Some(Builtin::Include) {
            return self.include_function(e, node, function);
        }
        let nargs = self.arguments(e, node.node("arguments"), Some(function))?;
        e.emit(
            Instr::CallFunction {
                name: name.to_owned(),
                nargs,
            },
            line,
        );
        Ok(())
    }

    fn include_function(&self, e: &mut Emitter, node: &Node, function: &Callable) -> Result<()> {
        let line = node.line();
        let bound = bind_arguments(node.node("arguments"), function, line)?;
        for (position, name) in INCLUDE_ARGUMENTS.iter().enumerate() {
            match bound.get(position).copied().flatten() {
                Some(value) => self.expr(e, value)?,
                None => {
                    let value = match *name {
                        "template" => {
                            return Err(Error::syntax(
                                "The \"include\" function requires a template name.",
                                line,
                            ));
                        }
                        "variables" => ConstValue::Map(Vec::new()),
                        "with_context" => ConstValue::Bool(true),
                        _ => ConstValue::Bool(false),
                    };
                    e.emit(Instr::Const { value }, line);
                }
            }
        }
        e.emit(Instr::IncludeFunction, line);
        Ok(())
    }

    fn test(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        let name = node.attr_str("name");
        let test = self
            .registry
            .test(name)
            .ok_or_else(|| Error::syntax(format!("Unknown \"{name}\" test."), line))?;
        if test.builtin_kind() == Some(Builtin::Defined) {
            return self.defined(e, node.node("node"));
        }
        self.expr(e, node.node("node"))?;
        let nargs = self.arguments(e, node.node("arguments"), Some(test))?;
        e.emit(
            Instr::CallTest {
                name: name.to_owned(),
                nargs,
            },
            line,
        );
        Ok(())
    }

    /// Operand of `is defined`.
    fn defined(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        let kind = node.kind();
        if kind == NodeKind::Name {
            match node.attr_str("name") {
                "_self" | "_context" | "_charset" => {
                    e.emit(Instr::Const { value: ConstValue::Bool(true) }, line);
                }
                name => {
                    e.emit(Instr::Defined { name: name.to_owned() }, line);
                }
            }
        } else if kind == NodeKind::GetAttr {
            self.get_attr(e, node, true, true)?;
        } else if kind == NodeKind::MacroCall {
            e.emit(
                Instr::HasMacro {
                    template: macro_template(node),
                    name: node.attr_str("name").to_owned(),
                },
                line,
            );
        } else {
            self.expr(e, node)?;
        }
        Ok(())
    }

    /// Compiles an expression without strict variable checks, for the input
    /// of `default`.
    fn lenient(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let kind = node.kind();
        if kind == NodeKind::Name {
            self.name(e, node, true);
            Ok(())
        } else if kind == NodeKind::GetAttr {
            self.get_attr(e, node, true, false)
        } else {
            self.expr(e, node)
        }
    }

    fn get_attr(&self, e: &mut Emitter, node: &Node, lenient: bool, defined_test: bool) -> Result<()> {
        let line = node.line();
        let ignore_strict = lenient || node.attr_bool("ignore_strict_check");
        if ignore_strict {
            self.lenient(e, node.node("node"))?;
        } else {
            self.expr(e, node.node("node"))?;
        }
        self.expr(e, node.node("attribute"))?;
        let nargs = self.arguments(e, node.node("arguments"), None)?;
        let kind = match node.attr_str("type") {
            "method" => AttrKind::Method,
            "array" => AttrKind::Array,
            _ => AttrKind::Any,
        };
        e.emit(
            Instr::GetAttr {
                kind,
                nargs,
                sandboxed: node.attr_bool("sandboxed"),
                ignore_strict,
                defined_test: defined_test || node.attr_bool("is_defined_test"),
            },
            line,
        );
        Ok(())
    }

    fn macro_call(&self, e: &mut Emitter, node: &Node) -> Result<()> {
        let line = node.line();
        let template = macro_template(node);
        let name = node.attr_str("name").to_owned();
        if node.attr_bool("is_defined_test") {
            e.emit(Instr::HasMacro { template, name }, line);
            return Ok(());
        }

        let arguments = node.node("arguments");
        let positional: Vec<&Node> = arguments
            .nodes()
            .filter(|(key, _)| key.parse::<usize>().is_ok())
            .map(|(_, value)| value)
            .collect();
        let nargs = self.values(e, &positional, line)?;
        let mut named = Vec::new();
        for (key, value) in arguments.nodes() {
            if key.parse::<usize>().is_err() {
                self.expr(e, value)?;
                named.push(key.to_owned());
            }
        }
        e.emit(
            Instr::CallMacro {
                template,
                name,
                nargs,
                named,
            },
            line,
        );
        Ok(())
    }

    /// Pushes call arguments, binding named ones against the callable's
    /// declared argument names.
    fn arguments(&self, e: &mut Emitter, arguments: &Node, callable: Option<&Callable>) -> Result<Option<usize>> {
        let line = arguments.line();
        let has_named = arguments.nodes().any(|(key, _)| key.parse::<usize>().is_err());
        if let Some(callable) = callable.filter(|_| has_named) {
            let bound = bind_arguments(arguments, callable, line)?;
            let null = Node::constant(ConstValue::Null, line);
            let values: Vec<&Node> = bound.iter().map(|value| value.unwrap_or(&null)).collect();
            self.values(e, &values, line)
        } else {
            let values: Vec<&Node> = arguments.children().collect();
            self.values(e, &values, line)
        }
    }

    /// Pushes a list of argument values: one stack slot each, or a single
    /// sequence when any of them is spread.
    fn values(&self, e: &mut Emitter, values: &[&Node], line: usize) -> Result<Option<usize>> {
        if !values.iter().any(|value| value.attr_bool("spread")) {
            for value in values {
                self.expr(e, value)?;
            }
            return Ok(Some(values.len()));
        }
        e.emit(Instr::BuildList { len: 0 }, line);
        for value in values {
            self.expr(e, value)?;
            let instr = if value.attr_bool("spread") {
                Instr::ListExtend
            } else {
                Instr::ListPush
            };
            e.emit(instr, value.line());
        }
        Ok(None)
    }
}

fn macro_template(node: &Node) -> Option<String> {
    match node.attr_str("template") {
        "" | "_self" => None,
        template => Some(template.to_owned()),
    }
}

/// Orders call arguments by the callable's declared names. Gaps left by
/// skipped optional arguments are `None`; trailing gaps are dropped.
fn bind_arguments<'a>(arguments: &'a Node, callable: &Callable, line: usize) -> Result<Vec<Option<&'a Node>>> {
    let names = callable.argument_names();
    let kind = callable.kind();
    let callable_name = callable.name();
    let mut bound: Vec<Option<&Node>> = Vec::new();

    for (key, value) in arguments.nodes() {
        let position = match key.parse::<usize>() {
            Ok(position) => position,
            Err(_) => {
                if names.is_empty() {
                    return Err(Error::syntax(
                        format!("Named arguments are not supported for {kind} \"{callable_name}\"."),
                        value.line(),
                    ));
                }
                names.iter().position(|name| name == key).ok_or_else(|| {
                    Error::syntax(
                        format!(
                            "Unknown argument \"{key}\" for {kind} \"{callable_name}({})\".",
                            names.join(", ")
                        ),
                        value.line(),
                    )
                })?
            }
        };
        if bound.len() <= position {
            bound.resize(position.saturating_add(1), None);
        }
        if let Some(slot) = bound.get_mut(position) {
            if slot.is_some() {
                let name = names.get(position).map_or(key, String::as_str);
                return Err(Error::syntax(
                    format!("Argument \"{name}\" is defined twice for {kind} \"{callable_name}\"."),
                    value.line(),
                ));
            }
            *slot = Some(value);
        }
    }

    if bound.len() > names.len() && !callable.is_variadic() && !names.is_empty() {
        return Err(Error::syntax(
            format!(
                "Too many arguments for {kind} \"{callable_name}({})\".",
                names.join(", ")
            ),
            line,
        ));
    }
    while bound.last().is_some_and(Option::is_none) {
        bound.pop();
    }
    Ok(bound)
}
