//! The compiled form of a template.
//!
//! A template compiles to a [`CompiledTemplate`]: a set of stack-machine
//! routines (display, one per block, one per macro) plus the metadata the
//! runtime needs to wire inheritance, traits and the sandbox together. It is
//! plain data, serialized with `serde_json` for the compiled-code cache.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::{BinaryOp, ConstValue, UnaryOp};

/// How `GetAttr` looks the attribute up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrKind {
    /// `a.b`: mapping key, sequence index, object property, then method.
    Any,
    /// `a[b]`: mapping key or sequence index only.
    Array,
    /// `a.b(...)`.
    Method,
}

/// One stack-machine instruction.
///
/// `nargs: None` means the arguments were collected into a single sequence
/// value (calls with a spread argument).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "instr", rename_all = "snake_case")]
pub enum Instr {
    EmitText { text: String },
    /// Pops a value and writes it.
    Emit,
    Const { value: ConstValue },
    Pop,
    Lookup { name: String, ignore_strict: bool },
    /// Pushes whether the variable exists.
    Defined { name: String },
    SelfTemplate,
    ContextValue,
    /// Pops a value into a variable.
    Store { name: String },
    BuildList { len: usize },
    BuildMap { len: usize },
    ListPush,
    ListExtend,
    MapInsert,
    MapExtend,
    GetAttr {
        kind: AttrKind,
        nargs: Option<usize>,
        sandboxed: bool,
        ignore_strict: bool,
        defined_test: bool,
    },
    Binary { op: BinaryOp },
    Unary { op: UnaryOp },
    CustomBinary { name: String },
    CustomUnary { name: String },
    ToBool,
    Jump { target: usize },
    JumpIfFalse { target: usize },
    JumpIfTrue { target: usize },
    /// Jumps keeping the value when falsy, pops it otherwise.
    JumpIfFalseOrPop { target: usize },
    JumpIfTrueOrPop { target: usize },
    JumpIfNotNullOrPop { target: usize },
    /// Pops the arguments, then the filtered value.
    CallFilter { name: String, nargs: Option<usize> },
    CallFunction { name: String, nargs: Option<usize> },
    /// Pops the arguments, then the tested value.
    CallTest { name: String, nargs: Option<usize> },
    /// Pops the named argument values (in `named` order), then the
    /// positional ones. `template` is the variable holding the imported
    /// template, `None` for the current one.
    CallMacro {
        template: Option<String>,
        name: String,
        nargs: Option<usize>,
        named: Vec<String>,
    },
    HasMacro { template: Option<String>, name: String },
    /// Pops the sequence and starts a loop frame.
    PushLoop { with_loop: bool },
    /// Binds the next item, or jumps to `exit` when the sequence is done.
    Iterate { key: String, value: String, exit: usize },
    /// Pushes whether the current loop ran at least once.
    LoopIterated,
    PopLoop { key: String, value: String },
    BeginCapture,
    /// Pushes the captured output as markup.
    EndCapture,
    /// Pops the block name (and template when `has_template`) and renders
    /// the block.
    DisplayBlock { has_template: bool },
    BlockValue { has_template: bool },
    HasBlock { has_template: bool },
    DisplayParentBlock { name: String },
    ParentBlockValue { name: String },
    DisplayParent,
    /// Pops the variables (when `has_variables`), then the template.
    Include { ignore_missing: bool, only: bool, has_variables: bool },
    IncludeEmbedded {
        index: usize,
        ignore_missing: bool,
        only: bool,
        has_variables: bool,
    },
    /// Pops `template`, `variables`, `with_context`, `ignore_missing` and
    /// `sandboxed`, pushes the output.
    IncludeFunction,
    /// Pops a template reference and binds it for macro calls.
    Import { var: String, global: bool },
    CheckToString,
    EnableSandbox,
    DisableSandbox,
    PushWith { only: bool, has_variables: bool },
    PopWith,
    /// Pushes an arrow function closing over the current variables.
    MakeArrow { params: Vec<String>, body: Routine },
    /// Pops the version, the package and the message.
    Deprecated,
    Flush,
}

/// A compiled body with its line table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub code: Vec<Instr>,
    /// `(pc, line)` entries, one each time the source line changes.
    pub lines: Vec<(usize, usize)>,
}

impl Routine {
    /// The template line the instruction at `pc` came from.
    pub fn line_at(&self, pc: usize) -> Option<usize> {
        let index = self.lines.partition_point(|(start, _)| *start <= pc);
        index
            .checked_sub(1)
            .and_then(|i| self.lines.get(i))
            .map(|(_, line)| *line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroDef {
    /// Declared parameters with their defaults, in order.
    pub params: Vec<(String, ConstValue)>,
    pub body: Routine,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentRef {
    /// `{% extends "name" %}`.
    Static { name: String, line: usize },
    /// Any other expression, evaluated against the render context.
    Dynamic { routine: Routine, line: usize },
}

/// A `{% use %}` statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitRef {
    pub template: String,
    /// Source block name to the name it is imported under.
    pub renames: IndexMap<String, String>,
    pub line: usize,
}

/// First line each tag, filter and function is used on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub tags: IndexMap<String, usize>,
    pub filters: IndexMap<String, usize>,
    pub functions: IndexMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledTemplate {
    pub name: String,
    /// Position among the root template's embedded templates.
    pub index: Option<usize>,
    pub parent: Option<ParentRef>,
    pub traits: Vec<TraitRef>,
    pub display: Routine,
    pub blocks: IndexMap<String, Routine>,
    pub macros: IndexMap<String, MacroDef>,
    /// Embedded templates of the whole file, flattened (root only).
    pub embedded: Vec<CompiledTemplate>,
    /// Present when the sandbox pass ran.
    pub manifest: Option<Manifest>,
    pub is_traitable: bool,
}

impl CompiledTemplate {
    /// Total instructions across all routines, for logging.
    pub fn instruction_count(&self) -> usize {
        let parent = if let Some(ParentRef::Dynamic { routine, .. }) = &self.parent {
            routine.code.len()
        } else {
            0
        };
        [
            self.display.code.len(),
            parent,
            self.blocks.values().map(|r| r.code.len()).fold(0, usize::saturating_add),
            self.macros.values().map(|m| m.body.code.len()).fold(0, usize::saturating_add),
            self.embedded.iter().map(Self::instruction_count).fold(0, usize::saturating_add),
        ]
        .into_iter()
        .fold(0, usize::saturating_add)
    }
}
