//! Executes compiled routines.
//!
//! Every template, block and macro body runs in its own [`Frame`] with a
//! private copy of the variables, so assignments never leak back into the
//! caller. State shared by a whole render (imports, sandbox nesting, the
//! inheritance chain being displayed) lives on the [`Vm`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{trace, warn};

use super::State;
use super::template::{BlockMap, BlockRef, Template};
use crate::compiler::program::{AttrKind, Instr, ParentRef, Routine};
use crate::environment::Environment;
use crate::error::{Error, Result, SecurityErrorKind};
use crate::extension::{BinaryKind, Builtin, UnaryKind};
use crate::sandbox::{SecurityPolicy, TO_STRING_METHOD};
use crate::value::{Iteration, Object, Value, binary_op, unary_op};

type Scope = IndexMap<String, Value>;

/// Nested displays, blocks and macro calls allowed before rendering fails.
const MAX_DEPTH: usize = 500;

/// Where rendered text goes. Captures (`{% set %}` bodies, macro calls,
/// `block()` values) stack on top of the final writer.
pub(crate) struct Output<'w> {
    sink: &'w mut dyn fmt::Write,
    captures: Vec<String>,
}

impl<'w> Output<'w> {
    pub(crate) fn new(sink: &'w mut dyn fmt::Write) -> Self {
        Self {
            sink,
            captures: Vec::new(),
        }
    }

    fn write(&mut self, text: &str) -> Result<()> {
        match self.captures.last_mut() {
            Some(buffer) => {
                buffer.push_str(text);
                Ok(())
            }
            None => self
                .sink
                .write_str(text)
                .map_err(|_| Error::runtime("Unable to write the template output.")),
        }
    }

    fn begin_capture(&mut self) {
        self.captures.push(String::new());
    }

    fn end_capture(&mut self) -> String {
        self.captures.pop().unwrap_or_default()
    }
}

struct LoopState {
    iter: Iteration,
    index0: usize,
    length: Option<usize>,
    /// Variables as they were when the loop started.
    parent: Arc<Scope>,
    with_loop: bool,
    iterated: bool,
}

impl LoopState {
    /// The `loop` variable for the item at `index0`. Counting from the end
    /// is only possible when the length is known.
    fn variable(&self) -> Value {
        let mut map = Scope::with_capacity(8);
        map.insert("parent".to_owned(), Value::Map(Arc::clone(&self.parent)));
        map.insert("index0".to_owned(), Value::from(self.index0));
        map.insert("index".to_owned(), Value::from(self.index0.saturating_add(1)));
        map.insert("first".to_owned(), Value::Bool(self.index0 == 0));
        if let Some(length) = self.length {
            let revindex0 = length.saturating_sub(self.index0.saturating_add(1));
            map.insert("revindex0".to_owned(), Value::from(revindex0));
            map.insert("revindex".to_owned(), Value::from(revindex0.saturating_add(1)));
            map.insert("length".to_owned(), Value::from(length));
            map.insert("last".to_owned(), Value::Bool(revindex0 == 0));
        }
        Value::from_map(map)
    }
}

struct Frame {
    template: Arc<Template>,
    ctx: Scope,
    blocks: Arc<BlockMap>,
    stack: Vec<Value>,
    loops: Vec<LoopState>,
    withs: Vec<Scope>,
    /// Imports made inside a block or macro body.
    imports: IndexMap<String, Arc<Template>>,
}

fn corrupted() -> Error {
    Error::runtime("Corrupted program: the value stack is empty.")
}

impl Frame {
    fn new(template: Arc<Template>, ctx: Scope, blocks: Arc<BlockMap>) -> Self {
        Self {
            template,
            ctx,
            blocks,
            stack: Vec::with_capacity(16),
            loops: Vec::new(),
            withs: Vec::new(),
            imports: IndexMap::new(),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(corrupted)
    }

    fn peek(&self) -> Result<&Value> {
        self.stack.last().ok_or_else(corrupted)
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        let at = self.stack.len().checked_sub(n).ok_or_else(corrupted)?;
        Ok(self.stack.split_off(at))
    }

    /// `None` means the arguments were gathered into one sequence.
    fn pop_args(&mut self, nargs: Option<usize>) -> Result<Vec<Value>> {
        match nargs {
            Some(n) => self.pop_n(n),
            None => Ok(into_items(self.pop()?)),
        }
    }
}

fn into_items(value: Value) -> Vec<Value> {
    if let Value::Seq(items) = value {
        Arc::try_unwrap(items).unwrap_or_else(|items| (*items).clone())
    } else if value.is_null() {
        Vec::new()
    } else if value.is_iterable() {
        value
            .iterate()
            .map(|it| it.map(|(_, v)| v).collect())
            .unwrap_or_default()
    } else {
        vec![value]
    }
}

fn into_map(value: Value) -> Scope {
    if let Value::Map(map) = value {
        Arc::try_unwrap(map).unwrap_or_else(|map| (*map).clone())
    } else {
        value
            .iterate()
            .map(|it| it.map(|(k, v)| (k.to_string(), v)).collect())
            .unwrap_or_default()
    }
}

/// Variables handed to an include or a `with` body.
fn variables(value: Value, tag: &str) -> Result<Scope> {
    match value {
        Value::Null => Ok(Scope::new()),
        Value::Map(_) | Value::Seq(_) | Value::Iter(_) => Ok(into_map(value)),
        Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::String(_)
        | Value::Markup(_)
        | Value::Object(_)
        | Value::Template(_) => Err(Error::runtime(format!(
            "Variables passed to the \"{tag}\" tag must be a mapping."
        ))),
    }
}

/// A function value created by `x => expr`. Its body sees the variables
/// that were in scope where it was written, plus its parameters.
struct Arrow {
    template: Arc<Template>,
    params: Vec<String>,
    body: Routine,
    captured: Scope,
    imports: IndexMap<String, Arc<Template>>,
    sandboxed: bool,
}

impl fmt::Debug for Arrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arrow")
            .field("template", &self.template.name())
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Object for Arrow {
    fn class_name(&self) -> &str {
        "Closure"
    }

    fn is_callable(&self) -> bool {
        true
    }

    /// Missing arguments are null; extra ones are ignored.
    fn call(&self, state: &State<'_>, args: &[Value]) -> Result<Value> {
        let env = state
            .renderer()
            .ok_or_else(|| Error::runtime("An arrow function can only be called while a template renders."))?;
        let mut ctx = self.captured.clone();
        for (index, name) in self.params.iter().enumerate() {
            ctx.insert(name.clone(), args.get(index).cloned().unwrap_or_default());
        }
        let mut vm = Vm::new(env);
        if self.sandboxed {
            vm.sandbox_depth = 1;
        }
        let mut frame = Frame::new(Arc::clone(&self.template), ctx, Arc::new(BlockMap::new()));
        frame.imports = self.imports.clone();
        let mut scratch = String::new();
        let mut scratch = Output::new(&mut scratch);
        vm.call_routine(&self.body, &mut frame, &mut scratch)?;
        frame.pop()
    }
}

/// Renders `template`, or only one of its blocks.
pub(crate) fn render(
    env: &Environment,
    template: &Arc<Template>,
    context: Scope,
    block: Option<&str>,
    out: &mut Output<'_>,
) -> Result<()> {
    let mut vm = Vm::new(env);
    trace!(template = template.name(), block, "rendering");
    match block {
        None => vm.display(template, context, &BlockMap::new(), out),
        Some(name) => {
            vm.check_security(template)?;
            let context = vm.with_globals(context);
            vm.display_block(template, name, context, &Arc::new(BlockMap::new()), true, out)
        }
    }
}

struct Vm<'env> {
    env: &'env Environment,
    policy: Option<Arc<dyn SecurityPolicy>>,
    globally_sandboxed: bool,
    sandbox_depth: usize,
    /// Top-level imports, per template.
    imports: HashMap<String, IndexMap<String, Arc<Template>>>,
    /// Templates whose parent is being displayed.
    inheritance: Vec<String>,
    depth: usize,
}

impl<'env> Vm<'env> {
    fn new(env: &'env Environment) -> Self {
        Self {
            env,
            policy: env.registry().security_policy().cloned(),
            globally_sandboxed: env.options().sandboxed,
            sandbox_depth: 0,
            imports: HashMap::new(),
            inheritance: Vec::new(),
            depth: 0,
        }
    }

    fn is_sandboxed(&self) -> bool {
        self.policy.is_some() && (self.globally_sandboxed || self.sandbox_depth > 0)
    }

    fn strict(&self) -> bool {
        self.env.options().strict_variables
    }

    fn with_globals(&self, mut context: Scope) -> Scope {
        for (name, value) in self.env.registry().globals() {
            if !context.contains_key(name) {
                context.insert(name.clone(), value.clone());
            }
        }
        context
    }

    /// Runs the tag, filter and function manifest of a template (and of the
    /// traits it uses) through the policy.
    fn check_security(&self, template: &Arc<Template>) -> Result<()> {
        let Some(policy) = self.policy.as_ref().filter(|_| self.is_sandboxed()) else {
            return Ok(());
        };
        let mut pending = vec![Arc::clone(template)];
        while let Some(current) = pending.pop() {
            pending.extend(current.traits().iter().cloned());
            let Some(manifest) = &current.program().manifest else {
                continue;
            };
            let tags: Vec<&str> = manifest.tags.keys().map(String::as_str).collect();
            let filters: Vec<&str> = manifest.filters.keys().map(String::as_str).collect();
            let functions: Vec<&str> = manifest.functions.keys().map(String::as_str).collect();
            if let Err(error) = policy.check_security(&tags, &filters, &functions) {
                let line = match error.kind() {
                    SecurityErrorKind::NotAllowedTag { tag } => manifest.tags.get(tag),
                    SecurityErrorKind::NotAllowedFilter { filter } => manifest.filters.get(filter),
                    SecurityErrorKind::NotAllowedFunction { function } => {
                        manifest.functions.get(function)
                    }
                    SecurityErrorKind::NotAllowedMethod { .. }
                    | SecurityErrorKind::NotAllowedProperty { .. } => None,
                };
                let error = match line {
                    Some(line) => error.at_line(*line),
                    None => error,
                };
                return Err(Error::Security(error).locate(current.name(), None));
            }
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::runtime(format!(
                "Maximum template nesting depth ({MAX_DEPTH}) exceeded."
            )));
        }
        self.depth = self.depth.saturating_add(1);
        Ok(())
    }

    fn call_routine(&mut self, routine: &Routine, frame: &mut Frame, out: &mut Output<'_>) -> Result<()> {
        self.enter()?;
        let result = self.run(routine, frame, out);
        self.depth = self.depth.saturating_sub(1);
        result
    }

    /// Displays a whole template. `overrides` are blocks from child
    /// templates, which win over the template's own.
    fn display(
        &mut self,
        template: &Arc<Template>,
        context: Scope,
        overrides: &BlockMap,
        out: &mut Output<'_>,
    ) -> Result<()> {
        self.check_security(template)?;
        let context = self.with_globals(context);
        let mut blocks = template.block_map();
        blocks.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut frame = Frame::new(Arc::clone(template), context, Arc::new(blocks));
        self.call_routine(&template.program().display, &mut frame, out)
    }

    /// Displays an included template: it starts a fresh inheritance chain.
    fn display_isolated(&mut self, template: &Arc<Template>, context: Scope, out: &mut Output<'_>) -> Result<()> {
        let saved = std::mem::take(&mut self.inheritance);
        let result = self.display(template, context, &BlockMap::new(), out);
        self.inheritance = saved;
        result
    }

    fn run(&mut self, routine: &Routine, frame: &mut Frame, out: &mut Output<'_>) -> Result<()> {
        let mut pc = 0;
        while let Some(instr) = routine.code.get(pc) {
            pc = pc.saturating_add(1);
            if let Err(error) = self.step(instr, &mut pc, frame, out) {
                let line = routine.line_at(pc.saturating_sub(1));
                let name = frame.template.name();
                return Err(if self.env.options().rewrite_errors {
                    error.relocate(name, line)
                } else {
                    error.locate(name, line)
                });
            }
        }
        Ok(())
    }

    fn step(&mut self, instr: &Instr, pc: &mut usize, frame: &mut Frame, out: &mut Output<'_>) -> Result<()> {
        match instr {
            Instr::EmitText { text } => out.write(text)?,
            Instr::Emit => {
                let value = frame.pop()?;
                emit(&value, out)?;
            }
            Instr::Const { value } => frame.push(value.to_value()),
            Instr::Pop => {
                frame.pop()?;
            }
            Instr::Lookup { name, ignore_strict } => {
                let value = match frame.ctx.get(name) {
                    Some(value) => value.clone(),
                    None if !ignore_strict && self.strict() => {
                        return Err(Error::runtime(format!("Variable \"{name}\" does not exist.")));
                    }
                    None => Value::Null,
                };
                frame.push(value);
            }
            Instr::Defined { name } => {
                let defined = frame.ctx.contains_key(name);
                frame.push(Value::Bool(defined));
            }
            Instr::SelfTemplate => {
                let template = Arc::clone(&frame.template);
                frame.push(Value::Template(template));
            }
            Instr::ContextValue => {
                let context = frame.ctx.clone();
                frame.push(Value::from_map(context));
            }
            Instr::Store { name } => {
                let value = frame.pop()?;
                frame.ctx.insert(name.clone(), value);
            }
            Instr::BuildList { len } => {
                let items = frame.pop_n(*len)?;
                frame.push(Value::from_seq(items));
            }
            Instr::BuildMap { len } => {
                let flat = frame.pop_n(len.saturating_mul(2))?;
                let mut map = Scope::with_capacity(*len);
                let mut flat = flat.into_iter();
                while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                    map.insert(key.to_string(), value);
                }
                frame.push(Value::from_map(map));
            }
            Instr::ListPush => {
                let value = frame.pop()?;
                let mut items = into_items(frame.pop()?);
                items.push(value);
                frame.push(Value::from_seq(items));
            }
            Instr::ListExtend => {
                let spread = frame.pop()?;
                let mut items = into_items(frame.pop()?);
                if !spread.is_iterable() {
                    return Err(Error::runtime(format!(
                        "Only sequences and mappings can be spread, got \"{}\".",
                        spread.kind_name()
                    )));
                }
                items.extend(spread.iterate()?.map(|(_, v)| v));
                frame.push(Value::from_seq(items));
            }
            Instr::MapInsert => {
                let value = frame.pop()?;
                let key = frame.pop()?;
                let mut map = into_map(frame.pop()?);
                map.insert(key.to_string(), value);
                frame.push(Value::from_map(map));
            }
            Instr::MapExtend => {
                let spread = frame.pop()?;
                let mut map = into_map(frame.pop()?);
                if !spread.is_iterable() {
                    return Err(Error::runtime(format!(
                        "Only sequences and mappings can be spread, got \"{}\".",
                        spread.kind_name()
                    )));
                }
                for (key, value) in spread.iterate()? {
                    map.insert(key.to_string(), value);
                }
                frame.push(Value::from_map(map));
            }
            Instr::GetAttr {
                kind,
                nargs,
                sandboxed,
                ignore_strict,
                defined_test,
            } => {
                let args = frame.pop_args(*nargs)?;
                let attribute = frame.pop()?;
                let object = frame.pop()?;
                let lookup = AttrLookup {
                    kind: *kind,
                    sandboxed: *sandboxed && self.is_sandboxed(),
                    lenient: *ignore_strict || !self.strict(),
                    defined_test: *defined_test,
                };
                let value = self.get_attribute(&object, &attribute, &args, &lookup)?;
                frame.push(value);
            }
            Instr::Binary { op } => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(binary_op(*op, &left, &right)?);
            }
            Instr::Unary { op } => {
                let value = frame.pop()?;
                frame.push(unary_op(*op, &value)?);
            }
            Instr::CustomBinary { name } => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                let result = match self.env.registry().binary_operator(name).map(|op| &op.kind) {
                    Some(BinaryKind::Custom(func)) => func(&left, &right)?,
                    Some(BinaryKind::Builtin(op)) => binary_op(*op, &left, &right)?,
                    Some(BinaryKind::Is | BinaryKind::IsNot | BinaryKind::NullCoalesce) | None => {
                        return Err(Error::runtime(format!("Unknown operator \"{name}\".")));
                    }
                };
                frame.push(result);
            }
            Instr::CustomUnary { name } => {
                let value = frame.pop()?;
                let result = match self.env.registry().unary_operator(name).map(|op| &op.kind) {
                    Some(UnaryKind::Custom(func)) => func(&value)?,
                    Some(UnaryKind::Builtin(op)) => unary_op(*op, &value)?,
                    None => return Err(Error::runtime(format!("Unknown operator \"{name}\"."))),
                };
                frame.push(result);
            }
            Instr::ToBool => {
                let value = frame.pop()?;
                frame.push(Value::Bool(value.is_true()));
            }
            Instr::Jump { target } => *pc = *target,
            Instr::JumpIfFalse { target } => {
                if !frame.pop()?.is_true() {
                    *pc = *target;
                }
            }
            Instr::JumpIfTrue { target } => {
                if frame.pop()?.is_true() {
                    *pc = *target;
                }
            }
            Instr::JumpIfFalseOrPop { target } => {
                if frame.peek()?.is_true() {
                    frame.pop()?;
                } else {
                    *pc = *target;
                }
            }
            Instr::JumpIfTrueOrPop { target } => {
                if frame.peek()?.is_true() {
                    *pc = *target;
                } else {
                    frame.pop()?;
                }
            }
            Instr::JumpIfNotNullOrPop { target } => {
                if frame.peek()?.is_null() {
                    frame.pop()?;
                } else {
                    *pc = *target;
                }
            }
            Instr::CallFilter { name, nargs } => {
                let args = frame.pop_args(*nargs)?;
                let input = frame.pop()?;
                let result = self.call_filter(frame, name, input, args)?;
                frame.push(result);
            }
            Instr::CallFunction { name, nargs } => {
                let args = frame.pop_args(*nargs)?;
                let function = self
                    .env
                    .registry()
                    .function(name)
                    .ok_or_else(|| Error::runtime(format!("Unknown \"{name}\" function.")))?;
                let state = State::new(self.env, &frame.ctx, frame.template.name());
                let result = function.call(&state, &args)?;
                frame.push(result);
            }
            Instr::CallTest { name, nargs } => {
                let mut args = frame.pop_args(*nargs)?;
                args.insert(0, frame.pop()?);
                let test = self
                    .env
                    .registry()
                    .test(name)
                    .ok_or_else(|| Error::runtime(format!("Unknown \"{name}\" test.")))?;
                let state = State::new(self.env, &frame.ctx, frame.template.name());
                let result = test.call(&state, &args)?.is_true();
                frame.push(Value::Bool(result));
            }
            Instr::CallMacro {
                template,
                name,
                nargs,
                named,
            } => {
                let named_values = frame.pop_n(named.len())?;
                let positional = frame.pop_args(*nargs)?;
                let named: IndexMap<String, Value> = named.iter().cloned().zip(named_values).collect();
                let result = self.call_macro(frame, template.as_deref(), name, positional, named, out)?;
                frame.push(result);
            }
            Instr::HasMacro { template, name } => {
                let holder = match template {
                    None => Some(Arc::clone(&frame.template)),
                    Some(var) => self.import_target(frame, var),
                };
                let found = match holder {
                    Some(holder) => self.find_macro(&holder, name, &frame.ctx)?.is_some(),
                    None => false,
                };
                frame.push(Value::Bool(found));
            }
            Instr::PushLoop { with_loop } => {
                let seq = frame.pop()?;
                let iter = if seq.is_iterable() || seq.is_null() {
                    seq.iterate()?
                } else {
                    Iteration::Empty
                };
                let length = iter.len();
                frame.loops.push(LoopState {
                    iter,
                    index0: 0,
                    length,
                    parent: Arc::new(frame.ctx.clone()),
                    with_loop: *with_loop,
                    iterated: false,
                });
            }
            Instr::Iterate { key, value, exit } => {
                let state = frame.loops.last_mut().ok_or_else(corrupted)?;
                match state.iter.next() {
                    Some((item_key, item)) => {
                        let variable = state.with_loop.then(|| state.variable());
                        state.index0 = state.index0.saturating_add(1);
                        state.iterated = true;
                        frame.ctx.insert(key.clone(), item_key);
                        frame.ctx.insert(value.clone(), item);
                        if let Some(variable) = variable {
                            frame.ctx.insert("loop".to_owned(), variable);
                        }
                    }
                    None => *pc = *exit,
                }
            }
            Instr::LoopIterated => {
                let iterated = frame.loops.last().is_some_and(|state| state.iterated);
                frame.push(Value::Bool(iterated));
            }
            Instr::PopLoop { key, value } => {
                let state = frame.loops.pop().ok_or_else(corrupted)?;
                let current = std::mem::take(&mut frame.ctx);
                let mut restored = Scope::with_capacity(state.parent.len());
                for (name, item) in current {
                    if name != *key && name != *value && name != "loop" && state.parent.contains_key(&name) {
                        restored.insert(name, item);
                    }
                }
                for (name, item) in state.parent.iter() {
                    if !restored.contains_key(name) {
                        restored.insert(name.clone(), item.clone());
                    }
                }
                frame.ctx = restored;
            }
            Instr::BeginCapture => out.begin_capture(),
            Instr::EndCapture => {
                let captured = out.end_capture();
                frame.push(captured_value(captured));
            }
            Instr::DisplayBlock { has_template } => {
                let (template, name, blocks) = self.block_target(frame, *has_template)?;
                let context = frame.ctx.clone();
                self.display_block(&template, &name, context, &blocks, true, out)?;
            }
            Instr::BlockValue { has_template } => {
                let (template, name, blocks) = self.block_target(frame, *has_template)?;
                let context = frame.ctx.clone();
                out.begin_capture();
                let result = self.display_block(&template, &name, context, &blocks, true, out);
                let captured = out.end_capture();
                result?;
                frame.push(Value::markup(captured));
            }
            Instr::HasBlock { has_template } => {
                let (template, name, blocks) = self.block_target(frame, *has_template)?;
                let found = self.has_block(&template, &name, &frame.ctx, &blocks)?;
                frame.push(Value::Bool(found));
            }
            Instr::DisplayParentBlock { name } => self.display_parent_block(frame, name, out)?,
            Instr::ParentBlockValue { name } => {
                out.begin_capture();
                let result = self.display_parent_block(frame, name, out);
                let captured = out.end_capture();
                result?;
                frame.push(Value::markup(captured));
            }
            Instr::DisplayParent => self.display_parent(frame, out)?,
            Instr::Include {
                ignore_missing,
                only,
                has_variables,
            } => {
                let vars = if *has_variables { frame.pop()? } else { Value::Null };
                let target = frame.pop()?;
                let template = match self.load(&target) {
                    Ok(template) => template,
                    Err(Error::Loader(_)) if *ignore_missing => return Ok(()),
                    Err(error) => return Err(error),
                };
                self.include(frame, &template, vars, *only, out)?;
            }
            Instr::IncludeEmbedded {
                index,
                ignore_missing,
                only,
                has_variables,
            } => {
                let vars = if *has_variables { frame.pop()? } else { Value::Null };
                let root = Arc::clone(frame.template.root());
                let template = match self.env.load_embedded(&root, frame.template.source(), *index) {
                    Ok(template) => template,
                    Err(Error::Loader(_)) if *ignore_missing => return Ok(()),
                    Err(error) => return Err(error),
                };
                self.include(frame, &template, vars, *only, out)?;
            }
            Instr::IncludeFunction => {
                let sandboxed = frame.pop()?.is_true();
                let ignore_missing = frame.pop()?.is_true();
                let with_context = frame.pop()?.is_true();
                let vars = variables(frame.pop()?, "include")?;
                let target = frame.pop()?;
                let result = self.include_function(frame, &target, vars, with_context, ignore_missing, sandboxed, out)?;
                frame.push(result);
            }
            Instr::Import { var, global } => {
                let target = frame.pop()?;
                let template = self.load(&target)?;
                if *global {
                    self.imports
                        .entry(frame.template.key())
                        .or_default()
                        .insert(var.clone(), template);
                } else {
                    frame.imports.insert(var.clone(), template);
                }
            }
            Instr::CheckToString => {
                if self.is_sandboxed() {
                    self.check_to_string(frame.peek()?)?;
                }
            }
            Instr::EnableSandbox => self.sandbox_depth = self.sandbox_depth.saturating_add(1),
            Instr::DisableSandbox => self.sandbox_depth = self.sandbox_depth.saturating_sub(1),
            Instr::PushWith { only, has_variables } => {
                let vars = if *has_variables {
                    variables(frame.pop()?, "with")?
                } else {
                    Scope::new()
                };
                let saved = std::mem::take(&mut frame.ctx);
                let mut context = if *only { Scope::new() } else { saved.clone() };
                context.extend(vars);
                frame.ctx = self.with_globals(context);
                frame.withs.push(saved);
            }
            Instr::PopWith => {
                frame.ctx = frame.withs.pop().ok_or_else(corrupted)?;
            }
            Instr::MakeArrow { params, body } => {
                let mut imports = frame.imports.clone();
                if let Some(global) = self.imports.get(&frame.template.key()) {
                    for (var, template) in global {
                        imports.entry(var.clone()).or_insert_with(|| Arc::clone(template));
                    }
                }
                frame.push(Value::from_object(Arrow {
                    template: Arc::clone(&frame.template),
                    params: params.clone(),
                    body: body.clone(),
                    captured: frame.ctx.clone(),
                    imports,
                    sandboxed: self.is_sandboxed(),
                }));
            }
            Instr::Deprecated => {
                let version = frame.pop()?;
                let package = frame.pop()?;
                let message = frame.pop()?;
                warn!(
                    template = frame.template.name(),
                    package = %package,
                    version = %version,
                    "{message}"
                );
            }
            Instr::Flush => trace!(template = frame.template.name(), "flush"),
        }
        Ok(())
    }

    fn call_filter(&self, frame: &Frame, name: &str, input: Value, args: Vec<Value>) -> Result<Value> {
        let filter = self
            .env
            .registry()
            .filter(name)
            .ok_or_else(|| Error::runtime(format!("Unknown \"{name}\" filter.")))?;
        if filter.builtin_kind() == Some(Builtin::Default) {
            if input.is_empty() {
                return Ok(args.into_iter().next().unwrap_or_else(|| Value::from("")));
            }
            return Ok(input);
        }
        let mut all = Vec::with_capacity(args.len().saturating_add(1));
        all.push(input);
        all.extend(args);
        let state = State::new(self.env, &frame.ctx, frame.template.name());
        filter.call(&state, &all)
    }

    /// Loads a template from a name, a list of candidate names, or a
    /// template value.
    fn load(&self, target: &Value) -> Result<Arc<Template>> {
        match target {
            Value::Template(template) => Ok(Arc::clone(template)),
            Value::Seq(names) => {
                let names: Vec<String> = names.iter().map(ToString::to_string).collect();
                self.env.resolve_template(&names)
            }
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Markup(_)
            | Value::Map(_)
            | Value::Iter(_)
            | Value::Object(_) => self.env.load_template(&target.to_string()),
        }
    }

    fn include(
        &mut self,
        frame: &Frame,
        template: &Arc<Template>,
        vars: Value,
        only: bool,
        out: &mut Output<'_>,
    ) -> Result<()> {
        let vars = variables(vars, "include")?;
        let mut context = if only { Scope::new() } else { frame.ctx.clone() };
        context.extend(vars);
        self.display_isolated(template, context, out)
    }

    fn include_function(
        &mut self,
        frame: &Frame,
        target: &Value,
        vars: Scope,
        with_context: bool,
        ignore_missing: bool,
        sandboxed: bool,
        out: &mut Output<'_>,
    ) -> Result<Value> {
        let template = match self.load(target) {
            Ok(template) => template,
            Err(Error::Loader(_)) if ignore_missing => return Ok(Value::from("")),
            Err(error) => return Err(error),
        };
        let mut context = if with_context { frame.ctx.clone() } else { Scope::new() };
        context.extend(vars);

        let enable = sandboxed && self.policy.is_some() && !self.is_sandboxed();
        if enable {
            self.sandbox_depth = self.sandbox_depth.saturating_add(1);
        }
        out.begin_capture();
        let result = self.display_isolated(&template, context, out);
        let captured = out.end_capture();
        if enable {
            self.sandbox_depth = self.sandbox_depth.saturating_sub(1);
        }
        result?;
        Ok(Value::markup(captured))
    }

    /// The template imported under `var`: first imports local to the
    /// running body, then the template's top-level imports, then a variable
    /// holding a template.
    fn import_target(&self, frame: &Frame, var: &str) -> Option<Arc<Template>> {
        frame
            .imports
            .get(var)
            .or_else(|| {
                self.imports
                    .get(&frame.template.key())
                    .and_then(|imports| imports.get(var))
            })
            .cloned()
            .or_else(|| {
                if let Some(Value::Template(template)) = frame.ctx.get(var) {
                    Some(Arc::clone(template))
                } else {
                    None
                }
            })
    }

    /// The template defining macro `name`: `holder` or one of its parents.
    fn find_macro(&mut self, holder: &Arc<Template>, name: &str, context: &Scope) -> Result<Option<Arc<Template>>> {
        let mut current = Arc::clone(holder);
        loop {
            if current.has_macro(name) {
                return Ok(Some(current));
            }
            match self.parent_of(&current, context)? {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
    }

    fn call_macro(
        &mut self,
        frame: &Frame,
        template: Option<&str>,
        name: &str,
        positional: Vec<Value>,
        mut named: IndexMap<String, Value>,
        out: &mut Output<'_>,
    ) -> Result<Value> {
        let holder = match template {
            None => Arc::clone(&frame.template),
            Some(var) => self
                .import_target(frame, var)
                .ok_or_else(|| Error::runtime(format!("Variable \"{var}\" does not exist.")))?,
        };
        let not_defined = || {
            Error::runtime(format!(
                "Macro \"{name}\" is not defined in template \"{}\".",
                holder.name()
            ))
        };
        let owner = self.find_macro(&holder, name, &frame.ctx)?.ok_or_else(not_defined)?;
        let definition = owner.program().macros.get(name).ok_or_else(not_defined)?;

        let mut context = self.env.registry().globals().clone();
        let mut positional = positional.into_iter();
        for (param, default) in &definition.params {
            let value = match positional.next() {
                Some(value) => {
                    if named.contains_key(param) {
                        return Err(Error::runtime(format!(
                            "Argument \"{param}\" is defined twice for macro \"{name}\"."
                        )));
                    }
                    value
                }
                None => named.shift_remove(param).unwrap_or_else(|| default.to_value()),
            };
            context.insert(param.clone(), value);
        }
        if let Some(unknown) = named.keys().next() {
            return Err(Error::runtime(format!(
                "Unknown argument \"{unknown}\" for macro \"{name}\"."
            )));
        }
        context.insert("varargs".to_owned(), Value::from_seq(positional.collect()));

        let mut macro_frame = Frame::new(Arc::clone(&owner), context, Arc::new(BlockMap::new()));
        out.begin_capture();
        let result = self.call_routine(&definition.body, &mut macro_frame, out);
        let captured = out.end_capture();
        result?;
        Ok(captured_value(captured))
    }

    /// Pops the operands of a block instruction: the template that owns the
    /// block, its name, and the blocks overriding it.
    fn block_target(&self, frame: &mut Frame, has_template: bool) -> Result<(Arc<Template>, String, Arc<BlockMap>)> {
        let template = if has_template { Some(frame.pop()?) } else { None };
        let name = frame.pop()?.to_string();
        match template {
            Some(target) => Ok((self.load(&target)?, name, Arc::new(BlockMap::new()))),
            None => Ok((Arc::clone(&frame.template), name, Arc::clone(&frame.blocks))),
        }
    }

    /// The parent of `template`, when it has one. Expression parents are
    /// evaluated against `context`; a null or false result means none.
    fn parent_of(&mut self, template: &Arc<Template>, context: &Scope) -> Result<Option<Arc<Template>>> {
        match &template.program().parent {
            None => Ok(None),
            Some(ParentRef::Static { name, line }) => match template.static_parent() {
                Some(parent) => Ok(Some(Arc::clone(parent))),
                None => self
                    .env
                    .load_template(name)
                    .map(Some)
                    .map_err(|e| e.locate(template.name(), Some(*line))),
            },
            Some(ParentRef::Dynamic { routine, line }) => {
                let mut frame = Frame::new(Arc::clone(template), context.clone(), Arc::new(BlockMap::new()));
                let mut scratch = String::new();
                let mut scratch = Output::new(&mut scratch);
                self.call_routine(routine, &mut frame, &mut scratch)?;
                let target = frame.pop()?;
                if matches!(target, Value::Null | Value::Bool(false)) {
                    return Ok(None);
                }
                self.load(&target)
                    .map(Some)
                    .map_err(|e| e.locate(template.name(), Some(*line)))
            }
        }
    }

    fn display_parent(&mut self, frame: &Frame, out: &mut Output<'_>) -> Result<()> {
        let template = Arc::clone(&frame.template);
        let parent = self.parent_of(&template, &frame.ctx)?.ok_or_else(|| {
            Error::runtime(format!(
                "Unable to resolve the parent of template \"{}\".",
                template.name()
            ))
        })?;

        self.inheritance.push(template.key());
        let parent_key = parent.key();
        if self.inheritance.contains(&parent_key) {
            let mut chain: Vec<String> = self.inheritance.iter().map(|k| format!("\"{k}\"")).collect();
            chain.push(format!("\"{parent_key}\""));
            self.inheritance.pop();
            return Err(Error::runtime(format!(
                "Circular template inheritance detected ({}).",
                chain.join(" -> ")
            )));
        }
        let result = self.display(&parent, frame.ctx.clone(), &frame.blocks, out);
        self.inheritance.pop();
        result
    }

    /// Renders block `name` as seen from `template`.
    ///
    /// With `use_blocks`, overriding blocks from child templates come first.
    /// Blocks missing here are looked up in the parent chain.
    fn display_block(
        &mut self,
        template: &Arc<Template>,
        name: &str,
        context: Scope,
        blocks: &Arc<BlockMap>,
        use_blocks: bool,
        out: &mut Output<'_>,
    ) -> Result<()> {
        let target = use_blocks
            .then(|| blocks.get(name).cloned())
            .flatten()
            .or_else(|| own_block(template, name));

        if let Some(target) = target {
            let owner = Arc::clone(&target.template);
            let routine = owner.program().blocks.get(&target.name).ok_or_else(|| {
                Error::runtime(format!(
                    "Block \"{}\" on template \"{}\" does not exist.",
                    target.name,
                    owner.name()
                ))
            })?;
            let mut frame = Frame::new(Arc::clone(&owner), context, Arc::clone(blocks));
            return self.call_routine(routine, &mut frame, out);
        }

        if let Some(parent) = self.parent_of(template, &context)? {
            let mut merged = template.block_map();
            merged.extend(blocks.iter().map(|(k, v)| (k.clone(), v.clone())));
            return self.display_block(&parent, name, context, &Arc::new(merged), false, out);
        }

        if let Some(child) = blocks.get(name) {
            return Err(Error::runtime(format!(
                "Block \"{name}\" should not call parent() in \"{}\" as the block does not exist in the parent template \"{}\".",
                child.template.name(),
                template.name()
            )));
        }
        Err(Error::runtime(format!(
            "Block \"{name}\" on template \"{}\" does not exist.",
            template.name()
        )))
    }

    fn display_parent_block(&mut self, frame: &Frame, name: &str, out: &mut Output<'_>) -> Result<()> {
        let template = Arc::clone(&frame.template);
        if let Some(used) = template.trait_blocks().get(name) {
            let owner = Arc::clone(&used.template);
            let source_name = used.name.clone();
            return self.display_block(&owner, &source_name, frame.ctx.clone(), &frame.blocks, false, out);
        }
        if let Some(parent) = self.parent_of(&template, &frame.ctx)? {
            let mut merged = template.block_map();
            merged.extend(frame.blocks.iter().map(|(k, v)| (k.clone(), v.clone())));
            return self.display_block(&parent, name, frame.ctx.clone(), &Arc::new(merged), false, out);
        }
        Err(Error::runtime(format!(
            "The template has no parent and no traits defining the \"{name}\" block."
        )))
    }

    fn has_block(&mut self, template: &Arc<Template>, name: &str, context: &Scope, blocks: &BlockMap) -> Result<bool> {
        if blocks.contains_key(name) || own_block(template, name).is_some() {
            return Ok(true);
        }
        match self.parent_of(template, context)? {
            Some(parent) => self.has_block(&parent, name, context, &BlockMap::new()),
            None => Ok(false),
        }
    }

    fn check_to_string(&self, value: &Value) -> Result<()> {
        let Some(policy) = &self.policy else {
            return Ok(());
        };
        match value {
            Value::Object(object) if object.to_display().is_some() => {
                policy.check_method_allowed(object.as_ref(), TO_STRING_METHOD)?;
            }
            Value::Seq(items) => {
                for item in items.iter() {
                    self.check_to_string(item)?;
                }
            }
            Value::Map(map) => {
                for item in map.values() {
                    self.check_to_string(item)?;
                }
            }
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Markup(_)
            | Value::Iter(_)
            | Value::Object(_)
            | Value::Template(_) => {}
        }
        Ok(())
    }

    fn get_attribute(&self, object: &Value, attribute: &Value, args: &[Value], lookup: &AttrLookup) -> Result<Value> {
        let item = attribute.to_string();
        if lookup.kind != AttrKind::Method {
            if let Some(value) = object.get_item(attribute) {
                return Ok(if lookup.defined_test { Value::Bool(true) } else { value });
            }
            if lookup.kind == AttrKind::Array || !matches!(object, Value::Object(_) | Value::Template(_)) {
                if lookup.defined_test {
                    return Ok(Value::Bool(false));
                }
                if lookup.lenient {
                    return Ok(Value::Null);
                }
                return Err(Error::runtime(missing_item_message(object, &item, lookup.kind)));
            }
        }

        let object = match object {
            Value::Object(object) => object,
            Value::Template(_) => {
                return Err(Error::runtime("Accessing template attributes is forbidden."));
            }
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Markup(_)
            | Value::Seq(_)
            | Value::Map(_)
            | Value::Iter(_) => {
                if lookup.defined_test {
                    return Ok(Value::Bool(false));
                }
                if lookup.lenient {
                    return Ok(Value::Null);
                }
                return Err(Error::runtime(if object.is_null() {
                    format!("Impossible to invoke a method (\"{item}\") on a null variable.")
                } else {
                    format!(
                        "Impossible to invoke a method (\"{item}\") on a {} variable (\"{object}\").",
                        object.kind_name()
                    )
                }));
            }
        };

        if lookup.kind == AttrKind::Any {
            if let Some(value) = object.get_property(&item) {
                if lookup.defined_test {
                    return Ok(Value::Bool(true));
                }
                if lookup.sandboxed {
                    if let Some(policy) = &self.policy {
                        policy.check_property_allowed(object.as_ref(), &item)?;
                    }
                }
                return Ok(value);
            }
        }

        if !object.has_method(&item) {
            if lookup.defined_test {
                return Ok(Value::Bool(false));
            }
            if lookup.lenient {
                return Ok(Value::Null);
            }
            let class = object.class_name();
            return Err(Error::runtime(if lookup.kind == AttrKind::Method {
                format!("Method \"{item}\" for object \"{class}\" does not exist.")
            } else {
                format!(
                    "Neither the property \"{item}\" nor the method \"{item}()\" exist and have public access in class \"{class}\"."
                )
            }));
        }
        if lookup.defined_test {
            return Ok(Value::Bool(true));
        }
        if lookup.sandboxed {
            if let Some(policy) = &self.policy {
                policy.check_method_allowed(object.as_ref(), &item)?;
            }
        }
        object.call_method(&item, args)
    }
}

struct AttrLookup {
    kind: AttrKind,
    /// The sandbox is active and the access was marked for checking.
    sandboxed: bool,
    lenient: bool,
    defined_test: bool,
}

fn own_block(template: &Arc<Template>, name: &str) -> Option<BlockRef> {
    if template.program().blocks.contains_key(name) {
        return Some(BlockRef {
            template: Arc::clone(template),
            name: name.to_owned(),
        });
    }
    template.trait_blocks().get(name).cloned()
}

fn missing_item_message(object: &Value, item: &str, kind: AttrKind) -> String {
    if matches!(object, Value::Seq(_) | Value::Map(_)) {
        let keys: Vec<String> = object
            .iterate()
            .map(|it| it.map(|(k, _)| k.to_string()).collect())
            .unwrap_or_default();
        if keys.is_empty() {
            format!("Key \"{item}\" does not exist as the sequence/mapping is empty.")
        } else {
            format!(
                "Key \"{item}\" for sequence/mapping with keys \"{}\" does not exist.",
                keys.join(", ")
            )
        }
    } else if object.is_null() {
        if kind == AttrKind::Array {
            format!("Impossible to access a key (\"{item}\") on a null variable.")
        } else {
            format!("Impossible to access an attribute (\"{item}\") on a null variable.")
        }
    } else if kind == AttrKind::Array {
        format!(
            "Impossible to access a key (\"{item}\") on a {} variable (\"{object}\").",
            object.kind_name()
        )
    } else {
        format!(
            "Impossible to access an attribute (\"{item}\") on a {} variable (\"{object}\").",
            object.kind_name()
        )
    }
}

/// Captured output: empty stays a plain string, anything else is markup.
fn captured_value(captured: String) -> Value {
    if captured.is_empty() {
        Value::from("")
    } else {
        Value::markup(captured)
    }
}

fn emit(value: &Value, out: &mut Output<'_>) -> Result<()> {
    match value {
        Value::String(s) | Value::Markup(s) => out.write(s),
        Value::Null => Ok(()),
        Value::Object(object) => match object.to_display() {
            Some(text) => out.write(&text),
            None => Err(Error::runtime(format!(
                "Object of class \"{}\" could not be converted to string.",
                object.class_name()
            ))),
        },
        Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Seq(_)
        | Value::Map(_)
        | Value::Iter(_)
        | Value::Template(_) => out.write(&value.to_string()),
    }
}
