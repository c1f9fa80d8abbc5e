//! Code units and the instruction set they carry.
//!
//! A [`CodeUnit`] is immutable once built and shared behind an `Arc` by every function
//! object and frame created from it. Compilers (out of scope for this crate) or hosts
//! build code units with [`CodeBuilder`], which resolves variable names to slots and
//! labels to instruction offsets.

use std::sync::Arc;

use crate::{exception::FrameSummary, value::Value};

/// Instructions executed by a frame.
///
/// Stack effects are noted as `before -> after` with the top of stack on the right.
#[derive(Debug, Clone)]
pub enum Instr {
    /// `-> value`
    LoadConst(Value),
    /// `-> locals[slot]`, raising `UnboundLocalError` if the slot is unbound.
    LoadFast(u16),
    /// `value ->`
    StoreFast(u16),
    /// `-> cells[index].value`, cellvars first then freevars.
    LoadDeref(u16),
    /// `value ->`
    StoreDeref(u16),
    /// Looks up globals then builtins, raising `NameError` when missing.
    LoadGlobal(Arc<str>),
    StoreGlobal(Arc<str>),
    /// `value ->`
    Pop,
    /// `value -> value value`
    Dup,
    /// `a b -> b a`
    Swap,
    /// `items.. -> tuple`
    BuildTuple(u16),
    /// `items.. -> list`
    BuildList(u16),
    /// `lhs rhs -> result`
    BinaryAdd,
    BinarySub,
    BinaryMul,
    CompareEq,
    CompareLt,
    /// Unconditional jump to an instruction offset.
    Jump(usize),
    /// `cond ->`, jumping when falsy.
    PopJumpIfFalse(usize),
    /// `cond ->`, jumping when truthy.
    PopJumpIfTrue(usize),
    /// `iterable -> iterator`
    GetIter,
    /// `iterator -> iterator item`, or pops the iterator and jumps when exhausted.
    ForIter(usize),
    /// `callable args.. kwvalues.. -> result`; the last `kwnames.len()` arguments are
    /// passed by keyword.
    Call { argc: u16, kwnames: Arc<[Arc<str>]> },
    /// `defaults.. kwdefaults.. -> function`; `closure` lists cell indices of this frame
    /// to capture, in the new code's freevar order.
    MakeFunction {
        code: Arc<CodeUnit>,
        defaults: u16,
        kwdefaults: Arc<[Arc<str>]>,
        closure: Arc<[u16]>,
    },
    /// `value -> sent`
    Yield,
    /// `iterable -> result`, delegating to the iterator until it completes.
    YieldFrom,
    /// `awaitable -> result`
    Await,
    /// `value ->`
    Return,
    /// `exc ->`, where `exc` is an exception class or instance.
    Raise,
    /// `exc cause ->`
    RaiseFrom,
    /// Re-raises the exception currently being handled.
    ReRaise,
    /// Pushes an except block; on a matching exception the stack is unwound to the
    /// current depth, the exception instance pushed and control jumps to the handler.
    SetupExcept(usize),
    /// Pushes a finally block; the handler runs with a pending exception or return.
    SetupFinally(usize),
    /// Pops the innermost except or finally block on normal exit from its body.
    PopBlock,
    /// `exc candidates -> matched`, `candidates` is an exception class or a tuple of them.
    MatchExc,
    /// Leaves an except handler, restoring the previously handled exception.
    PopExcept,
    /// Marks normal entry into a finally handler.
    BeginFinally,
    /// Ends a finally handler, resuming whatever unwinding was pending.
    EndFinally,
}

/// Variadic and kind flags of a code unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CodeFlags {
    pub varargs: bool,
    pub varkwargs: bool,
    pub generator: bool,
    pub coroutine: bool,
}

/// Immutable compiled function body.
///
/// Local slots are laid out as: positional parameters, keyword-only parameters, the
/// `*args` slot, the `**kwargs` slot, then other locals.
#[derive(Debug)]
pub struct CodeUnit {
    name: Arc<str>,
    filename: Arc<str>,
    first_line: u32,
    varnames: Vec<Arc<str>>,
    argcount: usize,
    kwonlyargcount: usize,
    cellvars: Vec<Arc<str>>,
    freevars: Vec<Arc<str>>,
    flags: CodeFlags,
    instrs: Vec<Instr>,
    lines: Vec<u32>,
}

impl CodeUnit {
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[must_use]
    pub fn filename(&self) -> &Arc<str> {
        &self.filename
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    #[must_use]
    pub fn varnames(&self) -> &[Arc<str>] {
        &self.varnames
    }

    #[must_use]
    pub fn argcount(&self) -> usize {
        self.argcount
    }

    #[must_use]
    pub fn kwonlyargcount(&self) -> usize {
        self.kwonlyargcount
    }

    #[must_use]
    pub fn cellvars(&self) -> &[Arc<str>] {
        &self.cellvars
    }

    #[must_use]
    pub fn freevars(&self) -> &[Arc<str>] {
        &self.freevars
    }

    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.flags.generator
    }

    #[must_use]
    pub fn is_coroutine(&self) -> bool {
        self.flags.coroutine
    }

    #[must_use]
    pub fn nlocals(&self) -> usize {
        self.varnames.len()
    }

    #[must_use]
    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// Positional and keyword-only parameter names, in slot order.
    pub(crate) fn param_names(&self) -> &[Arc<str>] {
        &self.varnames[..self.argcount + self.kwonlyargcount]
    }

    pub(crate) fn varargs_slot(&self) -> Option<usize> {
        self.flags.varargs.then_some(self.argcount + self.kwonlyargcount)
    }

    pub(crate) fn varkwargs_slot(&self) -> Option<usize> {
        self.flags
            .varkwargs
            .then(|| self.argcount + self.kwonlyargcount + usize::from(self.flags.varargs))
    }

    /// Source line of the instruction at `index`.
    pub(crate) fn line_at(&self, index: usize) -> u32 {
        self.lines.get(index).copied().unwrap_or(self.first_line)
    }

    pub(crate) fn summary_at(&self, index: usize) -> FrameSummary {
        FrameSummary {
            name: self.name.clone(),
            filename: self.filename.clone(),
            line: self.line_at(index),
        }
    }
}

/// Errors detected while building a code unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeBuildError {
    #[error("'{name}' is not a local variable of {code}")]
    UnknownLocal { code: String, name: String },
    #[error("'{name}' is not a cell or free variable of {code}")]
    UnknownDeref { code: String, name: String },
    #[error("duplicate argument '{name}' in {code}")]
    DuplicateName { code: String, name: String },
    #[error("label {label} used in {code} but never bound")]
    UnboundLabel { code: String, label: usize },
    #[error("{code} has more than {max} operands", max = u16::MAX)]
    TooManyOperands { code: String },
}

/// Jump target handle created by [`CodeBuilder::label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
enum Patch {
    Label(Label),
    Fast(Arc<str>),
    Deref(Arc<str>),
    Closure(Vec<Arc<str>>),
}

/// Assembles a [`CodeUnit`].
///
/// The signature is declared with the consuming methods, instructions are emitted with
/// the `&mut self` methods. Variable names and labels are resolved by [`CodeBuilder::build`],
/// so declarations and emission may interleave.
#[derive(Debug)]
pub struct CodeBuilder {
    name: Arc<str>,
    filename: Arc<str>,
    first_line: u32,
    params: Vec<Arc<str>>,
    kwonly: Vec<Arc<str>>,
    varargs: Option<Arc<str>>,
    varkwargs: Option<Arc<str>>,
    locals: Vec<Arc<str>>,
    cellvars: Vec<Arc<str>>,
    freevars: Vec<Arc<str>>,
    flags: CodeFlags,
    instrs: Vec<Instr>,
    lines: Vec<u32>,
    line: u32,
    labels: Vec<Option<usize>>,
    patches: Vec<(usize, Patch)>,
}

fn names(names: &[&str]) -> Vec<Arc<str>> {
    names.iter().map(|name| Arc::from(*name)).collect()
}

impl CodeBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            filename: "<module>".into(),
            first_line: 1,
            params: Vec::new(),
            kwonly: Vec::new(),
            varargs: None,
            varkwargs: None,
            locals: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            flags: CodeFlags::default(),
            instrs: Vec::new(),
            lines: Vec::new(),
            line: 1,
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    #[must_use]
    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = filename.into();
        self
    }

    /// Sets the first line; instructions are attributed to it until [`CodeBuilder::line`].
    #[must_use]
    pub fn first_line(mut self, line: u32) -> Self {
        self.first_line = line;
        self.line = line;
        self
    }

    #[must_use]
    pub fn params(mut self, params: &[&str]) -> Self {
        self.params.extend(names(params));
        self
    }

    #[must_use]
    pub fn kwonly(mut self, params: &[&str]) -> Self {
        self.kwonly.extend(names(params));
        self
    }

    #[must_use]
    pub fn varargs(mut self, name: &str) -> Self {
        self.varargs = Some(name.into());
        self.flags.varargs = true;
        self
    }

    #[must_use]
    pub fn varkwargs(mut self, name: &str) -> Self {
        self.varkwargs = Some(name.into());
        self.flags.varkwargs = true;
        self
    }

    #[must_use]
    pub fn locals(mut self, locals: &[&str]) -> Self {
        self.locals.extend(names(locals));
        self
    }

    /// Variables of this code captured by nested functions. A cellvar named like a
    /// parameter starts out holding the argument.
    #[must_use]
    pub fn cellvars(mut self, cellvars: &[&str]) -> Self {
        self.cellvars.extend(names(cellvars));
        self
    }

    /// Variables captured from enclosing code, supplied as the closure.
    #[must_use]
    pub fn freevars(mut self, freevars: &[&str]) -> Self {
        self.freevars.extend(names(freevars));
        self
    }

    #[must_use]
    pub fn generator(mut self) -> Self {
        self.flags.generator = true;
        self
    }

    #[must_use]
    pub fn coroutine(mut self) -> Self {
        self.flags.coroutine = true;
        self
    }

    /// Sets the source line for subsequently emitted instructions.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        self.instrs.push(instr);
        self.lines.push(self.line);
        self
    }

    fn emit_patched(&mut self, instr: Instr, patch: Patch) -> &mut Self {
        self.patches.push((self.instrs.len(), patch));
        self.emit(instr)
    }

    #[must_use]
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next instruction emitted.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.instrs.len());
        self
    }

    pub fn load_const(&mut self, value: impl Into<Value>) -> &mut Self {
        self.emit(Instr::LoadConst(value.into()))
    }

    pub fn load_none(&mut self) -> &mut Self {
        self.emit(Instr::LoadConst(Value::None))
    }

    pub fn load_fast(&mut self, name: &str) -> &mut Self {
        self.emit_patched(Instr::LoadFast(0), Patch::Fast(name.into()))
    }

    pub fn store_fast(&mut self, name: &str) -> &mut Self {
        self.emit_patched(Instr::StoreFast(0), Patch::Fast(name.into()))
    }

    pub fn load_deref(&mut self, name: &str) -> &mut Self {
        self.emit_patched(Instr::LoadDeref(0), Patch::Deref(name.into()))
    }

    pub fn store_deref(&mut self, name: &str) -> &mut Self {
        self.emit_patched(Instr::StoreDeref(0), Patch::Deref(name.into()))
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        self.emit(Instr::LoadGlobal(name.into()))
    }

    pub fn store_global(&mut self, name: &str) -> &mut Self {
        self.emit(Instr::StoreGlobal(name.into()))
    }

    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.emit_patched(Instr::Jump(0), Patch::Label(label))
    }

    pub fn pop_jump_if_false(&mut self, label: Label) -> &mut Self {
        self.emit_patched(Instr::PopJumpIfFalse(0), Patch::Label(label))
    }

    pub fn pop_jump_if_true(&mut self, label: Label) -> &mut Self {
        self.emit_patched(Instr::PopJumpIfTrue(0), Patch::Label(label))
    }

    pub fn for_iter(&mut self, label: Label) -> &mut Self {
        self.emit_patched(Instr::ForIter(0), Patch::Label(label))
    }

    pub fn setup_except(&mut self, label: Label) -> &mut Self {
        self.emit_patched(Instr::SetupExcept(0), Patch::Label(label))
    }

    pub fn setup_finally(&mut self, label: Label) -> &mut Self {
        self.emit_patched(Instr::SetupFinally(0), Patch::Label(label))
    }

    pub fn call(&mut self, argc: u16) -> &mut Self {
        self.emit(Instr::Call {
            argc,
            kwnames: Arc::new([]),
        })
    }

    /// Call where the last `kwnames.len()` of the `argc` arguments are keywords.
    pub fn call_kw(&mut self, argc: u16, kwnames: &[&str]) -> &mut Self {
        self.emit(Instr::Call {
            argc,
            kwnames: names(kwnames).into(),
        })
    }

    /// Emits `MakeFunction`; `closure` names cell or free variables of this code.
    pub fn make_function(
        &mut self,
        code: Arc<CodeUnit>,
        defaults: u16,
        kwdefaults: &[&str],
        closure: &[&str],
    ) -> &mut Self {
        let instr = Instr::MakeFunction {
            code,
            defaults,
            kwdefaults: names(kwdefaults).into(),
            closure: Arc::new([]),
        };
        self.emit_patched(instr, Patch::Closure(names(closure)))
    }

    pub fn ret(&mut self) -> &mut Self {
        self.emit(Instr::Return)
    }

    pub fn build(self) -> Result<Arc<CodeUnit>, CodeBuildError> {
        let code_name = self.name.to_string();
        let mut varnames: Vec<Arc<str>> = Vec::new();
        let declared = self
            .params
            .iter()
            .chain(&self.kwonly)
            .chain(&self.varargs)
            .chain(&self.varkwargs);
        for name in declared {
            if varnames.contains(name) {
                return Err(CodeBuildError::DuplicateName {
                    code: code_name,
                    name: name.to_string(),
                });
            }
            varnames.push(name.clone());
        }
        for name in &self.locals {
            if !varnames.contains(name) {
                varnames.push(name.clone());
            }
        }
        let derefs: Vec<&Arc<str>> = self.cellvars.iter().chain(&self.freevars).collect();

        let operand = |value: usize| u16::try_from(value).map_err(|_| CodeBuildError::TooManyOperands { code: code_name.clone() });
        let mut instrs = self.instrs;
        for (index, patch) in self.patches {
            let instr = &mut instrs[index];
            match patch {
                Patch::Label(label) => {
                    let target = self.labels[label.0].ok_or_else(|| CodeBuildError::UnboundLabel {
                        code: code_name.clone(),
                        label: label.0,
                    })?;
                    match instr {
                        Instr::Jump(t)
                        | Instr::PopJumpIfFalse(t)
                        | Instr::PopJumpIfTrue(t)
                        | Instr::ForIter(t)
                        | Instr::SetupExcept(t)
                        | Instr::SetupFinally(t) => *t = target,
                        _ => unreachable!("label patch on non-jump instruction"),
                    }
                }
                Patch::Fast(name) => {
                    let slot = varnames.iter().position(|v| *v == name).ok_or_else(|| CodeBuildError::UnknownLocal {
                        code: code_name.clone(),
                        name: name.to_string(),
                    })?;
                    let slot = operand(slot)?;
                    match instr {
                        Instr::LoadFast(s) | Instr::StoreFast(s) => *s = slot,
                        _ => unreachable!("local patch on non-local instruction"),
                    }
                }
                Patch::Deref(name) => {
                    let index = derefs.iter().position(|v| **v == name).ok_or_else(|| CodeBuildError::UnknownDeref {
                        code: code_name.clone(),
                        name: name.to_string(),
                    })?;
                    let index = operand(index)?;
                    match instr {
                        Instr::LoadDeref(i) | Instr::StoreDeref(i) => *i = index,
                        _ => unreachable!("deref patch on non-deref instruction"),
                    }
                }
                Patch::Closure(captured) => {
                    let indices = captured
                        .iter()
                        .map(|name| {
                            let index = derefs.iter().position(|v| *v == name).ok_or_else(|| {
                                CodeBuildError::UnknownDeref {
                                    code: code_name.clone(),
                                    name: name.to_string(),
                                }
                            })?;
                            operand(index)
                        })
                        .collect::<Result<Vec<u16>, _>>()?;
                    if let Instr::MakeFunction { closure, .. } = instr {
                        *closure = indices.into();
                    }
                }
            }
        }

        Ok(Arc::new(CodeUnit {
            name: self.name,
            filename: self.filename,
            first_line: self.first_line,
            varnames,
            argcount: self.params.len(),
            kwonlyargcount: self.kwonly.len(),
            cellvars: self.cellvars,
            freevars: self.freevars,
            flags: self.flags,
            instrs,
            lines: self.lines,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_layout() {
        let mut builder = CodeBuilder::new("f")
            .params(&["a", "b"])
            .kwonly(&["k"])
            .varargs("args")
            .varkwargs("kw")
            .locals(&["tmp"]);
        builder.load_fast("tmp").load_fast("kw").ret();
        let code = builder.build().unwrap();
        let names: Vec<&str> = code.varnames().iter().map(|n| &**n).collect();
        assert_eq!(names, ["a", "b", "k", "args", "kw", "tmp"]);
        assert_eq!(code.varargs_slot(), Some(3));
        assert_eq!(code.varkwargs_slot(), Some(4));
        assert!(matches!(code.instrs()[0], Instr::LoadFast(5)));
        assert!(matches!(code.instrs()[1], Instr::LoadFast(4)));
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let mut builder = CodeBuilder::new("loop");
        let top = builder.label();
        let end = builder.label();
        builder.bind(top).load_const(true).pop_jump_if_false(end).jump(top).bind(end);
        builder.load_none().ret();
        let code = builder.build().unwrap();
        assert!(matches!(code.instrs()[1], Instr::PopJumpIfFalse(3)));
        assert!(matches!(code.instrs()[2], Instr::Jump(0)));
    }

    #[test]
    fn unknown_names_are_reported() {
        let mut builder = CodeBuilder::new("f");
        builder.load_fast("missing");
        assert_eq!(
            builder.build().unwrap_err(),
            CodeBuildError::UnknownLocal {
                code: "f".to_owned(),
                name: "missing".to_owned()
            }
        );

        let mut builder = CodeBuilder::new("g");
        let label = builder.label();
        builder.jump(label);
        assert!(matches!(builder.build(), Err(CodeBuildError::UnboundLabel { .. })));

        let builder = CodeBuilder::new("h").params(&["a"]).kwonly(&["a"]);
        assert!(matches!(builder.build(), Err(CodeBuildError::DuplicateName { .. })));
    }

    #[test]
    fn deref_indices_put_cellvars_first() {
        let mut builder = CodeBuilder::new("f").cellvars(&["c"]).freevars(&["x"]);
        builder.load_deref("x").store_deref("c");
        let code = builder.build().unwrap();
        assert!(matches!(code.instrs()[0], Instr::LoadDeref(1)));
        assert!(matches!(code.instrs()[1], Instr::StoreDeref(0)));
    }
}
