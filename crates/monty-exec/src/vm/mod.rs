//! The virtual machine: owner of the heap, the frame arena and the execution state.

mod binary;
mod exceptions;
mod gc;

use std::sync::Arc;

pub use exceptions::ExceptionInfo;

use crate::{
    args::{ArgValues, BoundArgs, bind_args},
    builtins::builtins_namespace,
    code::CodeUnit,
    exception::{ExcType, ExceptionRaise, ExceptionReport, RunError, RunResult, exc_err_fmt},
    frame::{Frame, FrameId, Frames},
    function::Function,
    generator::{Generator, GeneratorKind},
    heap::{Heap, HeapData, HeapId, Kwargs},
    resource::{ResourceError, ResourceLimits, ResourceTracker},
    run_frame::FrameExit,
    tracer::{CallTracer, NoopTracer},
    value::Value,
};

/// Result of starting a call.
#[derive(Debug)]
pub(crate) enum Entered {
    /// The call already produced its result: a builtin's return value or a new generator.
    Value(Value),
    /// A plain function frame, built and not yet run.
    Frame(FrameId),
}

/// Executes code units and owns every object they create.
///
/// A `Vm` is single-threaded: values and frames belong to one VM and must not be used
/// with another. Code units are immutable and may be shared between VMs.
#[derive(Debug)]
pub struct Vm<T: CallTracer = NoopTracer> {
    pub(crate) heap: Heap,
    pub(crate) frames: Frames,
    /// Innermost executing frame.
    pub(crate) current: Option<FrameId>,
    /// Exceptions currently being handled by `except` clauses, innermost last.
    pub(crate) handled: Vec<ExceptionRaise>,
    pub(crate) resources: ResourceTracker,
    pub(crate) tracer: T,
    /// The system builtins namespace, inherited by frames started from the host.
    pub(crate) builtins: HeapId,
    pub(crate) unraisable: Vec<ExceptionReport>,
}

impl Vm<NoopTracer> {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self::with_tracer(limits, NoopTracer)
    }
}

impl Default for Vm<NoopTracer> {
    fn default() -> Self {
        Self::new(ResourceLimits::default())
    }
}

impl<T: CallTracer> Vm<T> {
    #[must_use]
    pub fn with_tracer(limits: ResourceLimits, tracer: T) -> Self {
        let mut heap = Heap::new(None);
        let builtins = match heap.allocate(HeapData::Dict(builtins_namespace())) {
            Ok(id) => id,
            Err(_) => unreachable!("unlimited heap cannot refuse an allocation"),
        };
        heap.set_max_allocations(limits.max_allocations);
        tracing::debug!(?limits, "created vm");
        Self {
            heap,
            frames: Frames::default(),
            current: None,
            handled: Vec::new(),
            resources: ResourceTracker::new(limits),
            tracer,
            builtins,
            unraisable: Vec::new(),
        }
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut T {
        &mut self.tracer
    }

    pub fn limits(&self) -> &ResourceLimits {
        self.resources.limits()
    }

    /// Number of live heap objects.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    /// Number of frames alive, executing or held by suspended generators.
    #[must_use]
    pub fn live_frames(&self) -> usize {
        self.frames.len()
    }

    /// Reports of exceptions raised where they could not propagate, e.g. by generators
    /// closed during collection. Draining.
    pub fn take_unraisable(&mut self) -> Vec<ExceptionReport> {
        std::mem::take(&mut self.unraisable)
    }

    pub(crate) fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.heap.allocate(data)
    }

    /// Creates an empty globals namespace.
    pub fn new_globals(&mut self) -> RunResult<Value> {
        Ok(Value::Ref(self.allocate(HeapData::Dict(Kwargs::default()))?))
    }

    pub fn set_global(&mut self, globals: &Value, name: &str, value: Value) -> RunResult<()> {
        let id = self.dict_id(globals)?;
        if let HeapData::Dict(dict) = self.heap.get_mut(id) {
            dict.insert(name.into(), value);
        }
        Ok(())
    }

    #[must_use]
    pub fn get_global(&self, globals: &Value, name: &str) -> Option<Value> {
        match self.heap.try_get(globals.heap_id()?)? {
            HeapData::Dict(dict) => dict.get(name).cloned(),
            _ => None,
        }
    }

    /// Creates a closure cell holding `value`.
    pub fn new_cell(&mut self, value: Value) -> RunResult<Value> {
        Ok(Value::Ref(self.allocate(HeapData::Cell(value))?))
    }

    /// Contents of a cell, `None` if `cell` is not one or is empty.
    #[must_use]
    pub fn cell_get(&self, cell: &Value) -> Option<Value> {
        match self.heap.try_get(cell.heap_id()?)? {
            HeapData::Cell(Value::Undefined) => None,
            HeapData::Cell(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn new_tuple(&mut self, items: Vec<Value>) -> RunResult<Value> {
        Ok(Value::Ref(self.allocate(HeapData::Tuple(items))?))
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> RunResult<Value> {
        Ok(Value::Ref(self.allocate(HeapData::List(items))?))
    }

    /// Items of a tuple or list.
    #[must_use]
    pub fn sequence_items(&self, value: &Value) -> Option<Vec<Value>> {
        match self.heap.try_get(value.heap_id()?)? {
            HeapData::Tuple(items) | HeapData::List(items) => Some(items.clone()),
            _ => None,
        }
    }

    /// Entries of a dict, in insertion order.
    #[must_use]
    pub fn dict_items(&self, value: &Value) -> Option<Vec<(Arc<str>, Value)>> {
        match self.heap.try_get(value.heap_id()?)? {
            HeapData::Dict(dict) => Some(dict.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => None,
        }
    }

    /// `repr(value)`.
    #[must_use]
    pub fn repr(&self, value: &Value) -> String {
        value.py_repr(&self.heap)
    }

    /// `str(value)`.
    #[must_use]
    pub fn str(&self, value: &Value) -> String {
        value.py_str(&self.heap)
    }

    /// Python type name of `value`.
    #[must_use]
    pub fn type_name(&self, value: &Value) -> String {
        value.py_type(&self.heap).to_string()
    }

    fn dict_id(&self, value: &Value) -> RunResult<HeapId> {
        if let Value::Ref(id) = value
            && let Some(HeapData::Dict(_)) = self.heap.try_get(*id)
        {
            return Ok(*id);
        }
        exc_err_fmt!(ExcType::TypeError; "globals must be a dict, not '{}'", value.py_type(&self.heap))
    }

    fn cell_ids(&self, closure: &[Value]) -> RunResult<Vec<HeapId>> {
        closure
            .iter()
            .map(|value| match value {
                Value::Ref(id) if matches!(self.heap.try_get(*id), Some(HeapData::Cell(_))) => Ok(*id),
                other => exc_err_fmt!(ExcType::TypeError; "closure items must be cells, not '{}'", other.py_type(&self.heap)),
            })
            .collect()
    }

    fn check_closure(code: &CodeUnit, closure_len: usize) -> RunResult<()> {
        let expected = code.freevars().len();
        if expected != closure_len {
            return exc_err_fmt!(ExcType::ValueError; "{}() requires closure of length {expected}, not {closure_len}", code.name());
        }
        Ok(())
    }

    /// Creates a function object.
    ///
    /// `closure` must hold one cell per freevar of `code`.
    pub fn make_function(
        &mut self,
        code: &Arc<CodeUnit>,
        globals: &Value,
        defaults: Vec<Value>,
        kwdefaults: Kwargs,
        closure: &[Value],
    ) -> RunResult<Value> {
        let function = Function {
            code: code.clone(),
            globals: self.dict_id(globals)?,
            defaults,
            kwdefaults,
            closure: self.cell_ids(closure)?,
        };
        self.new_function(function)
    }

    pub(crate) fn new_function(&mut self, function: Function) -> RunResult<Value> {
        Self::check_closure(&function.code, function.closure.len())?;
        Ok(Value::Ref(self.allocate(HeapData::Function(function))?))
    }

    /// Invokes `code` with the given scope, defaults, closure and arguments.
    ///
    /// For a generator or coroutine code unit this creates and returns the generator
    /// without running any of its body; otherwise it runs the body to completion.
    pub fn invoke(
        &mut self,
        code: &Arc<CodeUnit>,
        globals: &Value,
        defaults: &[Value],
        kwdefaults: &Kwargs,
        closure: &[Value],
        args: ArgValues,
    ) -> RunResult<Value> {
        let globals = self.dict_id(globals)?;
        let closure = self.cell_ids(closure)?;
        Self::check_closure(code, closure.len())?;
        let bound = bind_args(code, defaults, kwdefaults, args)?;
        self.enter_code(code.clone(), globals, closure, bound)
    }

    /// Builds the frame for bound arguments and runs it, or wraps it in a generator.
    pub(crate) fn enter_code(
        &mut self,
        code: Arc<CodeUnit>,
        globals: HeapId,
        closure: Vec<HeapId>,
        bound: BoundArgs,
    ) -> RunResult<Value> {
        match self.new_frame(code, globals, closure, bound)? {
            Entered::Value(value) => Ok(value),
            Entered::Frame(frame) => self.run_to_completion(frame),
        }
    }

    /// Builds the frame for bound arguments.
    ///
    /// Generator and coroutine code is wrapped in a new generator instead, which is
    /// returned as the value of the call.
    pub(crate) fn new_frame(
        &mut self,
        code: Arc<CodeUnit>,
        globals: HeapId,
        closure: Vec<HeapId>,
        bound: BoundArgs,
    ) -> RunResult<Entered> {
        let BoundArgs {
            mut locals,
            varargs,
            varkwargs,
        } = bound;
        if let (Some(slot), Some(items)) = (code.varargs_slot(), varargs) {
            locals[slot] = Value::Ref(self.allocate(HeapData::Tuple(items))?);
        }
        if let (Some(slot), Some(extra)) = (code.varkwargs_slot(), varkwargs) {
            locals[slot] = Value::Ref(self.allocate(HeapData::Dict(extra))?);
        }

        let declared = code.argcount()
            + code.kwonlyargcount()
            + usize::from(code.flags().varargs)
            + usize::from(code.flags().varkwargs);
        let mut cells = Vec::with_capacity(code.cellvars().len() + closure.len());
        for name in code.cellvars() {
            // a captured parameter starts out holding its argument
            let initial = code.varnames()[..declared]
                .iter()
                .position(|param| param == name)
                .map_or(Value::Undefined, |slot| locals[slot].clone());
            cells.push(self.allocate(HeapData::Cell(initial))?);
        }
        cells.extend(closure);

        let builtins = match self.current {
            Some(caller) => self.frames.get(caller).builtins,
            None => self.builtins,
        };
        let frame = self.frames.push(Frame::new(code.clone(), locals, cells, globals, builtins));

        if !code.is_generator() && !code.is_coroutine() {
            return Ok(Entered::Frame(frame));
        }
        let kind = if code.is_coroutine() {
            GeneratorKind::Coroutine
        } else {
            GeneratorKind::Generator
        };
        match self.allocate(HeapData::Generator(Generator::new(kind, code.clone(), frame))) {
            Ok(id) => {
                tracing::debug!(name = %code.name(), %kind, "created generator");
                Ok(Entered::Value(Value::Ref(id)))
            }
            Err(err) => {
                self.frames.release(frame);
                Err(err.into())
            }
        }
    }

    /// Runs a plain function frame built by [`Self::new_frame`] and releases it.
    pub(crate) fn run_to_completion(&mut self, frame: FrameId) -> RunResult<Value> {
        let result = self.execute_frame(frame);
        self.frames.release(frame);
        match result? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(_) | FrameExit::Delegate(_) => Err(RunError::internal("plain function frame suspended")),
        }
    }
}
