//! Frame execution: the push/pop protocol and the instruction loop.
//!
//! Every execution of a frame, whether a fresh call or a generator resume, goes through
//! [`Vm::execute_frame`]. It links the frame to its caller, restores the frame's saved
//! handled exceptions, runs the tracer hooks and restores the caller's state on every
//! exit path.
//!
//! A call from running code to a function does not recurse: the callee's frame is
//! entered and the same loop runs it, returning to the caller when it exits. Only
//! generator resumes and host calls re-enter `execute_frame` natively.

use std::sync::Arc;

use crate::{
    args::ArgValues,
    code::{CodeUnit, Instr},
    exception::{ExcType, RunError, RunResult, exc_err_fmt},
    frame::{Block, Cursor, FinallyState, FrameId, GenInput},
    function::Function,
    generator::GeneratorKind,
    heap::{HeapData, HeapId},
    tracer::CallTracer,
    value::Value,
    vm::{Entered, Vm},
};

/// How a frame stopped executing.
#[derive(Debug)]
pub(crate) enum FrameExit {
    Return(Value),
    /// Suspended at a `yield`.
    Yield(Value),
    /// Suspended delegating to the iterator or coroutine at this heap id.
    Delegate(HeapId),
}

/// Why the instruction loop of one frame stopped.
enum Flow {
    Exit(FrameExit),
    /// The frame called a function; run the callee's frame next.
    Call(FrameId),
}

impl<T: CallTracer> Vm<T> {
    /// Runs `frame` until it returns, suspends or unwinds, including every function it
    /// calls along the way.
    pub(crate) fn execute_frame(&mut self, frame: FrameId) -> RunResult<FrameExit> {
        self.resources.enter_native()?;
        let result = self.enter_frame(frame).and_then(|()| self.drive(frame));
        self.resources.exit_native();
        result
    }

    fn drive(&mut self, entry: FrameId) -> RunResult<FrameExit> {
        let mut frame = entry;
        let mut pending = None;
        loop {
            let result = match self.run_frame(frame, pending.take()) {
                Ok(Flow::Call(callee)) => {
                    match self.enter_frame(callee) {
                        Ok(()) => frame = callee,
                        Err(err) => {
                            self.frames.release(callee);
                            pending = Some(err);
                        }
                    }
                    continue;
                }
                Ok(Flow::Exit(exit)) => Ok(exit),
                Err(err) => Err(err),
            };
            let caller = self.leave_frame(frame, &result);
            if frame == entry {
                return result;
            }
            self.frames.release(frame);
            frame = caller.ok_or_else(|| RunError::internal("callee frame without a caller"))?;
            match result {
                Ok(FrameExit::Return(value)) => self.push(frame, value),
                Ok(FrameExit::Yield(_) | FrameExit::Delegate(_)) => {
                    pending = Some(RunError::internal("plain function frame suspended"));
                }
                Err(err) => pending = Some(err),
            }
        }
    }

    /// Pushes `frame` on the call chain.
    fn enter_frame(&mut self, frame: FrameId) -> RunResult<()> {
        self.resources.enter()?;
        let caller = self.current;
        let exc_base = self.handled.len();
        let saved = {
            let state = self.frames.get_mut(frame);
            state.back = caller;
            state.exc_base = exc_base;
            std::mem::take(&mut state.saved_exceptions)
        };
        self.handled.extend(saved);
        self.current = Some(frame);
        let summary = self.frames.get(frame).summary();
        self.tracer.on_call(&summary);
        Ok(())
    }

    /// Pops `frame` off the call chain, returning its caller.
    fn leave_frame(&mut self, frame: FrameId, result: &RunResult<FrameExit>) -> Option<FrameId> {
        let exc_base = self.frames.get(frame).exc_base;
        let live = if self.handled.len() > exc_base {
            self.handled.split_off(exc_base)
        } else {
            Vec::new()
        };
        let state = self.frames.get_mut(frame);
        let caller = state.back.take();
        if matches!(result, Ok(FrameExit::Yield(_) | FrameExit::Delegate(_))) {
            state.saved_exceptions = live;
        }
        let summary = state.summary();
        self.current = caller;
        self.resources.exit();
        match result {
            Ok(_) => self.tracer.on_return(&summary),
            Err(err) => {
                if let Some(exc_type) = err.exc_type() {
                    self.tracer.on_exception(&summary, exc_type);
                }
            }
        }
        caller
    }

    /// Runs the instructions of one frame. `raised` is an error from a callee, unwound
    /// in this frame before anything else runs.
    fn run_frame(&mut self, frame: FrameId, raised: Option<RunError>) -> RunResult<Flow> {
        let (code, cursor, input, exc_base) = {
            let state = self.frames.get_mut(frame);
            (state.code.clone(), state.cursor, state.input.take(), state.exc_base)
        };
        let mut pc = match cursor {
            Cursor::NotStarted => 0,
            Cursor::At(pc) => pc,
            Cursor::Exhausted => return Err(RunError::internal("resumed an exhausted frame")),
        };
        let mut pending = raised;
        match input {
            Some(GenInput::Send(value)) if cursor != Cursor::NotStarted => self.push(frame, value),
            Some(GenInput::Throw(exc)) => pending = Some(RunError::Exc(exc)),
            Some(GenInput::Send(_)) | None => {}
        }
        self.frames.get_mut(frame).cursor = Cursor::At(pc);

        loop {
            let step = match pending.take() {
                Some(err) => Err(err),
                None => self.step(frame, &code, &mut pc, exc_base),
            };
            match step {
                Ok(None) => {}
                Ok(Some(flow)) => {
                    self.frames.get_mut(frame).cursor = match flow {
                        Flow::Exit(FrameExit::Return(_)) => Cursor::Exhausted,
                        Flow::Exit(FrameExit::Yield(_) | FrameExit::Delegate(_)) | Flow::Call(_) => Cursor::At(pc),
                    };
                    return Ok(flow);
                }
                Err(err) => {
                    if let Err(err) = self.unwind(frame, err, exc_base, &mut pc) {
                        self.frames.get_mut(frame).cursor = Cursor::Exhausted;
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Executes one instruction.
    fn step(&mut self, frame: FrameId, code: &Arc<CodeUnit>, pc: &mut usize, exc_base: usize) -> RunResult<Option<Flow>> {
        self.resources.check_time()?;
        let index = *pc;
        let Some(instr) = code.instrs().get(index) else {
            // falling off the end returns None
            return self.do_return(frame, Value::None, pc, exc_base);
        };
        self.frames.get_mut(frame).lasti = index;
        *pc += 1;

        match instr {
            Instr::LoadConst(value) => self.push(frame, value.clone()),
            Instr::LoadFast(slot) => {
                let slot = usize::from(*slot);
                let value = self.frames.get(frame).locals.get(slot).cloned().unwrap_or(Value::Undefined);
                if matches!(value, Value::Undefined) {
                    let name = code.varnames().get(slot).map_or("?", |name| &**name);
                    return exc_err_fmt!(ExcType::UnboundLocalError; "local variable '{name}' referenced before assignment");
                }
                self.push(frame, value);
            }
            Instr::StoreFast(slot) => {
                let value = self.pop(frame)?;
                let state = self.frames.get_mut(frame);
                match state.locals.get_mut(usize::from(*slot)) {
                    Some(local) => *local = value,
                    None => return Err(RunError::internal("local slot out of range")),
                }
            }
            Instr::LoadDeref(index) => {
                let index = usize::from(*index);
                let cell = self.cell_id(frame, index)?;
                let HeapData::Cell(value) = self.heap.get(cell) else {
                    return Err(RunError::internal("deref of a non-cell"));
                };
                if matches!(value, Value::Undefined) {
                    let cellvars = code.cellvars().len();
                    return if index < cellvars {
                        let name = &code.cellvars()[index];
                        exc_err_fmt!(ExcType::UnboundLocalError; "local variable '{name}' referenced before assignment")
                    } else {
                        let name = code.freevars().get(index - cellvars).map_or("?", |name| &**name);
                        exc_err_fmt!(ExcType::NameError; "free variable '{name}' referenced before assignment in enclosing scope")
                    };
                }
                let value = value.clone();
                self.push(frame, value);
            }
            Instr::StoreDeref(index) => {
                let value = self.pop(frame)?;
                let cell = self.cell_id(frame, usize::from(*index))?;
                if let HeapData::Cell(slot) = self.heap.get_mut(cell) {
                    *slot = value;
                }
            }
            Instr::LoadGlobal(name) => {
                let value = self.load_global(frame, name)?;
                self.push(frame, value);
            }
            Instr::StoreGlobal(name) => {
                let value = self.pop(frame)?;
                let globals = self.frames.get(frame).globals;
                if let HeapData::Dict(dict) = self.heap.get_mut(globals) {
                    dict.insert(name.clone(), value);
                }
            }
            Instr::Pop => {
                self.pop(frame)?;
            }
            Instr::Dup => {
                let value = self.peek(frame)?;
                self.push(frame, value);
            }
            Instr::Swap => {
                let stack = &mut self.frames.get_mut(frame).stack;
                let len = stack.len();
                if len < 2 {
                    return Err(RunError::internal("value stack underflow"));
                }
                stack.swap(len - 1, len - 2);
            }
            Instr::BuildTuple(count) => {
                let items = self.pop_n(frame, usize::from(*count))?;
                let id = self.allocate(HeapData::Tuple(items))?;
                self.push(frame, Value::Ref(id));
            }
            Instr::BuildList(count) => {
                let items = self.pop_n(frame, usize::from(*count))?;
                let id = self.allocate(HeapData::List(items))?;
                self.push(frame, Value::Ref(id));
            }
            Instr::BinaryAdd => self.binary_add(frame)?,
            Instr::BinarySub => self.binary_sub(frame)?,
            Instr::BinaryMul => self.binary_mul(frame)?,
            Instr::CompareEq => self.compare_eq(frame)?,
            Instr::CompareLt => self.compare_lt(frame)?,
            Instr::Jump(target) => *pc = *target,
            Instr::PopJumpIfFalse(target) => {
                let value = self.pop(frame)?;
                if !value.is_truthy(&self.heap) {
                    *pc = *target;
                }
            }
            Instr::PopJumpIfTrue(target) => {
                let value = self.pop(frame)?;
                if value.is_truthy(&self.heap) {
                    *pc = *target;
                }
            }
            Instr::GetIter => {
                let value = self.pop(frame)?;
                let iter = self.get_iter(&value)?;
                self.push(frame, iter);
            }
            Instr::ForIter(target) => {
                let Value::Ref(iter) = self.peek(frame)? else {
                    return Err(RunError::internal("ForIter without an iterator"));
                };
                match self.iter_next(iter)? {
                    Some(item) => self.push(frame, item),
                    None => {
                        self.pop(frame)?;
                        *pc = *target;
                    }
                }
            }
            Instr::Call { argc, kwnames } => {
                let argc = usize::from(*argc);
                if kwnames.len() > argc {
                    return Err(RunError::internal("more keyword names than arguments"));
                }
                let mut values = self.pop_n(frame, argc)?;
                let callable = self.pop(frame)?;
                let kw_values = values.split_off(argc - kwnames.len());
                let args = ArgValues {
                    args: values.into(),
                    kwargs: kwnames.iter().cloned().zip(kw_values).collect(),
                };
                match self.prepare_call(&callable, args)? {
                    Entered::Value(result) => self.push(frame, result),
                    Entered::Frame(callee) => return Ok(Some(Flow::Call(callee))),
                }
            }
            Instr::MakeFunction {
                code: function_code,
                defaults,
                kwdefaults,
                closure,
            } => {
                let kw_values = self.pop_n(frame, kwdefaults.len())?;
                let defaults = self.pop_n(frame, usize::from(*defaults))?;
                let state = self.frames.get(frame);
                let closure = closure
                    .iter()
                    .map(|index| state.cells.get(usize::from(*index)).copied())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| RunError::internal("closure index out of range"))?;
                let function = Function {
                    code: function_code.clone(),
                    globals: state.globals,
                    defaults,
                    kwdefaults: kwdefaults.iter().cloned().zip(kw_values).collect(),
                    closure,
                };
                let value = self.new_function(function)?;
                self.push(frame, value);
            }
            Instr::Yield => {
                if !code.is_generator() && !code.is_coroutine() {
                    return Err(RunError::internal("yield outside a generator"));
                }
                let value = self.pop(frame)?;
                return Ok(Some(Flow::Exit(FrameExit::Yield(value))));
            }
            Instr::YieldFrom => {
                let value = self.pop(frame)?;
                let target = self.yield_from_target(&value, code)?;
                return Ok(Some(Flow::Exit(FrameExit::Delegate(target))));
            }
            Instr::Await => {
                let value = self.pop(frame)?;
                let target = self.await_target(&value)?;
                return Ok(Some(Flow::Exit(FrameExit::Delegate(target))));
            }
            Instr::Return => {
                let value = self.pop(frame)?;
                return self.do_return(frame, value, pc, exc_base);
            }
            Instr::Raise => {
                let value = self.pop(frame)?;
                return Err(self.make_raise(value, None));
            }
            Instr::RaiseFrom => {
                let cause = self.pop(frame)?;
                let value = self.pop(frame)?;
                return Err(self.make_raise(value, Some(cause)));
            }
            Instr::ReRaise => {
                return match self.handled.last() {
                    Some(exc) => {
                        let mut exc = exc.clone();
                        exc.reraise = true;
                        Err(exc.into())
                    }
                    None => exc_err_fmt!(ExcType::RuntimeError; "No active exception to reraise"),
                };
            }
            Instr::SetupExcept(handler) => {
                let state = self.frames.get_mut(frame);
                let stack_depth = state.stack.len();
                state.blocks.push(Block::Except {
                    handler: *handler,
                    stack_depth,
                });
            }
            Instr::SetupFinally(handler) => {
                let state = self.frames.get_mut(frame);
                let stack_depth = state.stack.len();
                state.blocks.push(Block::Finally {
                    handler: *handler,
                    stack_depth,
                });
            }
            Instr::PopBlock => match self.frames.get_mut(frame).blocks.pop() {
                Some(Block::Except { .. } | Block::Finally { .. }) => {}
                _ => return Err(RunError::internal("PopBlock without a try block")),
            },
            Instr::MatchExc => {
                let candidates = self.pop(frame)?;
                let exc = self.pop(frame)?;
                let matched = self.exception_matches(&exc, &candidates)?;
                self.push(frame, Value::Bool(matched));
            }
            Instr::PopExcept => match self.frames.get_mut(frame).blocks.pop() {
                Some(Block::ExceptHandler {
                    handled_depth,
                    stack_depth,
                }) => {
                    self.frames.get_mut(frame).stack.truncate(stack_depth);
                    self.handled.truncate(exc_base + handled_depth);
                }
                _ => return Err(RunError::internal("PopExcept outside an except handler")),
            },
            Instr::BeginFinally => self.enter_finally(frame, FinallyState::Normal, exc_base),
            Instr::EndFinally => match self.exit_finally(frame, exc_base)? {
                FinallyState::Normal => {}
                FinallyState::Raised(exc) => return Err(RunError::Exc(exc)),
                FinallyState::Return(value) => return self.do_return(frame, value, pc, exc_base),
            },
        }
        Ok(None)
    }

    /// Returns `value`, first running any enclosing finally handlers.
    fn do_return(&mut self, frame: FrameId, value: Value, pc: &mut usize, exc_base: usize) -> RunResult<Option<Flow>> {
        loop {
            let state = self.frames.get_mut(frame);
            match state.blocks.pop() {
                None => return Ok(Some(Flow::Exit(FrameExit::Return(value)))),
                Some(Block::Except { .. }) => {}
                Some(Block::ExceptHandler { handled_depth, .. }) => self.handled.truncate(exc_base + handled_depth),
                Some(Block::FinallyHandler {
                    handled_depth,
                    finally_depth,
                }) => {
                    // returning from a finally clause drops whatever it was handling
                    state.finally_states.truncate(finally_depth);
                    self.handled.truncate(exc_base + handled_depth);
                }
                Some(Block::Finally { handler, stack_depth }) => {
                    state.stack.truncate(stack_depth);
                    *pc = handler;
                    self.enter_finally(frame, FinallyState::Return(value), exc_base);
                    return Ok(None);
                }
            }
        }
    }

    /// Starts a finally clause. A pending exception counts as being handled while the
    /// clause runs, so exceptions raised there get it as their context.
    fn enter_finally(&mut self, frame: FrameId, finally: FinallyState, exc_base: usize) {
        let handled_depth = self.handled.len() - exc_base;
        if let FinallyState::Raised(exc) = &finally {
            self.handled.push((**exc).clone());
        }
        let state = self.frames.get_mut(frame);
        state.blocks.push(Block::FinallyHandler {
            handled_depth,
            finally_depth: state.finally_states.len(),
        });
        state.finally_states.push(finally);
    }

    /// Ends the innermost finally clause, returning what it was entered for.
    fn exit_finally(&mut self, frame: FrameId, exc_base: usize) -> RunResult<FinallyState> {
        let state = self.frames.get_mut(frame);
        let Some(Block::FinallyHandler {
            handled_depth,
            finally_depth,
        }) = state.blocks.pop()
        else {
            return Err(RunError::internal("EndFinally outside a finally clause"));
        };
        state.finally_states.truncate(finally_depth + 1);
        let mut finally = state
            .finally_states
            .pop()
            .ok_or_else(|| RunError::internal("finally clause without a state"))?;
        let base = exc_base + handled_depth;
        // keep the instance created while the clause ran, if any
        if let FinallyState::Raised(exc) = &mut finally
            && exc.value.is_none()
        {
            exc.value = self.handled.get(base).and_then(|handled| handled.value);
        }
        self.handled.truncate(base);
        Ok(finally)
    }

    /// Finds the handler for `err` in this frame, or records the frame in the traceback
    /// and hands the error back when there is none.
    fn unwind(&mut self, frame: FrameId, err: RunError, exc_base: usize, pc: &mut usize) -> Result<(), RunError> {
        let RunError::Exc(mut exc) = err else {
            return Err(err);
        };
        self.attach_context(&mut exc);
        loop {
            let block = self.frames.get_mut(frame).blocks.pop();
            match block {
                None => {
                    exc.record_frame(self.frames.get(frame).summary(), false);
                    return Err(RunError::Exc(exc));
                }
                Some(Block::ExceptHandler { handled_depth, .. }) => self.handled.truncate(exc_base + handled_depth),
                Some(Block::FinallyHandler {
                    handled_depth,
                    finally_depth,
                }) => {
                    self.frames.get_mut(frame).finally_states.truncate(finally_depth);
                    self.handled.truncate(exc_base + handled_depth);
                }
                Some(Block::Except { handler, stack_depth }) => {
                    exc.record_frame(self.frames.get(frame).summary(), false);
                    let instance = self.normalize(&mut exc)?;
                    self.sync_traceback(&exc);
                    let handled_depth = self.handled.len() - exc_base;
                    let state = self.frames.get_mut(frame);
                    state.stack.truncate(stack_depth);
                    state.stack.push(Value::Ref(instance));
                    state.blocks.push(Block::ExceptHandler {
                        handled_depth,
                        stack_depth,
                    });
                    self.handled.push(*exc);
                    *pc = handler;
                    return Ok(());
                }
                Some(Block::Finally { handler, stack_depth }) => {
                    exc.record_frame(self.frames.get(frame).summary(), true);
                    self.frames.get_mut(frame).stack.truncate(stack_depth);
                    *pc = handler;
                    self.enter_finally(frame, FinallyState::Raised(exc), exc_base);
                    return Ok(());
                }
            }
        }
    }

    fn load_global(&self, frame: FrameId, name: &Arc<str>) -> RunResult<Value> {
        let state = self.frames.get(frame);
        for namespace in [state.globals, state.builtins] {
            if let HeapData::Dict(dict) = self.heap.get(namespace)
                && let Some(value) = dict.get(name)
            {
                return Ok(value.clone());
            }
        }
        exc_err_fmt!(ExcType::NameError; "name '{name}' is not defined")
    }

    fn cell_id(&self, frame: FrameId, index: usize) -> RunResult<HeapId> {
        self.frames
            .get(frame)
            .cells
            .get(index)
            .copied()
            .ok_or_else(|| RunError::internal("cell index out of range"))
    }

    fn yield_from_target(&mut self, value: &Value, code: &CodeUnit) -> RunResult<HeapId> {
        if let Value::Ref(id) = value
            && let Some(HeapData::Generator(generator)) = self.heap.try_get(*id)
            && generator.kind == GeneratorKind::Coroutine
        {
            if !code.is_coroutine() {
                return exc_err_fmt!(ExcType::TypeError; "cannot 'yield from' a coroutine object in a non-coroutine generator");
            }
            return Ok(*id);
        }
        self.get_iter(value)?
            .heap_id()
            .ok_or_else(|| RunError::internal("iterator is not a heap object"))
    }

    fn await_target(&self, value: &Value) -> RunResult<HeapId> {
        if let Value::Ref(id) = value {
            match self.heap.try_get(*id) {
                Some(HeapData::Generator(generator)) if generator.kind == GeneratorKind::Coroutine => return Ok(*id),
                Some(HeapData::Foreign(_)) => return Ok(*id),
                _ => {}
            }
        }
        exc_err_fmt!(ExcType::TypeError; "object {} can't be used in 'await' expression", value.py_type(&self.heap))
    }

    pub(crate) fn push(&mut self, frame: FrameId, value: Value) {
        self.frames.get_mut(frame).stack.push(value);
    }

    pub(crate) fn pop(&mut self, frame: FrameId) -> RunResult<Value> {
        self.frames
            .get_mut(frame)
            .stack
            .pop()
            .ok_or_else(|| RunError::internal("value stack underflow"))
    }

    fn peek(&self, frame: FrameId) -> RunResult<Value> {
        self.frames
            .get(frame)
            .stack
            .last()
            .cloned()
            .ok_or_else(|| RunError::internal("value stack underflow"))
    }

    fn pop_n(&mut self, frame: FrameId, count: usize) -> RunResult<Vec<Value>> {
        let stack = &mut self.frames.get_mut(frame).stack;
        if stack.len() < count {
            return Err(RunError::internal("value stack underflow"));
        }
        Ok(stack.split_off(stack.len() - count))
    }
}
