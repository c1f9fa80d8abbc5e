//! Generator and coroutine objects: resumption, exception injection, closing and
//! `yield from` delegation.
//!
//! A generator owns a suspended frame in the frame arena. Each resume re-enters that
//! frame through the normal frame push/pop protocol, so tracing, recursion limits and
//! the handled-exception stack work the same as for plain calls.
//!
//! While delegating (`yield from`), the frame stays suspended on its `YieldFrom`
//! instruction and the generator records the delegation target. Sends, throws and
//! closes are forwarded to the target until it completes; its return value (or
//! exception) is then delivered to the frame, which continues after the instruction.

use std::{fmt, sync::Arc};

use crate::{
    code::CodeUnit,
    exception::{ExcType, ExceptionRaise, RunError, RunResult, exc_err_fmt},
    frame::{Cursor, FrameId, GenInput},
    heap::{HeapData, HeapId},
    run_frame::FrameExit,
    tracer::CallTracer,
    value::Value,
    vm::Vm,
};

/// Lifecycle state of a generator, as reported by [`Vm::generator_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum GeneratorState {
    /// Created and never resumed.
    Created,
    /// Currently executing.
    Running,
    /// Suspended at a `yield`, `yield from` or `await`.
    Suspended,
    /// Returned, raised or closed; the frame has been released.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GeneratorKind {
    Generator,
    Coroutine,
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generator => f.write_str("generator"),
            Self::Coroutine => f.write_str("coroutine"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Generator {
    pub kind: GeneratorKind,
    pub code: Arc<CodeUnit>,
    /// `None` once the generator has finished.
    pub frame: Option<FrameId>,
    pub running: bool,
    /// Active `yield from` / `await` target.
    pub delegate: Option<HeapId>,
    /// Set once the collector has run the close-on-collect step.
    pub finalized: bool,
}

impl Generator {
    pub fn new(kind: GeneratorKind, code: Arc<CodeUnit>, frame: FrameId) -> Self {
        Self {
            kind,
            code,
            frame: Some(frame),
            running: false,
            delegate: None,
            finalized: false,
        }
    }
}

/// Outcome of one resumption.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GenResult {
    Yielded(Value),
    /// Finished, with the return value.
    Done(Value),
}

enum DelegateStep {
    Yielded(Value),
    /// The target completed; resume the delegating frame with this input.
    Resume(GenInput),
}

impl<T: CallTracer> Vm<T> {
    /// Resumes `generator`, sending `value` as the result of the pending `yield`.
    ///
    /// Returns the next yielded value. When the generator finishes, fails with
    /// `StopIteration` carrying the return value; once finished, every further resume
    /// fails with a bare `StopIteration`.
    pub fn resume(&mut self, generator: &Value, value: Value) -> RunResult<Value> {
        let id = self.generator_id(generator)?;
        match self.gen_send(id, value)? {
            GenResult::Yielded(value) => Ok(value),
            GenResult::Done(value) => Err(self.stop_iteration(value)),
        }
    }

    /// Raises an exception inside `generator` at its suspension point.
    ///
    /// `exc` is an exception class or instance; `value` is the constructor payload when
    /// `exc` is a class. `traceback`, when given, must be a traceback object and becomes
    /// the starting traceback of the injected exception.
    pub fn throw(&mut self, generator: &Value, exc: Value, value: Option<Value>, traceback: Option<Value>) -> RunResult<Value> {
        let id = self.generator_id(generator)?;
        let traceback = match traceback {
            None | Some(Value::None) => None,
            Some(Value::Ref(tb)) => match self.heap.try_get(tb) {
                Some(HeapData::Traceback(traceback)) => Some(traceback.clone()),
                _ => return exc_err_fmt!(ExcType::TypeError; "throw() third argument must be a traceback object"),
            },
            Some(_) => return exc_err_fmt!(ExcType::TypeError; "throw() third argument must be a traceback object"),
        };
        let mut exc = self.make_envelope(exc, value)?;
        if let Some(traceback) = traceback {
            exc.traceback = traceback;
        }
        match self.gen_throw(id, Box::new(exc))? {
            GenResult::Yielded(value) => Ok(value),
            GenResult::Done(value) => Err(self.stop_iteration(value)),
        }
    }

    /// Closes `generator` by raising `GeneratorExit` at its suspension point.
    ///
    /// Fails with `RuntimeError` if the generator yields instead of exiting. Closing a
    /// finished or never-started generator does nothing but mark it finished. While
    /// delegating, the target is closed first; an error from it is returned unchanged and
    /// the generator is finished without running its body again.
    pub fn close(&mut self, generator: &Value) -> RunResult<()> {
        let id = self.generator_id(generator)?;
        self.gen_close(id)
    }

    /// State of a generator or coroutine, `None` if `generator` is neither.
    #[must_use]
    pub fn generator_state(&self, generator: &Value) -> Option<GeneratorState> {
        let Value::Ref(id) = generator else { return None };
        let Some(HeapData::Generator(generator)) = self.heap.try_get(*id) else {
            return None;
        };
        if generator.running {
            return Some(GeneratorState::Running);
        }
        Some(match generator.frame {
            None => GeneratorState::Closed,
            Some(frame) if self.frames.get(frame).cursor == Cursor::NotStarted => GeneratorState::Created,
            Some(_) => GeneratorState::Suspended,
        })
    }

    fn generator_id(&self, value: &Value) -> RunResult<HeapId> {
        if let Value::Ref(id) = value
            && let Some(HeapData::Generator(_)) = self.heap.try_get(*id)
        {
            return Ok(*id);
        }
        exc_err_fmt!(ExcType::TypeError; "'{}' object is not a generator", value.py_type(&self.heap))
    }

    fn generator(&self, id: HeapId) -> RunResult<&Generator> {
        match self.heap.get(id) {
            HeapData::Generator(generator) => Ok(generator),
            _ => Err(RunError::internal("heap object is not a generator")),
        }
    }

    fn generator_mut(&mut self, id: HeapId) -> RunResult<&mut Generator> {
        match self.heap.get_mut(id) {
            HeapData::Generator(generator) => Ok(generator),
            _ => Err(RunError::internal("heap object is not a generator")),
        }
    }

    fn set_running(&mut self, id: HeapId, running: bool) -> RunResult<()> {
        self.generator_mut(id)?.running = running;
        Ok(())
    }

    pub(crate) fn gen_send(&mut self, id: HeapId, value: Value) -> RunResult<GenResult> {
        let generator = self.generator(id)?;
        let kind = generator.kind;
        if generator.running {
            return exc_err_fmt!(ExcType::ValueError; "{kind} already executing");
        }
        let Some(frame) = generator.frame else {
            return Ok(GenResult::Done(Value::None));
        };
        if let Some(target) = generator.delegate {
            return match self.delegate_step(id, target, GenInput::Send(value))? {
                DelegateStep::Yielded(value) => Ok(GenResult::Yielded(value)),
                DelegateStep::Resume(input) => self.run_generator(id, input),
            };
        }
        if self.frames.get(frame).cursor == Cursor::NotStarted && !value.is_none() {
            return exc_err_fmt!(ExcType::TypeError; "can't send non-None value to a just-started {kind}");
        }
        self.run_generator(id, GenInput::Send(value))
    }

    pub(crate) fn gen_throw(&mut self, id: HeapId, exc: Box<ExceptionRaise>) -> RunResult<GenResult> {
        let generator = self.generator(id)?;
        let kind = generator.kind;
        if generator.running {
            return exc_err_fmt!(ExcType::ValueError; "{kind} already executing");
        }
        if generator.frame.is_none() {
            return Err(RunError::Exc(exc));
        }
        if let Some(target) = generator.delegate {
            if exc.matches(&[ExcType::GeneratorExit]) {
                // close the target first; a failure there replaces the thrown exception
                self.generator_mut(id)?.delegate = None;
                self.set_running(id, true)?;
                let closed = self.nested(|vm| vm.close_iter(target));
                self.set_running(id, false)?;
                let exc = match closed {
                    Ok(()) => exc,
                    Err(RunError::Exc(err)) => err,
                    Err(err) => {
                        self.finish_generator(id);
                        return Err(err);
                    }
                };
                return self.run_generator(id, GenInput::Throw(exc));
            }
            return match self.delegate_step(id, target, GenInput::Throw(exc))? {
                DelegateStep::Yielded(value) => Ok(GenResult::Yielded(value)),
                DelegateStep::Resume(input) => self.run_generator(id, input),
            };
        }
        self.run_generator(id, GenInput::Throw(exc))
    }

    pub(crate) fn gen_close(&mut self, id: HeapId) -> RunResult<()> {
        let generator = self.generator(id)?;
        let kind = generator.kind;
        if generator.running {
            return exc_err_fmt!(ExcType::ValueError; "{kind} already executing");
        }
        let Some(frame) = generator.frame else {
            return Ok(());
        };
        let delegate = generator.delegate;
        if self.frames.get(frame).cursor == Cursor::NotStarted {
            self.finish_generator(id);
            return Ok(());
        }
        if let Some(target) = delegate {
            self.generator_mut(id)?.delegate = None;
            self.set_running(id, true)?;
            let closed = self.nested(|vm| vm.close_iter(target));
            self.set_running(id, false)?;
            // a failure closing the target propagates as is, the frame is abandoned
            match closed {
                Err(err) if !err.matches(&[ExcType::GeneratorExit, ExcType::StopIteration]) => {
                    self.finish_generator(id);
                    return Err(err);
                }
                _ => {}
            }
        }
        let exit = Box::new(ExceptionRaise::new(ExcType::GeneratorExit, vec![]));
        match self.run_generator(id, GenInput::Throw(exit)) {
            Ok(GenResult::Yielded(_)) => exc_err_fmt!(ExcType::RuntimeError; "{kind} ignored GeneratorExit"),
            Ok(GenResult::Done(_)) => Ok(()),
            Err(err) if err.matches(&[ExcType::GeneratorExit, ExcType::StopIteration]) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Forwards one send or throw to the delegation target, with the delegating
    /// generator marked running. Delegation is cleared once the target completes.
    fn delegate_step(&mut self, id: HeapId, target: HeapId, input: GenInput) -> RunResult<DelegateStep> {
        self.set_running(id, true)?;
        let outcome = self.nested(|vm| match input {
            GenInput::Send(value) => vm.iter_send(target, value),
            GenInput::Throw(exc) => vm.iter_throw(target, exc),
        });
        self.set_running(id, false)?;
        let input = match outcome {
            Ok(GenResult::Yielded(value)) => return Ok(DelegateStep::Yielded(value)),
            Ok(GenResult::Done(value)) => GenInput::Send(value),
            Err(RunError::Exc(exc)) => GenInput::Throw(exc),
            Err(err) => {
                self.finish_generator(id);
                return Err(err);
            }
        };
        self.generator_mut(id)?.delegate = None;
        Ok(DelegateStep::Resume(input))
    }

    /// Runs `f` as one more level of native nesting. Delegation chains forward every
    /// step through each generator in the chain.
    fn nested<R>(&mut self, f: impl FnOnce(&mut Self) -> RunResult<R>) -> RunResult<R> {
        self.resources.enter_native()?;
        let result = f(self);
        self.resources.exit_native();
        result
    }

    /// Runs the generator's frame with `input` until it yields or finishes.
    fn run_generator(&mut self, id: HeapId, mut input: GenInput) -> RunResult<GenResult> {
        loop {
            let Some(frame) = self.generator(id)?.frame else {
                return match input {
                    GenInput::Throw(exc) => Err(RunError::Exc(exc)),
                    GenInput::Send(_) => Ok(GenResult::Done(Value::None)),
                };
            };
            self.frames.get_mut(frame).input = Some(input);
            self.set_running(id, true)?;
            let exit = self.execute_frame(frame);
            self.set_running(id, false)?;
            match exit {
                Ok(FrameExit::Yield(value)) => return Ok(GenResult::Yielded(value)),
                Ok(FrameExit::Return(value)) => {
                    self.finish_generator(id);
                    return Ok(GenResult::Done(value));
                }
                Ok(FrameExit::Delegate(target)) => {
                    self.generator_mut(id)?.delegate = Some(target);
                    match self.delegate_step(id, target, GenInput::Send(Value::None))? {
                        DelegateStep::Yielded(value) => return Ok(GenResult::Yielded(value)),
                        DelegateStep::Resume(next) => input = next,
                    }
                }
                Err(err) => {
                    let kind = self.generator(id)?.kind;
                    self.finish_generator(id);
                    return Err(self.stop_iteration_escaped(kind, err));
                }
            }
        }
    }

    /// A `StopIteration` escaping a generator body becomes a `RuntimeError` caused by it,
    /// so it cannot be mistaken for the generator finishing.
    fn stop_iteration_escaped(&mut self, kind: GeneratorKind, err: RunError) -> RunError {
        let RunError::Exc(mut exc) = err else { return err };
        if !exc.matches(&[ExcType::StopIteration]) {
            return RunError::Exc(exc);
        }
        let cause = match self.normalize(&mut exc) {
            Ok(cause) => cause,
            Err(err) => return err,
        };
        let mut runtime = ExceptionRaise::with_message(ExcType::RuntimeError, format!("{kind} raised StopIteration"));
        runtime.traceback = exc.traceback.clone();
        runtime.set_cause(Some(cause));
        runtime.context = Some(cause);
        runtime.context_attached = true;
        runtime.into()
    }

    /// Releases the frame; the generator reports `Closed` from now on.
    pub(crate) fn finish_generator(&mut self, id: HeapId) {
        let frame = match self.heap.try_get_mut(id) {
            Some(HeapData::Generator(generator)) => {
                generator.delegate = None;
                generator.frame.take()
            }
            _ => None,
        };
        if let Some(frame) = frame {
            self.frames.release(frame);
        }
    }

    /// Close-on-collect for an unreachable generator. Errors cannot propagate, they are
    /// logged and recorded as unraisable.
    pub(crate) fn finalize_generator(&mut self, id: HeapId) {
        let name = match self.generator_mut(id) {
            Ok(generator) => {
                generator.finalized = true;
                generator.code.name().clone()
            }
            Err(_) => return,
        };
        if let Err(err) = self.gen_close(id) {
            let report = self.report(&err);
            tracing::warn!(generator = %name, error = %report.summary(), "exception ignored in generator finalizer");
            self.unraisable.push(report);
        }
    }
}
