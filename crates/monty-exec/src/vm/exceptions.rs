//! Raising, normalizing, chaining and reporting exceptions.

use ahash::AHashSet;

use crate::{
    args::ArgValues,
    exception::{
        ChainRelation, ChainedException, ExcInstance, ExcType, ExceptionRaise, ExceptionReport, FrameSummary,
        RunError, RunResult, exc_err_fmt,
    },
    heap::{HeapData, HeapId},
    tracer::CallTracer,
    value::Value,
};

use super::Vm;

/// Snapshot of an exception instance's attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionInfo {
    pub exc_type: ExcType,
    pub args: Vec<Value>,
    /// `__cause__`
    pub cause: Option<Value>,
    /// `__context__`
    pub context: Option<Value>,
    /// `__suppress_context__`
    pub suppress_context: bool,
    /// `__traceback__`, innermost frame first.
    pub traceback: Vec<FrameSummary>,
}

fn next_link(cause: Option<HeapId>, context: Option<HeapId>, suppress_context: bool) -> Option<(HeapId, ChainRelation)> {
    match (cause, context) {
        (Some(cause), _) => Some((cause, ChainRelation::Cause)),
        (None, Some(context)) if !suppress_context => Some((context, ChainRelation::Context)),
        _ => None,
    }
}

impl<T: CallTracer> Vm<T> {
    /// Builds the error for `raise exc from cause` issued by the host.
    ///
    /// `exc` is an exception class or instance. The exception currently being handled,
    /// if any, becomes the implicit context. `Some(Value::None)` as cause suppresses
    /// context display.
    pub fn raise(&mut self, exc: Value, cause: Option<Value>) -> RunError {
        match self.make_raise(exc, cause) {
            RunError::Exc(mut exc) => {
                self.attach_context(&mut exc);
                RunError::Exc(exc)
            }
            other => other,
        }
    }

    /// The exception instance carried by `err`, normalizing it if needed.
    pub fn exception_value(&mut self, err: &mut RunError) -> RunResult<Option<Value>> {
        match err {
            RunError::Exc(exc) | RunError::UncatchableExc(exc) => {
                let id = self.normalize(exc)?;
                self.sync_traceback(exc);
                Ok(Some(Value::Ref(id)))
            }
            RunError::Internal(_) => Ok(None),
        }
    }

    /// Attributes of an exception instance, `None` if `value` is not one.
    #[must_use]
    pub fn exception_info(&self, value: &Value) -> Option<ExceptionInfo> {
        let HeapData::Exception(exc) = self.heap.try_get(value.heap_id()?)? else {
            return None;
        };
        Some(ExceptionInfo {
            exc_type: exc.exc_type,
            args: exc.args.clone(),
            cause: exc.cause.map(Value::Ref),
            context: exc.context.map(Value::Ref),
            suppress_context: exc.suppress_context,
            traceback: exc.traceback.innermost_first(),
        })
    }

    /// A traceback object for `err`, usable as the third argument of [`Vm::throw`].
    pub fn traceback_of(&mut self, err: &RunError) -> RunResult<Option<Value>> {
        let Some(exc) = err.exception() else {
            return Ok(None);
        };
        let id = self.allocate(HeapData::Traceback(exc.traceback.clone()))?;
        Ok(Some(Value::Ref(id)))
    }

    /// Display form of `err` including traceback and cause/context chain.
    ///
    /// Internal errors are reported as `SystemError`.
    #[must_use]
    pub fn report(&self, err: &RunError) -> ExceptionReport {
        let Some(exc) = err.exception() else {
            return ExceptionReport {
                exc_type: ExcType::SystemError,
                message: Some(err.to_string()),
                traceback: Vec::new(),
                chain: Vec::new(),
            };
        };
        let message = match exc.value.and_then(|id| self.heap.try_get(id)) {
            Some(HeapData::Exception(instance)) => instance.message(&self.heap),
            _ => ExcInstance::from_raise(exc).message(&self.heap),
        };

        let mut chain = Vec::new();
        let mut seen: AHashSet<HeapId> = exc.value.into_iter().collect();
        let mut link = next_link(exc.cause, exc.context, exc.suppress_context);
        while let Some((id, relation)) = link {
            if !seen.insert(id) {
                break;
            }
            let Some(HeapData::Exception(instance)) = self.heap.try_get(id) else {
                break;
            };
            chain.push(ChainedException {
                exc_type: instance.exc_type,
                message: instance.message(&self.heap),
                traceback: instance.traceback.innermost_first(),
                relation,
            });
            link = next_link(instance.cause, instance.context, instance.suppress_context);
        }
        chain.reverse();

        ExceptionReport {
            exc_type: exc.exc_type,
            message,
            traceback: exc.traceback.innermost_first(),
            chain,
        }
    }

    /// Creates the instance for `exc` if it has none yet.
    pub(crate) fn normalize(&mut self, exc: &mut ExceptionRaise) -> RunResult<HeapId> {
        if let Some(id) = exc.value {
            return Ok(id);
        }
        let id = self.allocate(HeapData::Exception(ExcInstance::from_raise(exc)))?;
        exc.value = Some(id);
        if let Some(context) = exc.context {
            self.break_context_cycle(id, context);
        }
        Ok(id)
    }

    /// Copies the envelope's traceback onto its instance's `__traceback__`.
    pub(crate) fn sync_traceback(&mut self, exc: &ExceptionRaise) {
        if let Some(id) = exc.value
            && let Some(HeapData::Exception(instance)) = self.heap.try_get_mut(id)
        {
            instance.traceback = exc.traceback.clone();
        }
    }

    /// Records the exception being handled as the implicit context of `exc`.
    ///
    /// Runs once per envelope, when it first unwinds through a frame. Skipped when the
    /// handled exception is `exc` itself.
    pub(crate) fn attach_context(&mut self, exc: &mut ExceptionRaise) {
        if exc.context_attached {
            return;
        }
        exc.context_attached = true;
        // the handled exception of a finally clause is only instantiated when needed
        let Some(mut handled) = self.handled.pop() else {
            return;
        };
        let active = self.normalize(&mut handled);
        self.handled.push(handled);
        let Ok(active) = active else {
            return;
        };
        if exc.value == Some(active) {
            return;
        }
        exc.context = Some(active);
        if let Some(id) = exc.value {
            self.break_context_cycle(id, active);
            if let HeapData::Exception(instance) = self.heap.get_mut(id) {
                instance.context = Some(active);
            }
        }
    }

    /// Cuts the context chain starting at `context` where it would lead back to `value`.
    fn break_context_cycle(&mut self, value: HeapId, context: HeapId) {
        let mut current = context;
        // bounded walk in case an older cycle already exists
        for _ in 0..self.heap.capacity() {
            let next = match self.heap.try_get(current) {
                Some(HeapData::Exception(instance)) => instance.context,
                _ => return,
            };
            match next {
                Some(next) if next == value => {
                    if let HeapData::Exception(instance) = self.heap.get_mut(current) {
                        instance.context = None;
                    }
                    return;
                }
                Some(next) => current = next,
                None => return,
            }
        }
    }

    /// Envelope for raising `exc` (a class or instance) with an optional constructor payload.
    ///
    /// A tuple payload is unpacked into the constructor arguments, except for `KeyError`
    /// whose single argument is the key itself.
    pub(crate) fn make_envelope(&mut self, exc: Value, payload: Option<Value>) -> RunResult<ExceptionRaise> {
        match exc {
            Value::ExcType(exc_type) => {
                let args = match payload {
                    None | Some(Value::None) => Vec::new(),
                    Some(payload) => match payload.heap_id().and_then(|id| self.heap.try_get(id)) {
                        Some(HeapData::Tuple(items)) if exc_type != ExcType::KeyError => items.clone(),
                        _ => vec![payload],
                    },
                };
                let mut raise = ExceptionRaise::new(exc_type, args);
                self.render_heap_args(&mut raise);
                Ok(raise)
            }
            Value::Ref(id) => {
                let Some(HeapData::Exception(instance)) = self.heap.try_get(id) else {
                    return exc_err_fmt!(ExcType::TypeError; "exceptions must derive from BaseException");
                };
                if payload.as_ref().is_some_and(|payload| !payload.is_none()) {
                    return exc_err_fmt!(ExcType::TypeError; "instance exception may not have a separate value");
                }
                let mut raise = ExceptionRaise::new(instance.exc_type, instance.args.clone());
                raise.value = Some(id);
                raise.cause = instance.cause;
                raise.context = instance.context;
                raise.suppress_context = instance.suppress_context;
                raise.traceback = instance.traceback.clone();
                self.render_heap_args(&mut raise);
                Ok(raise)
            }
            _ => exc_err_fmt!(ExcType::TypeError; "exceptions must derive from BaseException"),
        }
    }

    /// Renders the message now if any argument is a heap object, since `Display` on the
    /// envelope has no heap to look it up in.
    pub(crate) fn render_heap_args(&self, exc: &mut ExceptionRaise) {
        if exc.args.iter().any(|arg| arg.heap_id().is_some()) {
            exc.rendered = ExcInstance::from_raise(exc).message(&self.heap).map(Into::into);
        }
    }

    /// Error for `raise exc` / `raise exc from cause`.
    ///
    /// Failures while building the envelope (e.g. raising a non-exception) are returned
    /// as the error instead.
    pub(crate) fn make_raise(&mut self, exc: Value, cause: Option<Value>) -> RunError {
        match self.try_make_raise(exc, cause) {
            Ok(raise) => raise.into(),
            Err(err) => err,
        }
    }

    fn try_make_raise(&mut self, exc: Value, cause: Option<Value>) -> RunResult<ExceptionRaise> {
        let mut raise = self.make_envelope(exc, None)?;
        if let Some(cause) = cause {
            let cause = match cause {
                Value::None => None,
                Value::ExcType(exc_type) => self.instantiate(exc_type, ArgValues::new())?.heap_id(),
                Value::Ref(id) if matches!(self.heap.try_get(id), Some(HeapData::Exception(_))) => Some(id),
                _ => return exc_err_fmt!(ExcType::TypeError; "exception causes must derive from BaseException"),
            };
            raise.set_cause(cause);
            if let Some(id) = raise.value
                && let HeapData::Exception(instance) = self.heap.get_mut(id)
            {
                instance.cause = cause;
                instance.suppress_context = true;
            }
        }
        Ok(raise)
    }

    /// `MatchExc`: whether the exception instance `exc` matches `candidates`, an
    /// exception class or a tuple of them.
    pub(crate) fn exception_matches(&self, exc: &Value, candidates: &Value) -> RunResult<bool> {
        let Some(HeapData::Exception(instance)) = exc.heap_id().and_then(|id| self.heap.try_get(id)) else {
            return Err(RunError::internal("MatchExc on a non-exception"));
        };
        let kind = instance.exc_type;
        match candidates {
            Value::ExcType(candidate) => Ok(kind.matches(*candidate)),
            Value::Ref(id) if matches!(self.heap.try_get(*id), Some(HeapData::Tuple(_))) => {
                let HeapData::Tuple(items) = self.heap.get(*id) else {
                    return Ok(false);
                };
                let mut matched = false;
                for item in items {
                    match item {
                        Value::ExcType(candidate) => matched |= kind.matches(*candidate),
                        _ => return Self::bad_except_clause(),
                    }
                }
                Ok(matched)
            }
            _ => Self::bad_except_clause(),
        }
    }

    fn bad_except_clause() -> RunResult<bool> {
        exc_err_fmt!(ExcType::TypeError; "catching classes that do not inherit from BaseException is not allowed")
    }
}
