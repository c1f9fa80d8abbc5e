use crate::{
    args::{ArgValues, bind_args},
    builtins::Builtins,
    exception::{ExcInstance, ExcType, RunError, RunResult, exc_err_fmt},
    heap::{Heap, HeapData, HeapId},
    tracer::CallTracer,
    value::Value,
    vm::{Entered, Vm},
};

/// Target of a call, resolved from a value.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Callable {
    /// A function object on the heap.
    Function(HeapId),
    /// A builtin function like `iter` or `next`.
    Builtin(Builtins),
    /// An exception class; calling it creates an instance.
    ExcType(ExcType),
}

impl Callable {
    pub fn resolve(value: &Value, heap: &Heap) -> Option<Self> {
        match value {
            Value::Builtin(builtin) => Some(Self::Builtin(*builtin)),
            Value::ExcType(exc_type) => Some(Self::ExcType(*exc_type)),
            Value::Ref(id) => match heap.try_get(*id)? {
                HeapData::Function(_) => Some(Self::Function(*id)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl<T: CallTracer> Vm<T> {
    /// Calls `callable` with `args`.
    ///
    /// Generator and coroutine functions return a new, not yet started generator.
    pub fn call(&mut self, callable: &Value, args: ArgValues) -> RunResult<Value> {
        match self.prepare_call(callable, args)? {
            Entered::Value(value) => Ok(value),
            Entered::Frame(frame) => self.run_to_completion(frame),
        }
    }

    /// Starts a call. Builtins run immediately; a function gets a frame that the caller
    /// runs, so Python-level calls made by running code need no native recursion.
    pub(crate) fn prepare_call(&mut self, callable: &Value, args: ArgValues) -> RunResult<Entered> {
        match Callable::resolve(callable, &self.heap) {
            Some(Callable::Function(id)) => {
                let HeapData::Function(function) = self.heap.get(id) else {
                    return Err(RunError::internal("resolved function is not a function"));
                };
                let code = function.code.clone();
                let globals = function.globals;
                let closure = function.closure.clone();
                let bound = bind_args(&code, &function.defaults, &function.kwdefaults, args)?;
                self.new_frame(code, globals, closure, bound)
            }
            Some(Callable::Builtin(builtin)) => self.call_builtin(builtin, args).map(Entered::Value),
            Some(Callable::ExcType(exc_type)) => self.instantiate(exc_type, args).map(Entered::Value),
            None => exc_err_fmt!(ExcType::TypeError; "'{}' object is not callable", callable.py_type(&self.heap)),
        }
    }

    #[must_use]
    pub fn is_callable(&self, value: &Value) -> bool {
        Callable::resolve(value, &self.heap).is_some()
    }

    /// `ExcType(*args)`: an exception instance that has not been raised.
    pub(crate) fn instantiate(&mut self, exc_type: ExcType, args: ArgValues) -> RunResult<Value> {
        if !args.kwargs.is_empty() {
            return exc_err_fmt!(ExcType::TypeError; "{exc_type}() takes no keyword arguments");
        }
        let instance = ExcInstance {
            exc_type,
            args: args.args.into_vec(),
            cause: None,
            context: None,
            suppress_context: false,
            traceback: crate::exception::Traceback::default(),
        };
        Ok(Value::Ref(self.allocate(HeapData::Exception(instance))?))
    }
}
