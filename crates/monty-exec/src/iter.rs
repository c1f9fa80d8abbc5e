//! Uniform iteration over generators, builtin containers and host iterators.
//!
//! Two entry points exist. Plain iteration (`for` loops, `next()`) yields items and
//! treats completion as exhaustion, discarding any return value. The delegation
//! entry points used by `yield from` (`iter_send`, `iter_throw`) report completion as
//! [`GenResult::Done`] carrying the return value, so it can become the result of the
//! delegating expression.

use std::fmt::{self, Write};

use crate::{
    exception::{ExcType, ExceptionRaise, RunError, RunResult, exc_err_fmt},
    generator::{GenResult, GeneratorKind},
    heap::{HeapData, HeapId},
    tracer::CallTracer,
    types::Type,
    value::Value,
    vm::Vm,
};

/// `range(start, stop, step)`, step is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> usize {
        let (lo, hi) = if self.step > 0 {
            (self.start, self.stop)
        } else {
            (self.stop, self.start)
        };
        if hi <= lo {
            return 0;
        }
        // in i128 so that the magnitude of i64::MIN fits
        let span = i128::from(hi) - i128::from(lo);
        let step = i128::from(self.step).abs();
        usize::try_from((span - 1) / step + 1).unwrap_or(usize::MAX)
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let offset = i64::try_from(index).ok()?.checked_mul(self.step)?;
        self.start.checked_add(offset)
    }

    pub fn write_repr(&self, out: &mut String) {
        let _ = if self.step == 1 {
            write!(out, "range({}, {})", self.start, self.stop)
        } else {
            write!(out, "range({}, {}, {})", self.start, self.stop, self.step)
        };
    }
}

/// Iterator over a builtin container or string, by index.
#[derive(Debug)]
pub(crate) struct NativeIter {
    pub source: Value,
    index: usize,
    exhausted: bool,
}

impl NativeIter {
    fn new(source: Value) -> Self {
        Self {
            source,
            index: 0,
            exhausted: false,
        }
    }

    pub fn py_type(&self) -> Type {
        Type::Iterator
    }
}

/// An iterator implemented by the host.
///
/// `next`, `send` and `throw` return `Ok(None)` when the iterator is exhausted.
/// Returning a `StopIteration` error is also accepted and treated as exhaustion, with
/// its first argument used as the return value under `yield from`. The optional
/// capabilities default to absent; `yield from` then behaves as Python does for an
/// iterator lacking the corresponding method.
pub trait ForeignIterator: fmt::Debug {
    fn type_name(&self) -> &'static str {
        "foreign_iterator"
    }

    fn next(&mut self) -> RunResult<Option<Value>>;

    fn can_send(&self) -> bool {
        false
    }

    fn send(&mut self, value: Value) -> RunResult<Option<Value>> {
        let _ = value;
        self.next()
    }

    fn can_throw(&self) -> bool {
        false
    }

    fn throw(&mut self, exc: ExceptionRaise) -> RunResult<Option<Value>> {
        Err(exc.into())
    }

    fn can_close(&self) -> bool {
        false
    }

    fn close(&mut self) -> RunResult<()> {
        Ok(())
    }

    /// Heap objects this iterator keeps alive, for the collector.
    fn heap_ids(&self) -> Vec<HeapId> {
        Vec::new()
    }
}

#[derive(Debug)]
pub(crate) struct ForeignIter {
    inner: Box<dyn ForeignIterator>,
    exhausted: bool,
}

impl ForeignIter {
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name()
    }

    pub fn push_heap_ids(&self, out: &mut Vec<HeapId>) {
        out.extend(self.inner.heap_ids());
    }
}

enum ForeignOp {
    Next,
    Send(Value),
    Throw(Box<ExceptionRaise>),
}

impl<T: CallTracer> Vm<T> {
    /// Registers a host iterator, returning it as an iterator value.
    pub fn new_foreign_iter(&mut self, iterator: Box<dyn ForeignIterator>) -> RunResult<Value> {
        let id = self.allocate(HeapData::Foreign(ForeignIter {
            inner: iterator,
            exhausted: false,
        }))?;
        Ok(Value::Ref(id))
    }

    /// `iter(value)`: iterators and generators return themselves.
    pub fn get_iter(&mut self, value: &Value) -> RunResult<Value> {
        let source = match value {
            Value::Str(_) => value.clone(),
            Value::Ref(id) => match self.heap.try_get(*id) {
                Some(HeapData::Tuple(_) | HeapData::List(_) | HeapData::Dict(_) | HeapData::Range(_)) => value.clone(),
                Some(HeapData::Iter(_) | HeapData::Foreign(_)) => return Ok(value.clone()),
                Some(HeapData::Generator(generator)) => {
                    if generator.kind == GeneratorKind::Coroutine {
                        return exc_err_fmt!(ExcType::TypeError; "'coroutine' object is not iterable");
                    }
                    return Ok(value.clone());
                }
                _ => return exc_err_fmt!(ExcType::TypeError; "'{}' object is not iterable", value.py_type(&self.heap)),
            },
            _ => return exc_err_fmt!(ExcType::TypeError; "'{}' object is not iterable", value.py_type(&self.heap)),
        };
        let id = self.allocate(HeapData::Iter(NativeIter::new(source)))?;
        Ok(Value::Ref(id))
    }

    /// `next(iterator)`: the next item, or `StopIteration` once exhausted.
    ///
    /// A generator's return value is carried by the `StopIteration`.
    pub fn next(&mut self, iterator: &Value) -> RunResult<Value> {
        let id = self.iterator_id(iterator)?;
        match self.iter_send(id, Value::None)? {
            GenResult::Yielded(value) => Ok(value),
            GenResult::Done(value) => Err(self.stop_iteration(value)),
        }
    }

    pub(crate) fn stop_iteration(&self, value: Value) -> RunError {
        let args = if value.is_none() { vec![] } else { vec![value] };
        let mut exc = ExceptionRaise::new(ExcType::StopIteration, args);
        self.render_heap_args(&mut exc);
        exc.into()
    }

    fn iterator_id(&self, iterator: &Value) -> RunResult<HeapId> {
        if let Value::Ref(id) = iterator {
            match self.heap.try_get(*id) {
                Some(HeapData::Generator(generator)) if generator.kind == GeneratorKind::Coroutine => {}
                Some(HeapData::Iter(_) | HeapData::Foreign(_) | HeapData::Generator(_)) => return Ok(*id),
                _ => {}
            }
        }
        exc_err_fmt!(ExcType::TypeError; "'{}' object is not an iterator", iterator.py_type(&self.heap))
    }

    /// Plain iteration step: `None` once exhausted, return values discarded.
    ///
    /// An exhausted source is never resumed again.
    pub(crate) fn iter_next(&mut self, id: HeapId) -> RunResult<Option<Value>> {
        match self.iter_send(id, Value::None)? {
            GenResult::Yielded(value) => Ok(Some(value)),
            GenResult::Done(_) => Ok(None),
        }
    }

    /// Delegation step sending `value`.
    pub(crate) fn iter_send(&mut self, id: HeapId, value: Value) -> RunResult<GenResult> {
        match self.heap.get(id) {
            HeapData::Generator(_) => self.gen_send(id, value),
            HeapData::Iter(_) => {
                if !value.is_none() {
                    return exc_err_fmt!(ExcType::AttributeError; "'iterator' object has no attribute 'send'");
                }
                Ok(match self.native_next(id)? {
                    Some(item) => GenResult::Yielded(item),
                    None => GenResult::Done(Value::None),
                })
            }
            HeapData::Foreign(foreign) => {
                if value.is_none() {
                    self.foreign_step(id, ForeignOp::Next)
                } else if foreign.inner.can_send() {
                    self.foreign_step(id, ForeignOp::Send(value))
                } else {
                    exc_err_fmt!(ExcType::AttributeError; "'{}' object has no attribute 'send'", foreign.type_name())
                }
            }
            other => exc_err_fmt!(ExcType::TypeError; "'{}' object is not an iterator", other.py_type()),
        }
    }

    /// Delegation step throwing `exc`. Targets without throw support re-raise it.
    pub(crate) fn iter_throw(&mut self, id: HeapId, exc: Box<ExceptionRaise>) -> RunResult<GenResult> {
        match self.heap.get(id) {
            HeapData::Generator(_) => self.gen_throw(id, exc),
            HeapData::Foreign(foreign) if foreign.inner.can_throw() && !foreign.exhausted => {
                self.foreign_step(id, ForeignOp::Throw(exc))
            }
            _ => Err(RunError::Exc(exc)),
        }
    }

    /// Close request forwarded under delegation; targets without close support ignore it.
    pub(crate) fn close_iter(&mut self, id: HeapId) -> RunResult<()> {
        if matches!(self.heap.get(id), HeapData::Generator(_)) {
            return self.gen_close(id);
        }
        match self.heap.get_mut(id) {
            HeapData::Foreign(foreign) if foreign.inner.can_close() => {
                foreign.exhausted = true;
                foreign.inner.close()
            }
            _ => Ok(()),
        }
    }

    fn native_next(&mut self, id: HeapId) -> RunResult<Option<Value>> {
        let HeapData::Iter(iter) = self.heap.get(id) else {
            return Err(RunError::internal("native_next on a non-iterator"));
        };
        if iter.exhausted {
            return Ok(None);
        }
        let index = iter.index;
        let item = match &iter.source {
            Value::Str(s) => s.chars().nth(index).map(|c| Value::Str(c.to_string().into())),
            Value::Ref(source) => match self.heap.get(*source) {
                HeapData::Tuple(items) | HeapData::List(items) => items.get(index).cloned(),
                HeapData::Dict(dict) => dict.get_index(index).map(|(key, _)| Value::Str(key.clone())),
                HeapData::Range(range) => range.get(index).map(Value::Int),
                _ => None,
            },
            _ => None,
        };
        if let HeapData::Iter(iter) = self.heap.get_mut(id) {
            match item {
                Some(_) => iter.index += 1,
                None => iter.exhausted = true,
            }
        }
        Ok(item)
    }

    fn foreign_step(&mut self, id: HeapId, op: ForeignOp) -> RunResult<GenResult> {
        let HeapData::Foreign(foreign) = self.heap.get_mut(id) else {
            return Err(RunError::internal("foreign_step on a non-foreign object"));
        };
        if foreign.exhausted {
            return match op {
                ForeignOp::Throw(exc) => Err(RunError::Exc(exc)),
                ForeignOp::Next | ForeignOp::Send(_) => Ok(GenResult::Done(Value::None)),
            };
        }
        let result = match op {
            ForeignOp::Next => foreign.inner.next(),
            ForeignOp::Send(value) => foreign.inner.send(value),
            ForeignOp::Throw(exc) => foreign.inner.throw(*exc),
        };
        match result {
            Ok(Some(value)) => Ok(GenResult::Yielded(value)),
            Ok(None) => {
                foreign.exhausted = true;
                Ok(GenResult::Done(Value::None))
            }
            Err(RunError::Exc(exc)) if exc.matches(&[ExcType::StopIteration]) => {
                foreign.exhausted = true;
                Ok(GenResult::Done(exc.stop_iteration_value()))
            }
            Err(err) => Err(err),
        }
    }
}
