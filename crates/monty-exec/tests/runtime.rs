//! Tests for iteration, closures, tracing, resource limits and garbage collection.

use std::{sync::Arc, time::Duration};

use monty_exec::{
    ArgValues, Builtins, CallTracer, CodeBuilder, CodeUnit, DEFAULT_MAX_RECURSION_DEPTH, ExcType, ForeignIterator,
    GeneratorState, Instr, Kwargs, LogTracer, MAX_NATIVE_DEPTH, RecordingTracer, ResourceLimits, RunError, RunResult,
    TraceEvent, Value, Vm,
};
use pretty_assertions::assert_eq;

fn invoke<T: CallTracer>(vm: &mut Vm<T>, code: &Arc<CodeUnit>, globals: &Value, args: ArgValues) -> RunResult<Value> {
    vm.invoke(code, globals, &[], &Kwargs::default(), &[], args)
}

/// ```python
/// def total(items):
///     total = 0
///     for item in items:
///         total = total + item
///     return total
/// ```
fn total() -> Arc<CodeUnit> {
    let mut builder = CodeBuilder::new("total").params(&["items"]).locals(&["total", "item"]);
    let top = builder.label();
    let done = builder.label();
    builder
        .load_const(0)
        .store_fast("total")
        .load_fast("items")
        .emit(Instr::GetIter)
        .bind(top)
        .for_iter(done)
        .store_fast("item")
        .load_fast("total")
        .load_fast("item")
        .emit(Instr::BinaryAdd)
        .store_fast("total")
        .jump(top)
        .bind(done)
        .load_fast("total")
        .ret();
    builder.build().unwrap()
}

#[derive(Debug)]
struct Countdown(i64);

impl ForeignIterator for Countdown {
    fn type_name(&self) -> &'static str {
        "countdown"
    }

    fn next(&mut self) -> RunResult<Option<Value>> {
        if self.0 == 0 {
            return Ok(None);
        }
        self.0 -= 1;
        Ok(Some(Value::Int(self.0 + 1)))
    }
}

#[derive(Debug)]
struct Broken;

impl ForeignIterator for Broken {
    fn next(&mut self) -> RunResult<Option<Value>> {
        Err(std::io::Error::other("connection reset").into())
    }
}

#[test]
fn for_loops_over_every_iterable_kind() {
    let code = total();
    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();

    let range = vm.call(&Value::Builtin(Builtins::Range), ArgValues::new().arg(5)).unwrap();
    assert_eq!(vm.repr(&range), "range(0, 5)");
    assert_eq!(invoke(&mut vm, &code, &globals, ArgValues::new().arg(range)).unwrap(), Value::Int(10));

    let tuple = vm.new_tuple(vec![Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap();
    assert_eq!(invoke(&mut vm, &code, &globals, ArgValues::new().arg(tuple)).unwrap(), Value::Int(6));

    let list = vm.new_list(vec![]).unwrap();
    assert_eq!(invoke(&mut vm, &code, &globals, ArgValues::new().arg(list)).unwrap(), Value::Int(0));

    let countdown = vm.new_foreign_iter(Box::new(Countdown(3))).unwrap();
    assert_eq!(vm.type_name(&countdown), "countdown");
    assert_eq!(invoke(&mut vm, &code, &globals, ArgValues::new().arg(countdown)).unwrap(), Value::Int(6));

    // def numbers(): yield 4; yield 5; return 100
    let mut builder = CodeBuilder::new("numbers").generator();
    builder
        .load_const(4)
        .emit(Instr::Yield)
        .emit(Instr::Pop)
        .load_const(5)
        .emit(Instr::Yield)
        .emit(Instr::Pop)
        .load_const(100)
        .ret();
    let generator = invoke(&mut vm, &builder.build().unwrap(), &globals, ArgValues::new()).unwrap();
    // the return value is not part of the iteration
    assert_eq!(
        invoke(&mut vm, &code, &globals, ArgValues::new().arg(generator.clone())).unwrap(),
        Value::Int(9)
    );
    assert_eq!(vm.generator_state(&generator), Some(GeneratorState::Closed));
}

#[test]
fn iterating_non_iterables() {
    let code = total();
    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let err = invoke(&mut vm, &code, &globals, ArgValues::new().arg(3)).unwrap_err();
    assert_eq!(err.to_string(), "TypeError: 'int' object is not iterable");
}

#[test]
fn foreign_iterator_errors_propagate() {
    let code = total();
    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let broken = vm.new_foreign_iter(Box::new(Broken)).unwrap();
    let err = invoke(&mut vm, &code, &globals, ArgValues::new().arg(broken)).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::HostIoError));
    assert!(err.matches(&[ExcType::OSError]));
    assert_eq!(err.exception().unwrap().traceback().len(), 1);
}

#[test]
fn next_with_and_without_default() {
    let mut vm = Vm::default();
    let list = vm.new_list(vec![Value::from("a")]).unwrap();
    let iterator = vm.get_iter(&list).unwrap();
    assert_eq!(vm.next(&iterator).unwrap(), Value::from("a"));

    let err = vm.next(&iterator).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::StopIteration));

    let next = Value::Builtin(Builtins::Next);
    let args = ArgValues::new().arg(iterator.clone()).arg("done");
    assert_eq!(vm.call(&next, args).unwrap(), Value::from("done"));

    let err = vm.next(&list).unwrap_err();
    assert_eq!(err.to_string(), "TypeError: 'list' object is not an iterator");
}

#[test]
fn range_arguments() {
    let mut vm = Vm::default();
    let range = Value::Builtin(Builtins::Range);
    let err = vm
        .call(&range, ArgValues::new().arg(1).arg(10).arg(0))
        .unwrap_err();
    assert_eq!(err.to_string(), "ValueError: range() arg 3 must not be zero");

    let value = vm.call(&range, ArgValues::new().arg(10).arg(0).arg(-3)).unwrap();
    let iterator = vm.get_iter(&value).unwrap();
    let mut items = Vec::new();
    while let Ok(item) = vm.next(&iterator) {
        items.push(item);
    }
    assert_eq!(items, vec![Value::Int(10), Value::Int(7), Value::Int(4), Value::Int(1)]);
}

/// ```python
/// def make_counter():
///     n = 0
///     def inc():
///         nonlocal n
///         n = n + 1
///         return n
///     return inc
/// ```
fn make_counter() -> Arc<CodeUnit> {
    let mut builder = CodeBuilder::new("inc").freevars(&["n"]);
    builder
        .load_deref("n")
        .load_const(1)
        .emit(Instr::BinaryAdd)
        .emit(Instr::Dup)
        .store_deref("n")
        .ret();
    let inc = builder.build().unwrap();

    let mut builder = CodeBuilder::new("make_counter").cellvars(&["n"]);
    builder
        .load_const(0)
        .store_deref("n")
        .make_function(inc, 0, &[], &["n"])
        .ret();
    builder.build().unwrap()
}

#[test]
fn closures_share_cells() {
    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let counter = invoke(&mut vm, &make_counter(), &globals, ArgValues::new()).unwrap();
    assert_eq!(vm.call(&counter, ArgValues::new()).unwrap(), Value::Int(1));
    assert_eq!(vm.call(&counter, ArgValues::new()).unwrap(), Value::Int(2));

    // each call of the factory gets its own cell
    let other = invoke(&mut vm, &make_counter(), &globals, ArgValues::new()).unwrap();
    assert_eq!(vm.call(&other, ArgValues::new()).unwrap(), Value::Int(1));
    assert_eq!(vm.call(&counter, ArgValues::new()).unwrap(), Value::Int(3));
}

#[test]
fn captured_parameters_start_with_the_argument() {
    // def adder(x):
    //     def add(y): return x + y
    //     return add
    let mut builder = CodeBuilder::new("add").params(&["y"]).freevars(&["x"]);
    builder.load_deref("x").load_fast("y").emit(Instr::BinaryAdd).ret();
    let add = builder.build().unwrap();

    let mut builder = CodeBuilder::new("adder").params(&["x"]).cellvars(&["x"]);
    builder.make_function(add.clone(), 0, &[], &["x"]).ret();
    let adder = builder.build().unwrap();

    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let add_ten = invoke(&mut vm, &adder, &globals, ArgValues::new().arg(10)).unwrap();
    assert_eq!(vm.call(&add_ten, ArgValues::new().arg(5)).unwrap(), Value::Int(15));

    // hosts supply closures as cells
    let cell = vm.new_cell(Value::Int(1)).unwrap();
    assert_eq!(vm.cell_get(&cell), Some(Value::Int(1)));
    let result = vm
        .invoke(&add, &globals, &[], &Kwargs::default(), &[cell], ArgValues::new().arg(2))
        .unwrap();
    assert_eq!(result, Value::Int(3));

    let err = vm
        .make_function(&add, &globals, vec![], Kwargs::default(), &[])
        .unwrap_err();
    assert_eq!(err.to_string(), "ValueError: add() requires closure of length 1, not 0");
}

#[test]
fn free_variable_read_before_assignment() {
    // def outer():
    //     def inner(): return n
    //     f = inner
    //     return f()
    //     n = 1
    let mut builder = CodeBuilder::new("inner").freevars(&["n"]);
    builder.load_deref("n").ret();
    let inner = builder.build().unwrap();

    let mut builder = CodeBuilder::new("outer").cellvars(&["n"]);
    builder.make_function(inner, 0, &[], &["n"]).call(0).ret();
    let outer = builder.build().unwrap();

    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let err = invoke(&mut vm, &outer, &globals, ArgValues::new()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "NameError: free variable 'n' referenced before assignment in enclosing scope"
    );
}

/// `def inner(): raise ValueError` and `def outer(): return inner()`
fn nested_calls(inner_raises: bool) -> (Arc<CodeUnit>, Arc<CodeUnit>) {
    let mut builder = CodeBuilder::new("inner");
    if inner_raises {
        builder.load_const(ExcType::ValueError).emit(Instr::Raise);
    } else {
        builder.load_none().ret();
    }
    let inner = builder.build().unwrap();

    let mut builder = CodeBuilder::new("outer");
    builder.load_global("inner").call(0).ret();
    (inner, builder.build().unwrap())
}

fn traced(inner_raises: bool) -> Vec<TraceEvent> {
    let (inner, outer) = nested_calls(inner_raises);
    let mut vm = Vm::with_tracer(ResourceLimits::default(), RecordingTracer::default());
    let globals = vm.new_globals().unwrap();
    let function = vm.make_function(&inner, &globals, vec![], Kwargs::default(), &[]).unwrap();
    vm.set_global(&globals, "inner", function).unwrap();
    let _ = invoke(&mut vm, &outer, &globals, ArgValues::new());
    std::mem::take(&mut vm.tracer_mut().events)
}

#[test]
fn tracer_sees_calls_and_returns_in_order() {
    assert_eq!(
        traced(false),
        vec![
            TraceEvent::Call("outer".to_owned()),
            TraceEvent::Call("inner".to_owned()),
            TraceEvent::Return("inner".to_owned()),
            TraceEvent::Return("outer".to_owned()),
        ]
    );
}

#[test]
fn tracer_sees_exceptions_unwinding() {
    assert_eq!(
        traced(true),
        vec![
            TraceEvent::Call("outer".to_owned()),
            TraceEvent::Call("inner".to_owned()),
            TraceEvent::Exception("inner".to_owned(), ExcType::ValueError),
            TraceEvent::Exception("outer".to_owned(), ExcType::ValueError),
        ]
    );
}

#[test]
fn log_tracer_runs_code_unchanged() {
    let (inner, outer) = nested_calls(false);
    let mut vm = Vm::with_tracer(ResourceLimits::default(), LogTracer);
    let globals = vm.new_globals().unwrap();
    let function = vm.make_function(&inner, &globals, vec![], Kwargs::default(), &[]).unwrap();
    vm.set_global(&globals, "inner", function).unwrap();
    assert_eq!(invoke(&mut vm, &outer, &globals, ArgValues::new()).unwrap(), Value::None);
}

#[test]
fn recursion_limit() {
    // def forever(): return forever()
    let mut builder = CodeBuilder::new("forever");
    builder.load_global("forever").call(0).ret();
    let code = builder.build().unwrap();

    let mut vm = Vm::new(ResourceLimits::new().max_recursion_depth(20));
    let globals = vm.new_globals().unwrap();
    let function = vm.make_function(&code, &globals, vec![], Kwargs::default(), &[]).unwrap();
    vm.set_global(&globals, "forever", function).unwrap();

    let err = invoke(&mut vm, &code, &globals, ArgValues::new()).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::RecursionError));
    assert_eq!(err.to_string(), "RecursionError: maximum recursion depth exceeded");
    assert_eq!(err.exception().unwrap().traceback().len(), 20);
    assert_eq!(vm.live_frames(), 0);

    // the depth is restored once the error has unwound
    let noop = CodeBuilder::new("noop").build().unwrap();
    assert_eq!(invoke(&mut vm, &noop, &globals, ArgValues::new()).unwrap(), Value::None);
}

#[test]
fn default_recursion_limit_is_reachable() {
    // def forever(): return forever()
    let mut builder = CodeBuilder::new("forever");
    builder.load_global("forever").call(0).ret();
    let code = builder.build().unwrap();

    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let function = vm.make_function(&code, &globals, vec![], Kwargs::default(), &[]).unwrap();
    vm.set_global(&globals, "forever", function).unwrap();

    let err = invoke(&mut vm, &code, &globals, ArgValues::new()).unwrap_err();
    assert_eq!(err.to_string(), "RecursionError: maximum recursion depth exceeded");
    assert_eq!(err.exception().unwrap().traceback().len(), DEFAULT_MAX_RECURSION_DEPTH);
    assert_eq!(vm.live_frames(), 0);
}

#[test]
fn unbounded_delegation_chain_raises_recursion_error() {
    // def deep(): yield from deep()
    let mut builder = CodeBuilder::new("deep").generator();
    builder.load_global("deep").call(0).emit(Instr::YieldFrom).ret();
    let code = builder.build().unwrap();

    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let function = vm.make_function(&code, &globals, vec![], Kwargs::default(), &[]).unwrap();
    vm.set_global(&globals, "deep", function).unwrap();

    let generator = invoke(&mut vm, &code, &globals, ArgValues::new()).unwrap();
    let err = vm.resume(&generator, Value::None).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::RecursionError));
    // one frame per generator that was running when the limit was hit
    assert_eq!(err.exception().unwrap().traceback().len(), MAX_NATIVE_DEPTH);
    assert_eq!(vm.generator_state(&generator), Some(GeneratorState::Closed));
    assert_eq!(vm.live_frames(), 0);
}

#[test]
fn allocation_limit() {
    // while True: (1,)
    let mut builder = CodeBuilder::new("hog");
    let top = builder.label();
    builder
        .bind(top)
        .load_const(1)
        .emit(Instr::BuildTuple(1))
        .emit(Instr::Pop)
        .jump(top);
    let code = builder.build().unwrap();

    let mut vm = Vm::new(ResourceLimits::new().max_allocations(10));
    let globals = vm.new_globals().unwrap();
    let err = invoke(&mut vm, &code, &globals, ArgValues::new()).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::MemoryError));
    assert_eq!(err.to_string(), "MemoryError: allocation limit of 10 objects exceeded");
    assert_eq!(vm.live_objects(), 10);

    assert_eq!(vm.collect_garbage(&[globals]), 8);
    assert_eq!(vm.live_objects(), 2);
}

#[test]
fn time_limit_cannot_be_caught() {
    // try:
    //     while True: pass
    // except BaseException:
    //     return "caught"
    let mut builder = CodeBuilder::new("spin");
    let handler = builder.label();
    let top = builder.label();
    builder
        .setup_except(handler)
        .bind(top)
        .jump(top)
        .bind(handler)
        .load_const("caught")
        .ret();
    let code = builder.build().unwrap();

    let mut vm = Vm::new(ResourceLimits::new().max_duration(Duration::from_nanos(1)));
    let globals = vm.new_globals().unwrap();
    let err = invoke(&mut vm, &code, &globals, ArgValues::new()).unwrap_err();
    assert!(matches!(err, RunError::UncatchableExc(_)));
    assert_eq!(err.exc_type(), Some(ExcType::TimeoutError));
}

/// ```python
/// def guarded():
///     try:
///         yield 1
///     finally:
///         closed = True
/// ```
fn guarded() -> Arc<CodeUnit> {
    let mut builder = CodeBuilder::new("guarded").generator();
    let cleanup = builder.label();
    builder
        .setup_finally(cleanup)
        .load_const(1)
        .emit(Instr::Yield)
        .emit(Instr::Pop)
        .emit(Instr::PopBlock)
        .emit(Instr::BeginFinally)
        .bind(cleanup)
        .load_const(true)
        .store_global("closed")
        .emit(Instr::EndFinally)
        .load_none()
        .ret();
    builder.build().unwrap()
}

#[test]
fn collection_frees_unreachable_objects() {
    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let kept = vm.new_list(vec![]).unwrap();
    let inner = vm.new_tuple(vec![Value::Int(1)]).unwrap();
    vm.set_global(&globals, "nested", inner).unwrap();
    vm.new_tuple(vec![]).unwrap();
    vm.new_tuple(vec![]).unwrap();

    assert_eq!(vm.collect_garbage(&[globals.clone(), kept.clone()]), 2);
    assert_eq!(vm.repr(&kept), "[]");
    let nested = vm.get_global(&globals, "nested").unwrap();
    assert_eq!(vm.repr(&nested), "(1,)");
    assert_eq!(vm.collect_garbage(&[globals, kept]), 0);
}

#[test]
fn collection_closes_unreachable_generators() {
    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let code = guarded();

    let kept = invoke(&mut vm, &code, &globals, ArgValues::new()).unwrap();
    vm.resume(&kept, Value::None).unwrap();
    let dropped = invoke(&mut vm, &code, &globals, ArgValues::new()).unwrap();
    vm.resume(&dropped, Value::None).unwrap();
    assert_eq!(vm.live_frames(), 2);

    assert_eq!(vm.collect_garbage(&[globals.clone(), kept.clone()]), 1);
    assert_eq!(vm.get_global(&globals, "closed"), Some(Value::Bool(true)));
    assert_eq!(vm.generator_state(&kept), Some(GeneratorState::Suspended));
    assert_eq!(vm.live_frames(), 1);
    assert!(vm.take_unraisable().is_empty());
}

#[test]
fn finalizer_errors_are_unraisable() {
    // def stubborn():
    //     try:
    //         yield 1
    //     except BaseException:
    //         yield 2
    let mut builder = CodeBuilder::new("stubborn").generator();
    let handler = builder.label();
    builder
        .setup_except(handler)
        .load_const(1)
        .emit(Instr::Yield)
        .ret()
        .bind(handler)
        .emit(Instr::Pop)
        .emit(Instr::PopExcept)
        .load_const(2)
        .emit(Instr::Yield)
        .ret();
    let code = builder.build().unwrap();

    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let generator = invoke(&mut vm, &code, &globals, ArgValues::new()).unwrap();
    vm.resume(&generator, Value::None).unwrap();

    vm.collect_garbage(&[globals]);
    assert_eq!(vm.live_frames(), 0);
    let unraisable = vm.take_unraisable();
    assert_eq!(unraisable.len(), 1);
    assert_eq!(unraisable[0].summary(), "RuntimeError: generator ignored GeneratorExit");
    assert!(vm.take_unraisable().is_empty());
}
