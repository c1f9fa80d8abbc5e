//! Tests for raising, catching, chaining and reporting exceptions.

use std::sync::Arc;

use monty_exec::{
    ArgValues, ChainRelation, CodeBuilder, CodeUnit, ExcType, FrameSummary, Instr, Kwargs, RunError, Value, Vm,
};
use pretty_assertions::assert_eq;

fn frame(name: &str, line: u32) -> FrameSummary {
    FrameSummary {
        name: name.into(),
        filename: "test.py".into(),
        line,
    }
}

fn run(vm: &mut Vm, code: &Arc<CodeUnit>, globals: &Value) -> Result<Value, RunError> {
    vm.invoke(code, globals, &[], &Kwargs::default(), &[], ArgValues::new())
}

fn run_fresh(code: &Arc<CodeUnit>) -> (Vm, Result<Value, RunError>) {
    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let result = run(&mut vm, code, &globals);
    (vm, result)
}

/// Emits `raise exc_type(message)`.
fn raise_new(builder: &mut CodeBuilder, exc_type: ExcType, message: &str) {
    builder
        .load_const(exc_type)
        .load_const(message)
        .call(1)
        .emit(Instr::Raise);
}

#[test]
fn traceback_lists_innermost_frame_first() {
    // def inner(): raise ValueError("boom")
    let mut builder = CodeBuilder::new("inner").filename("test.py").first_line(1);
    builder.line(2);
    raise_new(&mut builder, ExcType::ValueError, "boom");
    let inner = builder.build().unwrap();

    // def outer(): inner()
    let mut builder = CodeBuilder::new("outer").filename("test.py").first_line(4);
    builder.line(5).load_global("inner").call(0).ret();
    let outer = builder.build().unwrap();

    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let function = vm.make_function(&inner, &globals, vec![], Kwargs::default(), &[]).unwrap();
    vm.set_global(&globals, "inner", function).unwrap();

    let err = run(&mut vm, &outer, &globals).unwrap_err();
    let exc = err.exception().unwrap();
    assert_eq!(exc.traceback().innermost_first(), vec![frame("inner", 2), frame("outer", 5)]);

    let report = vm.report(&err);
    assert_eq!(report.summary(), "ValueError: boom");
    assert_eq!(
        report.to_string(),
        "Traceback (most recent call first):\n  File \"test.py\", line 2, in inner\n  File \"test.py\", line 5, in outer\nValueError: boom"
    );
}

/// ```python
/// def f():
///     try:
///         raise KeyError("k")
///     except KeyError:
///         raise ValueError("v")
/// ```
fn raise_while_handling(raise_from_none: bool) -> Arc<CodeUnit> {
    let mut builder = CodeBuilder::new("f").filename("test.py");
    let handler = builder.label();
    let reraise = builder.label();
    builder.line(2).setup_except(handler).line(3);
    raise_new(&mut builder, ExcType::KeyError, "k");
    builder
        .bind(handler)
        .line(4)
        .emit(Instr::Dup)
        .load_const(ExcType::KeyError)
        .emit(Instr::MatchExc)
        .pop_jump_if_false(reraise)
        .emit(Instr::Pop)
        .line(5)
        .load_const(ExcType::ValueError)
        .load_const("v")
        .call(1);
    if raise_from_none {
        builder.load_none().emit(Instr::RaiseFrom);
    } else {
        builder.emit(Instr::Raise);
    }
    builder.bind(reraise).emit(Instr::ReRaise);
    builder.build().unwrap()
}

#[test]
fn implicit_context() {
    let (mut vm, result) = run_fresh(&raise_while_handling(false));
    let mut err = result.unwrap_err();
    assert_eq!(err.to_string(), "ValueError: v");

    let report = vm.report(&err);
    assert_eq!(report.chain.len(), 1);
    assert_eq!(report.chain[0].exc_type, ExcType::KeyError);
    assert_eq!(report.chain[0].message.as_deref(), Some("'k'"));
    assert_eq!(report.chain[0].relation, ChainRelation::Context);
    assert_eq!(report.chain[0].traceback, vec![frame("f", 3)]);
    assert_eq!(
        report.to_string(),
        "Traceback (most recent call first):\n  File \"test.py\", line 3, in f\nKeyError: 'k'\n\n\
         During handling of the above exception, another exception occurred:\n\n\
         Traceback (most recent call first):\n  File \"test.py\", line 5, in f\nValueError: v"
    );

    let value = vm.exception_value(&mut err).unwrap().unwrap();
    let info = vm.exception_info(&value).unwrap();
    assert_eq!(info.exc_type, ExcType::ValueError);
    assert_eq!(info.args, vec![Value::from("v")]);
    assert_eq!(info.cause, None);
    assert!(!info.suppress_context);
    assert_eq!(info.traceback, vec![frame("f", 5)]);

    let context = vm.exception_info(&info.context.unwrap()).unwrap();
    assert_eq!(context.exc_type, ExcType::KeyError);
    assert_eq!(context.context, None);
}

#[test]
fn raise_from_none_suppresses_context() {
    let (mut vm, result) = run_fresh(&raise_while_handling(true));
    let mut err = result.unwrap_err();

    let report = vm.report(&err);
    assert!(report.chain.is_empty());
    assert_eq!(
        report.to_string(),
        "Traceback (most recent call first):\n  File \"test.py\", line 5, in f\nValueError: v"
    );

    let value = vm.exception_value(&mut err).unwrap().unwrap();
    let info = vm.exception_info(&value).unwrap();
    assert_eq!(info.cause, None);
    assert!(info.suppress_context);
    // the context is still recorded, only its display is suppressed
    assert!(info.context.is_some());
}

#[test]
fn explicit_cause() {
    // raise ValueError("v") from KeyError("k")
    let mut builder = CodeBuilder::new("f").filename("test.py");
    builder
        .load_const(ExcType::ValueError)
        .load_const("v")
        .call(1)
        .load_const(ExcType::KeyError)
        .load_const("k")
        .call(1)
        .emit(Instr::RaiseFrom);
    let (vm, result) = run_fresh(&builder.build().unwrap());
    let err = result.unwrap_err();

    let exc = err.exception().unwrap();
    assert!(exc.suppress_context());
    assert!(exc.cause().is_some());

    let report = vm.report(&err);
    assert_eq!(report.chain.len(), 1);
    assert_eq!(report.chain[0].exc_type, ExcType::KeyError);
    assert_eq!(report.chain[0].relation, ChainRelation::Cause);
    assert!(report.chain[0].traceback.is_empty());
    assert!(
        report
            .to_string()
            .starts_with("KeyError: 'k'\n\nThe above exception was the direct cause of the following exception:\n\n")
    );
}

#[test]
fn cause_must_be_an_exception() {
    let mut builder = CodeBuilder::new("f");
    builder
        .load_const(ExcType::ValueError)
        .load_const(1)
        .emit(Instr::RaiseFrom);
    let (_, result) = run_fresh(&builder.build().unwrap());
    assert_eq!(
        result.unwrap_err().to_string(),
        "TypeError: exception causes must derive from BaseException"
    );
}

#[test]
fn raising_a_non_exception() {
    let mut builder = CodeBuilder::new("f");
    builder.load_const("oops").emit(Instr::Raise);
    let (_, result) = run_fresh(&builder.build().unwrap());
    assert_eq!(result.unwrap_err().to_string(), "TypeError: exceptions must derive from BaseException");
}

#[test]
fn bare_reraise_without_active_exception() {
    let mut builder = CodeBuilder::new("f");
    builder.emit(Instr::ReRaise);
    let (_, result) = run_fresh(&builder.build().unwrap());
    let err = result.unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::RuntimeError));
    assert_eq!(err.to_string(), "RuntimeError: No active exception to reraise");
}

#[test]
fn bare_reraise_keeps_traceback_and_has_no_self_context() {
    // try: raise ValueError("x")
    // except ValueError: raise
    let mut builder = CodeBuilder::new("f").filename("test.py");
    let handler = builder.label();
    builder.line(2).setup_except(handler);
    raise_new(&mut builder, ExcType::ValueError, "x");
    builder.bind(handler).line(4).emit(Instr::Pop).emit(Instr::ReRaise);
    let (mut vm, result) = run_fresh(&builder.build().unwrap());
    let mut err = result.unwrap_err();

    let exc = err.exception().unwrap();
    assert_eq!(exc.traceback().innermost_first(), vec![frame("f", 2)]);
    assert!(exc.context().is_none());

    let value = vm.exception_value(&mut err).unwrap().unwrap();
    assert_eq!(vm.exception_info(&value).unwrap().context, None);
}

#[test]
fn except_clause_with_tuple_and_bridged_kinds() {
    // try: raise ArityError("a")
    // except (KeyError, TypeError): return "caught"
    let mut builder = CodeBuilder::new("f");
    let handler = builder.label();
    let reraise = builder.label();
    builder.setup_except(handler);
    raise_new(&mut builder, ExcType::ArityError, "a");
    builder
        .bind(handler)
        .emit(Instr::Dup)
        .load_const(ExcType::KeyError)
        .load_const(ExcType::TypeError)
        .emit(Instr::BuildTuple(2))
        .emit(Instr::MatchExc)
        .pop_jump_if_false(reraise)
        .emit(Instr::Pop)
        .emit(Instr::PopExcept)
        .load_const("caught")
        .ret()
        .bind(reraise)
        .emit(Instr::ReRaise);
    let (_, result) = run_fresh(&builder.build().unwrap());
    assert_eq!(result.unwrap(), Value::from("caught"));

    assert!(ExcType::HostIoError.matches(ExcType::OSError));
    assert!(ExcType::HostMemoryError.matches(ExcType::MemoryError));
    let err = RunError::from(std::io::Error::other("disk on fire"));
    assert!(err.matches(&[ExcType::OSError]));
    assert_eq!(err.to_string(), "HostIoError: disk on fire");
}

#[test]
fn except_clause_with_non_exception() {
    let mut builder = CodeBuilder::new("f");
    let handler = builder.label();
    builder.setup_except(handler);
    raise_new(&mut builder, ExcType::ValueError, "x");
    builder.bind(handler).load_const(1).emit(Instr::MatchExc).ret();
    let (_, result) = run_fresh(&builder.build().unwrap());
    assert_eq!(
        result.unwrap_err().to_string(),
        "TypeError: catching classes that do not inherit from BaseException is not allowed"
    );
}

#[test]
fn finally_runs_and_reraises() {
    // try: raise ValueError("x")
    // finally: cleaned = True
    let mut builder = CodeBuilder::new("f").filename("test.py");
    let cleanup = builder.label();
    builder.line(2).setup_finally(cleanup);
    raise_new(&mut builder, ExcType::ValueError, "x");
    builder
        .emit(Instr::PopBlock)
        .emit(Instr::BeginFinally)
        .bind(cleanup)
        .line(4)
        .load_const(true)
        .store_global("cleaned")
        .emit(Instr::EndFinally)
        .load_none()
        .ret();

    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let err = run(&mut vm, &builder.build().unwrap(), &globals).unwrap_err();
    assert_eq!(err.exc_type(), Some(ExcType::ValueError));
    // the frame is recorded once, where the exception was raised
    assert_eq!(err.exception().unwrap().traceback().innermost_first(), vec![frame("f", 2)]);
    assert_eq!(vm.get_global(&globals, "cleaned"), Some(Value::Bool(true)));
}

#[test]
fn raise_in_finally_gets_pending_exception_as_context() {
    // try:
    //     try:
    //         raise KeyError("k")
    //     finally:
    //         raise ValueError("v")
    // except ValueError as e:
    //     caught = e
    // raise IndexError("after")
    let mut builder = CodeBuilder::new("f").filename("test.py");
    let handler = builder.label();
    let cleanup = builder.label();
    builder.line(2).setup_except(handler).setup_finally(cleanup).line(3);
    raise_new(&mut builder, ExcType::KeyError, "k");
    builder.emit(Instr::PopBlock).emit(Instr::BeginFinally).bind(cleanup).line(5);
    raise_new(&mut builder, ExcType::ValueError, "v");
    builder
        .bind(handler)
        .line(7)
        .store_global("caught")
        .emit(Instr::PopExcept)
        .line(8);
    raise_new(&mut builder, ExcType::IndexError, "after");

    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let err = run(&mut vm, &builder.build().unwrap(), &globals).unwrap_err();

    // neither pending exception outlives its handler
    assert_eq!(err.to_string(), "IndexError: after");
    assert_eq!(err.exception().unwrap().context(), None);

    let caught = vm.get_global(&globals, "caught").unwrap();
    let info = vm.exception_info(&caught).unwrap();
    assert_eq!(info.exc_type, ExcType::ValueError);
    let context = vm.exception_info(&info.context.unwrap()).unwrap();
    assert_eq!(context.exc_type, ExcType::KeyError);
    assert_eq!(context.args, vec![Value::from("k")]);
    assert_eq!(context.traceback, vec![frame("f", 3)]);
}

#[test]
fn return_in_finally_discards_pending_exception() {
    // try:
    //     raise KeyError("k")
    // finally:
    //     return 1
    let mut builder = CodeBuilder::new("f");
    let cleanup = builder.label();
    builder.setup_finally(cleanup);
    raise_new(&mut builder, ExcType::KeyError, "k");
    builder
        .emit(Instr::PopBlock)
        .emit(Instr::BeginFinally)
        .bind(cleanup)
        .load_const(1)
        .ret();

    let (_, result) = run_fresh(&builder.build().unwrap());
    assert_eq!(result.unwrap(), Value::Int(1));
}

#[test]
fn return_runs_finally_first() {
    // try: return 1
    // finally: x = 2
    let mut builder = CodeBuilder::new("f");
    let cleanup = builder.label();
    builder
        .setup_finally(cleanup)
        .load_const(1)
        .ret()
        .bind(cleanup)
        .load_const(2)
        .store_global("x")
        .emit(Instr::EndFinally)
        .load_none()
        .ret();

    let mut vm = Vm::default();
    let globals = vm.new_globals().unwrap();
    let result = run(&mut vm, &builder.build().unwrap(), &globals).unwrap();
    assert_eq!(result, Value::Int(1));
    assert_eq!(vm.get_global(&globals, "x"), Some(Value::Int(2)));
}

#[test]
fn host_raise_attaches_nothing_outside_handlers() {
    let mut vm = Vm::default();
    let mut err = vm.raise(ExcType::KeyError.into(), Some(ExcType::IndexError.into()));
    assert_eq!(err.to_string(), "KeyError");
    let value = vm.exception_value(&mut err).unwrap().unwrap();
    let info = vm.exception_info(&value).unwrap();
    assert!(info.suppress_context);
    assert_eq!(info.context, None);
    let cause = vm.exception_info(&info.cause.unwrap()).unwrap();
    assert_eq!(cause.exc_type, ExcType::IndexError);
    assert_eq!(vm.repr(&value), "KeyError()");
}

#[test]
fn report_serializes() {
    let (vm, result) = run_fresh(&raise_while_handling(false));
    let report = vm.report(&result.unwrap_err());
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["exc_type"], "ValueError");
    assert_eq!(json["message"], "v");
    assert_eq!(json["traceback"][0]["line"], 5);
    assert_eq!(json["chain"][0]["relation"], "context");
    assert_eq!(json["chain"][0]["exc_type"], "KeyError");
}

#[test]
fn internal_errors_report_as_system_error() {
    let mut builder = CodeBuilder::new("f");
    builder.emit(Instr::Pop);
    let (vm, result) = run_fresh(&builder.build().unwrap());
    let err = result.unwrap_err();
    assert!(matches!(err, RunError::Internal(_)));
    assert_eq!(vm.report(&err).exc_type, ExcType::SystemError);
}
