#![doc = include_str!("../../../README.md")]

mod args;
mod builtins;
mod callable;
mod code;
mod exception;
mod frame;
mod function;
mod generator;
mod heap;
mod iter;
mod resource;
mod run_frame;
mod tracer;
mod types;
mod value;
mod vm;

pub use crate::{
    args::ArgValues,
    builtins::Builtins,
    code::{CodeBuildError, CodeBuilder, CodeFlags, CodeUnit, Instr, Label},
    exception::{
        ChainRelation, ChainedException, ExcType, ExceptionRaise, ExceptionReport, FrameSummary, RunError, RunResult,
        Traceback,
    },
    generator::GeneratorState,
    heap::{HeapId, Kwargs},
    iter::ForeignIterator,
    resource::{DEFAULT_MAX_RECURSION_DEPTH, MAX_NATIVE_DEPTH, ResourceError, ResourceLimits},
    tracer::{CallTracer, LogTracer, NoopTracer, RecordingTracer, TraceEvent},
    types::Type,
    value::Value,
    vm::{ExceptionInfo, Vm},
};
