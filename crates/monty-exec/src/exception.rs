//! Exception kinds, the raised-exception envelope and traceback chains.
//!
//! A Python-level failure travels through the execution core as an [`ExceptionRaise`]
//! (the "envelope") wrapped in [`RunError`]. The envelope starts out unnormalized
//! (kind + constructor args) when it is created from Rust code, and is normalized into
//! a heap-allocated exception instance by the VM as soon as Python code can observe it:
//! when it is caught by an `except` clause, attached as a cause or context, or reported.
//!
//! Cause and context are stored as handles to exception instances. The envelope keeps
//! its own copy so chaining can be recorded before normalization; normalization copies
//! them onto the instance.

use std::{
    borrow::Cow,
    collections::TryReserveError,
    fmt::{self, Write},
    sync::Arc,
};

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{heap::HeapId, value::Value};

/// Result type for runtime operations.
pub type RunResult<T> = Result<T, RunError>;

/// Builds an [`ExceptionRaise`] with a formatted message.
///
/// Usage: `exc_fmt!(ExcType::TypeError; "'{}' object is not callable", ty)`
macro_rules! exc_fmt {
    ($exc_type:expr; $($fmt_args:tt)*) => {
        $crate::exception::ExceptionRaise::with_message($exc_type, format!($($fmt_args)*))
    };
}
pub(crate) use exc_fmt;

/// Same as [`exc_fmt!`] but wrapped in `Err(RunError)`, for use in `return` position.
macro_rules! exc_err_fmt {
    ($exc_type:expr; $($fmt_args:tt)*) => {
        Err($crate::exception::exc_fmt!($exc_type; $($fmt_args)*).into())
    };
}
pub(crate) use exc_err_fmt;

/// Builtin exception kinds.
///
/// User-defined exception classes belong to the object model and are not represented
/// here; every exception the core raises or matches is one of these kinds.
///
/// `ArityError`, `UnexpectedKeywordError` and `MultipleValuesError` are the binder's
/// failure kinds; they subclass `TypeError` so `except TypeError` catches them.
/// `HostIoError` and `HostMemoryError` represent failures coming from the host
/// (Rust `io::Error`, failed allocations); `except OSError` and `except MemoryError`
/// catch them through [`ExcType::matches`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum ExcType {
    BaseException,
    Exception,
    GeneratorExit,
    KeyboardInterrupt,
    SystemExit,
    StopIteration,
    StopAsyncIteration,
    ArithmeticError,
    OverflowError,
    ZeroDivisionError,
    AssertionError,
    AttributeError,
    LookupError,
    IndexError,
    KeyError,
    MemoryError,
    NameError,
    UnboundLocalError,
    OSError,
    TimeoutError,
    RuntimeError,
    NotImplementedError,
    RecursionError,
    SystemError,
    TypeError,
    ArityError,
    UnexpectedKeywordError,
    MultipleValuesError,
    ValueError,
    HostIoError,
    HostMemoryError,
}

impl ExcType {
    /// The direct base class of this kind, `None` for `BaseException`.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception | Self::GeneratorExit | Self::KeyboardInterrupt | Self::SystemExit => {
                Some(Self::BaseException)
            }
            Self::OverflowError | Self::ZeroDivisionError => Some(Self::ArithmeticError),
            Self::IndexError | Self::KeyError => Some(Self::LookupError),
            Self::UnboundLocalError => Some(Self::NameError),
            Self::TimeoutError => Some(Self::OSError),
            Self::NotImplementedError | Self::RecursionError => Some(Self::RuntimeError),
            Self::ArityError | Self::UnexpectedKeywordError | Self::MultipleValuesError => Some(Self::TypeError),
            Self::StopIteration
            | Self::StopAsyncIteration
            | Self::ArithmeticError
            | Self::AssertionError
            | Self::AttributeError
            | Self::LookupError
            | Self::MemoryError
            | Self::NameError
            | Self::OSError
            | Self::RuntimeError
            | Self::SystemError
            | Self::TypeError
            | Self::ValueError
            | Self::HostIoError
            | Self::HostMemoryError => Some(Self::Exception),
        }
    }

    /// Whether `self` is `other` or derives from it.
    #[must_use]
    pub fn is_subclass_of(self, other: Self) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    /// Whether an exception of this kind is caught by an `except candidate` clause.
    ///
    /// Host I/O failures are caught by `OSError` and host allocation failures by
    /// `MemoryError`, in addition to the normal subclass relation.
    #[must_use]
    pub fn matches(self, candidate: Self) -> bool {
        if self.is_subclass_of(candidate) {
            return true;
        }
        match candidate {
            Self::OSError => self == Self::HostIoError,
            Self::MemoryError => self == Self::HostMemoryError,
            _ => false,
        }
    }
}

/// One traceback record: the code unit that was executing and the line it was on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrameSummary {
    pub name: Arc<str>,
    pub filename: Arc<str>,
    pub line: u32,
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File \"{}\", line {}, in {}", self.filename, self.line, self.name)
    }
}

/// Singly-linked traceback chain.
///
/// Nodes are only ever added at the head, and existing nodes are shared (`Arc`) between
/// clones, so a chain handed to a handler is never mutated by later unwinding. The head
/// is the most recently recorded frame: as an exception unwinds outwards this is the
/// outermost frame seen so far.
#[derive(Debug, Clone, Default)]
pub struct Traceback {
    head: Option<Arc<TracebackNode>>,
}

#[derive(Debug)]
struct TracebackNode {
    frame: FrameSummary,
    next: Option<Arc<TracebackNode>>,
}

impl Traceback {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Prepends a record.
    pub(crate) fn push(&mut self, frame: FrameSummary) {
        let next = self.head.take();
        self.head = Some(Arc::new(TracebackNode { frame, next }));
    }

    /// Iterates from the head, i.e. the most recently recorded frame first.
    pub fn iter(&self) -> impl Iterator<Item = &FrameSummary> {
        std::iter::successors(self.head.as_deref(), |node| node.next.as_deref()).map(|node| &node.frame)
    }

    /// Frames in display order, the frame that raised first.
    #[must_use]
    pub fn innermost_first(&self) -> Vec<FrameSummary> {
        let mut frames: Vec<FrameSummary> = self.iter().cloned().collect();
        frames.reverse();
        frames
    }
}

/// A raised exception in flight: kind, payload or instance, chaining and traceback.
#[derive(Debug, Clone)]
pub struct ExceptionRaise {
    pub(crate) exc_type: ExcType,
    /// Constructor arguments, used to build the instance on normalization.
    pub(crate) args: Vec<Value>,
    /// The exception instance once normalized.
    pub(crate) value: Option<HeapId>,
    /// Explicit cause from `raise X from Y`.
    pub(crate) cause: Option<HeapId>,
    pub(crate) suppress_context: bool,
    /// Implicit context: the exception being handled when this one was raised.
    pub(crate) context: Option<HeapId>,
    pub(crate) traceback: Traceback,
    /// Set while the current frame is already present in the traceback, so the next
    /// `record_frame` call is skipped.
    pub(crate) reraise: bool,
    /// Whether the implicit context has been captured yet.
    pub(crate) context_attached: bool,
    /// Message rendered by the VM for arguments that live on its heap, used by `Display`.
    pub(crate) rendered: Option<Arc<str>>,
}

impl ExceptionRaise {
    #[must_use]
    pub fn new(exc_type: ExcType, args: Vec<Value>) -> Self {
        Self {
            exc_type,
            args,
            value: None,
            cause: None,
            suppress_context: false,
            context: None,
            traceback: Traceback::default(),
            reraise: false,
            context_attached: false,
            rendered: None,
        }
    }

    /// Creates an exception with a single string argument.
    #[must_use]
    pub fn with_message(exc_type: ExcType, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::new(exc_type, vec![Value::Str(message.into())])
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// The exception instance, once normalized.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        self.value.map(Value::Ref)
    }

    #[must_use]
    pub fn is_normalized(&self) -> bool {
        self.value.is_some()
    }

    #[must_use]
    pub fn cause(&self) -> Option<Value> {
        self.cause.map(Value::Ref)
    }

    #[must_use]
    pub fn context(&self) -> Option<Value> {
        self.context.map(Value::Ref)
    }

    #[must_use]
    pub fn suppress_context(&self) -> bool {
        self.suppress_context
    }

    #[must_use]
    pub fn traceback(&self) -> &Traceback {
        &self.traceback
    }

    #[must_use]
    pub fn is_reraise(&self) -> bool {
        self.reraise
    }

    /// Whether this exception is caught by an `except` clause naming any of `candidates`.
    #[must_use]
    pub fn matches(&self, candidates: &[ExcType]) -> bool {
        candidates.iter().any(|candidate| self.exc_type.matches(*candidate))
    }

    /// Records that the exception passed through `frame`.
    ///
    /// Skipped when the frame was already recorded (bare re-raise, or re-raised at the
    /// end of a `finally` block). Finally
    /// blocks pass `is_finally_reentry = true` so their own re-raise is not recorded twice.
    pub fn record_frame(&mut self, frame: FrameSummary, is_finally_reentry: bool) {
        if !self.reraise {
            self.traceback.push(frame);
        }
        self.reraise = is_finally_reentry;
    }

    /// Sets the explicit cause; `None` is `raise X from None`.
    ///
    /// Either way context display is suppressed, the context itself is kept.
    pub(crate) fn set_cause(&mut self, cause: Option<HeapId>) {
        self.cause = cause;
        self.suppress_context = true;
    }

    /// The value carried by a `StopIteration`, taken from its first argument.
    #[must_use]
    pub fn stop_iteration_value(&self) -> Value {
        self.args.first().cloned().unwrap_or(Value::None)
    }

    pub(crate) fn push_heap_ids(&self, out: &mut Vec<HeapId>) {
        out.extend(self.args.iter().filter_map(Value::heap_id));
        out.extend(self.value);
        out.extend(self.cause);
        out.extend(self.context);
    }
}

impl fmt::Display for ExceptionRaise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.exc_type)?;
        if let Some(message) = &self.rendered {
            return write!(f, ": {message}");
        }
        match self.args.as_slice() {
            [] => Ok(()),
            [arg] if self.exc_type == ExcType::KeyError => write!(f, ": {}", arg.simple_repr()),
            [arg] => write!(f, ": {}", arg.simple_str()),
            args => {
                f.write_str(": (")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(&arg.simple_repr())?;
                }
                f.write_char(')')
            }
        }
    }
}

/// Heap-resident exception instance, the normalized form of an [`ExceptionRaise`].
#[derive(Debug, Clone)]
pub(crate) struct ExcInstance {
    pub exc_type: ExcType,
    pub args: Vec<Value>,
    pub cause: Option<HeapId>,
    pub context: Option<HeapId>,
    pub suppress_context: bool,
    /// `__traceback__`, synced from the envelope when the instance is handed to a handler.
    pub traceback: Traceback,
}

impl ExcInstance {
    pub fn from_raise(exc: &ExceptionRaise) -> Self {
        Self {
            exc_type: exc.exc_type,
            args: exc.args.clone(),
            cause: exc.cause,
            context: exc.context,
            suppress_context: exc.suppress_context,
            traceback: exc.traceback.clone(),
        }
    }

    /// `str(exc)`, or `None` when there are no arguments.
    pub fn message(&self, heap: &crate::heap::Heap) -> Option<String> {
        match self.args.as_slice() {
            [] => None,
            [arg] if self.exc_type == ExcType::KeyError => Some(arg.py_repr(heap)),
            [arg] => Some(arg.py_str(heap)),
            args => {
                let mut out = String::from("(");
                crate::value::write_sequence_repr(args, heap, &mut out, 1);
                out.push(')');
                Some(out)
            }
        }
    }

    pub fn push_heap_ids(&self, out: &mut Vec<HeapId>) {
        out.extend(self.args.iter().filter_map(Value::heap_id));
        out.extend(self.cause);
        out.extend(self.context);
    }
}

/// Error type threaded through every runtime operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunError {
    /// A Python exception that `except` clauses may catch.
    #[error("{0}")]
    Exc(Box<ExceptionRaise>),
    /// An exception that unwinds through every handler, e.g. the time limit.
    #[error("{0}")]
    UncatchableExc(Box<ExceptionRaise>),
    /// A broken invariant inside the core, e.g. malformed instructions.
    #[error("internal error: {0}")]
    Internal(Cow<'static, str>),
}

impl RunError {
    pub(crate) fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    /// The envelope, for catchable and uncatchable exceptions alike.
    #[must_use]
    pub fn exception(&self) -> Option<&ExceptionRaise> {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => Some(exc),
            Self::Internal(_) => None,
        }
    }

    #[must_use]
    pub fn exc_type(&self) -> Option<ExcType> {
        self.exception().map(ExceptionRaise::exc_type)
    }

    /// Whether this is a catchable exception matching any of `candidates`.
    #[must_use]
    pub fn matches(&self, candidates: &[ExcType]) -> bool {
        match self {
            Self::Exc(exc) => exc.matches(candidates),
            Self::UncatchableExc(_) | Self::Internal(_) => false,
        }
    }
}

impl From<ExceptionRaise> for RunError {
    fn from(exc: ExceptionRaise) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl From<std::io::Error> for RunError {
    fn from(err: std::io::Error) -> Self {
        ExceptionRaise::with_message(ExcType::HostIoError, err.to_string()).into()
    }
}

impl From<TryReserveError> for RunError {
    fn from(err: TryReserveError) -> Self {
        ExceptionRaise::with_message(ExcType::HostMemoryError, err.to_string()).into()
    }
}

/// How an older exception in a chain relates to the one after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainRelation {
    /// `raise new from old`
    Cause,
    /// `old` was being handled when `new` was raised.
    Context,
}

/// An earlier exception in the cause/context chain of a report.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ChainedException {
    pub exc_type: ExcType,
    pub message: Option<String>,
    pub traceback: Vec<FrameSummary>,
    pub relation: ChainRelation,
}

/// Display form of an unhandled exception, built by [`crate::Vm::report`].
///
/// Traceback frames are listed innermost first. `chain` holds the earlier exceptions,
/// oldest first; each entry's `relation` says how it leads to the next entry (or to
/// the reported exception for the last one).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ExceptionReport {
    pub exc_type: ExcType,
    pub message: Option<String>,
    pub traceback: Vec<FrameSummary>,
    pub chain: Vec<ChainedException>,
}

impl ExceptionReport {
    /// `"ValueError: message"`, without traceback or chain.
    #[must_use]
    pub fn summary(&self) -> String {
        summary_line(self.exc_type, self.message.as_deref())
    }
}

fn summary_line(exc_type: ExcType, message: Option<&str>) -> String {
    match message {
        Some(message) if !message.is_empty() => format!("{exc_type}: {message}"),
        _ => exc_type.to_string(),
    }
}

fn write_block(
    f: &mut fmt::Formatter<'_>,
    exc_type: ExcType,
    message: Option<&str>,
    traceback: &[FrameSummary],
) -> fmt::Result {
    if !traceback.is_empty() {
        f.write_str("Traceback (most recent call first):\n")?;
        for frame in traceback {
            writeln!(f, "  {frame}")?;
        }
    }
    f.write_str(&summary_line(exc_type, message))
}

impl fmt::Display for ExceptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for link in &self.chain {
            write_block(f, link.exc_type, link.message.as_deref(), &link.traceback)?;
            match link.relation {
                ChainRelation::Cause => {
                    f.write_str("\n\nThe above exception was the direct cause of the following exception:\n\n")?;
                }
                ChainRelation::Context => {
                    f.write_str("\n\nDuring handling of the above exception, another exception occurred:\n\n")?;
                }
            }
        }
        write_block(f, self.exc_type, self.message.as_deref(), &self.traceback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str, line: u32) -> FrameSummary {
        FrameSummary {
            name: name.into(),
            filename: "test.py".into(),
            line,
        }
    }

    #[test]
    fn binder_kinds_are_type_errors() {
        for kind in [
            ExcType::ArityError,
            ExcType::UnexpectedKeywordError,
            ExcType::MultipleValuesError,
        ] {
            assert!(kind.is_subclass_of(ExcType::TypeError));
            assert!(kind.is_subclass_of(ExcType::Exception));
            assert!(!kind.is_subclass_of(ExcType::ValueError));
        }
    }

    #[test]
    fn host_failures_bridge_to_standard_kinds() {
        assert!(ExcType::HostIoError.matches(ExcType::OSError));
        assert!(ExcType::HostMemoryError.matches(ExcType::MemoryError));
        assert!(!ExcType::HostIoError.matches(ExcType::MemoryError));
        assert!(!ExcType::OSError.matches(ExcType::HostIoError));

        let err = RunError::from(std::io::Error::other("disk on fire"));
        assert!(err.matches(&[ExcType::ValueError, ExcType::OSError]));
        assert_eq!(err.to_string(), "HostIoError: disk on fire");
    }

    #[test]
    fn generator_exit_is_not_an_exception() {
        let exc = ExceptionRaise::new(ExcType::GeneratorExit, vec![]);
        assert!(!exc.matches(&[ExcType::Exception]));
        assert!(exc.matches(&[ExcType::BaseException]));
    }

    #[test]
    fn record_frame_skips_reraise_once() {
        let mut exc = ExceptionRaise::with_message(ExcType::ValueError, "bad");
        exc.record_frame(summary("inner", 3), false);
        assert_eq!(exc.traceback().len(), 1);

        // finally block records and flags the pass-through
        exc.record_frame(summary("outer", 7), true);
        assert_eq!(exc.traceback().len(), 2);
        assert!(exc.is_reraise());

        // the re-raise at the end of the finally block is not recorded again
        exc.record_frame(summary("outer", 9), false);
        assert_eq!(exc.traceback().len(), 2);
        assert!(!exc.is_reraise());

        exc.record_frame(summary("caller", 12), false);
        let names: Vec<_> = exc.traceback().innermost_first().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["inner".into(), "outer".into(), "caller".into()] as Vec<Arc<str>>);
    }

    #[test]
    fn traceback_clones_share_tail() {
        let mut exc = ExceptionRaise::with_message(ExcType::ValueError, "bad");
        exc.record_frame(summary("inner", 1), false);
        let handed_out = exc.traceback().clone();
        exc.record_frame(summary("outer", 2), false);
        assert_eq!(handed_out.len(), 1);
        assert_eq!(exc.traceback().len(), 2);
    }

    #[test]
    fn display_formats_args() {
        let exc = ExceptionRaise::new(ExcType::KeyError, vec![Value::Str("k".into())]);
        assert_eq!(exc.to_string(), "KeyError: 'k'");
        let exc = ExceptionRaise::new(ExcType::ValueError, vec![Value::Int(1), Value::Str("x".into())]);
        assert_eq!(exc.to_string(), "ValueError: (1, 'x')");
        let exc = ExceptionRaise::new(ExcType::StopIteration, vec![]);
        assert_eq!(exc.to_string(), "StopIteration");
    }
}
