//! Hooks observing frame entry and exit.
//!
//! The VM is generic over a [`CallTracer`] so the default [`NoopTracer`] compiles away.
//! Hooks only observe; they cannot alter control flow.

use crate::exception::{ExcType, FrameSummary};

/// Receives frame events in order: `on_call` when a frame starts or resumes, then
/// exactly one of `on_return` or `on_exception` when it returns, suspends or unwinds.
pub trait CallTracer {
    fn on_call(&mut self, _frame: &FrameSummary) {}

    /// The frame returned or suspended (yield, delegation).
    fn on_return(&mut self, _frame: &FrameSummary) {}

    /// The frame is unwinding with an exception of `exc_type`.
    fn on_exception(&mut self, _frame: &FrameSummary, _exc_type: ExcType) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl CallTracer for NoopTracer {}

/// Emits every frame event as a `tracing` event at TRACE level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl CallTracer for LogTracer {
    fn on_call(&mut self, frame: &FrameSummary) {
        tracing::trace!(name = %frame.name, file = %frame.filename, line = frame.line, "call");
    }

    fn on_return(&mut self, frame: &FrameSummary) {
        tracing::trace!(name = %frame.name, line = frame.line, "return");
    }

    fn on_exception(&mut self, frame: &FrameSummary, exc_type: ExcType) {
        tracing::trace!(name = %frame.name, line = frame.line, %exc_type, "exception");
    }
}

/// One recorded frame event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Call(String),
    Return(String),
    Exception(String, ExcType),
}

/// Records events by code unit name, mostly useful in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    pub events: Vec<TraceEvent>,
}

impl CallTracer for RecordingTracer {
    fn on_call(&mut self, frame: &FrameSummary) {
        self.events.push(TraceEvent::Call(frame.name.to_string()));
    }

    fn on_return(&mut self, frame: &FrameSummary) {
        self.events.push(TraceEvent::Return(frame.name.to_string()));
    }

    fn on_exception(&mut self, frame: &FrameSummary, exc_type: ExcType) {
        self.events.push(TraceEvent::Exception(frame.name.to_string(), exc_type));
    }
}
