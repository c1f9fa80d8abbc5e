//! Execution frames and the arena that owns them.
//!
//! Frames refer to each other (the `back` link to the caller) by [`FrameId`] instead of
//! by reference. A generator owns its suspended frame through the id as well, so a frame
//! outlives the call that created it exactly as long as some generator holds it.

use std::sync::Arc;

use crate::{
    code::CodeUnit,
    exception::{ExceptionRaise, FrameSummary},
    heap::HeapId,
    value::Value,
};

/// Index of a frame in [`Frames`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u32);

/// Where execution resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cursor {
    NotStarted,
    At(usize),
    Exhausted,
}

/// Entries of the block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Block {
    /// A `try` body with `except` clauses starting at `handler`.
    Except { handler: usize, stack_depth: usize },
    /// A `try` body with a `finally` clause starting at `handler`.
    Finally { handler: usize, stack_depth: usize },
    /// Inside an `except` clause. `handled_depth` is the handled-exception stack depth,
    /// relative to the frame's base, before this exception was pushed.
    ExceptHandler { handled_depth: usize, stack_depth: usize },
    /// Inside a `finally` clause. Its state is `finally_states[finally_depth]`; a pending
    /// exception is on the handled stack above `handled_depth` while the clause runs.
    FinallyHandler { handled_depth: usize, finally_depth: usize },
}

/// Why a finally handler is running.
#[derive(Debug, Clone)]
pub(crate) enum FinallyState {
    Normal,
    Raised(Box<ExceptionRaise>),
    Return(Value),
}

/// Input delivered to a suspended generator frame on resume.
#[derive(Debug, Clone)]
pub(crate) enum GenInput {
    Send(Value),
    Throw(Box<ExceptionRaise>),
}

/// Runtime state of one code unit invocation.
#[derive(Debug)]
pub(crate) struct Frame {
    pub code: Arc<CodeUnit>,
    pub locals: Vec<Value>,
    /// Cells for cellvars, then the closure's cells for freevars.
    pub cells: Vec<HeapId>,
    pub stack: Vec<Value>,
    pub blocks: Vec<Block>,
    pub finally_states: Vec<FinallyState>,
    pub cursor: Cursor,
    /// Index of the instruction executing or last executed.
    pub lasti: usize,
    /// Calling frame while this frame is executing.
    pub back: Option<FrameId>,
    /// Depth of the handled-exception stack when this frame was entered.
    pub exc_base: usize,
    pub globals: HeapId,
    pub builtins: HeapId,
    /// Handled exceptions of a suspended generator frame, restored on resume.
    pub saved_exceptions: Vec<ExceptionRaise>,
    pub input: Option<GenInput>,
}

impl Frame {
    pub fn new(code: Arc<CodeUnit>, locals: Vec<Value>, cells: Vec<HeapId>, globals: HeapId, builtins: HeapId) -> Self {
        Self {
            code,
            locals,
            cells,
            stack: Vec::new(),
            blocks: Vec::new(),
            finally_states: Vec::new(),
            cursor: Cursor::NotStarted,
            lasti: 0,
            back: None,
            exc_base: 0,
            globals,
            builtins,
            saved_exceptions: Vec::new(),
            input: None,
        }
    }

    pub fn summary(&self) -> FrameSummary {
        match self.cursor {
            Cursor::NotStarted => FrameSummary {
                name: self.code.name().clone(),
                filename: self.code.filename().clone(),
                line: self.code.first_line(),
            },
            Cursor::At(_) | Cursor::Exhausted => self.code.summary_at(self.lasti),
        }
    }

    pub fn push_heap_ids(&self, out: &mut Vec<HeapId>) {
        out.push(self.globals);
        out.push(self.builtins);
        out.extend(self.cells.iter().copied());
        out.extend(self.locals.iter().chain(&self.stack).filter_map(Value::heap_id));
        for state in &self.finally_states {
            match state {
                FinallyState::Normal => {}
                FinallyState::Raised(exc) => exc.push_heap_ids(out),
                FinallyState::Return(value) => out.extend(value.heap_id()),
            }
        }
        for exc in &self.saved_exceptions {
            exc.push_heap_ids(out);
        }
        match &self.input {
            Some(GenInput::Send(value)) => out.extend(value.heap_id()),
            Some(GenInput::Throw(exc)) => exc.push_heap_ids(out),
            None => {}
        }
    }
}

/// Storage for all live frames.
///
/// Instead of raw pointers between frames we use indices into this arena, so a
/// generator can hold its frame across suspensions and the collector can walk frames
/// without borrowing the heap.
#[derive(Debug, Default)]
pub(crate) struct Frames {
    frames: Vec<Option<Frame>>,
    free: Vec<u32>,
}

impl Frames {
    pub fn push(&mut self, frame: Frame) -> FrameId {
        if let Some(index) = self.free.pop() {
            self.frames[index as usize] = Some(frame);
            return FrameId(index);
        }
        self.frames.push(Some(frame));
        FrameId(u32::try_from(self.frames.len() - 1).unwrap_or(u32::MAX))
    }

    /// # Panics
    /// If the frame was released; frame ids are only held by live generators and the
    /// executing call chain.
    pub fn get(&self, id: FrameId) -> &Frame {
        match self.frames.get(id.0 as usize).and_then(Option::as_ref) {
            Some(frame) => frame,
            None => panic!("frame {id:?} used after release"),
        }
    }

    pub fn get_mut(&mut self, id: FrameId) -> &mut Frame {
        match self.frames.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(frame) => frame,
            None => panic!("frame {id:?} used after release"),
        }
    }

    pub fn release(&mut self, id: FrameId) -> Option<Frame> {
        let frame = self.frames.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len() - self.free.len()
    }
}
