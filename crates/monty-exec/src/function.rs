use std::{fmt, sync::Arc};

use crate::{
    code::CodeUnit,
    heap::{HeapId, Kwargs},
    value::Value,
};

/// A function object.
///
/// Contains everything needed to execute a user-defined function: the shared code
/// unit, the globals namespace it was defined in, default values and the closure
/// cells it captured. Functions are stored on the heap and referenced via `HeapId`.
#[derive(Debug)]
pub(crate) struct Function {
    pub code: Arc<CodeUnit>,
    /// Dict of module-level names.
    pub globals: HeapId,
    /// Defaults for the last `defaults.len()` positional parameters.
    pub defaults: Vec<Value>,
    pub kwdefaults: Kwargs,
    /// One cell per freevar of `code`, in order.
    pub closure: Vec<HeapId>,
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code.name())
    }
}

impl Function {
    pub fn name(&self) -> &str {
        self.code.name()
    }

    pub fn push_heap_ids(&self, out: &mut Vec<HeapId>) {
        out.push(self.globals);
        out.extend(self.defaults.iter().filter_map(Value::heap_id));
        out.extend(self.kwdefaults.values().filter_map(Value::heap_id));
        out.extend(self.closure.iter().copied());
    }
}
