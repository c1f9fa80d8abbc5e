use std::{fmt::Write, sync::Arc};

use crate::{
    builtins::Builtins,
    exception::ExcType,
    heap::{Heap, HeapData, HeapId},
    types::Type,
};

/// Reprs of nested containers stop at this depth and print `...`.
const MAX_REPR_DEPTH: usize = 16;

/// A Python value as seen by the execution core.
///
/// Immediate values are stored inline; everything with identity or interior
/// mutability (containers, cells, functions, generators, exception instances,
/// iterators) lives on the [`Heap`] and is referenced by [`HeapId`].
///
/// Equality on `Value` is structural for immediates and identity for heap references;
/// Python `==` semantics live in the VM's comparison ops.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Marks an unbound local slot.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    /// A builtin exception class, callable to create an instance.
    ExcType(ExcType),
    Builtin(Builtins),
    Ref(HeapId),
}

impl Value {
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[must_use]
    pub fn heap_id(&self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Integer view of the value, treating `bool` as `int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub(crate) fn py_type(&self, heap: &Heap) -> Type {
        match self {
            Self::Undefined => Type::Undefined,
            Self::None => Type::NoneType,
            Self::Bool(_) => Type::Bool,
            Self::Int(_) => Type::Int,
            Self::Str(_) => Type::Str,
            Self::ExcType(_) => Type::Type,
            Self::Builtin(_) => Type::BuiltinFunction,
            Self::Ref(id) => heap.try_get(*id).map_or(Type::Undefined, HeapData::py_type),
        }
    }

    pub(crate) fn is_truthy(&self, heap: &Heap) -> bool {
        match self {
            Self::Undefined | Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Str(s) => !s.is_empty(),
            Self::ExcType(_) | Self::Builtin(_) => true,
            Self::Ref(id) => match heap.try_get(*id) {
                Some(HeapData::Tuple(items) | HeapData::List(items)) => !items.is_empty(),
                Some(HeapData::Dict(dict)) => !dict.is_empty(),
                Some(HeapData::Range(range)) => range.len() > 0,
                _ => true,
            },
        }
    }

    pub(crate) fn py_repr(&self, heap: &Heap) -> String {
        let mut out = String::new();
        self.write_repr(heap, &mut out, 0);
        out
    }

    pub(crate) fn py_str(&self, heap: &Heap) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            Self::Ref(id) => match heap.try_get(*id) {
                Some(HeapData::Exception(exc)) => exc.message(heap).unwrap_or_default(),
                _ => self.py_repr(heap),
            },
            _ => self.py_repr(heap),
        }
    }

    fn write_repr(&self, heap: &Heap, out: &mut String, depth: usize) {
        match self {
            Self::Undefined => out.push_str("<undefined>"),
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Str(s) => write_str_repr(s, out),
            Self::ExcType(exc_type) => {
                let _ = write!(out, "<class '{exc_type}'>");
            }
            Self::Builtin(builtin) => {
                let _ = write!(out, "<built-in function {builtin}>");
            }
            Self::Ref(id) => {
                if depth >= MAX_REPR_DEPTH {
                    out.push_str("...");
                    return;
                }
                match heap.try_get(*id) {
                    Some(data) => data.write_repr(*id, heap, out, depth + 1),
                    None => out.push_str("<released object>"),
                }
            }
        }
    }

    /// Heap-free `str()` used where no heap is available (e.g. `Display` for errors).
    pub(crate) fn simple_str(&self) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            _ => self.simple_repr(),
        }
    }

    /// Heap-free `repr()`; heap references print as `<object>`.
    pub(crate) fn simple_repr(&self) -> String {
        match self {
            Self::Ref(_) => "<object>".to_owned(),
            other => {
                let mut out = String::new();
                // immediates never touch the heap
                other.write_repr(&Heap::EMPTY, &mut out, 0);
                out
            }
        }
    }
}

pub(crate) fn write_str_repr(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('\'');
}

pub(crate) fn write_sequence_repr(items: &[Value], heap: &Heap, out: &mut String, depth: usize) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.write_repr(heap, out, depth);
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value.into())
    }
}

impl From<ExcType> for Value {
    fn from(value: ExcType) -> Self {
        Self::ExcType(value)
    }
}
