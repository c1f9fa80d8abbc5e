//! Arena for values with identity.
//!
//! Objects are addressed by [`HeapId`] and never move. Released slots are reused
//! through a free list. There is no reference counting: unreachable objects are
//! reclaimed by the VM's mark/sweep collector (see `Vm::collect_garbage`).

use std::{fmt::Write, sync::Arc};

use indexmap::IndexMap;

use crate::{
    exception::{ExcInstance, Traceback},
    function::Function,
    generator::{Generator, GeneratorKind},
    iter::{ForeignIter, NativeIter, Range},
    resource::ResourceError,
    types::Type,
    value::{Value, write_sequence_repr, write_str_repr},
};

/// Insertion-ordered string-keyed mapping, used for keyword arguments and namespaces.
pub type Kwargs = IndexMap<Arc<str>, Value, ahash::RandomState>;

/// Index of an object on the [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub(crate) enum HeapData {
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Kwargs),
    Range(Range),
    /// A shared variable captured by one or more closures.
    Cell(Value),
    Function(Function),
    Generator(Generator),
    Exception(ExcInstance),
    Traceback(Traceback),
    Iter(NativeIter),
    Foreign(ForeignIter),
}

impl HeapData {
    pub fn py_type(&self) -> Type {
        match self {
            Self::Tuple(_) => Type::Tuple,
            Self::List(_) => Type::List,
            Self::Dict(_) => Type::Dict,
            Self::Range(_) => Type::Range,
            Self::Cell(_) => Type::Cell,
            Self::Function(_) => Type::Function,
            Self::Generator(generator) => match generator.kind {
                GeneratorKind::Generator => Type::Generator,
                GeneratorKind::Coroutine => Type::Coroutine,
            },
            Self::Exception(exc) => Type::Exception(exc.exc_type),
            Self::Traceback(_) => Type::Traceback,
            Self::Iter(iter) => iter.py_type(),
            Self::Foreign(foreign) => Type::Foreign(foreign.type_name()),
        }
    }

    /// Pushes every heap id directly referenced by this object.
    ///
    /// Generator frames are not reachable from here; the collector walks them
    /// separately since frames live in their own arena.
    pub fn push_children(&self, out: &mut Vec<HeapId>) {
        match self {
            Self::Tuple(items) | Self::List(items) => out.extend(items.iter().filter_map(Value::heap_id)),
            Self::Dict(dict) => out.extend(dict.values().filter_map(Value::heap_id)),
            Self::Cell(value) => out.extend(value.heap_id()),
            Self::Function(function) => function.push_heap_ids(out),
            Self::Generator(generator) => out.extend(generator.delegate),
            Self::Exception(exc) => exc.push_heap_ids(out),
            Self::Iter(iter) => out.extend(iter.source.heap_id()),
            Self::Foreign(foreign) => foreign.push_heap_ids(out),
            Self::Range(_) | Self::Traceback(_) => {}
        }
    }

    pub fn write_repr(&self, id: HeapId, heap: &Heap, out: &mut String, depth: usize) {
        let addr = id.index();
        match self {
            Self::Tuple(items) => {
                out.push('(');
                write_sequence_repr(items, heap, out, depth);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Self::List(items) => {
                out.push('[');
                write_sequence_repr(items, heap, out, depth);
                out.push(']');
            }
            Self::Dict(dict) => {
                out.push('{');
                for (i, (key, value)) in dict.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_str_repr(key, out);
                    out.push_str(": ");
                    out.push_str(&value.py_repr(heap));
                }
                out.push('}');
            }
            Self::Range(range) => range.write_repr(out),
            Self::Cell(_) => {
                let _ = write!(out, "<cell at 0x{addr:x}>");
            }
            Self::Function(function) => {
                let _ = write!(out, "<function {} at 0x{addr:x}>", function.name());
            }
            Self::Generator(generator) => {
                let _ = write!(out, "<{} object {} at 0x{addr:x}>", self.py_type(), generator.code.name());
            }
            Self::Exception(exc) => {
                let _ = write!(out, "{}(", exc.exc_type);
                write_sequence_repr(&exc.args, heap, out, depth);
                out.push(')');
            }
            Self::Traceback(_) | Self::Iter(_) | Self::Foreign(_) => {
                let _ = write!(out, "<{} object at 0x{addr:x}>", self.py_type());
            }
        }
    }
}

/// Arena of heap objects with an optional allocation cap.
#[derive(Debug)]
pub struct Heap {
    entries: Vec<Option<HeapData>>,
    free: Vec<u32>,
    live: usize,
    max_allocations: Option<usize>,
}

impl Heap {
    /// An empty heap, used to format immediate values.
    pub(crate) const EMPTY: Self = Self {
        entries: Vec::new(),
        free: Vec::new(),
        live: 0,
        max_allocations: None,
    };

    pub(crate) fn new(max_allocations: Option<usize>) -> Self {
        Self {
            max_allocations,
            ..Self::EMPTY
        }
    }

    pub(crate) fn set_max_allocations(&mut self, max_allocations: Option<usize>) {
        self.max_allocations = max_allocations;
    }

    /// Number of objects currently allocated.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// Size of the id space, including released slots.
    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        if let Some(limit) = self.max_allocations
            && self.live >= limit
        {
            return Err(ResourceError::Allocation { limit });
        }
        self.live += 1;
        if let Some(index) = self.free.pop() {
            self.entries[index as usize] = Some(data);
            return Ok(HeapId(index));
        }
        let index = u32::try_from(self.entries.len()).map_err(|_| ResourceError::Allocation { limit: u32::MAX as usize })?;
        self.entries.push(Some(data));
        Ok(HeapId(index))
    }

    pub(crate) fn try_get(&self, id: HeapId) -> Option<&HeapData> {
        self.entries.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn try_get_mut(&mut self, id: HeapId) -> Option<&mut HeapData> {
        self.entries.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Returns the object for `id`.
    ///
    /// # Panics
    /// If `id` has been released. Ids reachable from live values are never released,
    /// so this indicates a collector bug.
    pub(crate) fn get(&self, id: HeapId) -> &HeapData {
        match self.try_get(id) {
            Some(data) => data,
            None => panic!("heap object {id:?} used after release"),
        }
    }

    /// Mutable counterpart of [`Heap::get`].
    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        match self.try_get_mut(id) {
            Some(data) => data,
            None => panic!("heap object {id:?} used after release"),
        }
    }

    pub(crate) fn release(&mut self, id: HeapId) -> Option<HeapData> {
        let data = self.entries.get_mut(id.index())?.take()?;
        self.live -= 1;
        self.free.push(id.0);
        Some(data)
    }

    /// Ids of all live objects.
    pub(crate) fn ids(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_some())
            .map(|(index, _)| HeapId(index as u32))
    }
}
