use std::fmt;

use crate::exception::ExcType;

/// Represents the Python type of a value.
///
/// Used for error messages (`'int' object is not callable`) and for the type names
/// shown in reprs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Type {
    Type,
    NoneType,
    Bool,
    Int,
    Str,
    Tuple,
    List,
    Dict,
    Range,
    Cell,
    Function,
    BuiltinFunction,
    Generator,
    /// Produced by calling an `async def` function.
    Coroutine,
    Exception(ExcType),
    Iterator,
    Traceback,
    /// Host-provided iterator, displayed with the name the host gave it.
    Foreign(&'static str),
    /// Sentinel for unbound local slots, never visible to Python code.
    Undefined,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type => f.write_str("type"),
            Self::NoneType => f.write_str("NoneType"),
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::Str => f.write_str("str"),
            Self::Tuple => f.write_str("tuple"),
            Self::List => f.write_str("list"),
            Self::Dict => f.write_str("dict"),
            Self::Range => f.write_str("range"),
            Self::Cell => f.write_str("cell"),
            Self::Function => f.write_str("function"),
            Self::BuiltinFunction => f.write_str("builtin_function_or_method"),
            Self::Generator => f.write_str("generator"),
            Self::Coroutine => f.write_str("coroutine"),
            Self::Exception(exc_type) => write!(f, "{exc_type}"),
            Self::Iterator => f.write_str("iterator"),
            Self::Traceback => f.write_str("traceback"),
            Self::Foreign(name) => f.write_str(name),
            Self::Undefined => f.write_str("undefined"),
        }
    }
}

impl Type {
    /// Checks if a value of type `self` is an instance of `other`.
    ///
    /// `bool` is a subtype of `int`, and exception kinds follow their hierarchy.
    #[must_use]
    pub fn is_instance_of(self, other: Self) -> bool {
        match (self, other) {
            (a, b) if a == b => true,
            (Self::Bool, Self::Int) => true,
            (Self::Exception(a), Self::Exception(b)) => a.is_subclass_of(b),
            _ => false,
        }
    }
}
