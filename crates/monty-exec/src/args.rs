//! Binding call arguments to parameter slots.
//!
//! [`bind_args`] is pure: it only reads the code unit's signature and the function's
//! defaults, and returns the initial local slots plus the collected `*args`/`**kwargs`
//! contents. The VM allocates those on the heap afterwards.

use std::sync::Arc;

use itertools::Itertools;
use smallvec::SmallVec;

use crate::{
    code::CodeUnit,
    exception::{ExcType, RunResult, exc_err_fmt},
    heap::Kwargs,
    value::Value,
};

/// Arguments of a call: positional values then keyword name/value pairs.
///
/// Keyword pairs may repeat a name (e.g. from an expanded `**mapping` that overlaps an
/// explicit keyword); the binder reports that as `MultipleValuesError`.
#[derive(Debug, Clone, Default)]
pub struct ArgValues {
    pub args: SmallVec<[Value; 4]>,
    pub kwargs: Vec<(Arc<str>, Value)>,
}

impl ArgValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn positional(args: impl IntoIterator<Item = Value>) -> Self {
        Self {
            args: args.into_iter().collect(),
            kwargs: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len() + self.kwargs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

/// Result of binding: local slots plus the contents of the variadic parameters.
#[derive(Debug)]
pub(crate) struct BoundArgs {
    /// `code.nlocals()` slots, `Value::Undefined` where nothing was bound.
    pub locals: Vec<Value>,
    pub varargs: Option<Vec<Value>>,
    pub varkwargs: Option<Kwargs>,
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// Binds `args` to the parameters of `code`.
///
/// Keywords are matched in two passes so that a keyword colliding with an already
/// bound parameter is reported as `MultipleValuesError` even when an unknown keyword
/// appears earlier in the call.
pub(crate) fn bind_args(code: &CodeUnit, defaults: &[Value], kwdefaults: &Kwargs, args: ArgValues) -> RunResult<BoundArgs> {
    let name = code.name();
    let argcount = code.argcount();
    let kwonlycount = code.kwonlyargcount();
    let flags = code.flags();
    let param_names = code.param_names();
    let positional_given = args.args.len();

    let mut locals = vec![Value::Undefined; code.nlocals()];

    let takes_nothing = argcount == 0 && kwonlycount == 0 && !flags.varargs && !flags.varkwargs;
    if takes_nothing && !args.is_empty() {
        let given = positional_given + args.kwargs.len();
        return exc_err_fmt!(ExcType::ArityError; "{name}() takes no arguments ({given} given)");
    }

    // positional arguments
    if positional_given > argcount && !flags.varargs {
        let given = positional_given + args.kwargs.len();
        let quantifier = if defaults.is_empty() { "exactly" } else { "at most" };
        return exc_err_fmt!(
            ExcType::ArityError;
            "{name}() takes {quantifier} {argcount} positional argument{} ({given} given)",
            plural(argcount)
        );
    }
    let mut positional = args.args.into_iter();
    for slot in locals.iter_mut().take(argcount) {
        match positional.next() {
            Some(value) => *slot = value,
            None => break,
        }
    }
    let varargs = flags.varargs.then(|| positional.collect::<Vec<_>>());

    // keyword arguments, pass one: collisions with bound slots
    for (key, _) in &args.kwargs {
        if let Some(slot) = param_names.iter().position(|p| p == key)
            && slot < positional_given.min(argcount)
        {
            return exc_err_fmt!(ExcType::MultipleValuesError; "{name}() got multiple values for argument '{key}'");
        }
    }
    if let Some(key) = args.kwargs.iter().map(|(key, _)| key).duplicates().next() {
        return exc_err_fmt!(ExcType::MultipleValuesError; "{name}() got multiple values for argument '{key}'");
    }

    // pass two: assignment
    let mut varkwargs = flags.varkwargs.then(Kwargs::default);
    for (key, value) in args.kwargs {
        if let Some(slot) = param_names.iter().position(|p| *p == key) {
            locals[slot] = value;
        } else if let Some(extra) = varkwargs.as_mut() {
            extra.insert(key, value);
        } else {
            return exc_err_fmt!(ExcType::UnexpectedKeywordError; "{name}() got an unexpected keyword argument '{key}'");
        }
    }

    // positional defaults fill only slots still unbound
    let defaults = &defaults[defaults.len().saturating_sub(argcount)..];
    let first_default = argcount - defaults.len();
    for (slot, default) in locals[first_default..argcount].iter_mut().zip(defaults) {
        if matches!(slot, Value::Undefined) {
            *slot = default.clone();
        }
    }

    // keyword-only defaults
    let mut missing_kwonly = Vec::new();
    for index in argcount..argcount + kwonlycount {
        if !matches!(locals[index], Value::Undefined) {
            continue;
        }
        let param = &param_names[index];
        match kwdefaults.get(param) {
            Some(default) => locals[index] = default.clone(),
            None => missing_kwonly.push(param),
        }
    }
    if !missing_kwonly.is_empty() {
        let count = missing_kwonly.len();
        let names = missing_kwonly.iter().map(|param| format!("'{param}'")).join(", ");
        return exc_err_fmt!(
            ExcType::ArityError;
            "{name}() missing {count} required keyword-only argument{}: {names}",
            plural(count)
        );
    }

    if locals[..argcount].iter().any(|slot| matches!(slot, Value::Undefined)) {
        let quantifier = if defaults.is_empty() && !flags.varargs { "exactly" } else { "at least" };
        let required = argcount - defaults.len().min(argcount);
        let given = positional_given;
        return exc_err_fmt!(
            ExcType::ArityError;
            "{name}() takes {quantifier} {required} positional argument{} ({given} given)",
            plural(required)
        );
    }

    Ok(BoundArgs {
        locals,
        varargs,
        varkwargs,
    })
}
