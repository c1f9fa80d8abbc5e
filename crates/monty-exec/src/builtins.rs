//! Builtin functions available through the builtins namespace.

use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
    args::ArgValues,
    exception::{ExcType, RunResult, exc_err_fmt, exc_fmt},
    heap::{HeapData, Kwargs},
    iter::Range,
    tracer::CallTracer,
    value::Value,
    vm::Vm,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Builtins {
    Iter,
    Next,
    Range,
}

/// Builds the builtins namespace: builtin functions plus every exception class.
pub(crate) fn builtins_namespace() -> Kwargs {
    let mut namespace = Kwargs::default();
    for builtin in Builtins::iter() {
        let name: &'static str = builtin.into();
        namespace.insert(name.into(), Value::Builtin(builtin));
    }
    for exc_type in ExcType::iter() {
        let name: &'static str = exc_type.into();
        namespace.insert(name.into(), Value::ExcType(exc_type));
    }
    namespace
}

fn positional_only(name: Builtins, args: &ArgValues, min: usize, max: usize) -> RunResult<()> {
    if !args.kwargs.is_empty() {
        return exc_err_fmt!(ExcType::TypeError; "{name}() takes no keyword arguments");
    }
    let given = args.args.len();
    if given < min {
        return exc_err_fmt!(ExcType::TypeError; "{name} expected at least {min} argument{}, got {given}", if min == 1 { "" } else { "s" });
    }
    if given > max {
        return exc_err_fmt!(ExcType::TypeError; "{name} expected at most {max} arguments, got {given}");
    }
    Ok(())
}

impl<T: CallTracer> Vm<T> {
    pub(crate) fn call_builtin(&mut self, builtin: Builtins, args: ArgValues) -> RunResult<Value> {
        match builtin {
            Builtins::Iter => {
                positional_only(builtin, &args, 1, 1)?;
                self.get_iter(&args.args[0])
            }
            Builtins::Next => {
                positional_only(builtin, &args, 1, 2)?;
                match self.next(&args.args[0]) {
                    Err(err) if args.args.len() == 2 && err.matches(&[ExcType::StopIteration]) => Ok(args.args[1].clone()),
                    other => other,
                }
            }
            Builtins::Range => {
                positional_only(builtin, &args, 1, 3)?;
                let mut bounds = [0i64, 0, 1];
                for (i, arg) in args.args.iter().enumerate() {
                    bounds[i] = arg.as_int().ok_or_else(|| {
                        exc_fmt!(ExcType::TypeError; "'{}' object cannot be interpreted as an integer", arg.py_type(&self.heap))
                    })?;
                }
                let [start, stop, step] = match args.args.len() {
                    1 => [0, bounds[0], 1],
                    _ => bounds,
                };
                if step == 0 {
                    return exc_err_fmt!(ExcType::ValueError; "range() arg 3 must not be zero");
                }
                let id = self.allocate(HeapData::Range(Range { start, stop, step }))?;
                Ok(Value::Ref(id))
            }
        }
    }
}
