//! Arithmetic and comparison instructions.
//!
//! Each op pops the right operand, then the left, and pushes the result.

use std::sync::Arc;

use super::Vm;
use crate::{
    exception::{ExcType, RunError, RunResult, exc_err_fmt, exc_fmt},
    frame::FrameId,
    heap::{Heap, HeapData},
    tracer::CallTracer,
    types::Type,
    value::Value,
};

#[derive(Debug, Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
        }
    }

    fn apply(self, lhs: i64, rhs: i64) -> Option<i64> {
        match self {
            Self::Add => lhs.checked_add(rhs),
            Self::Sub => lhs.checked_sub(rhs),
            Self::Mul => lhs.checked_mul(rhs),
        }
    }
}

fn binary_type_error(op: &str, lhs: Type, rhs: Type) -> RunError {
    exc_fmt!(ExcType::TypeError; "unsupported operand type(s) for {op}: '{lhs}' and '{rhs}'").into()
}

/// Structural equality: immediates by value (with `True == 1`), tuples and lists
/// elementwise, other heap objects by identity.
fn values_equal(lhs: &Value, rhs: &Value, heap: &Heap, depth: usize) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
        return a == b;
    }
    match (lhs, rhs) {
        (Value::Ref(a), Value::Ref(b)) if a == b => true,
        (Value::Ref(a), Value::Ref(b)) if depth > 0 => match (heap.try_get(*a), heap.try_get(*b)) {
            (Some(HeapData::Tuple(xs)), Some(HeapData::Tuple(ys))) | (Some(HeapData::List(xs)), Some(HeapData::List(ys))) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y, heap, depth - 1))
            }
            _ => false,
        },
        _ => lhs == rhs,
    }
}

impl<T: CallTracer> Vm<T> {
    pub(crate) fn binary_add(&mut self, frame: FrameId) -> RunResult<()> {
        let rhs = self.pop(frame)?;
        let lhs = self.pop(frame)?;
        if let (Value::Str(a), Value::Str(b)) = (&lhs, &rhs) {
            let joined: Arc<str> = format!("{a}{b}").into();
            self.push(frame, Value::Str(joined));
            return Ok(());
        }
        self.arith(frame, ArithOp::Add, &lhs, &rhs)
    }

    pub(crate) fn binary_sub(&mut self, frame: FrameId) -> RunResult<()> {
        let rhs = self.pop(frame)?;
        let lhs = self.pop(frame)?;
        self.arith(frame, ArithOp::Sub, &lhs, &rhs)
    }

    pub(crate) fn binary_mul(&mut self, frame: FrameId) -> RunResult<()> {
        let rhs = self.pop(frame)?;
        let lhs = self.pop(frame)?;
        self.arith(frame, ArithOp::Mul, &lhs, &rhs)
    }

    fn arith(&mut self, frame: FrameId, op: ArithOp, lhs: &Value, rhs: &Value) -> RunResult<()> {
        let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) else {
            return Err(binary_type_error(op.symbol(), lhs.py_type(&self.heap), rhs.py_type(&self.heap)));
        };
        match op.apply(a, b) {
            Some(result) => {
                self.push(frame, Value::Int(result));
                Ok(())
            }
            None => exc_err_fmt!(ExcType::OverflowError; "integer overflow"),
        }
    }

    pub(crate) fn compare_eq(&mut self, frame: FrameId) -> RunResult<()> {
        let rhs = self.pop(frame)?;
        let lhs = self.pop(frame)?;
        let equal = values_equal(&lhs, &rhs, &self.heap, 16);
        self.push(frame, Value::Bool(equal));
        Ok(())
    }

    pub(crate) fn compare_lt(&mut self, frame: FrameId) -> RunResult<()> {
        let rhs = self.pop(frame)?;
        let lhs = self.pop(frame)?;
        let less = match (&lhs, &rhs) {
            (Value::Str(a), Value::Str(b)) => a < b,
            _ => match (lhs.as_int(), rhs.as_int()) {
                (Some(a), Some(b)) => a < b,
                _ => {
                    return exc_err_fmt!(
                        ExcType::TypeError;
                        "'<' not supported between instances of '{}' and '{}'",
                        lhs.py_type(&self.heap),
                        rhs.py_type(&self.heap)
                    );
                }
            },
        };
        self.push(frame, Value::Bool(less));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_treats_bools_as_ints() {
        let heap = Heap::EMPTY;
        assert!(values_equal(&Value::Bool(true), &Value::Int(1), &heap, 4));
        assert!(!values_equal(&Value::Str("1".into()), &Value::Int(1), &heap, 4));
        assert!(values_equal(&Value::None, &Value::None, &heap, 4));
    }

    #[test]
    fn overflow_is_detected() {
        assert_eq!(ArithOp::Mul.apply(i64::MAX, 2), None);
        assert_eq!(ArithOp::Sub.apply(5, 7), Some(-2));
    }
}
