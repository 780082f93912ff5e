//! User-defined function registration
//!
//! Scalar and aggregate functions reach the engine only through
//! [`FuncDef`] records registered on a connection. The VDBE invokes them
//! through [`FuncContext`], which carries the result cell, the error
//! slot, and (for aggregates) the per-group accumulator.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::error::ErrorCode;
use crate::types::{DataType, Value};

/// Scalar function or aggregate step callback.
pub type FuncStep = Rc<dyn Fn(&mut FuncContext, &[Value])>;

/// Aggregate finalizer callback.
pub type FuncFinal = Rc<dyn Fn(&mut FuncContext)>;

/// How the result type of a function is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncReturn {
    /// Result is numeric (the default)
    Numeric,
    /// Result is text
    Text,
    /// Result has the type of the function's first argument
    ArgType,
}

/// A registered SQL function.
#[derive(Clone)]
pub struct FuncDef {
    /// Function name, matched case-insensitively
    pub name: String,
    /// Required argument count; -1 accepts any count
    pub n_arg: i32,
    /// Scalar implementation (None for pure aggregates)
    pub func: Option<FuncStep>,
    /// Aggregate step
    pub step: Option<FuncStep>,
    /// Aggregate finalizer
    pub finalize: Option<FuncFinal>,
    /// Declared result typing
    pub returns: FuncReturn,
}

impl FuncDef {
    pub fn is_aggregate(&self) -> bool {
        self.step.is_some()
    }

    /// Result data type given the argument types.
    pub fn result_type(&self, arg_types: &[DataType]) -> DataType {
        match self.returns {
            FuncReturn::Numeric => DataType::Numeric,
            FuncReturn::Text => DataType::Text,
            FuncReturn::ArgType => arg_types.first().copied().unwrap_or(DataType::Numeric),
        }
    }
}

impl fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncDef")
            .field("name", &self.name)
            .field("n_arg", &self.n_arg)
            .field("aggregate", &self.is_aggregate())
            .finish()
    }
}

// ============================================================================
// Function Invocation Context
// ============================================================================

/// Context handed to a function implementation for one invocation (or,
/// for aggregates, one step / the finalize pass).
pub struct FuncContext {
    /// The value the function produced
    pub result: Value,
    /// Error raised by the implementation, if any
    pub error: Option<(ErrorCode, String)>,
    /// Number of step calls so far, counting this one (aggregates)
    pub count: i64,
    /// Per-group accumulator storage (aggregates)
    agg: Option<Box<dyn Any>>,
}

impl FuncContext {
    pub fn new() -> Self {
        Self {
            result: Value::Null,
            error: None,
            count: 0,
            agg: None,
        }
    }

    pub fn set_result(&mut self, v: Value) {
        self.result = v;
    }

    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.error = Some((ErrorCode::Error, msg.into()));
    }

    /// Fetch the aggregate accumulator, allocating a default-initialized
    /// one on first use. This is the `aggregate_context(size)` surface:
    /// each aggregate column of each group gets exactly one accumulator
    /// that survives across step calls.
    pub fn aggregate_context<T: Any + Default>(&mut self) -> &mut T {
        if self.agg.is_none() || self.agg.as_ref().map(|a| !a.is::<T>()).unwrap_or(false) {
            self.agg = Some(Box::new(T::default()));
        }
        self.agg
            .as_mut()
            .and_then(|a| a.downcast_mut::<T>())
            .expect("aggregate context type")
    }

    /// Take the accumulator out (used when the group is finalized).
    pub fn take_context(&mut self) -> Option<Box<dyn Any>> {
        self.agg.take()
    }

    /// Restore the accumulator (used between step calls on a group).
    pub fn put_context(&mut self, agg: Option<Box<dyn Any>>) {
        self.agg = agg;
    }
}

impl Default for FuncContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_context_persists() {
        #[derive(Default)]
        struct Sum {
            total: i64,
        }
        let mut ctx = FuncContext::new();
        ctx.aggregate_context::<Sum>().total = 5;
        ctx.aggregate_context::<Sum>().total += 2;
        assert_eq!(ctx.aggregate_context::<Sum>().total, 7);
    }

    #[test]
    fn test_result_type_derivation() {
        let def = FuncDef {
            name: "f".into(),
            n_arg: 1,
            func: None,
            step: None,
            finalize: None,
            returns: FuncReturn::ArgType,
        };
        assert_eq!(def.result_type(&[DataType::Text]), DataType::Text);
        assert_eq!(def.result_type(&[]), DataType::Numeric);
    }
}
