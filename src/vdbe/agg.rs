//! Aggregator runtime
//!
//! GROUP BY execution hashes each group key to a row of cells. Plain
//! cells hold group-by column values (AggSet/AggGet); function cells
//! accumulate through their registered step function and are finalized
//! the first time AggNext visits the group.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

use crate::func::{FuncContext, FuncDef};
use crate::types::Value;
use crate::vdbe::mem::Mem;

/// One cell of one group's row.
#[derive(Default)]
pub struct AggCell {
    pub mem: Mem,
    /// Accumulator handed to the step function
    pub ctx: Option<Box<dyn Any>>,
    /// Step invocations so far
    pub cnt: i64,
}

/// One group.
pub struct AggElem {
    pub key: Vec<u8>,
    pub cells: Vec<AggCell>,
}

/// The aggregator attached to a running program.
#[derive(Default)]
pub struct Aggregator {
    index: HashMap<Vec<u8>, usize>,
    elems: Vec<AggElem>,
    /// Function bound to each cell position, if any
    funcs: Vec<Option<Rc<FuncDef>>>,
    n_mem: usize,
    current: Option<usize>,
    /// AggNext iteration position (one past the last visited group)
    search: usize,
    started: bool,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the aggregator; groups created from now on have `n_mem`
    /// cells.
    pub fn reset(&mut self, n_mem: usize) {
        self.index.clear();
        self.elems.clear();
        self.funcs = (0..n_mem).map(|_| None).collect();
        self.n_mem = n_mem;
        self.current = None;
        self.search = 0;
        self.started = false;
    }

    pub fn n_mem(&self) -> usize {
        self.n_mem
    }

    /// Bind a function to cell `col`.
    pub fn init_func(&mut self, col: usize, func: Rc<FuncDef>) {
        if col < self.funcs.len() {
            self.funcs[col] = Some(func);
        }
    }

    pub fn func(&self, col: usize) -> Option<Rc<FuncDef>> {
        self.funcs.get(col).and_then(|f| f.clone())
    }

    /// Focus the group for `key`, creating it when new. Returns true
    /// when the group already existed.
    pub fn focus(&mut self, key: &[u8]) -> bool {
        if let Some(&idx) = self.index.get(key) {
            self.current = Some(idx);
            return true;
        }
        let cells = (0..self.n_mem).map(|_| AggCell::default()).collect();
        self.elems.push(AggElem {
            key: key.to_vec(),
            cells,
        });
        let idx = self.elems.len() - 1;
        self.index.insert(key.to_vec(), idx);
        self.current = Some(idx);
        false
    }

    /// The focused group's cell, for mutation.
    pub fn cell_mut(&mut self, col: usize) -> Option<&mut AggCell> {
        let idx = self.current?;
        self.elems.get_mut(idx)?.cells.get_mut(col)
    }

    /// Copy of the focused group's cell value.
    pub fn cell_value(&self, col: usize) -> Option<Mem> {
        let idx = self.current?;
        self.elems.get(idx)?.cells.get(col).map(|c| c.mem.clone())
    }

    /// Run one step of the aggregate bound to `col` with `args`.
    pub fn func_step(&mut self, col: usize, func: &Rc<FuncDef>, args: &[Value]) {
        if let Some(cell) = self.cell_mut(col) {
            cell.cnt += 1;
            let mut ctx = FuncContext::new();
            ctx.count = cell.cnt;
            ctx.put_context(cell.ctx.take());
            if let Some(step) = &func.step {
                step(&mut ctx, args);
            }
            cell.ctx = ctx.take_context();
            // A step may set an eager result (count does).
            cell.mem = Mem::from_value(&ctx.result);
        }
    }

    /// Advance to the next group and finalize its function cells.
    /// Returns false when every group has been visited.
    pub fn next(&mut self) -> bool {
        if !self.started {
            self.started = true;
            self.search = 0;
        }
        if self.search >= self.elems.len() {
            self.current = None;
            return false;
        }
        let idx = self.search;
        self.search += 1;
        for (col, cell) in self.elems[idx].cells.iter_mut().enumerate() {
            let func = match &self.funcs[col] {
                Some(f) => f.clone(),
                None => continue,
            };
            if let Some(fin) = &func.finalize {
                let mut ctx = FuncContext::new();
                ctx.count = cell.cnt;
                ctx.put_context(cell.ctx.take());
                fin(&mut ctx);
                cell.mem = Mem::from_value(&ctx.result);
            }
        }
        self.current = Some(idx);
        true
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::FuncReturn;

    fn sum_def() -> Rc<FuncDef> {
        #[derive(Default)]
        struct Sum {
            total: f64,
        }
        Rc::new(FuncDef {
            name: "sum".into(),
            n_arg: 1,
            func: None,
            step: Some(Rc::new(|ctx: &mut FuncContext, args: &[Value]| {
                if let Some(v) = args.first() {
                    if !v.is_null() {
                        ctx.aggregate_context::<Sum>().total += v.to_real();
                    }
                }
            })),
            finalize: Some(Rc::new(|ctx: &mut FuncContext| {
                let total = ctx.aggregate_context::<Sum>().total;
                ctx.set_result(Value::Real(total));
            })),
            returns: FuncReturn::Numeric,
        })
    }

    #[test]
    fn test_group_sums() {
        let mut agg = Aggregator::new();
        agg.reset(2);
        let sum = sum_def();
        agg.init_func(1, sum.clone());

        for (k, v) in [("a", 1.0), ("a", 2.0), ("b", 5.0)] {
            let existed = agg.focus(k.as_bytes());
            if !existed {
                if let Some(cell) = agg.cell_mut(0) {
                    cell.mem = Mem::text(k);
                }
            }
            agg.func_step(1, &sum, &[Value::Real(v)]);
        }

        let mut seen = Vec::new();
        while agg.next() {
            let key = agg.cell_value(0).unwrap().to_text();
            let total = agg.cell_value(1).unwrap().to_real();
            seen.push((key, total));
        }
        assert_eq!(seen, vec![("a".to_string(), 3.0), ("b".to_string(), 5.0)]);
    }

    #[test]
    fn test_focus_reports_existing() {
        let mut agg = Aggregator::new();
        agg.reset(1);
        assert!(!agg.focus(b"k"));
        assert!(agg.focus(b"k"));
        assert_eq!(agg.len(), 1);
    }
}
