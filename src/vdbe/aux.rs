//! Program construction and run state
//!
//! A [`Vdbe`] is first a program under construction — codegen appends
//! instructions, allocates forward labels, and patches jump targets —
//! and then, after [`Vdbe::ready`] resolves labels, a runnable machine
//! whose state (stack, cursors, keylists, sorter, aggregator) lives in
//! the same structure so a suspended `step()` can resume exactly where
//! it left off.

use std::collections::VecDeque;

use crate::error::Error;
use crate::schema::SchemaChange;
use crate::storage::{StorageCursor, StorageHandle};
use crate::types::{PageNo, RowId, Value};
use crate::vdbe::agg::Aggregator;
use crate::vdbe::mem::Mem;
use crate::vdbe::ops::{Instr, Opcode, P3};
use crate::vdbe::sorter::Sorter;

// ============================================================================
// Halt Error Actions
// ============================================================================

/// Values of the Halt opcode's P2 operand.
pub mod on_error {
    /// Roll the open transaction back and reset the schema cache
    pub const ROLLBACK: i32 = 1;
    /// Undo this statement's changes, keep the transaction open
    pub const ABORT: i32 = 2;
    /// Stop immediately, keeping prior changes
    pub const FAIL: i32 = 3;
}

// ============================================================================
// Cursors
// ============================================================================

/// Run-time state of one VDBE cursor slot.
#[derive(Default)]
pub struct VCursor {
    /// The storage cursor, absent for pure pseudo cursors
    pub cursor: Option<Box<dyn StorageCursor>>,
    /// Keeps a private environment alive for OpenTemp cursors
    pub temp_handle: Option<Box<dyn StorageHandle>>,
    /// Which attached database the cursor reads (for diagnostics)
    pub db_idx: usize,
    /// Report NULL for every column until the cursor moves again
    pub null_row: bool,
    /// Column reads decode the key instead of the data
    pub key_as_data: bool,
    /// One-row in-memory table for trigger OLD/NEW rows
    pub pseudo: bool,
    pub pseudo_key: RowId,
    pub pseudo_data: Vec<u8>,
    /// An integer MoveTo that has not touched storage yet; flushed
    /// before the next read
    pub deferred_moveto: Option<RowId>,
    /// Cache of the current row id
    pub last_recno: RowId,
    pub recno_valid: bool,
    /// NewRecno bookkeeping
    pub next_rowid: RowId,
    pub next_rowid_valid: bool,
    pub use_random_rowid: bool,
}

impl VCursor {
    /// Invalidate every per-row cache after the cursor moves.
    pub fn moved(&mut self) {
        self.null_row = false;
        self.recno_valid = false;
        self.deferred_moveto = None;
    }
}

// ============================================================================
// Sets
// ============================================================================

/// One membership set backing `expr IN (...)`.
#[derive(Default)]
pub struct SetState {
    members: std::collections::HashSet<Vec<u8>>,
    order: Vec<Vec<u8>>,
    pos: usize,
}

impl SetState {
    pub fn insert(&mut self, key: Vec<u8>) {
        if self.members.insert(key.clone()) {
            self.order.push(key);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.members.contains(key)
    }

    pub fn rewind(&mut self) -> bool {
        self.pos = 0;
        !self.order.is_empty()
    }

    pub fn next(&mut self) -> Option<&[u8]> {
        let item = self.order.get(self.pos)?;
        self.pos += 1;
        Some(item)
    }
}

// ============================================================================
// Machine Magic
// ============================================================================

/// Lifecycle tag of a Vdbe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    /// Still being built
    Init,
    /// Ready to run / running
    Run,
    /// Reached a terminal outcome
    Halt,
}

// ============================================================================
// The Machine
// ============================================================================

/// A VDBE program plus its run state.
pub struct Vdbe {
    // ------------------------------------------------------------------
    // Program
    // ------------------------------------------------------------------
    pub ops: Vec<Instr>,
    labels: Vec<i32>,
    /// Number of `?` variables referenced
    pub n_var: usize,
    /// Result column names followed by their declared types (2n slots)
    pub col_names: Vec<String>,
    pub result_columns: usize,
    /// Schema-cache changes to apply when the program commits
    pub pending_schema: Vec<SchemaChange>,
    /// EXPLAIN mode: list instead of run
    pub explain: bool,

    // ------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------
    pub magic: Magic,
    pub pc: usize,
    pub stack: Vec<Mem>,
    pub mems: Vec<Mem>,
    pub vars: Vec<Value>,
    pub cursors: Vec<Option<VCursor>>,
    pub sets: Vec<SetState>,
    pub agg: Aggregator,
    pub sorter: Sorter,
    pub keylist: VecDeque<RowId>,
    pub keylist_stack: Vec<VecDeque<RowId>>,
    pub return_stack: Vec<usize>,
    /// Roots allocated by CreateTable/CreateIndex, in program order
    pub created_roots: Vec<PageNo>,
    /// Uniquifier folded into records holding NULLs
    pub unique_cnt: u32,
    /// COPY input
    pub file: Option<Box<dyn std::io::BufRead>>,
    pub file_fields: Vec<Option<String>>,
    /// Values surfaced by the pending Row suspension
    pub result_row: Vec<Value>,
    /// Result rows delivered so far (drives NullCallback)
    pub n_callback: usize,
    /// A transaction was started by this program and should unwind on
    /// error
    pub undo_txn_on_error: bool,
    /// Rows changed by this program
    pub n_change: i64,
    pub error: Option<Error>,
}

/// Bound on the Gosub return stack; overflow is a program bug.
pub const RETURN_STACK_MAX: usize = 100;

impl Vdbe {
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            labels: Vec::new(),
            n_var: 0,
            col_names: Vec::new(),
            result_columns: 0,
            pending_schema: Vec::new(),
            explain: false,
            magic: Magic::Init,
            pc: 0,
            stack: Vec::new(),
            mems: Vec::new(),
            vars: Vec::new(),
            cursors: Vec::new(),
            sets: Vec::new(),
            agg: Aggregator::new(),
            sorter: Sorter::new(),
            keylist: VecDeque::new(),
            keylist_stack: Vec::new(),
            return_stack: Vec::new(),
            created_roots: Vec::new(),
            unique_cnt: 0,
            file: None,
            file_fields: Vec::new(),
            result_row: Vec::new(),
            n_callback: 0,
            undo_txn_on_error: false,
            n_change: 0,
            error: None,
        }
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Append an instruction; returns its address.
    pub fn add_op(&mut self, opcode: Opcode, p1: i32, p2: i32) -> usize {
        self.ops.push(Instr::new(opcode, p1, p2));
        self.ops.len() - 1
    }

    /// Append an instruction with a P3 operand.
    pub fn add_op_p3(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: P3) -> usize {
        self.ops.push(Instr::with_p3(opcode, p1, p2, p3));
        self.ops.len() - 1
    }

    /// Address the next instruction will get.
    pub fn current_addr(&self) -> usize {
        self.ops.len()
    }

    /// Allocate a forward-reference label. Labels are negative so they
    /// cannot collide with resolved addresses.
    pub fn make_label(&mut self) -> i32 {
        self.labels.push(-1);
        -(self.labels.len() as i32)
    }

    /// Bind a label to the current address.
    pub fn resolve_label(&mut self, label: i32) {
        let idx = (-label - 1) as usize;
        if idx < self.labels.len() {
            self.labels[idx] = self.current_addr() as i32;
        }
    }

    /// Patch the P2 of the instruction at `addr`.
    pub fn change_p2(&mut self, addr: usize, p2: i32) {
        if let Some(op) = self.ops.get_mut(addr) {
            op.p2 = p2;
        }
    }

    /// Replace the P3 of the most recent instruction (or of `addr`).
    pub fn change_p3(&mut self, addr: usize, p3: P3) {
        if let Some(op) = self.ops.get_mut(addr) {
            op.p3 = p3;
        }
    }

    /// Record a result column's name (`slot` < n) or declared type
    /// (`slot` >= n written via the type flag).
    pub fn set_col_name(&mut self, slot: usize, text: &str) {
        if self.col_names.len() <= slot {
            self.col_names.resize(slot + 1, String::new());
        }
        self.col_names[slot] = text.to_string();
    }

    /// Resolve labels and prepare run state. Called once at the end of
    /// prepare; afterwards every jump target is an absolute address.
    pub fn ready(&mut self) {
        for op in &mut self.ops {
            if op.p2 < 0 {
                let idx = (-op.p2 - 1) as usize;
                if idx < self.labels.len() && self.labels[idx] >= 0 {
                    op.p2 = self.labels[idx];
                }
            }
        }
        // Column names settle at prepare time.
        let mut n_res = 0usize;
        for op in &self.ops {
            if op.opcode == Opcode::ColumnName && op.p2 == 0 {
                n_res = n_res.max(op.p1 as usize + 1);
            }
        }
        self.result_columns = n_res;
        let mut names = vec![String::new(); n_res * 2];
        for op in &self.ops {
            if op.opcode == Opcode::ColumnName {
                let slot = if op.p2 != 0 {
                    n_res + op.p1 as usize
                } else {
                    op.p1 as usize
                };
                if slot < names.len() {
                    names[slot] = op.p3.as_str().unwrap_or("").to_string();
                }
            }
        }
        self.col_names = names;
        self.vars = vec![Value::Null; self.n_var];
        self.magic = Magic::Run;
        self.pc = 0;
    }

    /// Rewind to the beginning, keeping bindings.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.stack.clear();
        self.mems.clear();
        self.cursors.clear();
        self.sets.clear();
        self.agg.reset(0);
        self.sorter.reset();
        self.keylist.clear();
        self.keylist_stack.clear();
        self.return_stack.clear();
        self.created_roots.clear();
        self.file = None;
        self.file_fields.clear();
        self.result_row.clear();
        self.n_callback = 0;
        self.undo_txn_on_error = false;
        self.n_change = 0;
        self.error = None;
        self.magic = Magic::Run;
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// Render the program the way EXPLAIN surfaces it.
    pub fn listing(&self) -> Vec<(usize, String, i32, i32, String)> {
        self.ops
            .iter()
            .enumerate()
            .map(|(addr, op)| {
                (
                    addr,
                    format!("{:?}", op.opcode),
                    op.p1,
                    op.p2,
                    op.p3.as_str().map(str::to_string).unwrap_or_else(|| {
                        op.p3
                            .func()
                            .map(|f| f.name.clone())
                            .unwrap_or_default()
                    }),
                )
            })
            .collect()
    }

    // ========================================================================
    // Stack Helpers
    // ========================================================================

    pub fn push(&mut self, m: Mem) {
        self.stack.push(m);
    }

    pub fn pop(&mut self) -> Mem {
        self.stack.pop().unwrap_or_default()
    }

    /// Named memory cell, growing the array on demand.
    pub fn mem_cell(&mut self, idx: usize) -> &mut Mem {
        if self.mems.len() <= idx {
            self.mems.resize_with(idx + 1, Mem::default);
        }
        &mut self.mems[idx]
    }

    /// Cursor slot, growing the array on demand.
    pub fn cursor_slot(&mut self, idx: usize) -> &mut Option<VCursor> {
        if self.cursors.len() <= idx {
            self.cursors.resize_with(idx + 1, || None);
        }
        &mut self.cursors[idx]
    }

    /// Set slot, growing the array on demand.
    pub fn set_slot(&mut self, idx: usize) -> &mut SetState {
        if self.sets.len() <= idx {
            self.sets.resize_with(idx + 1, SetState::default);
        }
        &mut self.sets[idx]
    }
}

impl Default for Vdbe {
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
    fn test_labels_resolve_to_absolute_addresses() {
        let mut v = Vdbe::new();
        let lbl = v.make_label();
        v.add_op(Opcode::Goto, 0, lbl);
        v.add_op(Opcode::Noop, 0, 0);
        v.resolve_label(lbl);
        let target = v.add_op(Opcode::Halt, 0, 0);
        v.ready();
        assert_eq!(v.ops[0].p2 as usize, target);
    }

    #[test]
    fn test_column_names_fill_at_ready() {
        let mut v = Vdbe::new();
        v.add_op_p3(Opcode::ColumnName, 0, 0, P3::Static("a"));
        v.add_op_p3(Opcode::ColumnName, 1, 0, P3::Static("b"));
        v.add_op_p3(Opcode::ColumnName, 0, 1, P3::Static("INTEGER"));
        v.ready();
        assert_eq!(v.result_columns, 2);
        assert_eq!(v.col_names, vec!["a", "b", "INTEGER", ""]);
    }

    #[test]
    fn test_mem_and_cursor_slots_grow() {
        let mut v = Vdbe::new();
        v.mem_cell(5).set_int(9);
        assert_eq!(v.mems.len(), 6);
        assert_eq!(v.mems[5].to_int(), 9);
        assert!(v.cursor_slot(3).is_none());
        assert_eq!(v.cursors.len(), 4);
    }

    #[test]
    fn test_set_state_iteration() {
        let mut s = SetState::default();
        s.insert(b"a".to_vec());
        s.insert(b"b".to_vec());
        s.insert(b"a".to_vec());
        assert!(s.contains(b"a"));
        assert!(s.rewind());
        assert_eq!(s.next(), Some(&b"a"[..]));
        assert_eq!(s.next(), Some(&b"b"[..]));
        assert_eq!(s.next(), None);
    }
}
