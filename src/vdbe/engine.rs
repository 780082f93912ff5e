//! The VDBE bytecode interpreter
//!
//! `vdbe_exec` runs a prepared program against the connection's attached
//! databases until it finishes, suspends, or fails:
//!
//! * `Exec::Row` — a Callback/SortCallback surfaced a row; the caller
//!   reads `v.result_row` and re-enters.
//! * `Exec::Busy` — a lock collision with the busy handler declining to
//!   retry; `pc` and the stack are preserved so the caller can step
//!   again.
//! * `Exec::Done` — the program halted cleanly.
//!
//! Runtime errors unwind through a cleanup pass that closes cursors,
//! empties the sorter, and applies the halt error action to any open
//! transaction.

use std::cmp::Ordering;

use crate::api::connection::Connection;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{RowId, Value, MAX_ROWID};
use crate::vdbe::aux::{on_error, Magic, VCursor, Vdbe};
use crate::vdbe::mem::{numeric_cmp, text_cmp, Mem};
use crate::vdbe::ops::{Instr, Opcode};
use crate::vdbe::record;

/// Outcome of one exec slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exec {
    Done,
    Row,
    Busy,
}

// ============================================================================
// Cursor Helpers
// ============================================================================

fn cursor_mut<'a>(v: &'a mut Vdbe, idx: i32) -> Result<&'a mut VCursor> {
    v.cursor_slot(idx as usize)
        .as_mut()
        .ok_or_else(|| Error::with_message(ErrorCode::Internal, "cursor not open"))
}

/// Flush a deferred integer MoveTo before any read through the cursor.
fn flush_deferred(cur: &mut VCursor) -> Result<()> {
    if let Some(rowid) = cur.deferred_moveto.take() {
        if let Some(c) = cur.cursor.as_mut() {
            let seek = c.moveto(&record::int_to_key(rowid))?;
            cur.recno_valid = seek == crate::storage::Seek::Found;
            cur.last_recno = rowid;
            if seek != crate::storage::Seek::Found {
                cur.null_row = true;
            }
        }
    }
    Ok(())
}

/// Current payload of a cursor: data, or the key when key_as_data is on.
fn cursor_payload(cur: &mut VCursor) -> Result<Option<Vec<u8>>> {
    flush_deferred(cur)?;
    if cur.null_row {
        return Ok(None);
    }
    if cur.pseudo {
        return Ok(Some(cur.pseudo_data.clone()));
    }
    let c = match cur.cursor.as_mut() {
        Some(c) => c,
        None => return Ok(None),
    };
    if !c.valid() {
        return Ok(None);
    }
    Ok(Some(if cur.key_as_data { c.key()? } else { c.data()? }))
}

// ============================================================================
// Value Helpers
// ============================================================================

fn three_valued(m: &Mem, null_as: Option<bool>) -> Option<bool> {
    if m.is_null() {
        null_as
    } else {
        Some(m.to_int() != 0)
    }
}

fn map_halt_code(code: i32) -> ErrorCode {
    match code {
        1 => ErrorCode::Error,
        3 => ErrorCode::Perm,
        4 => ErrorCode::Abort,
        8 => ErrorCode::ReadOnly,
        13 => ErrorCode::Full,
        17 => ErrorCode::Schema,
        19 => ErrorCode::Constraint,
        20 => ErrorCode::Mismatch,
        _ => ErrorCode::Error,
    }
}

// ============================================================================
// Main Loop
// ============================================================================

/// Execute until the program yields. See the module comment for the
/// outcome contract.
pub fn vdbe_exec(conn: &mut Connection, v: &mut Vdbe) -> Result<Exec> {
    if v.magic != Magic::Run {
        return Err(Error::new(ErrorCode::Misuse));
    }
    let mut pc = v.pc;
    let mut busy_count = 0;
    let mut ops_since_progress = 0usize;

    loop {
        if pc >= v.ops.len() {
            return halt_done(conn, v);
        }
        let op = v.ops[pc].clone();
        log::trace!("vdbe pc={} {}", pc, op);

        // Cancellation points: the interrupt flag and the progress
        // handler are consulted at loop-edge opcodes.
        if op.opcode.is_jump() {
            if conn.is_interrupted() {
                return halt_error(conn, v, Error::new(ErrorCode::Interrupted), on_error::ABORT);
            }
        }
        ops_since_progress += 1;
        if let Some(every) = conn.progress_ops {
            if ops_since_progress >= every {
                ops_since_progress = 0;
                let ok = match conn.progress.as_mut() {
                    Some(h) => h(),
                    None => true,
                };
                if !ok {
                    return halt_error(conn, v, Error::new(ErrorCode::Abort), on_error::ABORT);
                }
            }
        }

        let mut next_pc = pc + 1;
        let step = exec_op(conn, v, &op, &mut next_pc);
        match step {
            Ok(Flow::Continue) => {}
            Ok(Flow::Row) => {
                v.pc = next_pc;
                return Ok(Exec::Row);
            }
            Ok(Flow::Done) => return halt_done(conn, v),
            Err(e) if e.code == ErrorCode::Busy => {
                // Consult the busy handler; retrying re-runs this same
                // instruction with the stack untouched by it.
                busy_count += 1;
                let db_name = conn
                    .dbs
                    .first()
                    .map(|d| d.name.clone())
                    .unwrap_or_default();
                let retry = match conn.busy.as_mut() {
                    Some(h) => h(db_name, busy_count),
                    None => false,
                };
                if retry {
                    continue;
                }
                v.pc = pc;
                return Ok(Exec::Busy);
            }
            Err(e) => {
                let action = if op.opcode == Opcode::Halt {
                    op.p2
                } else {
                    on_error::ABORT
                };
                return halt_error(conn, v, e, action);
            }
        }
        pc = next_pc;
    }
}

/// Per-instruction control flow.
enum Flow {
    Continue,
    Row,
    Done,
}

fn halt_done(conn: &mut Connection, v: &mut Vdbe) -> Result<Exec> {
    v.magic = Magic::Halt;
    conn.last_change_count = v.n_change;
    conn.total_change_count += v.n_change;
    // Inside a user transaction no Commit opcode runs, so schema-cache
    // changes apply here; a later ROLLBACK resets the cache and the
    // reload sees the restored catalog.
    if !v.pending_schema.is_empty() {
        let changes: Vec<_> = v.pending_schema.drain(..).collect();
        let mut roots = std::mem::take(&mut v.created_roots);
        conn.apply_schema_changes(changes, &mut roots);
    }
    cleanup(v);
    Ok(Exec::Done)
}

fn halt_error(conn: &mut Connection, v: &mut Vdbe, e: Error, action: i32) -> Result<Exec> {
    v.magic = Magic::Halt;
    match action {
        on_error::ROLLBACK => {
            conn.rollback_open_txns();
            conn.reset_all_schemas();
        }
        on_error::FAIL => {}
        _ => {
            // Abort: unwind the transaction this statement opened.
            if v.undo_txn_on_error {
                conn.rollback_open_txns();
            }
        }
    }
    v.pending_schema.clear();
    cleanup(v);
    v.error = Some(e.clone());
    Err(e)
}

/// Close cursors and runtime buffers after any terminal outcome.
fn cleanup(v: &mut Vdbe) {
    v.cursors.clear();
    v.sorter.reset();
    v.agg.reset(0);
    v.keylist.clear();
    v.keylist_stack.clear();
    v.return_stack.clear();
    v.sets.clear();
    v.file = None;
    v.file_fields.clear();
    v.stack.clear();
}

// ============================================================================
// Instruction Execution
// ============================================================================

#[allow(clippy::too_many_lines)]
fn exec_op(conn: &mut Connection, v: &mut Vdbe, op: &Instr, next_pc: &mut usize) -> Result<Flow> {
    use Opcode::*;
    let jump = |next_pc: &mut usize, target: i32| {
        *next_pc = target.max(0) as usize;
    };

    match op.opcode {
        // ------------------------------------------------------------------
        // Control flow
        // ------------------------------------------------------------------
        Noop => {}
        Goto => jump(next_pc, op.p2),
        Gosub => {
            if v.return_stack.len() >= crate::vdbe::aux::RETURN_STACK_MAX {
                return Err(Error::with_message(
                    ErrorCode::Internal,
                    "return address stack overflow",
                ));
            }
            v.return_stack.push(*next_pc);
            jump(next_pc, op.p2);
        }
        Return => {
            let addr = v
                .return_stack
                .pop()
                .ok_or_else(|| Error::with_message(ErrorCode::Internal, "return stack empty"))?;
            *next_pc = addr;
        }
        Halt => {
            if op.p1 == 0 {
                return Ok(Flow::Done);
            }
            let code = map_halt_code(op.p1);
            let msg = op.p3.as_str().unwrap_or(code.as_str()).to_string();
            return Err(Error::with_message(code, msg));
        }
        If | IfNot => {
            let m = v.pop();
            let t = three_valued(&m, Some(op.p1 != 0)).unwrap_or(false);
            let go = if op.opcode == If { t } else { !t };
            if go {
                jump(next_pc, op.p2);
            }
        }
        IsNull | NotNull => {
            let n = op.p1.unsigned_abs() as usize;
            if v.stack.len() < n {
                return Err(Error::new(ErrorCode::Internal));
            }
            let any_null = v.stack[v.stack.len() - n..].iter().any(|m| m.is_null());
            let go = if op.opcode == IsNull {
                any_null
            } else {
                !any_null
            };
            if op.p1 > 0 {
                for _ in 0..n {
                    v.pop();
                }
            }
            if go {
                jump(next_pc, op.p2);
            }
        }
        MustBeInt => {
            let top = v.stack.last().ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let converted = if top.is_int() {
                Some(top.i)
            } else if top.is_real() && top.r == top.r.trunc() {
                Some(top.r as i64)
            } else if top.is_str() {
                let s = top.to_text();
                if crate::util::strings::is_integer(s.trim()) {
                    Some(crate::util::strings::str_to_int(&s))
                } else {
                    None
                }
            } else {
                None
            };
            match converted {
                Some(i) => {
                    let top = v.stack.last_mut().expect("checked");
                    top.set_int(i);
                }
                None => {
                    if op.p2 > 0 {
                        if op.p1 != 0 {
                            v.pop();
                        }
                        jump(next_pc, op.p2);
                    } else {
                        return Err(Error::new(ErrorCode::Mismatch));
                    }
                }
            }
        }
        ForceInt => {
            let mut m = v.pop();
            if !m.is_null() {
                let r = m.to_real();
                let i = if op.p1 != 0 && r > r.trunc() {
                    r.trunc() as i64 + 1
                } else {
                    r.trunc() as i64
                };
                m.set_int(i);
            }
            v.push(m);
        }

        // ------------------------------------------------------------------
        // Stack
        // ------------------------------------------------------------------
        Integer => {
            v.push(Mem::int(op.p1 as i64));
        }
        String => match op.p3.as_str() {
            Some(s) => {
                let mut m = Mem::null();
                m.set_str_static(s);
                v.push(m);
            }
            None => v.push(Mem::null()),
        },
        Variable => {
            let idx = op.p1 as usize;
            let val = v
                .vars
                .get(idx.saturating_sub(1))
                .cloned()
                .unwrap_or(Value::Null);
            v.push(Mem::from_value(&val));
        }
        Pop => {
            for _ in 0..op.p1 {
                v.pop();
            }
        }
        Dup => {
            let idx = v
                .stack
                .len()
                .checked_sub(1 + op.p1 as usize)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let mut m = v.stack[idx].clone();
            if op.p2 != 0 && m.is_str() {
                let bytes = m.str_bytes().to_vec();
                m.set_str_ephem(bytes);
            } else {
                m.make_owned();
            }
            v.push(m);
        }
        Pull => {
            let idx = v
                .stack
                .len()
                .checked_sub(1 + op.p1 as usize)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let m = v.stack.remove(idx);
            v.push(m);
        }
        Push => {
            let top = v.pop();
            let len = v.stack.len();
            let idx = len
                .checked_sub(op.p1 as usize)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            v.stack[idx] = top;
        }
        Concat => {
            let n = op.p1 as usize;
            if v.stack.len() < n {
                return Err(Error::new(ErrorCode::Internal));
            }
            let start = v.stack.len() - n;
            let any_null = v.stack[start..].iter().any(|m| m.is_null());
            let sep = op.p3.as_str().unwrap_or("");
            let result = if any_null {
                Mem::null()
            } else {
                let mut parts = Vec::with_capacity(n);
                for m in &mut v.stack[start..] {
                    m.stringify();
                    parts.push(m.to_text());
                }
                Mem::text(&parts.join(sep))
            };
            if op.p2 == 0 {
                v.stack.truncate(start);
            }
            v.push(result);
        }

        // ------------------------------------------------------------------
        // Arithmetic / logic
        // ------------------------------------------------------------------
        Add | Subtract | Multiply | Divide | Remainder => {
            let b = v.pop();
            let a = v.pop();
            if a.is_null() || b.is_null() {
                v.push(Mem::null());
            } else if a.is_int() && b.is_int() {
                let (x, y) = (a.i, b.i);
                let r = match op.opcode {
                    Add => Some(x.wrapping_add(y)),
                    Subtract => Some(x.wrapping_sub(y)),
                    Multiply => Some(x.wrapping_mul(y)),
                    Divide => {
                        if y == 0 {
                            None
                        } else {
                            Some(x.wrapping_div(y))
                        }
                    }
                    _ => {
                        if y == 0 {
                            None
                        } else {
                            Some(x.wrapping_rem(y))
                        }
                    }
                };
                v.push(r.map(Mem::int).unwrap_or_default());
            } else {
                let (x, y) = (a.to_real(), b.to_real());
                let r = match op.opcode {
                    Add => Some(x + y),
                    Subtract => Some(x - y),
                    Multiply => Some(x * y),
                    Divide => {
                        if y == 0.0 {
                            None
                        } else {
                            Some(x / y)
                        }
                    }
                    _ => {
                        let yi = y as i64;
                        if yi == 0 {
                            None
                        } else {
                            Some((x as i64 % yi) as f64)
                        }
                    }
                };
                v.push(r.map(Mem::real).unwrap_or_default());
            }
        }
        And | Or => {
            let b = v.pop();
            let a = v.pop();
            let (ta, tb) = (three_valued(&a, None), three_valued(&b, None));
            let res = if op.opcode == And {
                match (ta, tb) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }
            } else {
                match (ta, tb) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }
            };
            v.push(match res {
                None => Mem::null(),
                Some(t) => Mem::int(t as i64),
            });
        }
        Negative | AbsValue => {
            let mut m = v.pop();
            if m.is_null() {
                v.push(m);
            } else if m.is_int() {
                let i = if op.opcode == AbsValue {
                    m.i.wrapping_abs()
                } else {
                    m.i.wrapping_neg()
                };
                m.set_int(i);
                v.push(m);
            } else {
                let r = m.to_real();
                m.set_real(if op.opcode == AbsValue { r.abs() } else { -r });
                v.push(m);
            }
        }
        Not => {
            let m = v.pop();
            v.push(match three_valued(&m, None) {
                None => Mem::null(),
                Some(t) => Mem::int(!t as i64),
            });
        }
        BitNot => {
            let m = v.pop();
            if m.is_null() {
                v.push(Mem::null());
            } else {
                v.push(Mem::int(!m.to_int()));
            }
        }
        BitAnd | BitOr | ShiftLeft | ShiftRight => {
            let b = v.pop();
            let a = v.pop();
            if a.is_null() || b.is_null() {
                v.push(Mem::null());
            } else {
                let (x, y) = (a.to_int(), b.to_int());
                let r = match op.opcode {
                    BitAnd => x & y,
                    BitOr => x | y,
                    ShiftLeft => x.wrapping_shl(y as u32),
                    _ => x.wrapping_shr(y as u32),
                };
                v.push(Mem::int(r));
            }
        }
        AddImm => {
            let mut m = v.pop();
            m.integerify();
            m.set_int(m.i.wrapping_add(op.p1 as i64));
            v.push(m);
        }

        // ------------------------------------------------------------------
        // Comparison
        // ------------------------------------------------------------------
        Eq | Ne | Lt | Le | Gt | Ge | StrEq | StrNe | StrLt | StrLe | StrGt | StrGe => {
            let b = v.pop();
            let a = v.pop();
            if a.is_null() || b.is_null() {
                if op.p2 != 0 {
                    if op.p1 != 0 {
                        jump(next_pc, op.p2);
                    }
                } else {
                    v.push(Mem::null());
                }
            } else {
                let textual = matches!(op.opcode, StrEq | StrNe | StrLt | StrLe | StrGt | StrGe);
                let c = if textual {
                    text_cmp(&a, &b)
                } else {
                    numeric_cmp(&a, &b)
                };
                let t = match op.opcode {
                    Eq | StrEq => c == Ordering::Equal,
                    Ne | StrNe => c != Ordering::Equal,
                    Lt | StrLt => c == Ordering::Less,
                    Le | StrLe => c != Ordering::Greater,
                    Gt | StrGt => c == Ordering::Greater,
                    _ => c != Ordering::Less,
                };
                if op.p2 != 0 {
                    if t {
                        jump(next_pc, op.p2);
                    }
                } else {
                    v.push(Mem::int(t as i64));
                }
            }
        }

        // ------------------------------------------------------------------
        // Records and keys
        // ------------------------------------------------------------------
        MakeRecord => {
            let n = op.p1 as usize;
            let start = v
                .stack
                .len()
                .checked_sub(n)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let unique = if op.p2 != 0 {
                v.unique_cnt = v.unique_cnt.wrapping_add(1);
                Some(v.unique_cnt)
            } else {
                None
            };
            let rec = record::make_record(&mut v.stack[start..], unique);
            v.stack.truncate(start);
            let mut m = Mem::null();
            m.set_str(rec);
            v.push(m);
        }
        MakeKey | MakeIdxKey => {
            let n = op.p1 as usize;
            let with_rowid = op.opcode == MakeIdxKey;
            let start = v
                .stack
                .len()
                .checked_sub(n + with_rowid as usize)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let mask = op.p3.as_str().unwrap_or("").to_string();
            let (key, has_null) = if with_rowid {
                let rowid = v.stack[start].to_int();
                let fields_at = start + 1;
                record::make_idx_key(&mut v.stack[fields_at..], &mask, rowid)
            } else {
                record::make_key(&mut v.stack[start..], &mask)
            };
            if with_rowid || op.p2 == 0 {
                v.stack.truncate(start);
            }
            let mut m = Mem::null();
            m.set_str(key);
            v.push(m);
            if with_rowid && has_null && op.p2 > 0 {
                jump(next_pc, op.p2);
            }
        }
        IncrKey => {
            let top = v
                .stack
                .last_mut()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            top.make_owned();
            record::incr_key(&mut top.z);
        }

        // ------------------------------------------------------------------
        // Cursor lifecycle
        // ------------------------------------------------------------------
        OpenRead | OpenWrite => {
            // The root rides on the stack when P2 is zero; it is only
            // popped after a successful open so a Busy retry re-runs
            // cleanly.
            let root = if op.p2 > 0 {
                op.p2 as u32
            } else {
                v.stack
                    .last()
                    .map(|m| m.to_int())
                    .ok_or_else(|| Error::new(ErrorCode::Internal))? as u32
            };
            let db_idx = conn
                .db_index(op.p3.as_str().unwrap_or("main"))
                .ok_or_else(|| Error::with_message(ErrorCode::Error, "unknown database"))?;
            let writable = op.opcode == OpenWrite;
            let handle = conn.dbs[db_idx]
                .handle
                .as_mut()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let cursor = handle.cursor(root, writable)?;
            if op.p2 <= 0 {
                v.pop();
            }
            let mut cur = VCursor {
                cursor: Some(cursor),
                db_idx,
                ..VCursor::default()
            };
            cur.moved();
            *v.cursor_slot(op.p1 as usize) = Some(cur);
        }
        OpenTemp => {
            let mut handle = crate::storage::open_env(":memory:", true)?;
            let root = handle.create_table()?;
            let cursor = handle.cursor(root, true)?;
            let cur = VCursor {
                cursor: Some(cursor),
                temp_handle: Some(handle),
                ..VCursor::default()
            };
            *v.cursor_slot(op.p1 as usize) = Some(cur);
        }
        OpenPseudo => {
            let cur = VCursor {
                pseudo: true,
                ..VCursor::default()
            };
            *v.cursor_slot(op.p1 as usize) = Some(cur);
        }
        Close => {
            if let Some(slot) = v.cursors.get_mut(op.p1 as usize) {
                *slot = None;
            }
        }

        // ------------------------------------------------------------------
        // Cursor positioning
        // ------------------------------------------------------------------
        MoveTo | MoveLt => {
            let mut key_mem = v.pop();
            let cur = cursor_mut(v, op.p1)?;
            if let Some(c) = cur.cursor.as_mut() {
                cur.null_row = false;
                let int_key = key_mem.is_int();
                if int_key && op.p2 == 0 && op.opcode == MoveTo {
                    cur.deferred_moveto = Some(key_mem.i);
                    cur.recno_valid = false;
                } else {
                    let key = if int_key {
                        record::int_to_key(key_mem.i).to_vec()
                    } else {
                        key_mem.stringify();
                        key_mem.str_bytes().to_vec()
                    };
                    let seek = c.moveto(&key)?;
                    cur.deferred_moveto = None;
                    cur.recno_valid = int_key && seek == crate::storage::Seek::Found;
                    if int_key {
                        cur.last_recno = key_mem.i;
                    }
                    use crate::storage::Seek;
                    if op.opcode == MoveTo {
                        let off_end = match seek {
                            Seek::Found | Seek::Greater => false,
                            Seek::Less => {
                                cur.recno_valid = false;
                                !c.next()?
                            }
                            Seek::Empty => true,
                        };
                        if off_end && op.p2 > 0 {
                            jump(next_pc, op.p2);
                        }
                    } else {
                        // MoveLt: settle on the largest entry below the key.
                        let off_front = match seek {
                            Seek::Found | Seek::Greater => {
                                cur.recno_valid = false;
                                !c.prev()?
                            }
                            Seek::Less => false,
                            Seek::Empty => true,
                        };
                        if off_front && op.p2 > 0 {
                            jump(next_pc, op.p2);
                        }
                    }
                }
            }
        }
        Rewind | Last => {
            let cur = cursor_mut(v, op.p1)?;
            cur.moved();
            let has_entry = match cur.cursor.as_mut() {
                Some(c) => {
                    if op.opcode == Rewind {
                        c.first()?
                    } else {
                        c.last()?
                    }
                }
                None => false,
            };
            if !has_entry && op.p2 > 0 {
                jump(next_pc, op.p2);
            }
        }
        Next | Prev => {
            let cur = cursor_mut(v, op.p1)?;
            flush_deferred(cur)?;
            cur.moved();
            let more = match cur.cursor.as_mut() {
                Some(c) => {
                    if op.opcode == Next {
                        c.next()?
                    } else {
                        c.prev()?
                    }
                }
                None => false,
            };
            if more {
                jump(next_pc, op.p2);
            }
        }
        Found | NotFound | Distinct => {
            let pop = op.opcode != Distinct;
            let mut key_mem = if pop {
                v.pop()
            } else {
                v.stack
                    .last()
                    .cloned()
                    .ok_or_else(|| Error::new(ErrorCode::Internal))?
            };
            key_mem.stringify();
            let key = key_mem.str_bytes().to_vec();
            let cur = cursor_mut(v, op.p1)?;
            cur.moved();
            let found = match cur.cursor.as_mut() {
                Some(c) => c.moveto(&key)? == crate::storage::Seek::Found,
                None => false,
            };
            let go = if op.opcode == Found { found } else { !found };
            if go {
                jump(next_pc, op.p2);
            }
        }
        NotExists => {
            let key_mem = v.pop();
            let rowid = key_mem.to_int();
            let cur = cursor_mut(v, op.p1)?;
            cur.moved();
            let found = match cur.cursor.as_mut() {
                Some(c) => c.moveto(&record::int_to_key(rowid))? == crate::storage::Seek::Found,
                None => false,
            };
            if found {
                cur.last_recno = rowid;
                cur.recno_valid = true;
            } else {
                jump(next_pc, op.p2);
            }
        }
        IsUnique => {
            let key_mem = v.pop();
            let key = key_mem.str_bytes().to_vec();
            if key.len() < 4 {
                return Err(Error::new(ErrorCode::Internal));
            }
            let rowid = v
                .stack
                .last()
                .map(|m| m.to_int())
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let prefix = key[..key.len() - 4].to_vec();
            let cur = cursor_mut(v, op.p1)?;
            cur.moved();
            let mut conflict: Option<RowId> = None;
            if let Some(c) = cur.cursor.as_mut() {
                use crate::storage::Seek;
                let seek = c.moveto(&prefix)?;
                let positioned = match seek {
                    Seek::Found | Seek::Greater => c.valid(),
                    Seek::Less => c.next()?,
                    Seek::Empty => false,
                };
                if positioned && c.key_compare(&prefix, true)? == Ordering::Equal {
                    let other = record::idx_key_rowid(&c.key()?)?;
                    if other != rowid {
                        conflict = Some(other);
                    }
                }
            }
            match conflict {
                None => jump(next_pc, op.p2),
                Some(other) => v.push(Mem::int(other)),
            }
        }
        NewRecno => {
            let rowid = new_recno(conn, v, op.p1)?;
            v.push(Mem::int(rowid));
        }

        // ------------------------------------------------------------------
        // Row I/O
        // ------------------------------------------------------------------
        Column => {
            let payload = if op.p1 < 0 {
                let depth = (-op.p1 - 1) as usize;
                let idx = v
                    .stack
                    .len()
                    .checked_sub(1 + depth)
                    .ok_or_else(|| Error::new(ErrorCode::Internal))?;
                Some(v.stack[idx].str_bytes().to_vec())
            } else {
                let cur = cursor_mut(v, op.p1)?;
                cursor_payload(cur)?
            };
            match payload {
                None => v.push(Mem::null()),
                Some(rec) => match record::record_field(&rec, op.p2 as usize)? {
                    None => v.push(Mem::null()),
                    Some(bytes) => {
                        let mut m = Mem::null();
                        m.set_str_ephem(bytes);
                        m.make_owned();
                        v.push(m);
                    }
                },
            }
        }
        Recno => {
            let cur = cursor_mut(v, op.p1)?;
            flush_deferred(cur)?;
            if cur.null_row {
                v.push(Mem::null());
            } else if cur.recno_valid {
                let last_recno = cur.last_recno;
                v.push(Mem::int(last_recno));
            } else if cur.pseudo {
                let pseudo_key = cur.pseudo_key;
                v.push(Mem::int(pseudo_key));
            } else {
                match cur.cursor.as_mut() {
                    Some(c) if c.valid() => {
                        let key = c.key()?;
                        v.push(Mem::int(record::key_to_int(&key)));
                    }
                    _ => v.push(Mem::null()),
                }
            }
        }
        FullKey | RowKey => {
            let cur = cursor_mut(v, op.p1)?;
            flush_deferred(cur)?;
            let key = if cur.pseudo {
                Some(record::int_to_key(cur.pseudo_key).to_vec())
            } else {
                match cur.cursor.as_mut() {
                    Some(c) if c.valid() => Some(c.key()?),
                    _ => None,
                }
            };
            match key {
                Some(k) => {
                    let mut m = Mem::null();
                    m.set_str(k);
                    v.push(m);
                }
                None => v.push(Mem::null()),
            }
        }
        RowData => {
            let cur = cursor_mut(v, op.p1)?;
            match cursor_payload(cur)? {
                Some(d) => {
                    let mut m = Mem::null();
                    m.set_str(d);
                    v.push(m);
                }
                None => v.push(Mem::null()),
            }
        }
        NullRow => {
            let cur = cursor_mut(v, op.p1)?;
            cur.null_row = true;
            cur.recno_valid = false;
        }
        KeyAsData => {
            let cur = cursor_mut(v, op.p1)?;
            cur.key_as_data = op.p2 != 0;
        }
        // P2 bit 0 counts the change, bit 1 records the last-insert
        // row id.
        PutIntKey | PutStrKey => {
            let mut data = v.pop();
            let mut key_mem = v.pop();
            let key = if op.opcode == PutIntKey {
                let rowid = key_mem.to_int();
                if op.p2 & 2 != 0 {
                    conn.last_rowid = rowid;
                }
                record::int_to_key(rowid).to_vec()
            } else {
                key_mem.stringify();
                key_mem.str_bytes().to_vec()
            };
            data.stringify();
            let payload = data.str_bytes().to_vec();
            if op.p2 & 1 != 0 {
                v.n_change += 1;
            }
            let cur = cursor_mut(v, op.p1)?;
            if cur.pseudo {
                cur.pseudo_key = record::key_to_int(&key);
                cur.pseudo_data = payload;
                cur.null_row = false;
            } else {
                let c = cur
                    .cursor
                    .as_mut()
                    .ok_or_else(|| Error::new(ErrorCode::Internal))?;
                c.insert(&key, &payload)?;
                if op.opcode == PutIntKey {
                    let rowid = record::key_to_int(&key);
                    cur.last_recno = rowid;
                    cur.recno_valid = true;
                    if cur.next_rowid_valid && rowid >= cur.next_rowid {
                        cur.next_rowid_valid = false;
                    }
                }
            }
        }
        Delete => {
            let cur = cursor_mut(v, op.p1)?;
            flush_deferred(cur)?;
            if let Some(c) = cur.cursor.as_mut() {
                c.delete()?;
            }
            cur.recno_valid = false;
            if op.p2 != 0 {
                v.n_change += 1;
            }
        }
        IdxPut => {
            let mut key_mem = v.pop();
            key_mem.stringify();
            let key = key_mem.str_bytes().to_vec();
            if op.p2 != 0 && key.len() >= 4 {
                let prefix = key[..key.len() - 4].to_vec();
                let cur = cursor_mut(v, op.p1)?;
                if let Some(c) = cur.cursor.as_mut() {
                    use crate::storage::Seek;
                    let seek = c.moveto(&prefix)?;
                    let positioned = match seek {
                        Seek::Found | Seek::Greater => c.valid(),
                        Seek::Less => c.next()?,
                        Seek::Empty => false,
                    };
                    if positioned && c.key_compare(&prefix, true)? == Ordering::Equal {
                        let name = op.p3.as_str().unwrap_or("index");
                        return Err(Error::with_message(
                            ErrorCode::Constraint,
                            format!("duplicate index entry in index {}", name),
                        ));
                    }
                }
            }
            let cur = cursor_mut(v, op.p1)?;
            if let Some(c) = cur.cursor.as_mut() {
                c.insert(&key, b"")?;
            }
        }
        IdxDelete => {
            let mut key_mem = v.pop();
            key_mem.stringify();
            let key = key_mem.str_bytes().to_vec();
            let cur = cursor_mut(v, op.p1)?;
            if let Some(c) = cur.cursor.as_mut() {
                if c.moveto(&key)? == crate::storage::Seek::Found {
                    c.delete()?;
                }
            }
            cur.recno_valid = false;
        }
        IdxRecno => {
            let cur = cursor_mut(v, op.p1)?;
            match cur.cursor.as_mut() {
                Some(c) if c.valid() => {
                    let key = c.key()?;
                    v.push(Mem::int(record::idx_key_rowid(&key)?));
                }
                _ => v.push(Mem::null()),
            }
        }
        IdxGT | IdxGE | IdxLT => {
            let mut key_mem = v.pop();
            key_mem.stringify();
            let probe = key_mem.str_bytes().to_vec();
            let cur = cursor_mut(v, op.p1)?;
            let c = cur
                .cursor
                .as_mut()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            if c.valid() {
                let cmp = c.key_compare(&probe, true)?;
                let go = match op.opcode {
                    IdxGT => cmp == Ordering::Greater,
                    IdxGE => cmp != Ordering::Less,
                    _ => cmp == Ordering::Less,
                };
                if go {
                    jump(next_pc, op.p2);
                }
            }
        }
        IdxIsNull => {
            let top = v
                .stack
                .last()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let key = top.str_bytes();
            let mut any_null = false;
            let mut pos = 0usize;
            for _ in 0..op.p1 {
                if pos >= key.len() {
                    break;
                }
                if key[pos] == b'a' {
                    any_null = true;
                    break;
                }
                pos += 1;
                while pos < key.len() && key[pos] != 0 {
                    pos += 1;
                }
                pos += 1;
            }
            if any_null {
                jump(next_pc, op.p2);
            }
        }

        // ------------------------------------------------------------------
        // Schema
        // ------------------------------------------------------------------
        CreateTable | CreateIndex => {
            let db_idx = op.p1 as usize;
            let handle = conn
                .dbs
                .get_mut(db_idx)
                .and_then(|d| d.handle.as_mut())
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let root = if op.opcode == CreateTable {
                handle.create_table()?
            } else {
                handle.create_index()?
            };
            v.created_roots.push(root);
            v.push(Mem::int(root as i64));
        }
        Destroy | Clear => {
            let db_idx = op.p2 as usize;
            let handle = conn
                .dbs
                .get_mut(db_idx)
                .and_then(|d| d.handle.as_mut())
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            if op.opcode == Destroy {
                handle.drop_table(op.p1 as u32)?;
            } else {
                handle.clear_table(op.p1 as u32)?;
            }
        }

        // ------------------------------------------------------------------
        // Transactions
        // ------------------------------------------------------------------
        Transaction => {
            let db = conn
                .dbs
                .get_mut(op.p1 as usize)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            if let Some(h) = db.handle.as_mut() {
                if !h.in_txn() {
                    h.begin_txn()?;
                    v.undo_txn_on_error = true;
                }
            }
        }
        Commit => {
            if let Some(hook) = conn.commit_hook.as_mut() {
                if hook() {
                    return Err(Error::new(ErrorCode::Constraint));
                }
            }
            let db_idx = op.p1 as usize;
            let changes: Vec<_> = v.pending_schema.drain(..).collect();
            let mut roots = std::mem::take(&mut v.created_roots);
            conn.apply_schema_changes(changes, &mut roots);
            let db = conn
                .dbs
                .get_mut(db_idx)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            if let Some(h) = db.handle.as_mut() {
                if h.in_txn() {
                    h.commit_txn()?;
                }
            }
            db.in_txn = false;
        }
        Rollback => {
            let db_idx = op.p1 as usize;
            v.pending_schema.clear();
            let db = conn
                .dbs
                .get_mut(db_idx)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            if let Some(h) = db.handle.as_mut() {
                if h.in_txn() {
                    h.abort_txn()?;
                }
            }
            db.in_txn = false;
            db.reset_schema();
        }
        Checkpoint => {
            if let Some(h) = conn
                .dbs
                .get_mut(op.p1 as usize)
                .and_then(|d| d.handle.as_mut())
            {
                h.checkpoint()?;
            }
        }
        SetFormatVersion => {
            let m = v.pop();
            if let Some(h) = conn
                .dbs
                .get_mut(op.p1 as usize)
                .and_then(|d| d.handle.as_mut())
            {
                h.set_format_version(m.to_int() as u32)?;
            }
        }
        SetSchemaSignature => {
            let db = conn
                .dbs
                .get_mut(op.p1 as usize)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            if let Some(h) = db.handle.as_mut() {
                h.set_schema_sig(op.p2 as u32)?;
            }
            db.schema_sig = op.p2 as u32;
        }
        VerifySchemaSignature => {
            let db = conn
                .dbs
                .get_mut(op.p1 as usize)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let sig = match db.handle.as_ref() {
                Some(h) => h.get_schema_sig()?,
                None => 0,
            };
            if sig != op.p2 as u32 {
                db.reset_schema();
                return Err(Error::new(ErrorCode::Schema));
            }
            db.flags |= crate::schema::DbFlags::COOKIE_READ;
        }

        // ------------------------------------------------------------------
        // Keylist
        // ------------------------------------------------------------------
        ListWrite => {
            let m = v.pop();
            v.keylist.push_back(m.to_int());
        }
        ListRead => match v.keylist.pop_front() {
            Some(rowid) => v.push(Mem::int(rowid)),
            None => jump(next_pc, op.p2),
        },
        ListRewind => {}
        ListReset => v.keylist.clear(),
        ListPush => {
            let cur = std::mem::take(&mut v.keylist);
            v.keylist_stack.push(cur);
        }
        ListPop => {
            v.keylist = v.keylist_stack.pop().unwrap_or_default();
        }

        // ------------------------------------------------------------------
        // Sorter
        // ------------------------------------------------------------------
        SortPut => {
            let mut key = v.pop();
            let mut data = v.pop();
            key.stringify();
            data.stringify();
            v.sorter
                .put(key.str_bytes().to_vec(), data.str_bytes().to_vec());
        }
        SortMakeRec => {
            let n = op.p1 as usize;
            let start = v
                .stack
                .len()
                .checked_sub(n)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let rec = record::make_record(&mut v.stack[start..], None);
            v.stack.truncate(start);
            let mut m = Mem::null();
            m.set_str(rec);
            v.push(m);
        }
        SortMakeKey => {
            let mask = op.p3.as_str().unwrap_or("").to_string();
            let n = mask.len();
            let start = v
                .stack
                .len()
                .checked_sub(n)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let key = record::make_sort_key(&mut v.stack[start..], &mask);
            v.stack.truncate(start);
            let mut m = Mem::null();
            m.set_str(key);
            v.push(m);
        }
        Sort => v.sorter.sort(),
        SortNext => match v.sorter.next() {
            Some(entry) => {
                let mut m = Mem::null();
                m.set_str(entry.data);
                v.push(m);
            }
            None => jump(next_pc, op.p2),
        },
        SortCallback => {
            let rec_mem = v.pop();
            let rec = rec_mem.str_bytes().to_vec();
            let mut row = Vec::with_capacity(op.p1 as usize);
            for i in 0..op.p1 as usize {
                row.push(match record::record_field(&rec, i)? {
                    None => Value::Null,
                    Some(bytes) => {
                        Value::Text(std::string::String::from_utf8_lossy(&bytes).into_owned())
                    }
                });
            }
            v.result_row = row;
            v.n_callback += 1;
            return Ok(Flow::Row);
        }
        SortReset => v.sorter.reset(),

        // ------------------------------------------------------------------
        // Aggregator
        // ------------------------------------------------------------------
        AggReset => v.agg.reset(op.p2 as usize),
        AggInit => {
            if let Some(func) = op.p3.func() {
                v.agg.init_func(op.p2 as usize, func.clone());
            }
        }
        AggFunc => {
            let col_mem = v.pop();
            let col = col_mem.to_int() as usize;
            let n = op.p2 as usize;
            let start = v
                .stack
                .len()
                .checked_sub(n)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let args: Vec<Value> = v.stack[start..].iter().map(|m| m.as_value()).collect();
            v.stack.truncate(start);
            let func = op
                .p3
                .func()
                .cloned()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            v.agg.func_step(col, &func, &args);
        }
        AggFocus => {
            let mut key_mem = v.pop();
            key_mem.stringify();
            if v.agg.focus(key_mem.str_bytes()) {
                jump(next_pc, op.p2);
            }
        }
        AggSet => {
            let mut m = v.pop();
            m.make_owned();
            if let Some(cell) = v.agg.cell_mut(op.p2 as usize) {
                cell.mem = m;
            }
        }
        AggGet => {
            let m = v
                .agg
                .cell_value(op.p2 as usize)
                .unwrap_or_default();
            v.push(m);
        }
        AggNext => {
            if !v.agg.next() {
                jump(next_pc, op.p2);
            }
        }

        // ------------------------------------------------------------------
        // Sets
        // ------------------------------------------------------------------
        SetInsert => {
            let key = match op.p3.as_str() {
                Some(s) => s.as_bytes().to_vec(),
                None => {
                    let mut m = v.pop();
                    m.stringify();
                    m.str_bytes().to_vec()
                }
            };
            v.set_slot(op.p1 as usize).insert(key);
        }
        SetFound | SetNotFound => {
            let mut m = v.pop();
            m.stringify();
            let key = m.str_bytes().to_vec();
            let found = v
                .sets
                .get(op.p1 as usize)
                .map(|s| s.contains(&key))
                .unwrap_or(false);
            let go = if op.opcode == SetFound { found } else { !found };
            if go {
                jump(next_pc, op.p2);
            }
        }
        SetFirst => {
            let slot = v.set_slot(op.p1 as usize);
            if !slot.rewind() {
                jump(next_pc, op.p2);
            } else {
                let bytes = slot.next().map(<[u8]>::to_vec).unwrap_or_default();
                let mut m = Mem::null();
                m.set_str(bytes);
                v.push(m);
            }
        }
        SetNext => {
            let item = v.set_slot(op.p1 as usize).next().map(<[u8]>::to_vec);
            if let Some(bytes) = item {
                let mut m = Mem::null();
                m.set_str(bytes);
                v.push(m);
                jump(next_pc, op.p2);
            }
        }

        // ------------------------------------------------------------------
        // Memory cells
        // ------------------------------------------------------------------
        MemStore => {
            let mut m = if op.p2 != 0 {
                v.pop()
            } else {
                v.stack
                    .last()
                    .cloned()
                    .ok_or_else(|| Error::new(ErrorCode::Internal))?
            };
            m.make_owned();
            *v.mem_cell(op.p1 as usize) = m;
        }
        MemLoad => {
            let m = v.mem_cell(op.p1 as usize).clone();
            v.push(m);
        }
        MemIncr => {
            let cell = v.mem_cell(op.p1 as usize);
            cell.integerify();
            cell.set_int(cell.i + 1);
            if op.p2 > 0 && cell.i > 0 {
                jump(next_pc, op.p2);
            }
        }

        // ------------------------------------------------------------------
        // Results
        // ------------------------------------------------------------------
        Callback => {
            let n = op.p1 as usize;
            let start = v
                .stack
                .len()
                .checked_sub(n)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let row: Vec<Value> = v.stack[start..].iter().map(|m| m.as_value()).collect();
            v.stack.truncate(start);
            v.result_row = row;
            v.n_callback += 1;
            return Ok(Flow::Row);
        }
        NullCallback => {
            // Headers were fixed at prepare time; nothing more to do
            // when at least one row has been surfaced.
            let _ = op.p1;
        }
        ColumnName => {}

        // ------------------------------------------------------------------
        // Bulk load
        // ------------------------------------------------------------------
        FileOpen => {
            let path = op
                .p3
                .as_str()
                .ok_or_else(|| Error::with_message(ErrorCode::Error, "missing file name"))?;
            let reader: Box<dyn std::io::BufRead> = if path.eq_ignore_ascii_case("stdin") {
                Box::new(std::io::BufReader::new(std::io::stdin()))
            } else {
                match std::fs::File::open(path) {
                    Ok(f) => Box::new(std::io::BufReader::new(f)),
                    Err(_) => {
                        return Err(Error::with_message(
                            ErrorCode::Error,
                            format!("unable to open file: {}", path),
                        ))
                    }
                }
            };
            v.file = Some(reader);
        }
        FileRead => {
            let delim = op.p3.as_str().unwrap_or("\t").to_string();
            let n_field = op.p1 as usize;
            let mut line = std::string::String::new();
            let eof = match v.file.as_mut() {
                Some(f) => {
                    use std::io::BufRead;
                    f.read_line(&mut line).unwrap_or(0) == 0
                }
                None => true,
            };
            if eof {
                jump(next_pc, op.p2);
            } else {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                v.file_fields = split_copy_line(&line, &delim, n_field);
            }
        }
        FileColumn => {
            let val = v
                .file_fields
                .get(op.p1 as usize)
                .cloned()
                .unwrap_or(None);
            match val {
                Some(s) => v.push(Mem::text(&s)),
                None => v.push(Mem::null()),
            }
        }

        // ------------------------------------------------------------------
        // Functions
        // ------------------------------------------------------------------
        Function => {
            let n = op.p1 as usize;
            let start = v
                .stack
                .len()
                .checked_sub(n)
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let args: Vec<Value> = v.stack[start..].iter().map(|m| m.as_value()).collect();
            v.stack.truncate(start);
            let func = op
                .p3
                .func()
                .cloned()
                .ok_or_else(|| Error::new(ErrorCode::Internal))?;
            let mut ctx = crate::func::FuncContext::new();
            match &func.func {
                Some(f) => f(&mut ctx, &args),
                None => return Err(Error::new(ErrorCode::Internal)),
            }
            if let Some((code, msg)) = ctx.error {
                return Err(Error::with_message(code, msg));
            }
            v.push(Mem::from_value(&ctx.result));
        }
    }
    Ok(Flow::Continue)
}

// ============================================================================
// Row-id Allocation
// ============================================================================

/// Find an unused row id: largest-plus-one first, then bounded random
/// probing biased toward the last row id for insert locality.
fn new_recno(conn: &mut Connection, v: &mut Vdbe, cursor_idx: i32) -> Result<RowId> {
    let cur = cursor_mut(v, cursor_idx)?;
    let c = match cur.cursor.as_mut() {
        Some(c) => c,
        None => return Ok(0),
    };
    if !cur.use_random_rowid {
        let candidate = if cur.next_rowid_valid {
            cur.next_rowid
        } else if !c.last()? {
            1
        } else {
            let max = record::key_to_int(&c.key()?);
            if max >= MAX_ROWID {
                cur.use_random_rowid = true;
                0
            } else {
                max + 1
            }
        };
        if !cur.use_random_rowid {
            if candidate < MAX_ROWID {
                cur.next_rowid = candidate + 1;
                cur.next_rowid_valid = true;
            } else {
                cur.next_rowid_valid = false;
            }
            cur.last_recno = candidate;
            cur.recno_valid = false;
            return Ok(candidate);
        }
    }
    // Random probing, first near the previous row id, then anywhere.
    let base = cur.last_recno;
    for attempt in 0..1000 {
        let candidate = if attempt < 5 && base > 0 && base < MAX_ROWID - 100 {
            base + 1 + conn.prng.below(100)
        } else {
            1 + conn.prng.below(MAX_ROWID - 1)
        };
        if c.moveto(&record::int_to_key(candidate))? != crate::storage::Seek::Found {
            cur.last_recno = candidate;
            cur.recno_valid = false;
            return Ok(candidate);
        }
    }
    Err(Error::new(ErrorCode::Full))
}

// ============================================================================
// COPY Line Splitting
// ============================================================================

/// Split one COPY input line into fields: `delim` separates fields,
/// backslash escapes the next character (`\t`, `\n`, `\\`), and a field
/// that is exactly `\N` reads as NULL.
fn split_copy_line(line: &str, delim: &str, n_field: usize) -> Vec<Option<String>> {
    let delim_ch = delim.chars().next().unwrap_or('\t');
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut raw = String::new();
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            raw.push(ch);
            match chars.next() {
                Some('n') => {
                    cur.push('\n');
                    raw.push('n');
                }
                Some('t') => {
                    cur.push('\t');
                    raw.push('t');
                }
                Some('\\') => {
                    cur.push('\\');
                    raw.push('\\');
                }
                Some(other) => {
                    cur.push(other);
                    raw.push(other);
                }
                None => break,
            }
        } else if ch == delim_ch {
            fields.push(finish_copy_field(cur, raw));
            cur = String::new();
            raw = String::new();
        } else {
            cur.push(ch);
            raw.push(ch);
        }
    }
    fields.push(finish_copy_field(cur, raw));
    fields.resize(n_field.max(fields.len()), None);
    fields
}

fn finish_copy_field(value: String, raw: String) -> Option<String> {
    if raw == "\\N" {
        None
    } else {
        Some(value)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_copy_line() {
        let f = split_copy_line("a\tb\t\\N\tc\\td", "\t", 4);
        assert_eq!(f[0], Some("a".to_string()));
        assert_eq!(f[1], Some("b".to_string()));
        assert_eq!(f[2], None);
        assert_eq!(f[3], Some("c\td".to_string()));
    }

    #[test]
    fn test_split_copy_line_pads_missing_fields() {
        let f = split_copy_line("only", "\t", 3);
        assert_eq!(f.len(), 3);
        assert_eq!(f[0], Some("only".to_string()));
        assert_eq!(f[1], None);
    }

    #[test]
    fn test_three_valued() {
        assert_eq!(three_valued(&Mem::int(1), None), Some(true));
        assert_eq!(three_valued(&Mem::int(0), None), Some(false));
        assert_eq!(three_valued(&Mem::null(), None), None);
        assert_eq!(three_valued(&Mem::null(), Some(true)), Some(true));
    }
}
