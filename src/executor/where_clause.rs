//! WHERE clause processing
//!
//! Generates the nested-loop scan code for a FROM clause: the WHERE
//! expression is split into AND-connected terms, each table picks at
//! most one access path (row-id lookup, equality-matched index, or full
//! scan, in that order of preference), and remaining terms compile to
//! jumps at the innermost level where their cursors exist. The caller
//! emits the loop body between `where_begin` and `where_end` and gets
//! `continue`/`break` labels for LIMIT/OFFSET and early exits.

use crate::error::Result;
use crate::executor::expr::{code_expr, code_expr_if_false, type_mask};
use crate::executor::prepare::{p3_text, Parse};
use crate::parser::ast::{Expr, ExprOp, JoinType, SrcList};
use crate::schema::Index;
use crate::vdbe::Opcode;

// ============================================================================
// Terms
// ============================================================================

/// One AND-connected conjunct of the WHERE clause.
pub struct WhereTerm {
    pub expr: Expr,
    /// Cursor of the join's right table when this term came from an ON
    /// or USING clause (the "from-join" marker)
    pub join_cursor: Option<i32>,
    consumed: bool,
}

impl WhereTerm {
    pub fn plain(expr: Expr) -> Self {
        Self {
            expr,
            join_cursor: None,
            consumed: false,
        }
    }

    pub fn from_join(expr: Expr, cursor: i32) -> Self {
        Self {
            expr,
            join_cursor: Some(cursor),
            consumed: false,
        }
    }
}

/// Split an expression on its top-level ANDs.
pub fn split_and_terms(e: &Expr, out: &mut Vec<Expr>) {
    if e.op == ExprOp::And {
        if let Some(l) = e.left.as_deref() {
            split_and_terms(l, out);
        }
        if let Some(r) = e.right.as_deref() {
            split_and_terms(r, out);
        }
    } else {
        out.push(e.clone());
    }
}

/// True when the expression references no cursor outside `allowed` and
/// contains no subquery.
fn uses_only(e: &Expr, allowed: &[i32]) -> bool {
    let mut ok = true;
    e.walk(&mut |node| {
        if node.select.is_some() {
            ok = false;
            return false;
        }
        if matches!(node.op, ExprOp::Column | ExprOp::AggFunction)
            && !allowed.contains(&node.table_idx)
        {
            ok = false;
            return false;
        }
        true
    });
    ok
}

/// The cursors an expression touches.
fn cursors_of(e: &Expr) -> Vec<i32> {
    let mut out = Vec::new();
    e.walk(&mut |node| {
        if node.op == ExprOp::Column && !out.contains(&node.table_idx) {
            out.push(node.table_idx);
        }
        true
    });
    out
}

/// If `term` is `column = expr` over `cursor` with the other side
/// computable from `earlier` cursors, return (column, rhs).
fn eq_term_for(term: &WhereTerm, cursor: i32, earlier: &[i32]) -> Option<(i32, Expr)> {
    let e = &term.expr;
    if e.op != ExprOp::Eq {
        return None;
    }
    let l = e.left.as_deref()?;
    let r = e.right.as_deref()?;
    if l.op == ExprOp::Column && l.table_idx == cursor && uses_only(r, earlier) {
        return Some((l.column_idx, r.clone()));
    }
    if r.op == ExprOp::Column && r.table_idx == cursor && uses_only(l, earlier) {
        return Some((r.column_idx, l.clone()));
    }
    None
}

// ============================================================================
// Levels
// ============================================================================

struct WhereLevel {
    cursor: i32,
    idx_cursor: i32,
    /// Row-id lookup levels have no scan loop
    lookup: bool,
    /// Loop-top address for the closing Next
    top_addr: usize,
    /// Re-entry point for the LEFT JOIN null-row pass
    body_label: i32,
    cont_label: i32,
    left_join_flag: i32,
    /// Where an empty LEFT JOIN scan lands: just before the null-row
    /// check rather than past it
    after_loop: i32,
}

/// Handle returned by `where_begin`; consumed by `where_end`.
pub struct WhereInfo {
    levels: Vec<WhereLevel>,
    /// Jump here to abandon the whole scan
    pub brk: i32,
    /// Jump here to skip to the next candidate row
    pub cont: i32,
}

// ============================================================================
// Loop Construction
// ============================================================================

/// Open the scan loops. `src` must have cursors assigned and tables
/// resolved; `terms` is the split WHERE clause including folded join
/// conditions. When `open_cursors` is false the caller has opened them
/// already (DELETE/UPDATE share one write cursor).
pub fn where_begin(
    p: &mut Parse,
    src: &SrcList,
    terms: &mut Vec<WhereTerm>,
    open_cursors: bool,
) -> Result<WhereInfo> {
    let brk = p.v.make_label();
    let mut levels: Vec<WhereLevel> = Vec::new();
    let mut earlier: Vec<i32> = Vec::new();

    for (i, item) in src.items.iter().enumerate() {
        let cursor = item.cursor;
        let cont_label = p.v.make_label();
        let brk_label = if i == 0 {
            brk
        } else {
            levels[i - 1].cont_label
        };
        let is_left = item.jointype.contains(JoinType::LEFT);
        let table = item.table.as_deref();

        // A LEFT JOIN right table needs its match flag cleared before
        // the scan opens.
        let left_join_flag = if is_left {
            let flag = p.alloc_mem();
            p.v.add_op_p3(Opcode::String, 0, 0, crate::vdbe::ops::P3::None);
            p.v.add_op(Opcode::MemStore, flag, 1);
            flag
        } else {
            -1
        };

        if open_cursors {
            if let Some(t) = table {
                if !t.is_transient {
                    p.code_verify_schema(t.db_idx);
                    let db_name = p.conn.dbs[t.db_idx].name.clone();
                    p.v.add_op_p3(
                        Opcode::OpenRead,
                        cursor,
                        t.tnum as i32,
                        p3_text(db_name),
                    );
                }
            }
        }

        // Pick the access path. LEFT JOIN right tables always scan so
        // the null-row pass has a plain loop to fall out of.
        let mut lookup = false;
        let mut idx_cursor = -1;
        let mut top_addr = 0usize;
        let mut after_loop = brk_label;

        let rowid_term = if is_left {
            None
        } else {
            terms.iter().enumerate().find_map(|(ti, t)| {
                if t.consumed {
                    return None;
                }
                eq_term_for(t, cursor, &earlier)
                    .filter(|(col, _)| *col == -1)
                    .map(|(_, rhs)| (ti, rhs))
            })
        };

        if let Some((ti, rhs)) = rowid_term {
            terms[ti].consumed = true;
            lookup = true;
            code_expr(p, &rhs)?;
            p.v.add_op(Opcode::MustBeInt, 1, brk_label);
            p.v.add_op(Opcode::NotExists, cursor, brk_label);
        } else if let Some((index, term_ids, rhses)) = (!is_left)
            .then(|| pick_index(p, table, cursor, terms, &earlier))
            .flatten()
        {
            for ti in &term_ids {
                terms[*ti].consumed = true;
            }
            idx_cursor = p.alloc_cursor();
            let db_name = p.conn.dbs[index.db_idx].name.clone();
            p.v.add_op_p3(
                Opcode::OpenRead,
                idx_cursor,
                index.tnum as i32,
                p3_text(db_name),
            );
            let mask: String = table
                .map(|t| {
                    index
                        .columns
                        .iter()
                        .map(|&c| type_mask(t.columns[c].sort_class))
                        .collect()
                })
                .unwrap_or_default();
            for rhs in &rhses {
                code_expr(p, rhs)?;
            }
            let key_mem = p.alloc_mem();
            p.v
                .add_op_p3(Opcode::MakeKey, rhses.len() as i32, 0, p3_text(mask));
            p.v.add_op(Opcode::MemStore, key_mem, 1);
            p.v.add_op(Opcode::MemLoad, key_mem, 0);
            p.v.add_op(Opcode::MoveTo, idx_cursor, brk_label);
            top_addr = p.v.current_addr();
            p.v.add_op(Opcode::MemLoad, key_mem, 0);
            p.v.add_op(Opcode::IdxGT, idx_cursor, brk_label);
            p.v.add_op(Opcode::IdxRecno, idx_cursor, 0);
            p.v.add_op(Opcode::MoveTo, cursor, 0);
        } else {
            let empty_target = if is_left {
                // An empty right table must still reach the null-row
                // pass.
                p.v.make_label()
            } else {
                brk_label
            };
            after_loop = empty_target;
            p.v.add_op(Opcode::Rewind, cursor, empty_target);
            top_addr = p.v.current_addr();
        }

        // Join conditions attached to this table filter real matches
        // only; the null-row pass re-enters past them.
        for t in terms.iter_mut() {
            if t.consumed || t.join_cursor != Some(cursor) {
                continue;
            }
            t.consumed = true;
            let expr = t.expr.clone();
            code_expr_if_false(p, &expr, cont_label, true)?;
        }

        let body_label = p.v.make_label();
        p.v.resolve_label(body_label);
        if is_left {
            p.v.add_op(Opcode::Integer, 1, 0);
            p.v.add_op(Opcode::MemStore, left_join_flag, 1);
        }

        earlier.push(cursor);

        // Plain WHERE terms fire at the first level where all their
        // cursors are bound; they also filter null-extended rows.
        for t in terms.iter_mut() {
            if t.consumed || t.join_cursor.is_some() {
                continue;
            }
            let used = cursors_of(&t.expr);
            if used.iter().all(|c| earlier.contains(c)) && uses_only(&t.expr, &earlier) {
                t.consumed = true;
                let expr = t.expr.clone();
                code_expr_if_false(p, &expr, cont_label, true)?;
            }
        }

        levels.push(WhereLevel {
            cursor,
            idx_cursor,
            lookup,
            top_addr,
            body_label,
            cont_label,
            left_join_flag,
            after_loop,
        });
    }

    let cont = levels
        .last()
        .map(|l| l.cont_label)
        .unwrap_or(brk);
    Ok(WhereInfo { levels, brk, cont })
}

/// Find an index on `table` whose every column is matched by an
/// equality term computable from earlier levels.
fn pick_index(
    p: &Parse,
    table: Option<&crate::schema::Table>,
    cursor: i32,
    terms: &[WhereTerm],
    earlier: &[i32],
) -> Option<(Index, Vec<usize>, Vec<Expr>)> {
    let table = table?;
    if table.is_transient {
        return None;
    }
    let db = p.conn.dbs.get(table.db_idx)?;
    for idx_name in &table.indices {
        let index = match db.indices.find(idx_name) {
            Some(ix) => ix.clone(),
            None => continue,
        };
        let mut term_ids = Vec::new();
        let mut rhses = Vec::new();
        let mut all = true;
        for &col in &index.columns {
            let hit = terms.iter().enumerate().find_map(|(ti, t)| {
                if t.consumed || term_ids.contains(&ti) {
                    return None;
                }
                eq_term_for(t, cursor, earlier)
                    .filter(|(c, _)| *c == col as i32)
                    .map(|(_, rhs)| (ti, rhs))
            });
            match hit {
                Some((ti, rhs)) => {
                    term_ids.push(ti);
                    rhses.push(rhs);
                }
                None => {
                    all = false;
                    break;
                }
            }
        }
        if all && !index.columns.is_empty() {
            return Some((index, term_ids, rhses));
        }
    }
    None
}

/// Close the loops opened by `where_begin`, innermost first, emitting
/// the LEFT JOIN null-row pass where needed.
pub fn where_end(p: &mut Parse, info: WhereInfo) {
    for level in info.levels.iter().rev() {
        p.v.resolve_label(level.cont_label);
        if !level.lookup {
            let scan_cursor = if level.idx_cursor >= 0 {
                level.idx_cursor
            } else {
                level.cursor
            };
            p.v.add_op(Opcode::Next, scan_cursor, level.top_addr as i32);
        }
        if level.left_join_flag >= 0 {
            p.v.resolve_label(level.after_loop);
            let skip = p.v.make_label();
            p.v.add_op(Opcode::MemLoad, level.left_join_flag, 0);
            p.v.add_op(Opcode::NotNull, 1, skip);
            p.v.add_op(Opcode::NullRow, level.cursor, 0);
            if level.idx_cursor >= 0 {
                p.v.add_op(Opcode::NullRow, level.idx_cursor, 0);
            }
            p.v.add_op(Opcode::Goto, 0, level.body_label);
            p.v.resolve_label(skip);
        }
    }
    p.v.resolve_label(info.brk);
}
