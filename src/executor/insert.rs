//! INSERT code generation
//!
//! Emits the row-assembly protocol shared with COPY and UPDATE: the row
//! id goes on the stack first (and into a memory cell), the column
//! values above it, then constraint checks run, index keys are built by
//! duplicating values in place, and finally MakeRecord + PutIntKey
//! write the row. `INSERT INTO ... SELECT` materializes the source into
//! a temp table and replays it row by row.

use crate::api::connection::AuthAction;
use crate::error::Result;
use crate::executor::build::conflict_halt_action;
use crate::executor::expr::{code_expr, type_mask};
use crate::executor::prepare::{p3_text, Parse};
use crate::executor::select::{compile_select, SelectDest};
use crate::parser::ast::{InsertSource, SrcList, Stmt};
use crate::parser::resolve::{expr_check, resolve_ids};
use crate::schema::{ConflictAction, Index, Table};
use crate::vdbe::ops::P3;
use crate::vdbe::Opcode;

// ============================================================================
// Row Writer
// ============================================================================

/// Cursors and cells needed to write rows into a table and its indices.
pub struct RowWriter {
    pub table: Table,
    pub db_idx: usize,
    pub tab_cur: i32,
    pub indices: Vec<(i32, Index)>,
    pub recno_mem: i32,
}

/// Open write cursors on a table and every index it carries.
pub fn open_table_for_writing(p: &mut Parse, table: &Table, db_idx: usize) -> Result<RowWriter> {
    let db_name = p.conn.dbs[db_idx].name.clone();
    let tab_cur = p.alloc_cursor();
    p.v
        .add_op_p3(Opcode::OpenWrite, tab_cur, table.tnum as i32, p3_text(db_name.clone()));
    let mut indices = Vec::new();
    for idx_name in &table.indices {
        if let Some(ix) = p.conn.dbs[db_idx].indices.find(idx_name).cloned() {
            let icur = p.alloc_cursor();
            p.v
                .add_op_p3(Opcode::OpenWrite, icur, ix.tnum as i32, p3_text(db_name.clone()));
            indices.push((icur, ix));
        }
    }
    let recno_mem = p.alloc_mem();
    Ok(RowWriter {
        table: table.clone(),
        db_idx,
        tab_cur,
        indices,
        recno_mem,
    })
}

/// The action a violated constraint applies: the statement's OR-clause
/// when given, else the constraint's own declaration (BEGIN ON CONFLICT
/// supplies the statement default).
fn effective_action(stmt_action: ConflictAction, declared: Option<ConflictAction>) -> ConflictAction {
    if stmt_action != ConflictAction::Abort {
        stmt_action
    } else {
        declared.unwrap_or(ConflictAction::Abort)
    }
}

/// Emit NOT NULL checks, unique-index checks, index-key inserts, and
/// the final record write. On entry the stack holds
/// `[recno, v0 .. v(n-1)]` with the recno also in `w.recno_mem`; on
/// exit the row is written and the stack is clean. `skip` receives
/// control when a constraint with the Ignore action fires, and
/// `put_flags` becomes PutIntKey's P2 (count / last-insert bits).
pub fn code_row_insert(
    p: &mut Parse,
    w: &RowWriter,
    stmt_action: ConflictAction,
    skip: i32,
    put_flags: i32,
) -> Result<()> {
    let n = w.table.columns.len();

    // NOT NULL enforcement.
    for (c, col) in w.table.columns.iter().enumerate() {
        if !col.not_null || Some(c) == w.table.ipk {
            continue;
        }
        let action = effective_action(stmt_action, None);
        p.v.add_op(Opcode::Dup, (n - 1 - c) as i32, 0);
        let ok = p.v.make_label();
        p.v.add_op(Opcode::NotNull, 1, ok);
        if action == ConflictAction::Ignore {
            p.v.add_op(Opcode::Pop, (n + 1) as i32, 0);
            p.v.add_op(Opcode::Goto, 0, skip);
        } else {
            p.v.add_op_p3(
                Opcode::Halt,
                19,
                conflict_halt_action(action),
                p3_text(format!("{}.{} may not be NULL", w.table.name, col.name)),
            );
        }
        p.v.resolve_label(ok);
    }

    // Row-id uniqueness: an explicit INTEGER PRIMARY KEY value may
    // collide with an existing row.
    {
        let action = effective_action(stmt_action, None);
        p.v.add_op(Opcode::MemLoad, w.recno_mem, 0);
        let ok = p.v.make_label();
        p.v.add_op(Opcode::NotExists, w.tab_cur, ok);
        match action {
            ConflictAction::Ignore => {
                p.v.add_op(Opcode::Pop, (n + 1) as i32, 0);
                p.v.add_op(Opcode::Goto, 0, skip);
            }
            ConflictAction::Replace => {
                // The cursor sits on the doomed row; clear its index
                // entries and remove it before writing the new one.
                crate::executor::delete::code_delete_index_entries(p, w);
                p.v.add_op(Opcode::Delete, w.tab_cur, 0);
            }
            _ => {
                p.v.add_op_p3(
                    Opcode::Halt,
                    19,
                    conflict_halt_action(action),
                    p3_text(format!("PRIMARY KEY must be unique in table {}", w.table.name)),
                );
            }
        }
        p.v.resolve_label(ok);
    }

    // Index maintenance with uniqueness checks.
    for (icur, ix) in &w.indices {
        let m = ix.columns.len();
        let mask: String = ix
            .columns
            .iter()
            .map(|&c| type_mask(w.table.columns[c].sort_class))
            .collect();
        // [.., R] then the key's rowid and fields.
        p.v.add_op(Opcode::MemLoad, w.recno_mem, 0);
        p.v.add_op(Opcode::MemLoad, w.recno_mem, 0);
        for (k, &c) in ix.columns.iter().enumerate() {
            let depth = (n - 1 - c) + 2 + k;
            p.v.add_op(Opcode::Dup, depth as i32, 0);
        }
        p.v.add_op_p3(Opcode::MakeIdxKey, m as i32, 0, p3_text(mask));
        if let Some(declared) = ix.on_error {
            let action = effective_action(stmt_action, Some(declared));
            p.v.add_op(Opcode::Dup, 0, 0);
            let ok = p.v.make_label();
            p.v.add_op(Opcode::IsUnique, *icur, ok);
            // Conflict: the offending row id is on top.
            if action == ConflictAction::Ignore {
                p.v.add_op(Opcode::Pop, (3 + n + 1) as i32, 0);
                p.v.add_op(Opcode::Goto, 0, skip);
            } else {
                p.v.add_op_p3(
                    Opcode::Halt,
                    19,
                    conflict_halt_action(action),
                    p3_text(format!("uniqueness constraint failed: {}", ix.name)),
                );
            }
            p.v.resolve_label(ok);
        }
        p.v
            .add_op_p3(Opcode::IdxPut, *icur, 0, p3_text(ix.name.clone()));
        p.v.add_op(Opcode::Pop, 1, 0);
    }

    p.v.add_op(Opcode::MakeRecord, n as i32, 0);
    p.v.add_op(Opcode::PutIntKey, w.tab_cur, put_flags);
    Ok(())
}

// ============================================================================
// INSERT Statement
// ============================================================================

pub fn compile_insert(p: &mut Parse, stmt: &Stmt) -> Result<()> {
    let Stmt::Insert {
        on_error,
        table: tname,
        columns,
        source,
    } = stmt
    else {
        return Err(p.error("not an INSERT"));
    };
    let stmt_action = if *on_error == ConflictAction::Abort {
        p.conn.default_conflict
    } else {
        *on_error
    };

    let (db_idx, table) = p.find_table(tname.database.as_deref(), &tname.name)?;
    if table.is_view() {
        return Err(p.error(format!("view {} may not be modified", table.name)));
    }
    let db_name = p.conn.dbs[db_idx].name.clone();
    p.conn
        .authorize(AuthAction::Insert, &table.name, "", &db_name)?;

    // Map targeted columns to table positions.
    let n = table.columns.len();
    let mut target: Vec<Option<usize>> = vec![None; n];
    let n_values;
    match columns {
        None => {
            for (c, slot) in target.iter_mut().enumerate() {
                *slot = Some(c);
            }
            n_values = n;
        }
        Some(ids) => {
            n_values = ids.names.len();
            for (j, cname) in ids.names.iter().enumerate() {
                match table.column_index(cname) {
                    Some(c) => {
                        if target[c].is_some() {
                            return Err(
                                p.error(format!("duplicate column name: {}", cname))
                            );
                        }
                        target[c] = Some(j);
                    }
                    None => {
                        return Err(p.error(format!(
                            "table {} has no column named {}",
                            table.name, cname
                        )));
                    }
                }
            }
        }
    }

    p.code_verify_schema(db_idx);
    p.code_begin_write(db_idx);

    match source {
        InsertSource::Values(values) => {
            if values.len() != n_values {
                return Err(p.error(format!(
                    "table {} has {} columns but {} values were supplied",
                    table.name,
                    n_values,
                    values.len()
                )));
            }
            let mut values = values.clone();
            let empty_src = SrcList::default();
            for item in &mut values.items {
                resolve_ids(p, &empty_src, None, &mut item.expr)?;
                expr_check(p, false, &mut item.expr)?;
            }
            let w = open_table_for_writing(p, &table, db_idx)?;

            // Row id: the INTEGER PRIMARY KEY value when supplied and
            // non-NULL, else a fresh one.
            match table.ipk.and_then(|c| target[c]) {
                Some(j) => {
                    code_expr(p, &values.items[j].expr)?;
                    let fresh = p.v.make_label();
                    let have = p.v.make_label();
                    p.v.add_op(Opcode::IsNull, -1, fresh);
                    p.v.add_op(Opcode::MustBeInt, 0, 0);
                    p.v.add_op(Opcode::Goto, 0, have);
                    p.v.resolve_label(fresh);
                    p.v.add_op(Opcode::Pop, 1, 0);
                    p.v.add_op(Opcode::NewRecno, w.tab_cur, 0);
                    p.v.resolve_label(have);
                }
                None => {
                    p.v.add_op(Opcode::NewRecno, w.tab_cur, 0);
                }
            }
            p.v.add_op(Opcode::MemStore, w.recno_mem, 0);

            for (c, col) in table.columns.iter().enumerate() {
                if Some(c) == table.ipk {
                    // The key carries the value; the record holds NULL.
                    p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
                } else if let Some(j) = target[c] {
                    code_expr(p, &values.items[j].expr)?;
                } else if let Some(d) = &col.default_value {
                    code_expr(p, d)?;
                } else {
                    p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
                }
            }
            let skip = p.v.make_label();
            code_row_insert(p, &w, stmt_action, skip, 3)?;
            p.v.resolve_label(skip);
        }
        InsertSource::Select(sel) => {
            let src_cur = p.alloc_cursor();
            let mut sel = (**sel).clone();
            let n_src = compile_select(p, &mut sel, SelectDest::TempTable(src_cur))?;
            if n_src != n_values {
                return Err(p.error(format!(
                    "table {} has {} columns but {} values were supplied",
                    table.name, n_values, n_src
                )));
            }
            let w = open_table_for_writing(p, &table, db_idx)?;
            let done = p.v.make_label();
            p.v.add_op(Opcode::Rewind, src_cur, done);
            let top = p.v.current_addr();
            let cont = p.v.make_label();

            match table.ipk.and_then(|c| target[c]) {
                Some(j) => {
                    p.v.add_op(Opcode::Column, src_cur, j as i32);
                    let fresh = p.v.make_label();
                    let have = p.v.make_label();
                    p.v.add_op(Opcode::IsNull, -1, fresh);
                    p.v.add_op(Opcode::MustBeInt, 0, 0);
                    p.v.add_op(Opcode::Goto, 0, have);
                    p.v.resolve_label(fresh);
                    p.v.add_op(Opcode::Pop, 1, 0);
                    p.v.add_op(Opcode::NewRecno, w.tab_cur, 0);
                    p.v.resolve_label(have);
                }
                None => {
                    p.v.add_op(Opcode::NewRecno, w.tab_cur, 0);
                }
            }
            p.v.add_op(Opcode::MemStore, w.recno_mem, 0);

            for (c, col) in table.columns.iter().enumerate() {
                if Some(c) == table.ipk {
                    p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
                } else if let Some(j) = target[c] {
                    p.v.add_op(Opcode::Column, src_cur, j as i32);
                } else if let Some(d) = &col.default_value {
                    code_expr(p, d)?;
                } else {
                    p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
                }
            }
            code_row_insert(p, &w, stmt_action, cont, 3)?;
            p.v.resolve_label(cont);
            p.v.add_op(Opcode::Next, src_cur, top as i32);
            p.v.resolve_label(done);
            p.v.add_op(Opcode::Close, src_cur, 0);
        }
    }

    p.code_end_write();
    Ok(())
}
