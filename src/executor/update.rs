//! UPDATE code generation
//!
//! Two passes like DELETE: the WHERE loop buffers row ids, then each
//! buffered row has its old index entries removed, its new values
//! computed (unassigned columns re-read from the old row), and the new
//! record written back — at a new row id when the INTEGER PRIMARY KEY
//! itself changes.

use crate::api::connection::AuthAction;
use crate::error::Result;
use crate::executor::delete::code_delete_index_entries;
use crate::executor::expr::code_expr;
use crate::executor::insert::{code_row_insert, open_table_for_writing};
use crate::executor::prepare::Parse;
use crate::executor::where_clause::{split_and_terms, where_begin, where_end, WhereTerm};
use crate::parser::ast::{Expr, SrcItem, SrcList, Stmt};
use crate::parser::resolve::{expr_check, resolve_ids};
use crate::schema::ConflictAction;
use crate::vdbe::ops::P3;
use crate::vdbe::Opcode;

pub fn compile_update(p: &mut Parse, stmt: &Stmt) -> Result<()> {
    let Stmt::Update {
        on_error,
        table: tname,
        sets,
        where_expr,
    } = stmt
    else {
        return Err(p.error("not an UPDATE"));
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

    // Map assignments to column positions.
    let mut assigned: Vec<Option<Expr>> = vec![None; table.columns.len()];
    for (cname, e) in sets {
        match table.column_index(cname) {
            Some(c) => {
                p.conn
                    .authorize(AuthAction::Update, &table.name, cname, &db_name)?;
                assigned[c] = Some(e.clone());
            }
            None => {
                return Err(p.error(format!("no such column: {}", cname)));
            }
        }
    }

    p.code_verify_schema(db_idx);
    p.code_begin_write(db_idx);

    // Pass one: the scan, collecting row ids.
    let mut src = SrcList::default();
    let mut item = SrcItem::named(None, &table.name);
    item.cursor = p.alloc_cursor();
    item.table = Some(Box::new(table.clone()));
    src.items.push(item);
    let scan_cur = src.items[0].cursor;

    for slot in assigned.iter_mut() {
        if let Some(e) = slot.as_mut() {
            resolve_ids(p, &src, None, e)?;
            expr_check(p, false, e)?;
        }
    }
    let mut terms: Vec<WhereTerm> = Vec::new();
    if let Some(w) = where_expr {
        let mut w = (**w).clone();
        resolve_ids(p, &src, None, &mut w)?;
        expr_check(p, false, &mut w)?;
        let mut split = Vec::new();
        split_and_terms(&w, &mut split);
        terms.extend(split.into_iter().map(WhereTerm::plain));
    }

    let info = where_begin(p, &src, &mut terms, true)?;
    p.v.add_op(Opcode::Recno, scan_cur, 0);
    p.v.add_op(Opcode::ListWrite, 0, 0);
    where_end(p, info);

    // Pass two rewrites each buffered row. The assignment expressions
    // were resolved against the scan cursor, so the same cursor number
    // must be positioned on the old row: reuse it as the write cursor.
    let writer = {
        let mut w = open_table_for_writing(p, &table, db_idx)?;
        // Redirect the table cursor to the scan cursor slot so old
        // column reads and the final write share a position.
        p.v.add_op(Opcode::Close, w.tab_cur, 0);
        p.v
            .add_op_p3(Opcode::OpenWrite, scan_cur, table.tnum as i32, {
                let db_name = p.conn.dbs[db_idx].name.clone();
                crate::executor::prepare::p3_text(db_name)
            });
        w.tab_cur = scan_cur;
        w
    };
    let new_recno_mem = p.alloc_mem();
    let ipk_updated = table.ipk.map(|c| assigned[c].is_some()).unwrap_or(false);

    p.v.add_op(Opcode::ListRewind, 0, 0);
    let done = p.v.make_label();
    let top = p.v.current_addr();
    p.v.add_op(Opcode::ListRead, 0, done);
    p.v.add_op(Opcode::MemStore, writer.recno_mem, 1);
    p.v.add_op(Opcode::MemLoad, writer.recno_mem, 0);
    p.v.add_op(Opcode::NotExists, writer.tab_cur, top as i32);

    // Old index entries leave first, keyed by the old row id.
    code_delete_index_entries(p, &writer);

    // The new row id.
    if ipk_updated {
        let c = table.ipk.expect("checked");
        code_expr(p, assigned[c].as_ref().expect("checked"))?;
        p.v.add_op(Opcode::MustBeInt, 0, 0);
    } else {
        p.v.add_op(Opcode::MemLoad, writer.recno_mem, 0);
    }
    p.v.add_op(Opcode::MemStore, new_recno_mem, 0);

    // New values: assigned expressions read the old row through the
    // still-positioned cursor; untouched columns copy through.
    for c in 0..table.columns.len() {
        if Some(c) == table.ipk {
            p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
        } else if let Some(e) = &assigned[c] {
            code_expr(p, e)?;
        } else {
            p.v.add_op(Opcode::Column, writer.tab_cur, c as i32);
        }
    }

    // Remove the old row once its values have been read.
    p.v.add_op(Opcode::Delete, writer.tab_cur, 0);

    // Hand off to the shared insert path with the new row id.
    let mut w2 = writer;
    w2.recno_mem = new_recno_mem;
    let cont = p.v.make_label();
    code_row_insert(p, &w2, stmt_action, cont, 1)?;
    p.v.resolve_label(cont);
    p.v.add_op(Opcode::Goto, 0, top as i32);
    p.v.resolve_label(done);
    p.v.add_op(Opcode::ListReset, 0, 0);

    p.code_end_write();
    Ok(())
}
