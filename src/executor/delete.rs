//! DELETE code generation
//!
//! The classic two-pass shape: scan the WHERE loop collecting row ids
//! into the keylist, then replay the list against write cursors,
//! removing index entries before each row. `DELETE FROM t` without a
//! WHERE clause short-circuits to clearing the table and index roots.

use crate::api::connection::AuthAction;
use crate::error::Result;
use crate::executor::expr::type_mask;
use crate::executor::prepare::{p3_text, Parse};
use crate::executor::where_clause::{split_and_terms, where_begin, where_end, WhereTerm};
use crate::parser::ast::{SrcItem, SrcList, Stmt};
use crate::parser::resolve::{expr_check, resolve_ids};
use crate::vdbe::Opcode;

pub fn compile_delete(p: &mut Parse, stmt: &Stmt) -> Result<()> {
    let Stmt::Delete {
        table: tname,
        where_expr,
    } = stmt
    else {
        return Err(p.error("not a DELETE"));
    };
    let (db_idx, table) = p.find_table(tname.database.as_deref(), &tname.name)?;
    if table.is_view() {
        return Err(p.error(format!("view {} may not be modified", table.name)));
    }
    let db_name = p.conn.dbs[db_idx].name.clone();
    p.conn
        .authorize(AuthAction::Delete, &table.name, "", &db_name)?;

    p.code_verify_schema(db_idx);
    p.code_begin_write(db_idx);

    // Without a WHERE clause the whole table (and every index) clears
    // in one step each.
    if where_expr.is_none() {
        p.v.add_op(Opcode::Clear, table.tnum as i32, db_idx as i32);
        let roots: Vec<u32> = table
            .indices
            .iter()
            .filter_map(|n| p.conn.dbs[db_idx].indices.find(n).map(|ix| ix.tnum))
            .collect();
        for root in roots {
            p.v.add_op(Opcode::Clear, root as i32, db_idx as i32);
        }
        p.code_end_write();
        return Ok(());
    }

    // Pass one: collect matching row ids.
    let mut src = SrcList::default();
    let mut item = SrcItem::named(None, &table.name);
    item.cursor = p.alloc_cursor();
    item.table = Some(Box::new(table.clone()));
    src.items.push(item);

    let mut w = where_expr.clone().map(|b| *b).expect("checked");
    resolve_ids(p, &src, None, &mut w)?;
    expr_check(p, false, &mut w)?;
    let mut terms: Vec<WhereTerm> = Vec::new();
    let mut split = Vec::new();
    split_and_terms(&w, &mut split);
    terms.extend(split.into_iter().map(WhereTerm::plain));

    let scan_cur = src.items[0].cursor;
    let info = where_begin(p, &src, &mut terms, true)?;
    p.v.add_op(Opcode::Recno, scan_cur, 0);
    p.v.add_op(Opcode::ListWrite, 0, 0);
    where_end(p, info);
    p.v.add_op(Opcode::Close, scan_cur, 0);

    // Pass two: delete each buffered row and its index entries.
    let writer = crate::executor::insert::open_table_for_writing(p, &table, db_idx)?;
    p.v.add_op(Opcode::ListRewind, 0, 0);
    let done = p.v.make_label();
    let top = p.v.current_addr();
    p.v.add_op(Opcode::ListRead, 0, done);
    p.v.add_op(Opcode::MemStore, writer.recno_mem, 1);
    p.v.add_op(Opcode::MemLoad, writer.recno_mem, 0);
    p.v.add_op(Opcode::NotExists, writer.tab_cur, top as i32);
    code_delete_index_entries(p, &writer);
    p.v.add_op(Opcode::Delete, writer.tab_cur, 1);
    p.v.add_op(Opcode::Goto, 0, top as i32);
    p.v.resolve_label(done);
    p.v.add_op(Opcode::ListReset, 0, 0);

    p.code_end_write();
    Ok(())
}

/// Remove the index entries of the row the table cursor is positioned
/// on, keyed by the row id in `w.recno_mem`.
pub fn code_delete_index_entries(p: &mut Parse, w: &crate::executor::insert::RowWriter) {
    for (icur, ix) in &w.indices {
        let mask: String = ix
            .columns
            .iter()
            .map(|&c| type_mask(w.table.columns[c].sort_class))
            .collect();
        p.v.add_op(Opcode::MemLoad, w.recno_mem, 0);
        for &c in &ix.columns {
            p.v.add_op(Opcode::Column, w.tab_cur, c as i32);
        }
        p.v
            .add_op_p3(Opcode::MakeIdxKey, ix.columns.len() as i32, 0, p3_text(mask));
        p.v.add_op(Opcode::IdxDelete, *icur, 0);
    }
}
