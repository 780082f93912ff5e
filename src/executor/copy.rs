//! COPY bulk loading
//!
//! `COPY table FROM 'file'` reads delimited lines through the FileOpen
//! / FileRead / FileColumn opcodes and funnels each line through the
//! same row-insertion protocol INSERT uses. `\N` fields arrive as NULL
//! and backslash escapes are honored by the line reader.

use crate::api::connection::AuthAction;
use crate::error::Result;
use crate::executor::insert::{code_row_insert, open_table_for_writing};
use crate::executor::prepare::{p3_text, Parse};
use crate::parser::ast::Stmt;
use crate::schema::ConflictAction;
use crate::vdbe::ops::P3;
use crate::vdbe::Opcode;

pub fn compile_copy(p: &mut Parse, stmt: &Stmt) -> Result<()> {
    let Stmt::Copy {
        on_error,
        table: tname,
        file,
        delimiter,
    } = stmt
    else {
        return Err(p.error("not a COPY"));
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
        .authorize(AuthAction::Copy, &table.name, file, &db_name)?;

    p.code_verify_schema(db_idx);
    p.code_begin_write(db_idx);
    let w = open_table_for_writing(p, &table, db_idx)?;

    p.v
        .add_op_p3(Opcode::FileOpen, 0, 0, p3_text(file.clone()));
    let done = p.v.make_label();
    let n = table.columns.len();
    let top = p.v.current_addr();
    let delim = delimiter.clone().unwrap_or_else(|| "\t".to_string());
    p.v
        .add_op_p3(Opcode::FileRead, n as i32, done, p3_text(delim));

    // Row id: the INTEGER PRIMARY KEY field when the table has one,
    // else a fresh number.
    match table.ipk {
        Some(c) => {
            p.v.add_op(Opcode::FileColumn, c as i32, 0);
            p.v.add_op(Opcode::MustBeInt, 0, 0);
        }
        None => {
            p.v.add_op(Opcode::NewRecno, w.tab_cur, 0);
        }
    }
    p.v.add_op(Opcode::MemStore, w.recno_mem, 0);
    for c in 0..n {
        if Some(c) == table.ipk {
            p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
        } else {
            p.v.add_op(Opcode::FileColumn, c as i32, 0);
        }
    }
    let cont = p.v.make_label();
    code_row_insert(p, &w, stmt_action, cont, 3)?;
    p.v.resolve_label(cont);
    p.v.add_op(Opcode::Goto, 0, top as i32);
    p.v.resolve_label(done);

    p.code_end_write();
    Ok(())
}
