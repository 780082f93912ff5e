//! PRAGMA handling
//!
//! The schema-introspection pragmas the engine answers directly:
//! `database_list`, `table_info(t)`, and `index_list(t)`. Unknown
//! pragmas compile to an empty program, matching the engine's
//! forgiving tradition.

use crate::api::connection::AuthAction;
use crate::error::Result;
use crate::executor::prepare::{p3_text, Parse};
use crate::parser::ast::Expr;
use crate::vdbe::Opcode;

pub fn compile_pragma(p: &mut Parse, name: &str, value: Option<&Expr>) -> Result<()> {
    let arg = value.map(|e| e.token.clone()).unwrap_or_default();
    p.conn.authorize(AuthAction::Pragma, name, &arg, "")?;

    match name.to_ascii_lowercase().as_str() {
        "database_list" => {
            for (i, header) in ["seq", "name", "file"].iter().enumerate() {
                p.v
                    .add_op_p3(Opcode::ColumnName, i as i32, 0, p3_text(*header));
            }
            for i in 0..p.conn.dbs.len() {
                if p.conn.dbs[i].handle.is_none() {
                    continue;
                }
                let dbname = p.conn.dbs[i].name.clone();
                p.v.add_op(Opcode::Integer, i as i32, 0);
                p.v.add_op_p3(Opcode::String, 0, 0, p3_text(dbname));
                p.v.add_op_p3(Opcode::String, 0, 0, p3_text(""));
                p.v.add_op(Opcode::Callback, 3, 0);
            }
        }
        "table_info" => {
            let (_, table) = p.find_table(None, &arg)?;
            for (i, header) in ["cid", "name", "type", "notnull", "dflt_value", "pk"]
                .iter()
                .enumerate()
            {
                p.v
                    .add_op_p3(Opcode::ColumnName, i as i32, 0, p3_text(*header));
            }
            for (ci, col) in table.columns.iter().enumerate() {
                p.v.add_op(Opcode::Integer, ci as i32, 0);
                p.v
                    .add_op_p3(Opcode::String, 0, 0, p3_text(col.name.clone()));
                p.v.add_op_p3(
                    Opcode::String,
                    0,
                    0,
                    p3_text(col.decl_type.clone().unwrap_or_default()),
                );
                p.v.add_op(Opcode::Integer, col.not_null as i32, 0);
                match &col.default_value {
                    Some(d) => {
                        p.v
                            .add_op_p3(Opcode::String, 0, 0, p3_text(d.token.clone()));
                    }
                    None => {
                        p.v
                            .add_op_p3(Opcode::String, 0, 0, crate::vdbe::ops::P3::None);
                    }
                }
                p.v
                    .add_op(Opcode::Integer, col.primary_key as i32, 0);
                p.v.add_op(Opcode::Callback, 6, 0);
            }
        }
        "index_list" => {
            let (db_idx, table) = p.find_table(None, &arg)?;
            for (i, header) in ["seq", "name", "unique"].iter().enumerate() {
                p.v
                    .add_op_p3(Opcode::ColumnName, i as i32, 0, p3_text(*header));
            }
            for (i, idx_name) in table.indices.iter().enumerate() {
                let unique = p
                    .conn
                    .dbs[db_idx]
                    .indices
                    .find(idx_name)
                    .map(|ix| ix.on_error.is_some())
                    .unwrap_or(false);
                p.v.add_op(Opcode::Integer, i as i32, 0);
                p.v
                    .add_op_p3(Opcode::String, 0, 0, p3_text(idx_name.clone()));
                p.v.add_op(Opcode::Integer, unique as i32, 0);
                p.v.add_op(Opcode::Callback, 3, 0);
            }
        }
        other => {
            log::debug!("ignoring unknown pragma {}", other);
        }
    }
    Ok(())
}
