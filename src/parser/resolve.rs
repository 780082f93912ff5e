//! Name resolution and expression checking
//!
//! `resolve_ids` binds identifiers to (cursor, column) pairs against a
//! FROM clause, rewrites double-quoted strings that name columns into
//! references, binds `ORDER BY alias` against the result list, and
//! compiles IN/scalar subqueries into sets and memory cells as it finds
//! them. `expr_check` then resolves function calls, tags aggregates,
//! and infers each node's data class — the type that later picks
//! between numeric and text comparison opcodes.

use crate::error::Result;
use crate::executor::prepare::{p3_text, Parse};
use crate::executor::select::{compile_select, SelectDest};
use crate::parser::ast::{Expr, ExprList, ExprOp, SrcList};
use crate::types::DataType;
use crate::vdbe::ops::P3;
use crate::vdbe::Opcode;

// ============================================================================
// Identifier Resolution
// ============================================================================

/// Resolve every name in `e` against `src`, with `aliases` naming the
/// output columns for `ORDER BY alias` rewriting.
pub fn resolve_ids(
    p: &mut Parse,
    src: &SrcList,
    aliases: Option<&ExprList>,
    e: &mut Expr,
) -> Result<()> {
    match e.op {
        ExprOp::Id | ExprOp::QString => resolve_bare_id(p, src, aliases, e),
        ExprOp::Dot => resolve_dotted(p, src, e),
        ExprOp::Variable => {
            p.n_var += 1;
            e.table_idx = p.n_var;
            Ok(())
        }
        ExprOp::In => {
            if let Some(l) = e.left.as_mut() {
                resolve_ids(p, src, aliases, l)?;
            }
            if e.select.is_some() {
                // Subquery form: materialize into a private ordered set.
                let cursor = p.alloc_cursor();
                p.v.add_op(Opcode::OpenTemp, cursor, 1);
                let mut sub = e.select.take().map(|b| *b).expect("checked");
                compile_select(p, &mut sub, SelectDest::Set(cursor))?;
                e.select = Some(Box::new(sub));
                e.table_idx = cursor;
            } else {
                // List form: every element must be constant; the values
                // seed a membership set before the main loop runs.
                let set_idx = p.alloc_set();
                e.table_idx = set_idx;
                if let Some(list) = e.list.as_mut() {
                    for item in &mut list.items {
                        resolve_ids(p, src, aliases, &mut item.expr)?;
                        if !item.expr.is_constant() {
                            return Err(p.error(
                                "right-hand side of IN operator must be constant",
                            ));
                        }
                        let text = constant_text(&item.expr);
                        p.v.add_op_p3(Opcode::SetInsert, set_idx, 0, p3_text(text));
                    }
                }
            }
            Ok(())
        }
        ExprOp::Select | ExprOp::Exists => {
            // A scalar subquery lands in a memory cell, preloaded for
            // the zero-row case.
            let cell = p.alloc_mem();
            e.column_idx = cell;
            if e.op == ExprOp::Exists {
                p.v.add_op(Opcode::Integer, 0, 0);
            } else {
                p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
            }
            p.v.add_op(Opcode::MemStore, cell, 1);
            let mut sub = e.select.take().map(|b| *b).expect("subquery");
            let dest = if e.op == ExprOp::Exists {
                SelectDest::Exists(cell)
            } else {
                SelectDest::Mem(cell)
            };
            compile_select(p, &mut sub, dest)?;
            e.select = Some(Box::new(sub));
            Ok(())
        }
        _ => {
            if let Some(l) = e.left.as_mut() {
                resolve_ids(p, src, aliases, l)?;
            }
            if let Some(r) = e.right.as_mut() {
                resolve_ids(p, src, aliases, r)?;
            }
            if let Some(list) = e.list.as_mut() {
                for item in &mut list.items {
                    resolve_ids(p, src, aliases, &mut item.expr)?;
                }
            }
            Ok(())
        }
    }
}

/// The textual form of a constant expression, for set seeding.
fn constant_text(e: &Expr) -> String {
    match e.op {
        ExprOp::UMinus => format!("-{}", constant_text(e.left.as_deref().unwrap_or(e))),
        ExprOp::UPlus => constant_text(e.left.as_deref().unwrap_or(e)),
        ExprOp::Null => String::new(),
        _ => e.token.clone(),
    }
}

fn resolve_bare_id(
    p: &mut Parse,
    src: &SrcList,
    aliases: Option<&ExprList>,
    e: &mut Expr,
) -> Result<()> {
    let name = e.token.clone();
    let mut matches: Vec<(i32, i32, DataType, String, String, usize)> = Vec::new();
    for item in &src.items {
        let table = match item.table.as_deref() {
            Some(t) => t,
            None => continue,
        };
        if let Some(ci) = table.column_index(&name) {
            // An INTEGER PRIMARY KEY column is the row id in disguise.
            let col = if table.ipk == Some(ci) { -1 } else { ci as i32 };
            matches.push((
                item.cursor,
                col,
                table.columns[ci].sort_class,
                table.name.clone(),
                table.columns[ci].name.clone(),
                table.db_idx,
            ));
        }
    }
    match matches.len() {
        1 => {
            let (cursor, col, dt, tab_name, col_name, db_idx) = matches.remove(0);
            return bind_column(p, e, cursor, col, dt, &tab_name, &col_name, db_idx);
        }
        n if n > 1 => {
            return Err(p.error(format!("ambiguous column name: {}", name)));
        }
        _ => {}
    }
    // Output-alias reference (`ORDER BY alias`): substitute a copy of
    // the named result expression.
    if let Some(aliases) = aliases {
        for item in &aliases.items {
            if item
                .name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(&name))
            {
                let mut sub = item.expr.clone();
                sub.span = e.span.clone();
                *e = Expr::new(ExprOp::As, Some(sub), None, &name);
                return Ok(());
            }
        }
    }
    // The row id pseudo-column resolves when exactly one table is in
    // scope.
    if (name.eq_ignore_ascii_case("rowid")
        || name.eq_ignore_ascii_case("_rowid_")
        || name.eq_ignore_ascii_case("oid"))
        && src.len() == 1
    {
        if let Some(t) = src.items[0].table.as_deref() {
            if t.column_index(&name).is_none() {
                e.op = ExprOp::Column;
                e.table_idx = src.items[0].cursor;
                e.column_idx = -1;
                e.data_type = DataType::Numeric;
                return Ok(());
            }
        }
    }
    // A double-quoted token that names no column falls back to being a
    // string literal.
    if e.op == ExprOp::QString {
        e.op = ExprOp::String;
        return Ok(());
    }
    Err(p.error(format!("no such column: {}", name)))
}

fn resolve_dotted(p: &mut Parse, src: &SrcList, e: &mut Expr) -> Result<()> {
    // Shapes: table.column, or database.table.column.
    let (db_name, tab_name, col_name) = {
        let left = e.left.as_deref().ok_or_else(|| p.error("malformed name"))?;
        let right = e.right.as_deref().ok_or_else(|| p.error("malformed name"))?;
        if right.op == ExprOp::Dot {
            let t = right.left.as_deref().ok_or_else(|| p.error("malformed name"))?;
            let c = right
                .right
                .as_deref()
                .ok_or_else(|| p.error("malformed name"))?;
            (Some(left.token.clone()), t.token.clone(), c.token.clone())
        } else {
            (None, left.token.clone(), right.token.clone())
        }
    };

    let mut matches: Vec<(i32, i32, DataType, String, String, usize)> = Vec::new();
    for item in &src.items {
        let table = match item.table.as_deref() {
            Some(t) => t,
            None => continue,
        };
        if !item.visible_name().eq_ignore_ascii_case(&tab_name) {
            continue;
        }
        if let Some(dbn) = db_name.as_deref() {
            let db_matches = item
                .database
                .as_deref()
                .map(|d| d.eq_ignore_ascii_case(dbn))
                .unwrap_or_else(|| {
                    p.conn
                        .dbs
                        .get(table.db_idx)
                        .map(|d| d.name.eq_ignore_ascii_case(dbn))
                        .unwrap_or(false)
                });
            if !db_matches {
                continue;
            }
        }
        if let Some(ci) = table.column_index(&col_name) {
            let col = if table.ipk == Some(ci) { -1 } else { ci as i32 };
            matches.push((
                item.cursor,
                col,
                table.columns[ci].sort_class,
                table.name.clone(),
                table.columns[ci].name.clone(),
                table.db_idx,
            ));
        } else if col_name.eq_ignore_ascii_case("rowid")
            || col_name.eq_ignore_ascii_case("_rowid_")
            || col_name.eq_ignore_ascii_case("oid")
        {
            matches.push((
                item.cursor,
                -1,
                DataType::Numeric,
                table.name.clone(),
                col_name.clone(),
                table.db_idx,
            ));
        }
    }
    // Name lookup errors distinguish a missing table from a missing
    // column on a known table.
    if matches.is_empty() {
        let table_known = src.items.iter().any(|item| {
            item.table.is_some() && item.visible_name().eq_ignore_ascii_case(&tab_name)
        });
        return Err(if table_known {
            p.error(format!("no such column: {}.{}", tab_name, col_name))
        } else {
            p.error(format!("no such table: {}", tab_name))
        });
    }
    if matches.len() > 1 {
        return Err(p.error(format!("ambiguous column name: {}.{}", tab_name, col_name)));
    }
    let (cursor, col, dt, t_name, c_name, db_idx) = matches.remove(0);
    bind_column(p, e, cursor, col, dt, &t_name, &c_name, db_idx)
}

#[allow(clippy::too_many_arguments)]
fn bind_column(
    p: &mut Parse,
    e: &mut Expr,
    cursor: i32,
    col: i32,
    dt: DataType,
    tab_name: &str,
    col_name: &str,
    db_idx: usize,
) -> Result<()> {
    // Per-read authorization; an ignored read compiles to literal NULL.
    let db_name = p
        .conn
        .dbs
        .get(db_idx)
        .map(|d| d.name.clone())
        .unwrap_or_default();
    let verdict = p.conn.authorize(
        crate::api::connection::AuthAction::Read,
        tab_name,
        col_name,
        &db_name,
    )?;
    if verdict == crate::api::connection::AuthResult::Ignore {
        e.op = ExprOp::Null;
        e.left = None;
        e.right = None;
        return Ok(());
    }
    e.op = ExprOp::Column;
    e.left = None;
    e.right = None;
    e.table_idx = cursor;
    e.column_idx = col;
    e.data_type = dt;
    Ok(())
}

// ============================================================================
// Expression Checking and Type Inference
// ============================================================================

/// Resolve function calls, tag aggregates, and compute `data_type`
/// bottom-up. `allow_agg` is true only where aggregate functions are
/// legal (result list, HAVING, ORDER BY of an aggregate query).
pub fn expr_check(p: &mut Parse, allow_agg: bool, e: &mut Expr) -> Result<()> {
    if let Some(l) = e.left.as_mut() {
        expr_check(p, allow_agg, l)?;
    }
    if let Some(r) = e.right.as_mut() {
        expr_check(p, allow_agg, r)?;
    }
    let in_func = e.op == ExprOp::Function;
    if let Some(list) = e.list.as_mut() {
        for item in &mut list.items {
            // Aggregates do not nest inside their own arguments.
            let child_agg = allow_agg && !in_func;
            expr_check(p, child_agg, &mut item.expr)?;
        }
    }

    match e.op {
        ExprOp::Function => {
            let name = e.token.clone();
            let n_arg = match (&e.list, e.column_idx) {
                // f(*) parses with column_idx set to -1 and no list.
                (None, -1) => 0,
                (Some(l), _) => l.len() as i32,
                (None, _) => 0,
            };
            // typeof() reports the static type class; it resolves here
            // and folds to a constant at codegen.
            if name.eq_ignore_ascii_case("typeof") {
                if n_arg != 1 {
                    return Err(
                        p.error("wrong number of arguments to function typeof()")
                    );
                }
                e.data_type = DataType::Text;
                return Ok(());
            }
            let def = match p.conn.find_function(&name, n_arg) {
                Some(d) => d,
                None => {
                    return Err(if p.conn.function_exists(&name) {
                        p.error(format!("wrong number of arguments to function {}()", name))
                    } else {
                        p.error(format!("no such function: {}", name))
                    });
                }
            };
            if def.is_aggregate() {
                if !allow_agg {
                    return Err(p.error(format!("misuse of aggregate function {}()", name)));
                }
                e.op = ExprOp::AggFunction;
            }
            let arg_types: Vec<DataType> = e
                .list
                .as_ref()
                .map(|l| l.items.iter().map(|i| i.expr.data_type).collect())
                .unwrap_or_default();
            e.data_type = if name.eq_ignore_ascii_case("typeof") {
                DataType::Text
            } else {
                def.result_type(&arg_types)
            };
            e.func = Some(def);
        }
        ExprOp::String | ExprOp::QString | ExprOp::Concat => e.data_type = DataType::Text,
        ExprOp::Integer | ExprOp::Float | ExprOp::Null => e.data_type = DataType::Numeric,
        ExprOp::Variable => e.data_type = DataType::Text,
        ExprOp::Column => {}
        ExprOp::As => {
            e.data_type = e
                .left
                .as_ref()
                .map(|l| l.data_type)
                .unwrap_or(DataType::Numeric);
        }
        ExprOp::Case => {
            // The first THEN branch settles the type.
            e.data_type = e
                .list
                .as_ref()
                .and_then(|l| l.items.get(1))
                .map(|i| i.expr.data_type)
                .unwrap_or(DataType::Numeric);
        }
        ExprOp::Select | ExprOp::Exists => {
            e.data_type = e
                .select
                .as_ref()
                .and_then(|s| s.result.items.first())
                .map(|i| i.expr.data_type)
                .unwrap_or(DataType::Numeric);
        }
        // Arithmetic, comparisons, and logic are numeric.
        _ => e.data_type = DataType::Numeric,
    }
    Ok(())
}

/// The comparison class of a binary comparison: text when either side
/// is text.
pub fn comparison_type(l: &Expr, r: &Expr) -> DataType {
    if l.data_type == DataType::Text || r.data_type == DataType::Text {
        DataType::Text
    } else {
        DataType::Numeric
    }
}
