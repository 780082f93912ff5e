//! SELECT planning and code generation
//!
//! Translates a SELECT tree into VDBE code: FROM terms get cursors and
//! resolved tables (views and subqueries materialize into transient
//! tables unless flattened into the caller), the WHERE engine builds
//! the scan loops, aggregates run through the aggregator, ORDER BY
//! through the sorter, and every row is dispatched to a destination
//! describing who consumes it.

use std::rc::Rc;

use crate::api::connection::AuthAction;
use crate::error::Result;
use crate::executor::expr::{code_expr, code_expr_if_false, type_mask};
use crate::executor::prepare::{p3_text, Parse};
use crate::executor::where_clause::{
    split_and_terms, where_begin, where_end, WhereTerm,
};
use crate::func::FuncDef;
use crate::parser::ast::{
    CompoundOp, Expr, ExprList, ExprOp, JoinType, Select, SrcList,
};
use crate::parser::resolve::{expr_check, resolve_ids};
use crate::schema::{Column, Table};
use crate::types::DataType;
use crate::vdbe::ops::P3;
use crate::vdbe::Opcode;

// ============================================================================
// Destinations
// ============================================================================

/// Where each result row of a SELECT goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectDest {
    /// Surface rows to the caller
    Callback,
    /// First row's first column into a memory cell, then stop
    Mem(i32),
    /// Store 1 into the cell when any row exists, then stop
    Exists(i32),
    /// Each row becomes a key of a temp ordered set
    Set(i32),
    /// Insert row records into a temp table keyed by the record
    Union(i32),
    /// Delete matching row records from a temp table
    Except(i32),
    /// Append row records at fresh row ids
    Table(i32),
    /// Open the temp table, then behave as Table
    TempTable(i32),
    /// Gosub to an address per row; the callee consumes the stack
    Subroutine(i32),
    /// Push each row into the sort buffer; the caller drains it
    Sorter,
    /// Evaluate and drop (side effects only)
    Discard,
}

impl SelectDest {
    fn ignores_order_by(self) -> bool {
        matches!(
            self,
            SelectDest::Union(_) | SelectDest::Except(_) | SelectDest::Discard
        )
    }
}

// ============================================================================
// Aggregate Bookkeeping
// ============================================================================

/// One cell of the aggregator: a bare column carried per group, or an
/// aggregate function accumulation.
pub struct AggEntry {
    pub func: Option<Rc<FuncDef>>,
    /// For columns: the expression to evaluate in the scan loop.
    /// For functions: the call site (its args are coded in the loop).
    pub expr: Expr,
}

// ============================================================================
// Entry Point
// ============================================================================

/// Compile one SELECT (or compound chain) into the current program.
/// Returns the number of result columns.
pub fn compile_select(p: &mut Parse, sel: &mut Select, dest: SelectDest) -> Result<usize> {
    if sel.prior.is_some() {
        return multi_select(p, sel, dest);
    }
    p.conn.authorize(AuthAction::Select, "", "", "")?;

    let join_terms = fill_in_column_list(p, sel)?;

    if matches!(dest, SelectDest::Mem(_) | SelectDest::Set(_)) && sel.result.len() > 1 {
        return Err(p.error(
            "only a single result allowed for a SELECT that is part of an expression",
        ));
    }

    let order_by_dropped = dest.ignores_order_by();
    if order_by_dropped {
        sel.order_by = None;
    }

    // Resolve and check every expression against the FROM clause.
    let mut is_agg = resolve_select_exprs(p, sel)?;
    let mut join_terms = resolve_join_terms(p, sel, join_terms)?;

    if matches!(dest, SelectDest::Callback) {
        generate_column_names(p, sel);
    }

    // min()/max() of a single column over a bare table compiles to one
    // positioning step instead of a scan.
    if simple_min_max_query(p, sel, dest)? {
        return Ok(sel.result.len());
    }

    // Flatten or materialize FROM-clause subqueries.
    let mut i = 0;
    while i < sel.src.len() {
        if sel.src.items[i].select.is_none() {
            i += 1;
            continue;
        }
        if try_flatten_subquery(p, sel, i, is_agg)? {
            // Re-resolve nothing: substitution rewired the expressions
            // in place; refresh aggregate status for new WHERE terms.
            let mut extra: Vec<Expr> = Vec::new();
            if let Some(w) = sel.where_expr.as_deref() {
                split_and_terms(w, &mut extra);
            }
            join_terms.extend(extra.into_iter().map(WhereTerm::plain));
            sel.where_expr = None;
            continue;
        }
        let cursor = sel.src.items[i].cursor;
        let mut sub = sel.src.items[i].select.take().map(|b| *b).expect("subquery");
        compile_select(p, &mut sub, SelectDest::TempTable(cursor))?;
        sel.src.items[i].select = Some(Box::new(sub));
        i += 1;
    }

    compute_limit_registers(p, sel);

    if let SelectDest::TempTable(cursor) = dest {
        p.v.add_op(Opcode::OpenTemp, cursor, 0);
    }

    // Aggregate analysis: register every column and aggregate-function
    // occurrence used by the output expressions.
    p.agg_entries.clear();
    if is_agg || sel.group_by.is_some() {
        is_agg = true;
        analyze_select_aggregates(p, sel);
        let n = p.agg_entries.len() as i32;
        p.v.add_op(Opcode::AggReset, 0, n);
        for (i, entry) in p.agg_entries.iter().enumerate() {
            if let Some(func) = &entry.func {
                if func.finalize.is_some() {
                    p.v
                        .add_op_p3(Opcode::AggInit, 0, i as i32, P3::Func(func.clone()));
                }
            }
        }
        if sel.group_by.is_none() {
            // Without GROUP BY there is exactly one group; create it up
            // front so an empty scan still produces a row.
            p.v.add_op_p3(Opcode::String, 0, 0, p3_text(""));
            let here = p.v.current_addr() + 1;
            p.v.add_op(Opcode::AggFocus, 0, here as i32);
        }
    }

    let distinct = if sel.distinct {
        let cur = p.alloc_cursor();
        p.v.add_op(Opcode::OpenTemp, cur, 1);
        cur
    } else {
        -1
    };

    // The scan.
    let mut terms = join_terms;
    if let Some(w) = sel.where_expr.as_deref() {
        let mut plain = Vec::new();
        split_and_terms(w, &mut plain);
        terms.extend(plain.into_iter().map(WhereTerm::plain));
    }
    let info = where_begin(p, &sel.src, &mut terms, true)?;
    let (cont, brk) = (info.cont, info.brk);

    if !is_agg {
        select_inner_loop(p, sel, None, distinct, dest, cont, brk)?;
    } else {
        code_aggregate_step(p, sel)?;
    }

    where_end(p, info);

    // Second loop: walk the groups, apply HAVING, emit each group row.
    if is_agg {
        let endagg = p.v.make_label();
        let startagg = p.v.current_addr();
        p.v.add_op(Opcode::AggNext, 0, endagg);
        p.use_agg = true;
        if let Some(h) = sel.having.clone() {
            code_expr_if_false(p, &h, startagg as i32, true)?;
        }
        select_inner_loop(p, sel, None, distinct, dest, startagg as i32, endagg)?;
        p.v.add_op(Opcode::Goto, 0, startagg as i32);
        p.v.resolve_label(endagg);
        p.use_agg = false;
    }

    if sel.order_by.is_some() {
        generate_sort_tail(p, sel, sel.result.len(), dest);
    }

    if matches!(dest, SelectDest::Callback) {
        p.v
            .add_op(Opcode::NullCallback, sel.result.len() as i32, 0);
    }

    p.agg_entries.clear();
    Ok(sel.result.len())
}

// ============================================================================
// FROM Clause Preparation
// ============================================================================

/// Assign cursors, bind tables (expanding views into subqueries and
/// deriving transient shapes for subqueries), expand `*` terms, and
/// fold JOIN conditions into marked WHERE terms.
fn fill_in_column_list(p: &mut Parse, sel: &mut Select) -> Result<Vec<(Expr, i32)>> {
    for item in &mut sel.src.items {
        if item.cursor < 0 {
            item.cursor = p.alloc_cursor();
        }
    }
    for i in 0..sel.src.len() {
        if sel.src.items[i].table.is_some() {
            continue;
        }
        if sel.src.items[i].select.is_some() {
            let mut sub = sel.src.items[i].select.take().map(|b| *b).expect("sub");
            let name = sel.src.items[i]
                .alias
                .clone()
                .unwrap_or_else(|| format!("dbsql_subquery_{}", sel.src.items[i].cursor));
            let shape = select_result_shape(p, &name, &mut sub)?;
            sel.src.items[i].select = Some(Box::new(sub));
            sel.src.items[i].table = Some(Box::new(shape));
        } else {
            let name = sel.src.items[i].name.clone();
            let dbq = sel.src.items[i].database.clone();
            let (db_idx, table) = p.find_table(dbq.as_deref(), &name)?;
            p.code_verify_schema(db_idx);
            if table.is_view() {
                // A view reads as a subquery over its defining SELECT.
                let mut sub = table
                    .select
                    .clone()
                    .map(|b| *b)
                    .ok_or_else(|| p.error(format!("view {} is malformed", name)))?;
                let mut shape = select_result_shape(p, &name, &mut sub)?;
                shape.db_idx = db_idx;
                sel.src.items[i].select = Some(Box::new(sub));
                sel.src.items[i].table = Some(Box::new(shape));
            } else {
                sel.src.items[i].table = Some(Box::new(table));
            }
        }
    }

    expand_stars(sel);

    // Fold join conditions into from-join-marked terms.
    let mut join_terms: Vec<(Expr, i32)> = Vec::new();
    for i in 1..sel.src.len() {
        let (left, right) = {
            let (a, b) = sel.src.items.split_at(i);
            (&a[i - 1], &b[0])
        };
        let cursor = right.cursor;
        let jt = right.jointype;
        if jt.contains(JoinType::NATURAL) {
            if right.on_expr.is_some() || right.using.is_some() {
                return Err(p.error(
                    "a NATURAL join may not have an ON or USING clause",
                ));
            }
            if let (Some(lt), Some(rt)) = (left.table.as_deref(), right.table.as_deref()) {
                for (ci, col) in rt.columns.iter().enumerate() {
                    if let Some(li) = lt.column_index(&col.name) {
                        join_terms.push((
                            column_eq_term(left.cursor, li, lt, right.cursor, ci, rt),
                            cursor,
                        ));
                    }
                }
            }
        }
        if let Some(using) = &right.using {
            for name in &using.names {
                let lt = left.table.as_deref();
                let rt = right.table.as_deref();
                let li = lt.and_then(|t| t.column_index(name));
                let ri = rt.and_then(|t| t.column_index(name));
                match (lt, rt, li, ri) {
                    (Some(lt), Some(rt), Some(li), Some(ri)) => {
                        join_terms
                            .push((column_eq_term(left.cursor, li, lt, right.cursor, ri, rt), cursor));
                    }
                    _ => {
                        return Err(p.error(format!(
                            "cannot join using column {} - column not present in both tables",
                            name
                        )));
                    }
                }
            }
        }
    }
    // ON clauses stay on their items (shape derivation walks this list
    // too and must not consume them); each compile clones its own copy.
    for item in &sel.src.items {
        if let Some(on) = item.on_expr.as_deref() {
            join_terms.push((on.clone(), item.cursor));
        }
    }
    Ok(join_terms)
}

/// Build a resolved equality term between two named columns.
fn column_eq_term(
    lc: i32,
    li: usize,
    lt: &Table,
    rc: i32,
    ri: usize,
    rt: &Table,
) -> Expr {
    let mut l = Expr::leaf(ExprOp::Column, &lt.columns[li].name);
    l.table_idx = lc;
    l.column_idx = li as i32;
    l.data_type = lt.columns[li].sort_class;
    let mut r = Expr::leaf(ExprOp::Column, &rt.columns[ri].name);
    r.table_idx = rc;
    r.column_idx = ri as i32;
    r.data_type = rt.columns[ri].sort_class;
    Expr::new(ExprOp::Eq, Some(l), Some(r), "=")
}

/// Expand `*` and `table.*` in the result list into resolved column
/// references.
fn expand_stars(sel: &mut Select) {
    let expand_item = |item: &crate::parser::ast::SrcItem, out: &mut ExprList| {
        if let Some(t) = item.table.as_deref() {
            for (ci, col) in t.columns.iter().enumerate() {
                let mut e = Expr::leaf(ExprOp::Column, &col.name);
                e.table_idx = item.cursor;
                e.column_idx = ci as i32;
                e.data_type = col.sort_class;
                e.span = format!("{}.{}", item.visible_name(), col.name);
                out.append(e, None);
            }
        }
    };

    if sel.result.is_empty() {
        let mut out = ExprList::new();
        for item in &sel.src.items {
            expand_item(item, &mut out);
        }
        sel.result = out;
        return;
    }
    let needs_expand = sel.result.items.iter().any(|i| {
        i.expr.op == ExprOp::Dot
            && i.expr
                .right
                .as_deref()
                .map(|r| r.token == "*")
                .unwrap_or(false)
    });
    if !needs_expand {
        return;
    }
    let mut out = ExprList::new();
    for item in std::mem::take(&mut sel.result.items) {
        let is_star = item.expr.op == ExprOp::Dot
            && item
                .expr
                .right
                .as_deref()
                .map(|r| r.token == "*")
                .unwrap_or(false);
        if is_star {
            let tname = item
                .expr
                .left
                .as_deref()
                .map(|l| l.token.clone())
                .unwrap_or_default();
            for src in &sel.src.items {
                if src.visible_name().eq_ignore_ascii_case(&tname) {
                    expand_item(src, &mut out);
                }
            }
        } else {
            out.items.push(item);
        }
    }
    sel.result = out;
}

/// The left-most branch of a compound chain.
fn leftmost_mut(s: &mut Select) -> &mut Select {
    if s.prior.is_some() {
        leftmost_mut(s.prior.as_deref_mut().expect("checked"))
    } else {
        s
    }
}

/// Derive the transient table describing a subquery's result shape;
/// CREATE TABLE AS and CREATE VIEW borrow this to shape their columns.
pub fn select_result_shape_for(p: &mut Parse, name: &str, sub: &mut Select) -> Result<Table> {
    select_result_shape(p, name, sub)
}

/// Derive the transient table describing a subquery's result shape.
/// For compounds the left-most branch supplies the shape.
fn select_result_shape(p: &mut Parse, name: &str, sub: &mut Select) -> Result<Table> {
    let lm = leftmost_mut(sub);
    fill_in_column_list(p, lm)?;
    let shaped = lm.result.clone();
    let shaped = &shaped;

    let mut table = Table::new(name, 0);
    table.is_transient = true;
    let mut names: Vec<String> = Vec::new();
    for (i, item) in shaped.items.iter().enumerate() {
        let base = if let Some(alias) = &item.name {
            alias.clone()
        } else if item.expr.op == ExprOp::Column && !item.expr.token.is_empty() {
            item.expr.token.clone()
        } else if item.expr.op == ExprOp::Dot {
            item.expr
                .right
                .as_deref()
                .map(|r| r.token.clone())
                .unwrap_or_else(|| format!("column{}", i + 1))
        } else if !item.expr.span.is_empty() {
            item.expr.span.clone()
        } else {
            format!("column{}", i + 1)
        };
        let mut unique = base.clone();
        let mut cnt = 0;
        while names.iter().any(|n| n.eq_ignore_ascii_case(&unique)) {
            cnt += 1;
            unique = format!("{}_{}", base, cnt);
        }
        names.push(unique.clone());
        let mut col = Column::new(&unique);
        col.sort_class = static_expr_type(&item.expr);
        table.columns.push(col);
    }
    Ok(table)
}

/// Best-effort type classification before resolution has run; used only
/// to type transient shapes.
fn static_expr_type(e: &Expr) -> DataType {
    match e.op {
        ExprOp::String | ExprOp::QString | ExprOp::Concat => DataType::Text,
        ExprOp::Column => e.data_type,
        ExprOp::As => e
            .left
            .as_deref()
            .map(static_expr_type)
            .unwrap_or(DataType::Numeric),
        _ => DataType::Numeric,
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve and type-check all clauses; returns whether the statement
/// uses aggregate functions.
fn resolve_select_exprs(p: &mut Parse, sel: &mut Select) -> Result<bool> {
    let src = sel.src.clone();
    let mut is_agg = false;

    let mut result = std::mem::take(&mut sel.result);
    for item in &mut result.items {
        resolve_ids(p, &src, None, &mut item.expr)?;
        expr_check(p, true, &mut item.expr)?;
        if contains_aggregate(&item.expr) {
            is_agg = true;
        }
    }
    sel.result = result;
    let aliases = sel.result.clone();

    if let Some(mut w) = sel.where_expr.take() {
        resolve_ids(p, &src, Some(&aliases), &mut w)?;
        expr_check(p, false, &mut w)?;
        sel.where_expr = Some(w);
    }
    if sel.having.is_some() && sel.group_by.is_none() {
        return Err(p.error("a GROUP BY clause is required before HAVING"));
    }
    if let Some(mut h) = sel.having.take() {
        resolve_ids(p, &src, Some(&aliases), &mut h)?;
        expr_check(p, true, &mut h)?;
        if contains_aggregate(&h) {
            is_agg = true;
        }
        sel.having = Some(h);
    }
    if let Some(mut gb) = sel.group_by.take() {
        for item in &mut gb.items {
            substitute_column_number(&aliases, &mut item.expr);
            resolve_ids(p, &src, Some(&aliases), &mut item.expr)?;
            expr_check(p, false, &mut item.expr)?;
        }
        sel.group_by = Some(gb);
    }
    if let Some(mut ob) = sel.order_by.take() {
        for item in &mut ob.items {
            substitute_column_number(&aliases, &mut item.expr);
            resolve_ids(p, &src, Some(&aliases), &mut item.expr)?;
            expr_check(p, true, &mut item.expr)?;
            if contains_aggregate(&item.expr) {
                is_agg = true;
            }
        }
        sel.order_by = Some(ob);
    }
    Ok(is_agg)
}

/// `ORDER BY 2` names the second result column.
fn substitute_column_number(result: &ExprList, e: &mut Expr) {
    if e.op == ExprOp::Integer {
        let n = crate::util::strings::str_to_int(&e.token);
        if n >= 1 && (n as usize) <= result.len() {
            *e = result.items[(n - 1) as usize].expr.clone();
        }
    }
}

fn contains_aggregate(e: &Expr) -> bool {
    let mut found = false;
    e.walk(&mut |node| {
        if node.op == ExprOp::AggFunction {
            found = true;
            return false;
        }
        true
    });
    found
}

fn resolve_join_terms(
    p: &mut Parse,
    sel: &Select,
    terms: Vec<(Expr, i32)>,
) -> Result<Vec<WhereTerm>> {
    let mut out = Vec::new();
    for (mut e, cursor) in terms {
        resolve_ids(p, &sel.src, None, &mut e)?;
        expr_check(p, false, &mut e)?;
        let mut split = Vec::new();
        split_and_terms(&e, &mut split);
        for t in split {
            out.push(WhereTerm::from_join(t, cursor));
        }
    }
    Ok(out)
}

// ============================================================================
// Column Headers
// ============================================================================

/// Emit ColumnName ops for callback output: the alias, a bare column's
/// name, or the expression's source text; declared types ride in the
/// second half of the name array.
fn generate_column_names(p: &mut Parse, sel: &Select) {
    for (i, item) in sel.result.items.iter().enumerate() {
        let name = if let Some(alias) = &item.name {
            alias.clone()
        } else if item.expr.op == ExprOp::Column {
            column_name_for(sel, &item.expr).unwrap_or_else(|| item.expr.span.clone())
        } else if !item.expr.span.is_empty() {
            item.expr.span.clone()
        } else {
            format!("column{}", i + 1)
        };
        p.v
            .add_op_p3(Opcode::ColumnName, i as i32, 0, p3_text(name));
        let decl = decl_type_for(sel, &item.expr).unwrap_or_default();
        p.v
            .add_op_p3(Opcode::ColumnName, i as i32, 1, p3_text(decl));
    }
}

fn src_table_of<'a>(sel: &'a Select, cursor: i32) -> Option<&'a Table> {
    sel.src
        .items
        .iter()
        .find(|it| it.cursor == cursor)
        .and_then(|it| it.table.as_deref())
}

fn column_name_for(sel: &Select, e: &Expr) -> Option<String> {
    let t = src_table_of(sel, e.table_idx)?;
    if e.column_idx < 0 {
        return Some("rowid".to_string());
    }
    t.columns.get(e.column_idx as usize).map(|c| c.name.clone())
}

fn decl_type_for(sel: &Select, e: &Expr) -> Option<String> {
    if e.op != ExprOp::Column {
        return None;
    }
    let t = src_table_of(sel, e.table_idx)?;
    if e.column_idx < 0 {
        return Some("INTEGER".to_string());
    }
    t.columns
        .get(e.column_idx as usize)
        .and_then(|c| c.decl_type.clone())
}

// ============================================================================
// Limit Registers
// ============================================================================

/// Allocate countdown cells for LIMIT/OFFSET. "LIMIT 0" means no rows;
/// a negative limit means unlimited.
fn compute_limit_registers(p: &mut Parse, sel: &mut Select) {
    if sel.limit >= 0 && sel.limit_mem < 0 {
        let mem = p.alloc_mem();
        p.v
            .add_op(Opcode::Integer, (-sel.limit).clamp(i32::MIN as i64, 0) as i32, 0);
        p.v.add_op(Opcode::MemStore, mem, 1);
        sel.limit_mem = mem;
    }
    if sel.offset > 0 && sel.offset_mem < 0 {
        let mem = p.alloc_mem();
        p.v
            .add_op(Opcode::Integer, (-sel.offset).clamp(i32::MIN as i64, 0) as i32, 0);
        p.v.add_op(Opcode::MemStore, mem, 1);
        sel.offset_mem = mem;
    }
}

// ============================================================================
// Inner Loop
// ============================================================================

/// Emit the body run once per candidate row: LIMIT/OFFSET countdowns,
/// column evaluation (or extraction from `src_cursor` for compound
/// scans), DISTINCT filtering, and the destination dispatch.
fn select_inner_loop(
    p: &mut Parse,
    sel: &Select,
    src_cursor: Option<(i32, usize)>,
    distinct: i32,
    dest: SelectDest,
    cont: i32,
    brk: i32,
) -> Result<()> {
    let n = src_cursor.map(|(_, n)| n).unwrap_or(sel.result.len());

    if sel.order_by.is_none() {
        if sel.offset_mem >= 0 {
            let addr = p.v.current_addr();
            p.v.add_op(Opcode::MemIncr, sel.offset_mem, (addr + 2) as i32);
            p.v.add_op(Opcode::Goto, 0, cont);
        }
        if sel.limit_mem >= 0 {
            p.v.add_op(Opcode::MemIncr, sel.limit_mem, brk);
        }
    }

    match src_cursor {
        Some((cursor, n)) => {
            for i in 0..n {
                p.v.add_op(Opcode::Column, cursor, i as i32);
            }
        }
        None => {
            for item in &sel.result.items {
                code_expr(p, &item.expr)?;
            }
        }
    }

    if distinct >= 0 && n > 0 {
        let mask: String = sel
            .result
            .items
            .iter()
            .map(|i| type_mask(i.expr.data_type))
            .collect();
        p.v.add_op_p3(Opcode::MakeKey, n as i32, 1, p3_text(mask));
        let addr = p.v.current_addr();
        p.v.add_op(Opcode::Distinct, distinct, (addr + 3) as i32);
        p.v.add_op(Opcode::Pop, (n + 1) as i32, 0);
        p.v.add_op(Opcode::Goto, 0, cont);
        p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
        p.v.add_op(Opcode::PutStrKey, distinct, 0);
    }

    match dest {
        SelectDest::Union(param) => {
            p.v.add_op(Opcode::MakeRecord, n as i32, 1);
            p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
            p.v.add_op(Opcode::PutStrKey, param, 0);
        }
        SelectDest::Except(param) => {
            let addr = p.v.add_op(Opcode::MakeRecord, n as i32, 1);
            p.v.add_op(Opcode::NotFound, param, (addr + 3) as i32);
            p.v.add_op(Opcode::Delete, param, 0);
        }
        SelectDest::Table(param) | SelectDest::TempTable(param) => {
            p.v.add_op(Opcode::MakeRecord, n as i32, 0);
            if sel.order_by.is_some() {
                push_onto_sorter(p, sel)?;
            } else {
                p.v.add_op(Opcode::NewRecno, param, 0);
                p.v.add_op(Opcode::Pull, 1, 0);
                p.v.add_op(Opcode::PutIntKey, param, 0);
            }
        }
        SelectDest::Set(param) => {
            let addr = p.v.current_addr();
            p.v.add_op(Opcode::NotNull, -1, (addr + 3) as i32);
            p.v.add_op(Opcode::Pop, 1, 0);
            let over = p.v.make_label();
            p.v.add_op(Opcode::Goto, 0, over);
            if sel.order_by.is_some() {
                push_onto_sorter(p, sel)?;
            } else {
                p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
                p.v.add_op(Opcode::PutStrKey, param, 0);
            }
            p.v.resolve_label(over);
        }
        SelectDest::Mem(param) => {
            if sel.order_by.is_some() {
                push_onto_sorter(p, sel)?;
            } else {
                p.v.add_op(Opcode::MemStore, param, 1);
                p.v.add_op(Opcode::Goto, 0, brk);
            }
        }
        SelectDest::Exists(param) => {
            p.v.add_op(Opcode::Pop, n as i32, 0);
            p.v.add_op(Opcode::Integer, 1, 0);
            p.v.add_op(Opcode::MemStore, param, 1);
            p.v.add_op(Opcode::Goto, 0, brk);
        }
        SelectDest::Callback | SelectDest::Sorter => {
            if sel.order_by.is_some() {
                p.v.add_op(Opcode::SortMakeRec, n as i32, 0);
                push_onto_sorter(p, sel)?;
            } else {
                p.v.add_op(Opcode::Callback, n as i32, 0);
            }
        }
        SelectDest::Subroutine(addr) => {
            if sel.order_by.is_some() {
                p.v.add_op(Opcode::MakeRecord, n as i32, 0);
                push_onto_sorter(p, sel)?;
            } else {
                p.v.add_op(Opcode::Gosub, 0, addr);
            }
        }
        SelectDest::Discard => {
            p.v.add_op(Opcode::Pop, n as i32, 0);
        }
    }
    Ok(())
}

/// Build the sort key for the row whose record sits on the stack, then
/// hand both to the sorter.
fn push_onto_sorter(p: &mut Parse, sel: &Select) -> Result<()> {
    let order_by = sel.order_by.as_ref().expect("sorter needs ORDER BY");
    let mut mask = String::new();
    for item in &order_by.items {
        let c = match (item.expr.data_type, item.desc) {
            (DataType::Text, false) => 'A',
            (DataType::Text, true) => 'D',
            (DataType::Numeric, false) => '+',
            (DataType::Numeric, true) => '-',
        };
        mask.push(c);
        code_expr(p, &item.expr)?;
    }
    p.v.add_op_p3(
        Opcode::SortMakeKey,
        order_by.len() as i32,
        0,
        p3_text(mask),
    );
    p.v.add_op(Opcode::SortPut, 0, 0);
    Ok(())
}

/// Sort the buffered rows and stream them to the destination with
/// LIMIT/OFFSET applied.
fn generate_sort_tail(p: &mut Parse, sel: &Select, n: usize, dest: SelectDest) {
    if dest == SelectDest::Sorter {
        // The caller drains the sorter itself.
        return;
    }
    let end = p.v.make_label();
    p.v.add_op(Opcode::Sort, 0, 0);
    let addr = p.v.current_addr();
    p.v.add_op(Opcode::SortNext, 0, end);
    if sel.offset_mem >= 0 {
        let here = p.v.current_addr();
        p.v.add_op(Opcode::MemIncr, sel.offset_mem, (here + 3) as i32);
        p.v.add_op(Opcode::Pop, 1, 0);
        p.v.add_op(Opcode::Goto, 0, addr as i32);
    }
    if sel.limit_mem >= 0 {
        p.v.add_op(Opcode::MemIncr, sel.limit_mem, end);
    }
    match dest {
        SelectDest::Callback => {
            p.v.add_op(Opcode::SortCallback, n as i32, 0);
        }
        SelectDest::Table(param) | SelectDest::TempTable(param) => {
            p.v.add_op(Opcode::NewRecno, param, 0);
            p.v.add_op(Opcode::Pull, 1, 0);
            p.v.add_op(Opcode::PutIntKey, param, 0);
        }
        SelectDest::Set(param) => {
            let here = p.v.current_addr();
            p.v.add_op(Opcode::NotNull, -1, (here + 3) as i32);
            p.v.add_op(Opcode::Pop, 1, 0);
            p.v.add_op(Opcode::Goto, 0, (here + 5) as i32);
            p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
            p.v.add_op(Opcode::PutStrKey, param, 0);
        }
        SelectDest::Mem(param) => {
            p.v.add_op(Opcode::MemStore, param, 1);
            p.v.add_op(Opcode::Goto, 0, end);
        }
        _ => {
            p.v.add_op(Opcode::Pop, 1, 0);
        }
    }
    p.v.add_op(Opcode::Goto, 0, addr as i32);
    p.v.resolve_label(end);
}

// ============================================================================
// Aggregates
// ============================================================================

/// Register aggregate cells for the output expressions: each distinct
/// column reference gets a carried cell, each aggregate call an
/// accumulator cell. Function arguments stay untouched — they are
/// evaluated against the real cursors inside the scan.
fn analyze_select_aggregates(p: &mut Parse, sel: &mut Select) {
    let mut result = std::mem::take(&mut sel.result);
    for item in &mut result.items {
        analyze_aggregate_expr(p, &mut item.expr);
    }
    sel.result = result;
    if let Some(mut gb) = sel.group_by.take() {
        for item in &mut gb.items {
            analyze_aggregate_expr(p, &mut item.expr);
        }
        sel.group_by = Some(gb);
    }
    if let Some(mut h) = sel.having.take() {
        analyze_aggregate_expr(p, &mut h);
        sel.having = Some(h);
    }
    if let Some(mut ob) = sel.order_by.take() {
        for item in &mut ob.items {
            analyze_aggregate_expr(p, &mut item.expr);
        }
        sel.order_by = Some(ob);
    }
}

fn analyze_aggregate_expr(p: &mut Parse, e: &mut Expr) {
    match e.op {
        ExprOp::Column => {
            let existing = p.agg_entries.iter().position(|entry| {
                entry.func.is_none()
                    && entry.expr.op == ExprOp::Column
                    && entry.expr.table_idx == e.table_idx
                    && entry.expr.column_idx == e.column_idx
            });
            let idx = match existing {
                Some(i) => i,
                None => {
                    p.agg_entries.push(AggEntry {
                        func: None,
                        expr: e.clone(),
                    });
                    p.agg_entries.len() - 1
                }
            };
            e.agg_idx = idx as i32;
        }
        ExprOp::AggFunction => {
            p.agg_entries.push(AggEntry {
                func: e.func.clone(),
                expr: e.clone(),
            });
            e.agg_idx = (p.agg_entries.len() - 1) as i32;
        }
        _ => {
            if let Some(l) = e.left.as_mut() {
                analyze_aggregate_expr(p, l);
            }
            if let Some(r) = e.right.as_mut() {
                analyze_aggregate_expr(p, r);
            }
            if let Some(list) = e.list.as_mut() {
                for item in &mut list.items {
                    analyze_aggregate_expr(p, &mut item.expr);
                }
            }
        }
    }
}

/// The aggregate variant of the inner loop: focus the row's group, fill
/// carried columns on first sight, run each accumulator's step.
fn code_aggregate_step(p: &mut Parse, sel: &Select) -> Result<()> {
    if let Some(gb) = sel.group_by.as_ref() {
        let mask: String = gb
            .items
            .iter()
            .map(|i| type_mask(i.expr.data_type))
            .collect();
        for item in &gb.items {
            code_expr(p, &item.expr)?;
        }
        p.v
            .add_op_p3(Opcode::MakeKey, gb.len() as i32, 0, p3_text(mask));
        let have = p.v.make_label();
        p.v.add_op(Opcode::AggFocus, 0, have);
        for i in 0..p.agg_entries.len() {
            if p.agg_entries[i].func.is_some() {
                continue;
            }
            let col = p.agg_entries[i].expr.clone();
            code_expr(p, &col)?;
            p.v.add_op(Opcode::AggSet, 0, i as i32);
        }
        p.v.resolve_label(have);
    } else {
        for i in 0..p.agg_entries.len() {
            if p.agg_entries[i].func.is_some() {
                continue;
            }
            let col = p.agg_entries[i].expr.clone();
            code_expr(p, &col)?;
            p.v.add_op(Opcode::AggSet, 0, i as i32);
        }
    }
    for i in 0..p.agg_entries.len() {
        let func = match &p.agg_entries[i].func {
            Some(f) => f.clone(),
            None => continue,
        };
        let call = p.agg_entries[i].expr.clone();
        let n = call.list.as_ref().map(|l| l.len()).unwrap_or(0);
        if let Some(list) = call.list.as_ref() {
            for item in &list.items {
                code_expr(p, &item.expr)?;
            }
        }
        p.v.add_op(Opcode::Integer, i as i32, 0);
        p.v
            .add_op_p3(Opcode::AggFunc, 0, n as i32, P3::Func(func));
    }
    Ok(())
}

// ============================================================================
// min()/max() Fast Path
// ============================================================================

/// `SELECT min(c) FROM t` (or max) with nothing else compiles to one
/// cursor positioning: Rewind/Last on the table for the row-id column,
/// or on an index keyed on `c`.
fn simple_min_max_query(p: &mut Parse, sel: &mut Select, dest: SelectDest) -> Result<bool> {
    if !matches!(dest, SelectDest::Callback | SelectDest::Mem(_)) {
        return Ok(false);
    }
    if sel.where_expr.is_some()
        || sel.group_by.is_some()
        || sel.having.is_some()
        || sel.order_by.is_some()
        || sel.src.len() != 1
        || sel.result.len() != 1
        || sel.distinct
    {
        return Ok(false);
    }
    let e = &sel.result.items[0].expr;
    if e.op != ExprOp::AggFunction {
        return Ok(false);
    }
    let is_min = e.token.eq_ignore_ascii_case("min");
    let is_max = e.token.eq_ignore_ascii_case("max");
    if !is_min && !is_max {
        return Ok(false);
    }
    let arg = match e.list.as_ref().and_then(|l| l.items.first()) {
        Some(item) if item.expr.op == ExprOp::Column => item.expr.clone(),
        _ => return Ok(false),
    };
    let table = match sel.src.items[0].table.as_deref() {
        Some(t) if !t.is_transient && !t.is_view() => t.clone(),
        _ => return Ok(false),
    };
    let col = arg.column_idx;
    let is_rowid = col < 0 || table.ipk == Some(col as usize);

    // Non-rowid columns need an index whose first column is the target.
    let index = if is_rowid {
        None
    } else {
        let db = &p.conn.dbs[table.db_idx];
        let found = table.indices.iter().find_map(|name| {
            db.indices
                .find(name)
                .filter(|ix| ix.columns.first() == Some(&(col as usize)))
                .cloned()
        });
        match found {
            Some(ix) => Some(ix),
            None => return Ok(false),
        }
    };

    let db_idx = table.db_idx;
    p.code_verify_schema(db_idx);
    let db_name = p.conn.dbs[db_idx].name.clone();
    let tab_cur = sel.src.items[0].cursor;
    p.v
        .add_op_p3(Opcode::OpenRead, tab_cur, table.tnum as i32, p3_text(db_name.clone()));
    let (seek_cur, uses_index) = match &index {
        Some(ix) => {
            let ic = p.alloc_cursor();
            p.v
                .add_op_p3(Opcode::OpenRead, ic, ix.tnum as i32, p3_text(db_name));
            (ic, true)
        }
        None => (tab_cur, false),
    };

    let empty = p.v.make_label();
    let out = p.v.make_label();
    let op = if is_min { Opcode::Rewind } else { Opcode::Last };
    p.v.add_op(op, seek_cur, empty);
    if uses_index {
        p.v.add_op(Opcode::IdxRecno, seek_cur, 0);
        p.v.add_op(Opcode::MoveTo, tab_cur, 0);
    }
    if col < 0 {
        p.v.add_op(Opcode::Recno, tab_cur, 0);
    } else {
        p.v.add_op(Opcode::Column, tab_cur, col);
    }
    p.v.add_op(Opcode::Goto, 0, out);
    p.v.resolve_label(empty);
    p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
    p.v.resolve_label(out);
    match dest {
        SelectDest::Mem(cell) => {
            p.v.add_op(Opcode::MemStore, cell, 1);
        }
        _ => {
            p.v.add_op(Opcode::Callback, 1, 0);
            p.v.add_op(Opcode::NullCallback, 1, 0);
        }
    }
    Ok(true)
}

// ============================================================================
// Compound SELECTs
// ============================================================================

fn compound_op_name(op: CompoundOp) -> &'static str {
    match op {
        CompoundOp::Union => "UNION",
        CompoundOp::UnionAll => "UNION ALL",
        CompoundOp::Intersect => "INTERSECT",
        CompoundOp::Except => "EXCEPT",
        CompoundOp::Select => "SELECT",
    }
}

/// Compile a UNION / UNION ALL / INTERSECT / EXCEPT chain. The branches
/// materialize into temp tables (UNION ALL streams straight through
/// when it can), and a final pass scans the result into the real
/// destination.
fn multi_select(p: &mut Parse, sel: &mut Select, dest: SelectDest) -> Result<usize> {
    let mut prior = sel.prior.take().map(|b| *b).expect("compound prior");
    if prior.order_by.is_some() {
        return Err(p.error(format!(
            "ORDER BY clause should come after {} not before",
            compound_op_name(sel.op)
        )));
    }
    if prior.limit >= 0 || prior.offset > 0 {
        return Err(p.error(format!(
            "LIMIT clause should come after {} not before",
            compound_op_name(sel.op)
        )));
    }

    let mut dest = dest;
    if let SelectDest::TempTable(param) = dest {
        p.v.add_op(Opcode::OpenTemp, param, 0);
        dest = SelectDest::Table(param);
    }

    let n_cols;
    match sel.op {
        CompoundOp::UnionAll if sel.order_by.is_none() => {
            // Push the limit down so it applies across both branches.
            prior.limit = sel.limit;
            prior.offset = sel.offset;
            compile_select(p, &mut prior, dest)?;
            sel.limit_mem = prior.limit_mem;
            sel.offset_mem = prior.offset_mem;
            sel.limit = -1;
            sel.offset = 0;
            n_cols = compile_select(p, sel, dest)?;
            check_compound_widths(p, &prior, sel)?;
            sel.prior = Some(Box::new(prior));
        }
        CompoundOp::UnionAll | CompoundOp::Union | CompoundOp::Except => {
            let prior_dest_is_union = sel.op != CompoundOp::UnionAll;
            // Reuse the caller's temp table when shapes line up.
            let plain = sel.order_by.is_none() && sel.limit < 0 && sel.offset == 0;
            let reuse = plain
                && match (dest, prior_dest_is_union) {
                    (SelectDest::Union(_), true) | (SelectDest::Table(_), false) => true,
                    _ => false,
                };
            let union_tab = if reuse {
                match dest {
                    SelectDest::Union(t) | SelectDest::Table(t) => t,
                    _ => unreachable!(),
                }
            } else {
                let t = p.alloc_cursor();
                if let Some(ob) = sel.order_by.as_mut() {
                    match_orderby_to_column(p, &sel.result, ob, t)?;
                }
                if prior_dest_is_union {
                    p.v.add_op(Opcode::OpenTemp, t, 1);
                    p.v.add_op(Opcode::KeyAsData, t, 1);
                } else {
                    p.v.add_op(Opcode::OpenTemp, t, 0);
                }
                t
            };
            let prior_dest = if prior_dest_is_union {
                SelectDest::Union(union_tab)
            } else {
                SelectDest::Table(union_tab)
            };
            compile_select(p, &mut prior, prior_dest)?;

            let self_dest = match sel.op {
                CompoundOp::Except => SelectDest::Except(union_tab),
                CompoundOp::Union => SelectDest::Union(union_tab),
                _ => SelectDest::Table(union_tab),
            };
            let order_by = sel.order_by.take();
            let (limit, offset) = (sel.limit, sel.offset);
            sel.limit = -1;
            sel.offset = 0;
            n_cols = compile_select(p, sel, self_dest)?;
            sel.order_by = order_by;
            sel.limit = limit;
            sel.offset = offset;
            check_compound_widths(p, &prior, sel)?;
            sel.prior = Some(Box::new(prior));

            if !reuse {
                if matches!(dest, SelectDest::Callback) {
                    generate_column_names(p, sel);
                }
                scan_compound_table(p, sel, union_tab, n_cols, dest, None)?;
            }
        }
        CompoundOp::Intersect => {
            let tab1 = p.alloc_cursor();
            let tab2 = p.alloc_cursor();
            if let Some(ob) = sel.order_by.as_mut() {
                match_orderby_to_column(p, &sel.result, ob, tab1)?;
            }
            p.v.add_op(Opcode::OpenTemp, tab1, 1);
            p.v.add_op(Opcode::KeyAsData, tab1, 1);
            compile_select(p, &mut prior, SelectDest::Union(tab1))?;

            p.v.add_op(Opcode::OpenTemp, tab2, 1);
            p.v.add_op(Opcode::KeyAsData, tab2, 1);
            let order_by = sel.order_by.take();
            let (limit, offset) = (sel.limit, sel.offset);
            sel.limit = -1;
            sel.offset = 0;
            n_cols = compile_select(p, sel, SelectDest::Union(tab2))?;
            sel.order_by = order_by;
            sel.limit = limit;
            sel.offset = offset;
            check_compound_widths(p, &prior, sel)?;
            sel.prior = Some(Box::new(prior));

            if matches!(dest, SelectDest::Callback) {
                generate_column_names(p, sel);
            }
            scan_compound_table(p, sel, tab1, n_cols, dest, Some(tab2))?;
        }
        CompoundOp::Select => unreachable!("not a compound"),
    }

    if matches!(dest, SelectDest::Callback) {
        p.v.add_op(Opcode::NullCallback, n_cols as i32, 0);
    }
    Ok(n_cols)
}

fn check_compound_widths(p: &mut Parse, prior: &Select, sel: &Select) -> Result<()> {
    if prior.result.len() != sel.result.len() {
        return Err(p.error(format!(
            "SELECTs to the left and right of {} do not have the same number of result columns",
            compound_op_name(sel.op)
        )));
    }
    Ok(())
}

/// Scan a materialized compound table, probing `intersect_with` when
/// given, and feed each row through the normal inner-loop dispatch
/// (which handles the sorter, LIMIT, and the final destination).
fn scan_compound_table(
    p: &mut Parse,
    sel: &mut Select,
    table_cur: i32,
    n_cols: usize,
    dest: SelectDest,
    intersect_with: Option<i32>,
) -> Result<()> {
    let mut ob = sel.order_by.take();
    if let Some(ob) = ob.as_mut() {
        multi_select_sort_order(sel, ob);
    }
    sel.order_by = ob;
    let brk = p.v.make_label();
    let cont = p.v.make_label();
    p.v.add_op(Opcode::Rewind, table_cur, brk);
    compute_limit_registers(p, sel);
    let start = p.v.current_addr();
    if let Some(other) = intersect_with {
        p.v.add_op(Opcode::FullKey, table_cur, 0);
        p.v.add_op(Opcode::NotFound, other, cont);
    }
    select_inner_loop(
        p,
        sel,
        Some((table_cur, n_cols)),
        -1,
        dest,
        cont,
        brk,
    )?;
    p.v.resolve_label(cont);
    p.v.add_op(Opcode::Next, table_cur, start as i32);
    p.v.resolve_label(brk);
    p.v.add_op(Opcode::Close, table_cur, 0);
    if let Some(other) = intersect_with {
        p.v.add_op(Opcode::Close, other, 0);
    }
    if sel.order_by.is_some() {
        generate_sort_tail(p, sel, n_cols, dest);
    }
    Ok(())
}

/// Bind each compound ORDER BY term to a result-column index of the
/// temp table holding the union.
fn match_orderby_to_column(
    p: &mut Parse,
    result: &ExprList,
    order_by: &mut ExprList,
    table_cur: i32,
) -> Result<()> {
    for (i, item) in order_by.items.iter_mut().enumerate() {
        let e = &mut item.expr;
        let mut col: i32 = -1;
        if e.op == ExprOp::Integer {
            let n = crate::util::strings::str_to_int(&e.token);
            if n < 1 || n as usize > result.len() {
                return Err(p.error(format!(
                    "ORDER BY position {} should be between 1 and {}",
                    n,
                    result.len()
                )));
            }
            col = (n - 1) as i32;
        }
        if col < 0 && matches!(e.op, ExprOp::Id | ExprOp::QString | ExprOp::String) {
            for (j, r) in result.items.iter().enumerate() {
                if r.name
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(&e.token))
                {
                    col = j as i32;
                    break;
                }
            }
        }
        if col < 0 {
            for (j, r) in result.items.iter().enumerate() {
                if exprs_compare(e, &r.expr) {
                    col = j as i32;
                    break;
                }
            }
        }
        if col < 0 {
            return Err(p.error(format!(
                "ORDER BY term number {} does not match any result column",
                i + 1
            )));
        }
        *e = Expr::leaf(ExprOp::Column, &e.token.clone());
        e.table_idx = table_cur;
        e.column_idx = col;
        item.done = true;
    }
    Ok(())
}

/// Structural equality of two unresolved expressions, used to match
/// ORDER BY terms against result columns.
fn exprs_compare(a: &Expr, b: &Expr) -> bool {
    if a.op != b.op || !a.token.eq_ignore_ascii_case(&b.token) {
        return false;
    }
    match (&a.left, &b.left) {
        (Some(x), Some(y)) if !exprs_compare(x, y) => return false,
        (Some(_), None) | (None, Some(_)) => return false,
        _ => {}
    }
    match (&a.right, &b.right) {
        (Some(x), Some(y)) if !exprs_compare(x, y) => return false,
        (Some(_), None) | (None, Some(_)) => return false,
        _ => {}
    }
    true
}

/// A compound ORDER BY term sorts as text only when the matched column
/// is text in every branch.
fn multi_select_sort_order(sel: &Select, order_by: &mut ExprList) {
    for item in &mut order_by.items {
        let col = item.expr.column_idx;
        if col < 0 {
            continue;
        }
        let mut all_text = true;
        let mut cur = Some(sel);
        while let Some(s) = cur {
            if let Some(r) = s.result.items.get(col as usize) {
                if r.expr.data_type != DataType::Text {
                    all_text = false;
                }
            }
            cur = s.prior.as_deref();
        }
        item.expr.data_type = if all_text {
            DataType::Text
        } else {
            DataType::Numeric
        };
    }
}

// ============================================================================
// Subquery Flattening
// ============================================================================

/// The individually-testable preconditions for merging a FROM-clause
/// subquery into its parent. All must hold.
pub fn flatten_preconditions(
    outer: &Select,
    item_jointype: JoinType,
    sub: &Select,
    outer_agg: bool,
    sub_agg: bool,
) -> [bool; 12] {
    let outer_is_join = outer.src.len() > 1;
    [
        // 1. The subquery has a FROM clause.
        !sub.src.is_empty(),
        // 2. Not both sides aggregate.
        !(outer_agg && sub_agg),
        // 3. An aggregate subquery cannot join into the outer query.
        !(sub_agg && outer_is_join),
        // 4. A DISTINCT subquery cannot be joined.
        !(sub.distinct && outer_is_join),
        // 5. A DISTINCT subquery cannot feed an aggregate outer query.
        !(sub.distinct && outer_agg),
        // 6. A LIMITed subquery cannot be joined.
        !(sub.limit >= 0 && outer_is_join),
        // 7. A LIMITed subquery cannot feed an aggregate outer query.
        !(sub.limit >= 0 && outer_agg),
        // 8. An aggregate subquery cannot take an outer LIMIT.
        !(sub_agg && outer.limit >= 0),
        // 9. ORDER BY may appear on at most one side.
        !(outer.order_by.is_some() && sub.order_by.is_some()),
        // 10. The subquery is not itself compound.
        sub.prior.is_none(),
        // 11. The subquery is not the right side of a LEFT JOIN.
        !item_jointype.contains(JoinType::LEFT),
        // 12. An aggregate subquery cannot feed a DISTINCT outer query.
        !(sub_agg && outer.distinct),
    ]
}

/// Attempt to flatten the subquery at `sel.src[item]` into `sel`.
/// On success the item is replaced by the subquery's FROM terms and
/// every outer reference is substituted with the subquery's result
/// expression.
fn try_flatten_subquery(
    p: &mut Parse,
    sel: &mut Select,
    item: usize,
    outer_agg: bool,
) -> Result<bool> {
    let (jointype, cursor) = {
        let it = &sel.src.items[item];
        (it.jointype, it.cursor)
    };
    let mut sub = match sel.src.items[item].select.clone().map(|b| *b) {
        Some(s) => s,
        None => return Ok(false),
    };
    let sub_agg = select_uses_aggregates(p, &sub);
    let checks = flatten_preconditions(sel, jointype, &sub, outer_agg, sub_agg);
    if checks.iter().any(|ok| !ok) {
        return Ok(false);
    }

    // Resolve the subquery's own expressions so the substitution plants
    // bound references into the outer tree.
    let sub_join_terms = fill_in_column_list(p, &mut sub)?;
    resolve_select_exprs(p, &mut sub)?;
    let sub_terms = resolve_join_terms(p, &sub, sub_join_terms)?;

    let result = sub.result.clone();
    subst_expr_list(&mut sel.result, cursor, &result);
    if let Some(w) = sel.where_expr.as_mut() {
        subst_expr(w, cursor, &result);
    }
    if let Some(gb) = sel.group_by.as_mut() {
        subst_expr_list(gb, cursor, &result);
    }
    if let Some(h) = sel.having.as_mut() {
        subst_expr(h, cursor, &result);
    }
    if let Some(ob) = sel.order_by.as_mut() {
        subst_expr_list(ob, cursor, &result);
    }

    // Merge WHERE clauses and the FROM lists.
    let mut where_parts: Vec<Expr> = Vec::new();
    if let Some(w) = sub.where_expr.take() {
        where_parts.push(*w);
    }
    for t in sub_terms {
        where_parts.push(t.expr);
    }
    if let Some(w) = sel.where_expr.take() {
        where_parts.push(*w);
    }
    sel.where_expr = combine_and(where_parts).map(Box::new);

    let mut spliced = sub.src.items.clone();
    if let Some(first) = spliced.first_mut() {
        first.jointype = jointype;
    }
    sel.src.items.splice(item..=item, spliced);

    sel.distinct = sel.distinct || sub.distinct;
    if sub.limit >= 0 && sel.limit < 0 {
        sel.limit = sub.limit;
        sel.offset = sub.offset;
    }
    if sel.order_by.is_none() {
        sel.order_by = sub.order_by.take();
    }
    log::debug!("flattened subquery at cursor {}", cursor);
    Ok(true)
}

fn select_uses_aggregates(p: &Parse, sel: &Select) -> bool {
    let mut found = false;
    let mut check = |e: &Expr| {
        e.walk(&mut |node| {
            if node.op == ExprOp::Function || node.op == ExprOp::AggFunction {
                if let Some(def) = p.conn.find_function(
                    &node.token,
                    node.list.as_ref().map(|l| l.len() as i32).unwrap_or(0),
                ) {
                    if def.is_aggregate() {
                        found = true;
                        return false;
                    }
                }
            }
            true
        });
    };
    for item in &sel.result.items {
        check(&item.expr);
    }
    if let Some(h) = sel.having.as_deref() {
        check(h);
    }
    found || sel.group_by.is_some()
}

fn combine_and(parts: Vec<Expr>) -> Option<Expr> {
    let mut it = parts.into_iter();
    let first = it.next()?;
    Some(it.fold(first, |acc, e| {
        Expr::new(ExprOp::And, Some(acc), Some(e), "AND")
    }))
}

/// Replace references to `table` columns with copies of the matching
/// result expression (row-id references stay).
fn subst_expr(e: &mut Expr, table: i32, result: &ExprList) {
    if e.op == ExprOp::Column && e.table_idx == table && e.column_idx >= 0 {
        if let Some(item) = result.items.get(e.column_idx as usize) {
            let span = e.span.clone();
            *e = item.expr.clone();
            if !span.is_empty() {
                e.span = span;
            }
            return;
        }
    }
    if let Some(l) = e.left.as_mut() {
        subst_expr(l, table, result);
    }
    if let Some(r) = e.right.as_mut() {
        subst_expr(r, table, result);
    }
    if let Some(list) = e.list.as_mut() {
        for item in &mut list.items {
            subst_expr(&mut item.expr, table, result);
        }
    }
}

fn subst_expr_list(list: &mut ExprList, table: i32, result: &ExprList) {
    for item in &mut list.items {
        subst_expr(&mut item.expr, table, result);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::SrcItem;

    fn empty_select() -> Select {
        Select::new(ExprList::new(), SrcList::default())
    }

    #[test]
    fn test_flatten_preconditions_each_condition() {
        let mut outer = empty_select();
        outer.src.items.push(SrcItem::named(None, "t"));
        let mut sub = empty_select();
        sub.src.items.push(SrcItem::named(None, "u"));

        // Baseline: everything holds.
        let ok = flatten_preconditions(&outer, JoinType::empty(), &sub, false, false);
        assert!(ok.iter().all(|b| *b));

        // 1: subquery without FROM.
        let no_from = empty_select();
        assert!(!flatten_preconditions(&outer, JoinType::empty(), &no_from, false, false)[0]);

        // 2: both aggregate.
        assert!(!flatten_preconditions(&outer, JoinType::empty(), &sub, true, true)[1]);

        // 6: LIMIT in subquery feeding a join.
        let mut limited = sub.clone();
        limited.limit = 5;
        let mut joined = outer.clone();
        joined.src.items.push(SrcItem::named(None, "t2"));
        assert!(!flatten_preconditions(&joined, JoinType::empty(), &limited, false, false)[5]);

        // 9: ORDER BY on both sides.
        let mut ob_outer = outer.clone();
        ob_outer.order_by = Some(ExprList::new());
        let mut ob_sub = sub.clone();
        ob_sub.order_by = Some(ExprList::new());
        assert!(!flatten_preconditions(&ob_outer, JoinType::empty(), &ob_sub, false, false)[8]);

        // 10: compound subquery.
        let mut compound = sub.clone();
        compound.prior = Some(Box::new(empty_select()));
        assert!(!flatten_preconditions(&outer, JoinType::empty(), &compound, false, false)[9]);

        // 11: right side of a LEFT JOIN.
        assert!(!flatten_preconditions(&outer, JoinType::LEFT, &sub, false, false)[10]);
    }

    #[test]
    fn test_subst_expr_replaces_column_refs() {
        let mut target = Expr::leaf(ExprOp::Column, "x");
        target.table_idx = 7;
        target.column_idx = 0;
        let mut result = ExprList::new();
        let mut replacement = Expr::leaf(ExprOp::Column, "y");
        replacement.table_idx = 3;
        replacement.column_idx = 2;
        result.append(replacement, None);

        subst_expr(&mut target, 7, &result);
        assert_eq!(target.table_idx, 3);
        assert_eq!(target.column_idx, 2);
    }

    #[test]
    fn test_exprs_compare() {
        let a = Expr::new(
            ExprOp::Plus,
            Some(Expr::leaf(ExprOp::Id, "a")),
            Some(Expr::leaf(ExprOp::Integer, "1")),
            "+",
        );
        let b = a.clone();
        assert!(exprs_compare(&a, &b));
        let c = Expr::leaf(ExprOp::Id, "a");
        assert!(!exprs_compare(&a, &c));
    }

    #[test]
    fn test_combine_and() {
        assert!(combine_and(vec![]).is_none());
        let parts = vec![
            Expr::leaf(ExprOp::Integer, "1"),
            Expr::leaf(ExprOp::Integer, "2"),
            Expr::leaf(ExprOp::Integer, "3"),
        ];
        let combined = combine_and(parts).unwrap();
        assert_eq!(combined.op, ExprOp::And);
        assert_eq!(combined.left.as_ref().unwrap().op, ExprOp::And);
    }
}
