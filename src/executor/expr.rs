//! Expression code generation
//!
//! `code_expr` leaves an expression's value on the stack; the
//! `code_expr_if_true` / `code_expr_if_false` pair compile boolean
//! contexts straight into jumps, short-circuiting AND/OR and picking
//! numeric or text comparison opcodes from the operands' inferred
//! types.

use crate::error::Result;
use crate::executor::prepare::{p3_text, Parse};
use crate::parser::ast::{Expr, ExprOp};
use crate::parser::resolve::comparison_type;
use crate::types::DataType;
use crate::util::strings;
use crate::vdbe::ops::P3;
use crate::vdbe::Opcode;

// ============================================================================
// Value Context
// ============================================================================

/// Emit code that pushes the value of `e`.
pub fn code_expr(p: &mut Parse, e: &Expr) -> Result<()> {
    match e.op {
        ExprOp::Null => {
            p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
        }
        ExprOp::Integer => {
            code_integer(p, &e.token, false);
        }
        ExprOp::Float | ExprOp::String | ExprOp::QString => {
            p.v.add_op_p3(Opcode::String, 0, 0, p3_text(e.token.clone()));
        }
        ExprOp::Variable => {
            p.v.add_op(Opcode::Variable, e.table_idx, 0);
        }
        ExprOp::Column => {
            // Inside the output loop of an aggregate query column
            // references read back from the aggregator.
            if p.use_agg && e.agg_idx >= 0 {
                p.v.add_op(Opcode::AggGet, 0, e.agg_idx);
            } else if e.column_idx < 0 {
                p.v.add_op(Opcode::Recno, e.table_idx, 0);
            } else {
                p.v.add_op(Opcode::Column, e.table_idx, e.column_idx);
            }
        }
        ExprOp::AggFunction => {
            p.v.add_op(Opcode::AggGet, 0, e.agg_idx);
        }
        ExprOp::As => {
            code_expr(p, e.left.as_deref().expect("alias body"))?;
        }
        ExprOp::Plus | ExprOp::Minus | ExprOp::Star | ExprOp::Slash | ExprOp::Rem => {
            code_expr(p, e.left.as_deref().expect("lhs"))?;
            code_expr(p, e.right.as_deref().expect("rhs"))?;
            let op = match e.op {
                ExprOp::Plus => Opcode::Add,
                ExprOp::Minus => Opcode::Subtract,
                ExprOp::Star => Opcode::Multiply,
                ExprOp::Slash => Opcode::Divide,
                _ => Opcode::Remainder,
            };
            p.v.add_op(op, 0, 0);
        }
        ExprOp::Concat => {
            code_expr(p, e.left.as_deref().expect("lhs"))?;
            code_expr(p, e.right.as_deref().expect("rhs"))?;
            p.v.add_op(Opcode::Concat, 2, 0);
        }
        ExprOp::BitAnd | ExprOp::BitOr | ExprOp::LShift | ExprOp::RShift => {
            code_expr(p, e.left.as_deref().expect("lhs"))?;
            code_expr(p, e.right.as_deref().expect("rhs"))?;
            let op = match e.op {
                ExprOp::BitAnd => Opcode::BitAnd,
                ExprOp::BitOr => Opcode::BitOr,
                ExprOp::LShift => Opcode::ShiftLeft,
                _ => Opcode::ShiftRight,
            };
            p.v.add_op(op, 0, 0);
        }
        ExprOp::Eq | ExprOp::Ne | ExprOp::Lt | ExprOp::Le | ExprOp::Gt | ExprOp::Ge => {
            let l = e.left.as_deref().expect("lhs");
            let r = e.right.as_deref().expect("rhs");
            code_expr(p, l)?;
            code_expr(p, r)?;
            let base = comparison_base(e.op);
            let op = Opcode::comparison(base, comparison_type(l, r));
            p.v.add_op(op, 0, 0);
        }
        ExprOp::And | ExprOp::Or => {
            code_expr(p, e.left.as_deref().expect("lhs"))?;
            code_expr(p, e.right.as_deref().expect("rhs"))?;
            let op = if e.op == ExprOp::And {
                Opcode::And
            } else {
                Opcode::Or
            };
            p.v.add_op(op, 0, 0);
        }
        ExprOp::Not => {
            code_expr(p, e.left.as_deref().expect("operand"))?;
            p.v.add_op(Opcode::Not, 0, 0);
        }
        ExprOp::BitNot => {
            code_expr(p, e.left.as_deref().expect("operand"))?;
            p.v.add_op(Opcode::BitNot, 0, 0);
        }
        ExprOp::UMinus => {
            let inner = e.left.as_deref().expect("operand");
            match inner.op {
                ExprOp::Integer => code_integer(p, &inner.token, true),
                ExprOp::Float => {
                    p.v
                        .add_op_p3(Opcode::String, 0, 0, p3_text(format!("-{}", inner.token)));
                }
                _ => {
                    code_expr(p, inner)?;
                    p.v.add_op(Opcode::Negative, 0, 0);
                }
            }
        }
        ExprOp::UPlus => {
            code_expr(p, e.left.as_deref().expect("operand"))?;
        }
        ExprOp::IsNull | ExprOp::NotNull => {
            // Produce 1/0 from the null test.
            code_expr(p, e.left.as_deref().expect("operand"))?;
            let test = if e.op == ExprOp::IsNull {
                Opcode::IsNull
            } else {
                Opcode::NotNull
            };
            let addr = p.v.current_addr();
            p.v.add_op(test, 1, (addr + 3) as i32);
            p.v.add_op(Opcode::Integer, 0, 0);
            p.v.add_op(Opcode::Goto, 0, (addr + 4) as i32);
            p.v.add_op(Opcode::Integer, 1, 0);
        }
        ExprOp::Function => {
            if e.token.eq_ignore_ascii_case("typeof") {
                // typeof() reports the argument's static type class.
                let t = e
                    .list
                    .as_ref()
                    .and_then(|l| l.items.first())
                    .map(|i| i.expr.data_type)
                    .unwrap_or(DataType::Numeric);
                let text = if t == DataType::Text { "text" } else { "numeric" };
                p.v.add_op_p3(Opcode::String, 0, 0, P3::Static(text));
                return Ok(());
            }
            let def = e.func.clone().expect("resolved function");
            let n = e.list.as_ref().map(|l| l.len()).unwrap_or(0) as i32;
            if let Some(list) = e.list.as_ref() {
                for item in &list.items {
                    code_expr(p, &item.expr)?;
                }
            }
            p.v.add_op_p3(Opcode::Function, n, 0, P3::Func(def));
        }
        ExprOp::Select | ExprOp::Exists => {
            p.v.add_op(Opcode::MemLoad, e.column_idx, 0);
        }
        ExprOp::In => {
            let operand = e.left.as_deref().expect("IN operand");
            code_expr(p, operand)?;
            // NULL operand yields NULL, not false.
            let addr = p.v.current_addr();
            p.v.add_op(Opcode::NotNull, -1, (addr + 4) as i32);
            p.v.add_op(Opcode::Pop, 1, 0);
            p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
            let done = p.v.make_label();
            p.v.add_op(Opcode::Goto, 0, done);
            let found = p.v.make_label();
            // Set members are stored as raw value text, so the operand
            // itself is the probe key.
            if e.select.is_some() {
                p.v.add_op(Opcode::Found, e.table_idx, found);
            } else {
                p.v.add_op(Opcode::SetFound, e.table_idx, found);
            }
            p.v.add_op(Opcode::Integer, 0, 0);
            p.v.add_op(Opcode::Goto, 0, done);
            p.v.resolve_label(found);
            p.v.add_op(Opcode::Integer, 1, 0);
            p.v.resolve_label(done);
        }
        ExprOp::Between => {
            // x BETWEEN lo AND hi compiles as x >= lo AND x <= hi.
            let rewritten = rewrite_between(e);
            code_expr(p, &rewritten)?;
        }
        ExprOp::Case => {
            let done = p.v.make_label();
            let pairs = e.list.as_ref().expect("case pairs");
            let mut branches = Vec::new();
            let mut i = 0;
            while i + 1 < pairs.items.len() {
                let when = &pairs.items[i].expr;
                let hit = p.v.make_label();
                if let Some(operand) = e.left.as_deref() {
                    code_expr(p, operand)?;
                    code_expr(p, when)?;
                    let op = Opcode::comparison(Opcode::Eq, comparison_type(operand, when));
                    p.v.add_op(op, 0, hit);
                } else {
                    code_expr_if_true(p, when, hit, false)?;
                }
                branches.push((hit, i + 1));
                i += 2;
            }
            match e.right.as_deref() {
                Some(else_e) => code_expr(p, else_e)?,
                None => {
                    p.v.add_op_p3(Opcode::String, 0, 0, P3::None);
                }
            }
            p.v.add_op(Opcode::Goto, 0, done);
            for (hit, then_idx) in branches {
                p.v.resolve_label(hit);
                code_expr(p, &pairs.items[then_idx].expr)?;
                p.v.add_op(Opcode::Goto, 0, done);
            }
            p.v.resolve_label(done);
        }
        ExprOp::Id | ExprOp::Dot => {
            return Err(p.error(format!("unresolved name: {}", e.token)));
        }
    }
    Ok(())
}

/// Push an integer literal, falling back to a lazily-converted string
/// when it does not fit the instruction's operand.
fn code_integer(p: &mut Parse, token: &str, negate: bool) {
    let text = if negate {
        format!("-{}", token)
    } else {
        token.to_string()
    };
    if strings::is_integer(&text) {
        let v = strings::str_to_int(&text);
        if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
            p.v.add_op_p3(Opcode::Integer, v as i32, 0, p3_text(text));
            return;
        }
    }
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(text));
}

fn comparison_base(op: ExprOp) -> Opcode {
    match op {
        ExprOp::Eq => Opcode::Eq,
        ExprOp::Ne => Opcode::Ne,
        ExprOp::Lt => Opcode::Lt,
        ExprOp::Le => Opcode::Le,
        ExprOp::Gt => Opcode::Gt,
        _ => Opcode::Ge,
    }
}

fn invert_comparison(op: Opcode) -> Opcode {
    match op {
        Opcode::Eq => Opcode::Ne,
        Opcode::Ne => Opcode::Eq,
        Opcode::Lt => Opcode::Ge,
        Opcode::Le => Opcode::Gt,
        Opcode::Gt => Opcode::Le,
        Opcode::Ge => Opcode::Lt,
        other => other,
    }
}

/// The MakeKey type-mask character for a data class.
pub fn type_mask(dt: DataType) -> String {
    match dt {
        DataType::Text => "t".to_string(),
        DataType::Numeric => "n".to_string(),
    }
}

fn rewrite_between(e: &Expr) -> Expr {
    let x = e.left.as_deref().expect("between operand");
    let bounds = e.list.as_ref().expect("between bounds");
    let lo = &bounds.items[0].expr;
    let hi = &bounds.items[1].expr;
    let ge = Expr::new(ExprOp::Ge, Some(x.clone()), Some(lo.clone()), ">=");
    let le = Expr::new(ExprOp::Le, Some(x.clone()), Some(hi.clone()), "<=");
    Expr::new(ExprOp::And, Some(ge), Some(le), "AND")
}

// ============================================================================
// Jump Context
// ============================================================================

/// Emit code that jumps to `dest` when `e` is true. `jump_if_null`
/// controls whether a NULL outcome also jumps.
pub fn code_expr_if_true(p: &mut Parse, e: &Expr, dest: i32, jump_if_null: bool) -> Result<()> {
    match e.op {
        ExprOp::And => {
            // Both sides must hold: a false left skips the jump.
            let fall = p.v.make_label();
            code_expr_if_false(p, e.left.as_deref().expect("lhs"), fall, !jump_if_null)?;
            code_expr_if_true(p, e.right.as_deref().expect("rhs"), dest, jump_if_null)?;
            p.v.resolve_label(fall);
        }
        ExprOp::Or => {
            code_expr_if_true(p, e.left.as_deref().expect("lhs"), dest, jump_if_null)?;
            code_expr_if_true(p, e.right.as_deref().expect("rhs"), dest, jump_if_null)?;
        }
        ExprOp::Not => {
            code_expr_if_false(p, e.left.as_deref().expect("operand"), dest, jump_if_null)?;
        }
        ExprOp::Eq | ExprOp::Ne | ExprOp::Lt | ExprOp::Le | ExprOp::Gt | ExprOp::Ge => {
            let l = e.left.as_deref().expect("lhs");
            let r = e.right.as_deref().expect("rhs");
            code_expr(p, l)?;
            code_expr(p, r)?;
            let op = Opcode::comparison(comparison_base(e.op), comparison_type(l, r));
            p.v.add_op(op, jump_if_null as i32, dest);
        }
        ExprOp::IsNull => {
            code_expr(p, e.left.as_deref().expect("operand"))?;
            p.v.add_op(Opcode::IsNull, 1, dest);
        }
        ExprOp::NotNull => {
            code_expr(p, e.left.as_deref().expect("operand"))?;
            p.v.add_op(Opcode::NotNull, 1, dest);
        }
        ExprOp::Between => {
            let rewritten = rewrite_between(e);
            code_expr_if_true(p, &rewritten, dest, jump_if_null)?;
        }
        _ => {
            code_expr(p, e)?;
            p.v.add_op(Opcode::If, jump_if_null as i32, dest);
        }
    }
    Ok(())
}

/// Emit code that jumps to `dest` when `e` is false.
pub fn code_expr_if_false(p: &mut Parse, e: &Expr, dest: i32, jump_if_null: bool) -> Result<()> {
    match e.op {
        ExprOp::And => {
            code_expr_if_false(p, e.left.as_deref().expect("lhs"), dest, jump_if_null)?;
            code_expr_if_false(p, e.right.as_deref().expect("rhs"), dest, jump_if_null)?;
        }
        ExprOp::Or => {
            let fall = p.v.make_label();
            code_expr_if_true(p, e.left.as_deref().expect("lhs"), fall, !jump_if_null)?;
            code_expr_if_false(p, e.right.as_deref().expect("rhs"), dest, jump_if_null)?;
            p.v.resolve_label(fall);
        }
        ExprOp::Not => {
            code_expr_if_true(p, e.left.as_deref().expect("operand"), dest, jump_if_null)?;
        }
        ExprOp::Eq | ExprOp::Ne | ExprOp::Lt | ExprOp::Le | ExprOp::Gt | ExprOp::Ge => {
            let l = e.left.as_deref().expect("lhs");
            let r = e.right.as_deref().expect("rhs");
            code_expr(p, l)?;
            code_expr(p, r)?;
            let base = invert_comparison(comparison_base(e.op));
            let op = Opcode::comparison(base, comparison_type(l, r));
            p.v.add_op(op, jump_if_null as i32, dest);
        }
        ExprOp::IsNull => {
            code_expr(p, e.left.as_deref().expect("operand"))?;
            p.v.add_op(Opcode::NotNull, 1, dest);
        }
        ExprOp::NotNull => {
            code_expr(p, e.left.as_deref().expect("operand"))?;
            p.v.add_op(Opcode::IsNull, 1, dest);
        }
        ExprOp::Between => {
            let rewritten = rewrite_between(e);
            code_expr_if_false(p, &rewritten, dest, jump_if_null)?;
        }
        _ => {
            code_expr(p, e)?;
            p.v.add_op(Opcode::IfNot, jump_if_null as i32, dest);
        }
    }
    Ok(())
}
