//! Expression trees and SELECT structures
//!
//! The parser's semantic actions assemble these nodes; name resolution
//! annotates them in place; codegen walks them. Every node exclusively
//! owns its children, so duplication is a deep clone and dropping a
//! partially built tree frees it.

use std::rc::Rc;

use crate::func::FuncDef;
use crate::schema::Table;
use crate::types::DataType;

// ============================================================================
// Expression Operators
// ============================================================================

/// Operator tag of an expression node. These mirror the token tags the
/// parser produces and stay opaque outside the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    // Literals and names
    Null,
    Integer,
    Float,
    String,
    /// Double-quoted text: resolves as an identifier when it names a
    /// column, else decays to a string literal
    QString,
    Variable,
    Id,
    Dot,
    /// A resolved column reference (table_idx/column_idx are valid)
    Column,
    /// An output-alias reference rewritten from Id (`ORDER BY alias`)
    As,
    Function,
    /// A function call recognized as an aggregate
    AggFunction,

    // Binary arithmetic / string
    Plus,
    Minus,
    Star,
    Slash,
    Rem,
    Concat,

    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logic
    And,
    Or,
    Not,
    IsNull,
    NotNull,

    // Bitwise
    BitAnd,
    BitOr,
    BitNot,
    LShift,
    RShift,

    // Unary
    UMinus,
    UPlus,

    // Composite
    In,
    Between,
    Case,
    /// Scalar subquery
    Select,
    Exists,
}

// ============================================================================
// Expression Node
// ============================================================================

/// One node of an expression tree.
#[derive(Debug, Clone)]
pub struct Expr {
    pub op: ExprOp,
    pub left: Option<Box<Expr>>,
    pub right: Option<Box<Expr>>,
    /// Function arguments, IN list, or CASE when/then pairs
    pub list: Option<ExprList>,
    /// Subquery for In/Select/Exists
    pub select: Option<Box<Select>>,
    /// The defining token's text (identifier, literal, function name)
    pub token: String,
    /// Source text covered by the whole expression, used for naming
    /// result columns
    pub span: String,
    /// Resolved cursor number; for In, the set index or temp cursor
    pub table_idx: i32,
    /// Resolved column index; -1 means the row id
    pub column_idx: i32,
    /// Index into the aggregator's column array
    pub agg_idx: i32,
    /// Inferred data class, set by expr_check
    pub data_type: DataType,
    /// Resolved function definition for Function/AggFunction
    pub func: Option<Rc<FuncDef>>,
}

impl Expr {
    /// Create a node with up to two children.
    pub fn new(op: ExprOp, left: Option<Expr>, right: Option<Expr>, token: &str) -> Self {
        let mut e = Self {
            op,
            left: left.map(Box::new),
            right: right.map(Box::new),
            list: None,
            select: None,
            token: token.to_string(),
            span: String::new(),
            table_idx: -1,
            column_idx: 0,
            agg_idx: -1,
            data_type: DataType::Numeric,
            func: None,
        };
        if e.span.is_empty() {
            e.span = e.token.clone();
        }
        e
    }

    /// A bare literal or name node.
    pub fn leaf(op: ExprOp, token: &str) -> Self {
        Self::new(op, None, None, token)
    }

    /// A function-call node.
    pub fn function(name: &str, args: Option<ExprList>) -> Self {
        let mut e = Self::leaf(ExprOp::Function, name);
        e.list = args;
        e
    }

    /// Set the covered source span.
    pub fn set_span(&mut self, span: &str) {
        self.span = span.trim().to_string();
    }

    /// True for expressions built solely from literals: these may be
    /// evaluated at compile time and are the only forms allowed in an
    /// IN list and in DEFAULT clauses.
    pub fn is_constant(&self) -> bool {
        match self.op {
            ExprOp::Null | ExprOp::Integer | ExprOp::Float | ExprOp::String => true,
            ExprOp::UMinus | ExprOp::UPlus => {
                self.left.as_ref().map(|e| e.is_constant()).unwrap_or(false)
            }
            ExprOp::Plus
            | ExprOp::Minus
            | ExprOp::Star
            | ExprOp::Slash
            | ExprOp::Rem
            | ExprOp::Concat => {
                self.left.as_ref().map(|e| e.is_constant()).unwrap_or(false)
                    && self.right.as_ref().map(|e| e.is_constant()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Walk the tree pre-order, calling `f` on every node. When `f`
    /// returns false the node's children are skipped.
    pub fn walk(&self, f: &mut impl FnMut(&Expr) -> bool) {
        if !f(self) {
            return;
        }
        if let Some(l) = &self.left {
            l.walk(f);
        }
        if let Some(r) = &self.right {
            r.walk(f);
        }
        if let Some(list) = &self.list {
            for item in &list.items {
                item.expr.walk(f);
            }
        }
    }
}

// ============================================================================
// Expression Lists
// ============================================================================

/// One element of an expression list: the expression plus an optional
/// alias and (for ORDER BY) a direction.
#[derive(Debug, Clone)]
pub struct ExprItem {
    pub expr: Expr,
    pub name: Option<String>,
    /// Descending sort for ORDER BY terms
    pub desc: bool,
    /// Scratch marker used while matching compound ORDER BY terms
    pub done: bool,
}

impl ExprItem {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr,
            name: None,
            desc: false,
            done: false,
        }
    }
}

/// An ordered list of expressions (result columns, function arguments,
/// GROUP BY, ORDER BY, IN lists).
#[derive(Debug, Clone, Default)]
pub struct ExprList {
    pub items: Vec<ExprItem>,
}

impl ExprList {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn append(&mut self, expr: Expr, name: Option<String>) {
        let mut item = ExprItem::new(expr);
        item.name = name;
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
// Identifier Lists
// ============================================================================

/// A plain list of identifiers (column name lists, USING clauses).
#[derive(Debug, Clone, Default)]
pub struct IdList {
    pub names: Vec<String>,
}

impl IdList {
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// FROM Clause
// ============================================================================

bitflags::bitflags! {
    /// Join qualifiers between a FROM term and the term before it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JoinType: u8 {
        const INNER   = 0x01;
        const CROSS   = 0x02;
        const NATURAL = 0x04;
        const LEFT    = 0x08;
        const RIGHT   = 0x10;
        const OUTER   = 0x20;
    }
}

/// One term of a FROM clause.
#[derive(Debug, Clone)]
pub struct SrcItem {
    /// Explicit database qualifier (`db.table`)
    pub database: Option<String>,
    /// Table or view name; empty for naked subqueries
    pub name: String,
    pub alias: Option<String>,
    /// Resolved copy of the schema object
    pub table: Option<Box<Table>>,
    /// Subquery in FROM
    pub select: Option<Box<Select>>,
    /// Join type connecting this term to the previous one
    pub jointype: JoinType,
    pub on_expr: Option<Box<Expr>>,
    pub using: Option<IdList>,
    /// VDBE cursor assigned during planning
    pub cursor: i32,
}

impl SrcItem {
    pub fn named(database: Option<String>, name: &str) -> Self {
        Self {
            database,
            name: name.to_string(),
            alias: None,
            table: None,
            select: None,
            jointype: JoinType::empty(),
            on_expr: None,
            using: None,
            cursor: -1,
        }
    }

    /// The name this term answers to in qualified references.
    pub fn visible_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A FROM clause.
#[derive(Debug, Clone, Default)]
pub struct SrcList {
    pub items: Vec<SrcItem>,
}

impl SrcList {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
// SELECT Statement
// ============================================================================

/// Compound operator linking a SELECT to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompoundOp {
    #[default]
    Select,
    Union,
    UnionAll,
    Intersect,
    Except,
}

/// A parsed SELECT statement (possibly one branch of a compound).
#[derive(Debug, Clone)]
pub struct Select {
    /// Result columns; a lone `*` parses as an empty list
    pub result: ExprList,
    pub src: SrcList,
    pub where_expr: Option<Box<Expr>>,
    pub group_by: Option<ExprList>,
    pub having: Option<Box<Expr>>,
    pub order_by: Option<ExprList>,
    pub distinct: bool,
    /// LIMIT count; negative means none
    pub limit: i64,
    /// OFFSET count; 0 means none
    pub offset: i64,
    /// How this branch combines with `prior`
    pub op: CompoundOp,
    /// The SELECT to the left in a compound statement
    pub prior: Option<Box<Select>>,
    /// Memory cells holding the countdown counters, set by
    /// compute_limit_registers; negative when absent
    pub limit_mem: i32,
    pub offset_mem: i32,
}

impl Select {
    pub fn new(result: ExprList, src: SrcList) -> Self {
        Self {
            result,
            src,
            where_expr: None,
            group_by: None,
            having: None,
            order_by: None,
            distinct: false,
            limit: -1,
            offset: 0,
            op: CompoundOp::Select,
            prior: None,
            limit_mem: -1,
            offset_mem: -1,
        }
    }
}

// ============================================================================
// Statements
// ============================================================================

/// A possibly database-qualified object name.
#[derive(Debug, Clone, Default)]
pub struct QualName {
    pub database: Option<String>,
    pub name: String,
}

impl QualName {
    pub fn bare(name: &str) -> Self {
        Self {
            database: None,
            name: name.to_string(),
        }
    }
}

use crate::schema::{ConflictAction, TriggerEvent, TriggerTime};

/// One column definition in CREATE TABLE.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub decl_type: Option<String>,
    pub default_value: Option<Expr>,
    pub not_null: bool,
    pub primary_key: bool,
    pub pk_conflict: ConflictAction,
    pub unique: bool,
    pub collate: Option<DataType>,
    /// Column-level REFERENCES clause
    pub references: Option<(String, IdList)>,
}

impl ColumnDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            decl_type: None,
            default_value: None,
            not_null: false,
            primary_key: false,
            pk_conflict: ConflictAction::Abort,
            unique: false,
            collate: None,
            references: None,
        }
    }
}

/// A table-level constraint in CREATE TABLE.
#[derive(Debug, Clone)]
pub enum TableConstraint {
    PrimaryKey(IdList, ConflictAction),
    Unique(IdList, ConflictAction),
    ForeignKey {
        columns: IdList,
        to_table: String,
        to_columns: IdList,
        on_delete: ConflictAction,
        on_update: ConflictAction,
        deferred: bool,
    },
}

/// Source of an INSERT's row.
#[derive(Debug, Clone)]
pub enum InsertSource {
    Values(ExprList),
    Select(Box<Select>),
}

/// A parsed statement.
#[derive(Debug, Clone)]
pub enum Stmt {
    Select(Select),
    Insert {
        on_error: ConflictAction,
        table: QualName,
        columns: Option<IdList>,
        source: InsertSource,
    },
    Delete {
        table: QualName,
        where_expr: Option<Box<Expr>>,
    },
    Update {
        on_error: ConflictAction,
        table: QualName,
        sets: Vec<(String, Expr)>,
        where_expr: Option<Box<Expr>>,
    },
    CreateTable {
        temp: bool,
        name: QualName,
        columns: Vec<ColumnDef>,
        constraints: Vec<TableConstraint>,
        as_select: Option<Box<Select>>,
        /// Text of the whole statement, stored in the master table
        sql: String,
    },
    CreateView {
        temp: bool,
        name: QualName,
        select: Box<Select>,
        sql: String,
    },
    CreateIndex {
        unique: Option<ConflictAction>,
        name: QualName,
        table: String,
        columns: IdList,
        sql: String,
    },
    CreateTrigger {
        name: QualName,
        time: TriggerTime,
        event: TriggerEvent,
        columns: Option<IdList>,
        table: String,
        sql: String,
    },
    DropTable(QualName),
    DropView(QualName),
    DropIndex(QualName),
    DropTrigger(QualName),
    Begin(ConflictAction),
    CommitTxn,
    RollbackTxn,
    Copy {
        on_error: ConflictAction,
        table: QualName,
        file: String,
        delimiter: Option<String>,
    },
    Pragma {
        name: String,
        value: Option<Expr>,
    },
    Attach {
        filename: Expr,
        db_name: String,
    },
    Detach(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_constant() {
        let lit = Expr::leaf(ExprOp::Integer, "5");
        assert!(lit.is_constant());
        let sum = Expr::new(
            ExprOp::Plus,
            Some(Expr::leaf(ExprOp::Integer, "1")),
            Some(Expr::leaf(ExprOp::Integer, "2")),
            "+",
        );
        assert!(sum.is_constant());
        let id = Expr::leaf(ExprOp::Id, "x");
        assert!(!id.is_constant());
    }

    #[test]
    fn test_expr_deep_clone_is_independent() {
        let mut a = Expr::new(
            ExprOp::Plus,
            Some(Expr::leaf(ExprOp::Integer, "1")),
            Some(Expr::leaf(ExprOp::Integer, "2")),
            "+",
        );
        let b = a.clone();
        a.left.as_mut().unwrap().token = "9".to_string();
        assert_eq!(b.left.as_ref().unwrap().token, "1");
    }

    #[test]
    fn test_walk_visits_all() {
        let e = Expr::new(
            ExprOp::And,
            Some(Expr::leaf(ExprOp::Integer, "1")),
            Some(Expr::new(
                ExprOp::Eq,
                Some(Expr::leaf(ExprOp::Id, "a")),
                Some(Expr::leaf(ExprOp::Integer, "3")),
                "=",
            )),
            "AND",
        );
        let mut n = 0;
        e.walk(&mut |_| {
            n += 1;
            true
        });
        assert_eq!(n, 5);
    }

    #[test]
    fn test_idlist_case_insensitive() {
        let ids = IdList {
            names: vec!["Alpha".into()],
        };
        assert!(ids.contains("ALPHA"));
        assert!(!ids.contains("beta"));
    }
}
