//! Database connections
//!
//! A `Connection` owns the attached databases (main, temp, and any
//! ATTACHed auxiliaries), the registered functions, the PRNG, and the
//! caller-installed hooks. A magic field guards against re-entrant API
//! use: every entry point checks it is `Idle`, flips to `Busy`, and
//! restores on exit.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::func::{FuncContext, FuncDef, FuncReturn};
use crate::random::Prng;
use crate::schema::{Db, SchemaChange, DB_MAIN, DB_TEMP};
use crate::types::{RowId, StepResult, Value};
use crate::vdbe::Vdbe;

use super::stmt::Statement;

// ============================================================================
// Authorization
// ============================================================================

/// Action codes handed to the authorizer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    CreateIndex,
    CreateTable,
    CreateTempIndex,
    CreateTempTable,
    CreateTempTrigger,
    CreateTempView,
    CreateTrigger,
    CreateView,
    Delete,
    DropIndex,
    DropTable,
    DropTempIndex,
    DropTempTable,
    DropTempTrigger,
    DropTempView,
    DropTrigger,
    DropView,
    Insert,
    Pragma,
    Read,
    Select,
    Transaction,
    Update,
    Attach,
    Detach,
    Copy,
}

/// Authorizer verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Allow the operation
    Ok,
    /// Fail the prepare with a permission error
    Deny,
    /// Allow the prepare but elide the guarded access (a denied column
    /// read compiles to literal NULL)
    Ignore,
}

pub type Authorizer = Box<dyn FnMut(AuthAction, &str, &str, &str, &str) -> AuthResult>;

// ============================================================================
// Connection Magic
// ============================================================================

/// Re-entrancy guard state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMagic {
    Idle,
    Busy,
    Closed,
}

// ============================================================================
// Connection
// ============================================================================

/// An open database connection.
pub struct Connection {
    pub(crate) dbs: Vec<Db>,
    pub(crate) funcs: Vec<Rc<FuncDef>>,
    pub(crate) prng: Prng,
    pub(crate) magic: ConnMagic,
    interrupt: Arc<AtomicBool>,
    pub(crate) busy: Option<Box<dyn FnMut(String, i32) -> bool>>,
    pub(crate) progress: Option<Box<dyn FnMut() -> bool>>,
    pub(crate) progress_ops: Option<usize>,
    pub(crate) trace: Option<Box<dyn FnMut(&str)>>,
    pub(crate) commit_hook: Option<Box<dyn FnMut() -> bool>>,
    pub(crate) authorizer: Option<Authorizer>,
    pub(crate) last_rowid: RowId,
    pub(crate) last_change_count: i64,
    pub(crate) total_change_count: i64,
    /// Conflict policy installed by BEGIN ... ON CONFLICT
    pub(crate) default_conflict: crate::schema::ConflictAction,
}

impl Connection {
    /// Open a connection on `path`. `:memory:` (or an empty path) is a
    /// private database; any other path is shared with every other
    /// connection that opens it.
    pub fn open(path: &str) -> Result<Self> {
        let main_handle = crate::storage::open_env(path, false)?;
        let mut conn = Self {
            dbs: vec![Db::new("main", Some(main_handle)), Db::new("temp", None)],
            funcs: Vec::new(),
            prng: Prng::new(),
            magic: ConnMagic::Idle,
            interrupt: Arc::new(AtomicBool::new(false)),
            busy: None,
            progress: None,
            progress_ops: None,
            trace: None,
            commit_hook: None,
            authorizer: None,
            last_rowid: 0,
            last_change_count: 0,
            total_change_count: 0,
            default_conflict: crate::schema::ConflictAction::Abort,
        };
        register_builtin_functions(&mut conn);
        log::debug!("opened connection on {:?}", path);
        Ok(conn)
    }

    /// Close the connection, releasing attached databases.
    pub fn close(mut self) {
        self.rollback_open_txns();
        self.dbs.clear();
        self.magic = ConnMagic::Closed;
    }

    // ========================================================================
    // Guard
    // ========================================================================

    pub(crate) fn enter(&mut self) -> Result<()> {
        if self.magic != ConnMagic::Idle {
            return Err(Error::new(ErrorCode::Misuse));
        }
        self.magic = ConnMagic::Busy;
        Ok(())
    }

    pub(crate) fn leave(&mut self) {
        if self.magic == ConnMagic::Busy {
            self.magic = ConnMagic::Idle;
        }
    }

    // ========================================================================
    // Statement API
    // ========================================================================

    /// Compile the first statement of `sql`. Returns `None` when only
    /// whitespace or comments precede the end of input, along with the
    /// byte offset of the uncompiled tail.
    pub fn prepare(&mut self, sql: &str) -> Result<(Option<Statement>, usize)> {
        self.enter()?;
        let r = crate::executor::prepare::compile(self, sql);
        self.leave();
        r
    }

    /// Run one step of a prepared statement.
    pub fn step(&mut self, stmt: &mut Statement) -> Result<StepResult> {
        self.enter()?;
        let r = stmt.step_inner(self);
        self.leave();
        r
    }

    /// Convenience: compile and run every statement of `sql`, invoking
    /// `callback(values, names)` per row. A callback returning false
    /// aborts with `Abort`. The names slice holds the column names
    /// followed by their declared types.
    pub fn exec(
        &mut self,
        sql: &str,
        mut callback: impl FnMut(&[Value], &[String]) -> bool,
    ) -> Result<()> {
        let mut rest_at = 0usize;
        while rest_at < sql.len() {
            let chunk = &sql[rest_at..];
            let (stmt, tail) = self.prepare(chunk)?;
            rest_at += if tail == 0 { chunk.len() } else { tail };
            let mut stmt = match stmt {
                Some(s) => s,
                None => break,
            };
            if let Some(h) = self.trace.as_mut() {
                h(stmt.sql());
            }
            loop {
                match self.step(&mut stmt)? {
                    StepResult::Row => {
                        let names = stmt.names().to_vec();
                        if !callback(stmt.row(), &names) {
                            stmt.finalize()?;
                            return Err(Error::new(ErrorCode::Abort));
                        }
                    }
                    StepResult::Done => break,
                    StepResult::Busy => {
                        stmt.finalize()?;
                        return Err(Error::new(ErrorCode::Busy));
                    }
                }
            }
            stmt.finalize()?;
        }
        Ok(())
    }

    /// Collect an entire result set: column names first, then one row
    /// of values per result row.
    pub fn exec_table(&mut self, sql: &str) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
        let mut names: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        self.exec(sql, |vals, hdrs| {
            if names.is_empty() {
                let n = vals.len();
                names = hdrs.iter().take(n).cloned().collect();
            }
            rows.push(vals.to_vec());
            true
        })?;
        Ok((names, rows))
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Register a scalar function. `n_arg` of -1 accepts any argument
    /// count. Re-registering a (name, n_arg) pair replaces it.
    pub fn create_function(
        &mut self,
        name: &str,
        n_arg: i32,
        returns: FuncReturn,
        func: impl Fn(&mut FuncContext, &[Value]) + 'static,
    ) {
        self.add_func(FuncDef {
            name: name.to_string(),
            n_arg,
            func: Some(Rc::new(func)),
            step: None,
            finalize: None,
            returns,
        });
    }

    /// Register an aggregate function as its step and finalize halves.
    pub fn create_aggregate(
        &mut self,
        name: &str,
        n_arg: i32,
        returns: FuncReturn,
        step: impl Fn(&mut FuncContext, &[Value]) + 'static,
        finalize: impl Fn(&mut FuncContext) + 'static,
    ) {
        self.add_func(FuncDef {
            name: name.to_string(),
            n_arg,
            func: None,
            step: Some(Rc::new(step)),
            finalize: Some(Rc::new(finalize)),
            returns,
        });
    }

    fn add_func(&mut self, def: FuncDef) {
        self.funcs
            .retain(|f| !(f.name.eq_ignore_ascii_case(&def.name) && f.n_arg == def.n_arg));
        self.funcs.push(Rc::new(def));
    }

    /// Find the best function for a call site: exact arity wins over a
    /// variadic registration.
    pub(crate) fn find_function(&self, name: &str, n_arg: i32) -> Option<Rc<FuncDef>> {
        let mut fallback = None;
        for f in &self.funcs {
            if !f.name.eq_ignore_ascii_case(name) {
                continue;
            }
            if f.n_arg == n_arg {
                return Some(f.clone());
            }
            if f.n_arg < 0 {
                fallback = Some(f.clone());
            }
        }
        fallback
    }

    /// Whether any registration of `name` exists (for arity errors).
    pub(crate) fn function_exists(&self, name: &str) -> bool {
        self.funcs.iter().any(|f| f.name.eq_ignore_ascii_case(name))
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    pub fn set_authorizer(&mut self, auth: Option<Authorizer>) {
        self.authorizer = auth;
    }

    pub fn set_busycall(&mut self, handler: Option<Box<dyn FnMut(String, i32) -> bool>>) {
        self.busy = handler;
    }

    /// Install the default busy handler: sleep-and-retry until the
    /// cumulative delay exceeds `ms`.
    pub fn set_timeout(&mut self, ms: u64) {
        if ms == 0 {
            self.busy = None;
            return;
        }
        let mut waited = 0u64;
        self.busy = Some(Box::new(move |_db, _count| {
            if waited >= ms {
                return false;
            }
            let slice = 10.min(ms - waited);
            std::thread::sleep(std::time::Duration::from_millis(slice));
            waited += slice;
            true
        }));
    }

    pub fn set_progresscall(
        &mut self,
        every_n_ops: usize,
        handler: Option<Box<dyn FnMut() -> bool>>,
    ) {
        self.progress_ops = handler.as_ref().map(|_| every_n_ops.max(1));
        self.progress = handler;
    }

    pub fn set_tracecall(&mut self, handler: Option<Box<dyn FnMut(&str)>>) {
        self.trace = handler;
    }

    /// The commit hook; returning true converts the commit into a
    /// constraint failure.
    pub fn set_commitcall(&mut self, handler: Option<Box<dyn FnMut() -> bool>>) {
        self.commit_hook = handler;
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn last_inserted_rowid(&self) -> RowId {
        self.last_rowid
    }

    /// Rows changed by the most recent statement.
    pub fn last_change_count(&self) -> i64 {
        self.last_change_count
    }

    /// Rows changed since the connection opened.
    pub fn total_change_count(&self) -> i64 {
        self.total_change_count
    }

    /// Ask the running statement to stop at its next jump opcode.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Handle for interrupting from another thread.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        let hit = self.interrupt.load(Ordering::SeqCst);
        if hit {
            self.interrupt.store(false, Ordering::SeqCst);
        }
        hit
    }

    // ========================================================================
    // Databases
    // ========================================================================

    pub(crate) fn db_index(&self, name: &str) -> Option<usize> {
        self.dbs
            .iter()
            .position(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// The temp database's storage springs into existence on first use.
    pub(crate) fn ensure_temp_db(&mut self) -> Result<()> {
        if self.dbs[DB_TEMP].handle.is_none() {
            self.dbs[DB_TEMP].handle = Some(crate::storage::open_env(":memory:", true)?);
        }
        Ok(())
    }

    pub(crate) fn attach_db(&mut self, name: &str, path: &str) -> Result<usize> {
        if self.db_index(name).is_some() {
            return Err(Error::with_message(
                ErrorCode::Error,
                format!("database {} is already in use", name),
            ));
        }
        let handle = crate::storage::open_env(path, false)?;
        self.dbs.push(Db::new(name, Some(handle)));
        Ok(self.dbs.len() - 1)
    }

    pub(crate) fn detach_db(&mut self, name: &str) -> Result<()> {
        let idx = self
            .db_index(name)
            .ok_or_else(|| Error::with_message(ErrorCode::Error, format!("no such database: {}", name)))?;
        if idx <= DB_TEMP {
            return Err(Error::with_message(
                ErrorCode::Error,
                format!("cannot detach database {}", name),
            ));
        }
        self.dbs.remove(idx);
        Ok(())
    }

    /// Apply staged schema-cache changes, patching freshly allocated
    /// root pages into the objects that were waiting for them.
    pub(crate) fn apply_schema_changes(
        &mut self,
        changes: Vec<SchemaChange>,
        roots: &mut Vec<crate::types::PageNo>,
    ) {
        let mut roots = roots.drain(..);
        for change in changes {
            match change {
                SchemaChange::AddTable(mut t) => {
                    if t.tnum == 0 && !t.is_view() {
                        t.tnum = roots.next().unwrap_or(0);
                    }
                    let db = &mut self.dbs[t.db_idx];
                    db.unreset_views();
                    db.tables.insert(&t.name.clone(), t);
                }
                SchemaChange::AddIndex(mut ix) => {
                    if ix.tnum == 0 {
                        ix.tnum = roots.next().unwrap_or(0);
                    }
                    let db = &mut self.dbs[ix.db_idx];
                    if let Some(t) = db.tables.find_mut(&ix.table) {
                        if !t.indices.iter().any(|n| n.eq_ignore_ascii_case(&ix.name)) {
                            t.indices.push(ix.name.clone());
                        }
                    }
                    db.indices.insert(&ix.name.clone(), ix);
                }
                SchemaChange::AddTrigger(tr) => {
                    let db = &mut self.dbs[tr.db_idx];
                    db.triggers.insert(&tr.name.clone(), tr);
                }
                SchemaChange::DropTable { db, name } => {
                    let db = &mut self.dbs[db];
                    if let Some(t) = db.tables.remove(&name) {
                        for ix in &t.indices {
                            db.indices.remove(ix);
                        }
                    }
                    db.unreset_views();
                }
                SchemaChange::DropIndex { db, name } => {
                    let db = &mut self.dbs[db];
                    if let Some(ix) = db.indices.remove(&name) {
                        if let Some(t) = db.tables.find_mut(&ix.table) {
                            t.indices.retain(|n| !n.eq_ignore_ascii_case(&name));
                        }
                    }
                }
                SchemaChange::DropTrigger { db, name } => {
                    self.dbs[db].triggers.remove(&name);
                }
            }
        }
    }

    /// Abort every open storage transaction (halt-time rollback).
    pub(crate) fn rollback_open_txns(&mut self) {
        for db in &mut self.dbs {
            if let Some(h) = db.handle.as_mut() {
                if h.in_txn() {
                    let _ = h.abort_txn();
                }
            }
            db.in_txn = false;
        }
    }

    /// Throw away every schema cache; they reload lazily.
    pub(crate) fn reset_all_schemas(&mut self) {
        for db in &mut self.dbs {
            db.reset_schema();
        }
        log::debug!("schema caches reset");
    }

    /// Run the authorizer, mapping Deny to an error.
    pub(crate) fn authorize(
        &mut self,
        action: AuthAction,
        arg1: &str,
        arg2: &str,
        db_name: &str,
    ) -> Result<AuthResult> {
        let res = match self.authorizer.as_mut() {
            Some(a) => a(action, arg1, arg2, db_name, ""),
            None => AuthResult::Ok,
        };
        if res == AuthResult::Deny {
            return Err(Error::with_message(
                ErrorCode::Perm,
                format!("not authorized ({:?} {} {})", action, arg1, arg2),
            ));
        }
        Ok(res)
    }

    /// Drive a ready Vdbe to completion, for internal statements.
    pub(crate) fn run_to_completion(&mut self, v: &mut Vdbe) -> Result<()> {
        loop {
            match crate::vdbe::vdbe_exec(self, v)? {
                crate::vdbe::Exec::Done => return Ok(()),
                crate::vdbe::Exec::Row => continue,
                crate::vdbe::Exec::Busy => {
                    return Err(Error::new(ErrorCode::Busy));
                }
            }
        }
    }
}

// ============================================================================
// Builtin Functions
// ============================================================================

/// The handful of functions the planner and the standard test corpus
/// rely on, registered through the same public mechanism user functions
/// use.
fn register_builtin_functions(conn: &mut Connection) {
    use crate::util::strings;

    conn.create_function("length", 1, FuncReturn::Numeric, |ctx, args| {
        match args.first() {
            Some(Value::Null) | None => ctx.set_result(Value::Null),
            Some(v) => ctx.set_result(Value::Int(v.to_text().len() as i64)),
        }
    });

    conn.create_function("substr", 3, FuncReturn::Text, |ctx, args| {
        if args.iter().any(Value::is_null) {
            ctx.set_result(Value::Null);
            return;
        }
        let text = args[0].to_text();
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len() as i64;
        let mut start = args[1].to_int();
        let count = args[2].to_int().max(0);
        if start < 0 {
            start = (len + start).max(0) + 1;
        }
        let begin = (start - 1).clamp(0, len) as usize;
        let end = ((start - 1) + count).clamp(0, len) as usize;
        ctx.set_result(Value::Text(chars[begin..end].iter().collect()));
    });

    conn.create_function("abs", 1, FuncReturn::Numeric, |ctx, args| {
        match args.first() {
            Some(Value::Null) | None => ctx.set_result(Value::Null),
            Some(Value::Int(i)) => ctx.set_result(Value::Int(i.wrapping_abs())),
            Some(v) => ctx.set_result(Value::Real(v.to_real().abs())),
        }
    });

    conn.create_function("round", -1, FuncReturn::Numeric, |ctx, args| {
        match args.first() {
            Some(Value::Null) | None => ctx.set_result(Value::Null),
            Some(v) => {
                let digits = args.get(1).map(|d| d.to_int()).unwrap_or(0).clamp(0, 30);
                let factor = 10f64.powi(digits as i32);
                ctx.set_result(Value::Real((v.to_real() * factor).round() / factor));
            }
        }
    });

    conn.create_function("coalesce", -1, FuncReturn::ArgType, |ctx, args| {
        for a in args {
            if !a.is_null() {
                ctx.set_result(a.clone());
                return;
            }
        }
        ctx.set_result(Value::Null);
    });

    conn.create_function("ifnull", 2, FuncReturn::ArgType, |ctx, args| {
        for a in args {
            if !a.is_null() {
                ctx.set_result(a.clone());
                return;
            }
        }
        ctx.set_result(Value::Null);
    });

    conn.create_function("upper", 1, FuncReturn::Text, |ctx, args| {
        match args.first() {
            Some(Value::Null) | None => ctx.set_result(Value::Null),
            Some(v) => ctx.set_result(Value::Text(v.to_text().to_uppercase())),
        }
    });

    conn.create_function("lower", 1, FuncReturn::Text, |ctx, args| {
        match args.first() {
            Some(Value::Null) | None => ctx.set_result(Value::Null),
            Some(v) => ctx.set_result(Value::Text(v.to_text().to_lowercase())),
        }
    });

    conn.create_function("like", 2, FuncReturn::Numeric, |ctx, args| {
        if args.iter().any(Value::is_null) {
            ctx.set_result(Value::Null);
            return;
        }
        let hit = strings::like_match(&args[0].to_text(), &args[1].to_text());
        ctx.set_result(Value::Int(hit as i64));
    });

    conn.create_function("glob", 2, FuncReturn::Numeric, |ctx, args| {
        if args.iter().any(Value::is_null) {
            ctx.set_result(Value::Null);
            return;
        }
        let hit = strings::glob_match(&args[0].to_text(), &args[1].to_text());
        ctx.set_result(Value::Int(hit as i64));
    });

    // Scalar min/max take two or more arguments; the single-argument
    // forms below are the aggregates.
    conn.create_function("min", -1, FuncReturn::ArgType, |ctx, args| {
        if args.is_empty() || args.iter().any(Value::is_null) {
            ctx.set_result(Value::Null);
            return;
        }
        let mut best = args[0].clone();
        for a in &args[1..] {
            if compare_values(a, &best) == std::cmp::Ordering::Less {
                best = a.clone();
            }
        }
        ctx.set_result(best);
    });

    conn.create_function("max", -1, FuncReturn::ArgType, |ctx, args| {
        if args.is_empty() || args.iter().any(Value::is_null) {
            ctx.set_result(Value::Null);
            return;
        }
        let mut best = args[0].clone();
        for a in &args[1..] {
            if compare_values(a, &best) == std::cmp::Ordering::Greater {
                best = a.clone();
            }
        }
        ctx.set_result(best);
    });

    register_minmax_aggregate(conn, "min", std::cmp::Ordering::Less);
    register_minmax_aggregate(conn, "max", std::cmp::Ordering::Greater);

    conn.create_aggregate(
        "count",
        -1,
        FuncReturn::Numeric,
        |ctx, args| {
            let counts = args.is_empty() || !args[0].is_null();
            let n = ctx.aggregate_context::<i64>();
            if counts {
                *n += 1;
            }
        },
        |ctx| {
            let n = *ctx.aggregate_context::<i64>();
            ctx.set_result(Value::Int(n));
        },
    );

    #[derive(Default)]
    struct SumState {
        total: f64,
        seen: bool,
    }

    conn.create_aggregate(
        "sum",
        1,
        FuncReturn::Numeric,
        |ctx, args| {
            if let Some(v) = args.first() {
                if !v.is_null() {
                    let s = ctx.aggregate_context::<SumState>();
                    s.total += v.to_real();
                    s.seen = true;
                }
            }
        },
        |ctx| {
            let s = ctx.aggregate_context::<SumState>();
            let (total, seen) = (s.total, s.seen);
            ctx.set_result(if seen {
                if total == total.trunc() && total.abs() < 9.0e15 {
                    Value::Int(total as i64)
                } else {
                    Value::Real(total)
                }
            } else {
                Value::Null
            });
        },
    );

    conn.create_aggregate(
        "avg",
        1,
        FuncReturn::Numeric,
        |ctx, args| {
            if let Some(v) = args.first() {
                if !v.is_null() {
                    let s = ctx.aggregate_context::<SumState>();
                    s.total += v.to_real();
                    s.seen = true;
                }
            }
        },
        |ctx| {
            let s = ctx.aggregate_context::<SumState>();
            let (total, seen) = (s.total, s.seen);
            let count = ctx.count;
            ctx.set_result(if seen && count > 0 {
                Value::Real(total / count as f64)
            } else {
                Value::Null
            });
        },
    );
}

/// SQL ordering of two non-null values: numbers before text, numbers by
/// value, text bytewise.
fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use crate::util::strings::is_numeric;
    let a_num = matches!(a, Value::Int(_) | Value::Real(_))
        || matches!(a, Value::Text(s) if is_numeric(s));
    let b_num = matches!(b, Value::Int(_) | Value::Real(_))
        || matches!(b, Value::Text(s) if is_numeric(s));
    match (a_num, b_num) {
        (true, true) => a
            .to_real()
            .partial_cmp(&b.to_real())
            .unwrap_or(std::cmp::Ordering::Equal),
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        (false, false) => a.to_text().cmp(&b.to_text()),
    }
}

fn register_minmax_aggregate(conn: &mut Connection, name: &str, keep: std::cmp::Ordering) {
    #[derive(Default)]
    struct Best(Option<Value>);
    conn.create_aggregate(
        name,
        1,
        FuncReturn::ArgType,
        move |ctx, args| {
            let v = match args.first() {
                Some(v) if !v.is_null() => v.clone(),
                _ => return,
            };
            let best = ctx.aggregate_context::<Best>();
            let replace = match &best.0 {
                None => true,
                Some(cur) => compare_values(&v, cur) == keep,
            };
            if replace {
                best.0 = Some(v);
            }
        },
        |ctx| {
            let v = ctx.aggregate_context::<Best>().0.clone();
            ctx.set_result(v.unwrap_or(Value::Null));
        },
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_function_prefers_exact_arity() {
        let conn = Connection::open(":memory:").unwrap();
        // min is registered both variadic (scalar) and 1-arg (aggregate).
        let agg = conn.find_function("min", 1).unwrap();
        assert!(agg.is_aggregate());
        let scalar = conn.find_function("min", 2).unwrap();
        assert!(!scalar.is_aggregate());
    }

    #[test]
    fn test_db_index() {
        let conn = Connection::open(":memory:").unwrap();
        assert_eq!(conn.db_index("main"), Some(DB_MAIN));
        assert_eq!(conn.db_index("TEMP"), Some(DB_TEMP));
        assert_eq!(conn.db_index("aux"), None);
    }

    #[test]
    fn test_reentry_guard() {
        let mut conn = Connection::open(":memory:").unwrap();
        conn.enter().unwrap();
        assert_eq!(conn.enter().unwrap_err().code, ErrorCode::Misuse);
        conn.leave();
        conn.enter().unwrap();
        conn.leave();
    }

    #[test]
    fn test_compare_values_classes() {
        use std::cmp::Ordering::*;
        assert_eq!(
            compare_values(&Value::Int(2), &Value::Text("10".into())),
            Less
        );
        assert_eq!(
            compare_values(&Value::Int(2), &Value::Text("x".into())),
            Less
        );
        assert_eq!(
            compare_values(&Value::Text("b".into()), &Value::Text("a".into())),
            Greater
        );
    }
}
