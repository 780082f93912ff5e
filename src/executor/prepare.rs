//! Statement preparation
//!
//! The pipeline from SQL text to a runnable program: parse, load any
//! missing schema caches from the master tables, dispatch to the
//! statement compilers, and resolve labels. The [`Parse`] context
//! carries everything codegen needs — the connection, the program under
//! construction, the allocators for cursors / memory cells / sets, and
//! the accumulated error state.

use crate::api::connection::Connection;
use crate::api::stmt::Statement;
use crate::error::{Error, ErrorCode, Result};
use crate::parser::ast::Stmt;
use crate::parser::grammar::Parser;
use crate::schema::{Db, DbFlags, DB_TEMP};
use crate::storage::MASTER_ROOT;
use crate::types::PageNo;
use crate::vdbe::ops::P3;
use crate::vdbe::{Opcode, Vdbe};

// ============================================================================
// Parse Context
// ============================================================================

/// State threaded through the semantic actions and code generators of
/// one statement.
pub struct Parse<'c> {
    pub conn: &'c mut Connection,
    /// The program under construction
    pub v: Vdbe,
    /// Semantic errors recorded so far; no code runs when nonzero
    pub n_err: usize,
    pub err_msg: Option<String>,
    /// Cursor number allocator
    pub n_tab: i32,
    /// Memory cell allocator
    pub n_mem: i32,
    /// Membership-set allocator
    pub n_set: i32,
    /// `?` variables seen so far
    pub n_var: i32,
    /// Replaying a master-table row instead of compiling user SQL
    pub initing: bool,
    pub init_db: usize,
    pub init_root: PageNo,
    /// The table being assembled by CREATE TABLE semantic actions
    pub new_table: Option<crate::schema::Table>,
    /// Aggregator cells registered for the SELECT being compiled
    pub agg_entries: Vec<crate::executor::select::AggEntry>,
    /// Column references compile to AggGet while the output loop of an
    /// aggregate query is being generated
    pub use_agg: bool,
    /// Databases whose signature check has been emitted
    verified_dbs: Vec<usize>,
    /// Databases with a statement transaction emitted
    txn_dbs: Vec<usize>,
}

impl<'c> Parse<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        Self {
            conn,
            v: Vdbe::new(),
            n_err: 0,
            err_msg: None,
            n_tab: 0,
            n_mem: 0,
            n_set: 0,
            n_var: 0,
            initing: false,
            init_db: 0,
            init_root: 0,
            new_table: None,
            agg_entries: Vec::new(),
            use_agg: false,
            verified_dbs: Vec::new(),
            txn_dbs: Vec::new(),
        }
    }

    /// Record a semantic error; the returned value propagates out of
    /// the compiler.
    pub fn error(&mut self, msg: impl Into<String>) -> Error {
        let msg = msg.into();
        self.n_err += 1;
        self.err_msg = Some(msg.clone());
        Error::with_message(ErrorCode::Error, msg)
    }

    /// Allocate a cursor number.
    pub fn alloc_cursor(&mut self) -> i32 {
        let c = self.n_tab;
        self.n_tab += 1;
        c
    }

    /// Allocate a memory cell.
    pub fn alloc_mem(&mut self) -> i32 {
        let m = self.n_mem;
        self.n_mem += 1;
        m
    }

    /// Allocate a membership set.
    pub fn alloc_set(&mut self) -> i32 {
        let s = self.n_set;
        self.n_set += 1;
        s
    }

    /// Emit the schema-signature check for a database, once per
    /// statement. A mismatch at run time halts with `Schema` so the
    /// caller re-prepares.
    pub fn code_verify_schema(&mut self, db_idx: usize) {
        if self.initing || self.verified_dbs.contains(&db_idx) {
            return;
        }
        self.verified_dbs.push(db_idx);
        let sig = self.conn.dbs[db_idx].schema_sig;
        self.v
            .add_op(Opcode::VerifySchemaSignature, db_idx as i32, sig as i32);
    }

    /// Open a statement-level transaction on a database, once.
    pub fn code_begin_write(&mut self, db_idx: usize) {
        if self.initing || self.txn_dbs.contains(&db_idx) {
            return;
        }
        self.txn_dbs.push(db_idx);
        self.v.add_op(Opcode::Transaction, db_idx as i32, 0);
    }

    /// Close the statement transactions opened by `code_begin_write`,
    /// unless a user transaction keeps them open.
    pub fn code_end_write(&mut self) {
        let dbs = std::mem::take(&mut self.txn_dbs);
        for db_idx in dbs {
            if !self.conn.dbs[db_idx].in_txn {
                self.v.add_op(Opcode::Commit, db_idx as i32, 0);
            }
        }
    }

    /// Draw a fresh schema signature and emit the ops that store it.
    /// Every committed DDL changes the signature so other connections'
    /// prepared statements notice. Signatures stay below 2^31 so they
    /// ride in a P2 operand without colliding with the label space.
    pub fn change_schema_signature(&mut self, db_idx: usize) {
        if self.initing {
            return;
        }
        let mut sig = self.conn.prng.random_u32() & 0x7fff_ffff;
        if sig == self.conn.dbs[db_idx].schema_sig {
            sig = sig.wrapping_add(1) & 0x7fff_ffff;
        }
        self.v
            .add_op(Opcode::SetSchemaSignature, db_idx as i32, sig as i32);
    }

    /// Resolve a table name (optionally db-qualified) to its database
    /// slot and a copy of the schema object.
    pub fn find_table(
        &mut self,
        database: Option<&str>,
        name: &str,
    ) -> Result<(usize, crate::schema::Table)> {
        let candidates: Vec<usize> = match database {
            Some(dbn) => match self.conn.db_index(dbn) {
                Some(i) => vec![i],
                None => {
                    return Err(self.error(format!("unknown database: {}", dbn)));
                }
            },
            // Unqualified names search temp before main, then the
            // attached databases.
            None => {
                let mut order = vec![DB_TEMP, 0];
                order.extend(2..self.conn.dbs.len());
                order
            }
        };
        for db_idx in candidates {
            if let Some(t) = self.conn.dbs.get(db_idx).and_then(|d| d.tables.find(name)) {
                return Ok((db_idx, t.clone()));
            }
        }
        // The catalog tables answer to their well-known names even
        // though they never live in the schema cache.
        if name.eq_ignore_ascii_case(crate::schema::MASTER_NAME)
            || name.eq_ignore_ascii_case(crate::schema::TEMP_MASTER_NAME)
        {
            let db_idx = if name.eq_ignore_ascii_case(crate::schema::TEMP_MASTER_NAME) {
                DB_TEMP
            } else {
                0
            };
            let mut t = crate::schema::Table::new(name, db_idx);
            for col_name in crate::schema::MASTER_COLUMNS {
                let mut col = crate::schema::Column::new(col_name);
                col.sort_class = if col_name == "rootpage" {
                    crate::types::DataType::Numeric
                } else {
                    crate::types::DataType::Text
                };
                t.columns.push(col);
            }
            t.tnum = MASTER_ROOT;
            return Ok((db_idx, t));
        }
        Err(self.error(format!("no such table: {}", name)))
    }

    /// Resolve an index name to (db, index).
    pub fn find_index(
        &mut self,
        database: Option<&str>,
        name: &str,
    ) -> Result<(usize, crate::schema::Index)> {
        let candidates: Vec<usize> = match database {
            Some(dbn) => match self.conn.db_index(dbn) {
                Some(i) => vec![i],
                None => return Err(self.error(format!("unknown database: {}", dbn))),
            },
            None => (0..self.conn.dbs.len()).collect(),
        };
        for db_idx in candidates {
            if let Some(ix) = self.conn.dbs.get(db_idx).and_then(|d| d.indices.find(name)) {
                return Ok((db_idx, ix.clone()));
            }
        }
        Err(self.error(format!("no such index: {}", name)))
    }
}

// ============================================================================
// Compilation Entry
// ============================================================================

/// Compile the first statement of `sql` into a prepared statement.
/// Returns `None` when only whitespace/comments remain, plus the byte
/// offset of the unconsumed tail.
pub fn compile(conn: &mut Connection, sql: &str) -> Result<(Option<Statement>, usize)> {
    let mut parser = Parser::new(sql)?;
    let (stmt, explain, tail) = parser.parse_statement()?;
    let stmt = match stmt {
        Some(s) => s,
        None => return Ok((None, sql.len())),
    };

    // begin_stmt: make sure every attached database's schema cache is
    // loaded, and clear per-statement properties on databases outside a
    // user transaction.
    init_schemas(conn)?;
    for db in conn.dbs.iter_mut() {
        if !db.in_txn {
            db.flags -= DbFlags::COOKIE_READ | DbFlags::SCHEMA_LOCKED;
        }
    }

    let mut p = Parse::new(conn);
    let result = compile_stmt(&mut p, &stmt);
    let n_err = p.n_err;
    let n_var = p.n_var;
    let mut v = std::mem::replace(&mut p.v, Vdbe::new());
    drop(p);
    result?;
    if n_err > 0 {
        return Err(Error::new(ErrorCode::Error));
    }

    v.n_var = n_var as usize;
    v.explain = explain;
    v.ready();
    log::debug!("prepared {} ops for {:?}", v.ops.len(), first_line(sql));
    Ok((Some(Statement::new(v, sql[..tail].trim())), tail))
}

fn first_line(sql: &str) -> &str {
    sql.lines().next().unwrap_or("").trim()
}

/// Dispatch a parsed statement to its code generator.
pub(crate) fn compile_stmt(p: &mut Parse, stmt: &Stmt) -> Result<()> {
    use crate::executor::{build, copy, delete, insert, pragma, select, update};
    match stmt {
        Stmt::Select(sel) => {
            let mut sel = sel.clone();
            select::compile_select(p, &mut sel, select::SelectDest::Callback)?;
            p.code_end_write();
            Ok(())
        }
        Stmt::Insert { .. } => insert::compile_insert(p, stmt),
        Stmt::Delete { .. } => delete::compile_delete(p, stmt),
        Stmt::Update { .. } => update::compile_update(p, stmt),
        Stmt::Copy { .. } => copy::compile_copy(p, stmt),
        Stmt::CreateTable { .. }
        | Stmt::CreateView { .. }
        | Stmt::CreateIndex { .. }
        | Stmt::CreateTrigger { .. }
        | Stmt::DropTable(_)
        | Stmt::DropView(_)
        | Stmt::DropIndex(_)
        | Stmt::DropTrigger(_)
        | Stmt::Begin(_)
        | Stmt::CommitTxn
        | Stmt::RollbackTxn
        | Stmt::Attach { .. }
        | Stmt::Detach(_) => build::compile_ddl(p, stmt),
        Stmt::Pragma { name, value } => pragma::compile_pragma(p, name, value.as_ref()),
    }
}

// ============================================================================
// Schema Recovery
// ============================================================================

/// Load the schema cache of every attached database that lacks one by
/// replaying the CREATE statements stored in its master table.
pub(crate) fn init_schemas(conn: &mut Connection) -> Result<()> {
    for db_idx in 0..conn.dbs.len() {
        init_one_schema(conn, db_idx)?;
    }
    Ok(())
}

pub(crate) fn init_one_schema(conn: &mut Connection, db_idx: usize) -> Result<()> {
    {
        let db: &Db = &conn.dbs[db_idx];
        if db.flags.contains(DbFlags::SCHEMA_LOADED) || db.handle.is_none() {
            return Ok(());
        }
    }
    log::debug!("loading schema for database {}", conn.dbs[db_idx].name);

    // Read the signature and every master row up front so no cursor is
    // live while the rows are replayed.
    let mut rows: Vec<(String, String, PageNo, String)> = Vec::new();
    let sig;
    {
        let handle = conn.dbs[db_idx].handle.as_mut().expect("checked above");
        sig = handle.get_schema_sig()?;
        let mut cursor = handle.cursor(MASTER_ROOT, false)?;
        let mut more = cursor.first()?;
        while more {
            let rec = cursor.data()?;
            let get = |k: usize| -> Result<String> {
                Ok(crate::vdbe::record::record_field(&rec, k)?
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default())
            };
            let typ = get(0)?;
            let name = get(1)?;
            let root = crate::util::strings::str_to_int(&get(3)?) as PageNo;
            let sql_text = get(4)?;
            rows.push((typ, name, root, sql_text));
            more = cursor.next()?;
        }
    }

    for (typ, name, root, sql_text) in rows {
        if sql_text.is_empty() {
            continue;
        }
        let parsed = Parser::new(&sql_text).and_then(|mut pr| pr.parse_statement());
        let stmt = match parsed {
            Ok((Some(s), _, _)) => s,
            _ => {
                log::debug!("skipping malformed master row {} ({})", name, typ);
                continue;
            }
        };
        let mut p = Parse::new(conn);
        p.initing = true;
        p.init_db = db_idx;
        p.init_root = root;
        let r = crate::executor::build::compile_ddl(&mut p, &stmt);
        drop(p);
        if let Err(e) = r {
            log::debug!("master row {} failed to replay: {}", name, e);
        }
    }

    let db = &mut conn.dbs[db_idx];
    db.schema_sig = sig;
    db.flags |= DbFlags::SCHEMA_LOADED;
    Ok(())
}

// ============================================================================
// Constant P3 helpers
// ============================================================================

/// Wrap owned text as a dynamic P3 operand.
pub fn p3_text(s: impl Into<String>) -> P3 {
    P3::Dynamic(s.into())
}
