//! DDL semantic actions
//!
//! The actions the statement compiler drives, in parse order, for
//! CREATE/DROP of tables, indices, views, and triggers, plus
//! transaction control and ATTACH/DETACH. Each CREATE both stages an
//! in-memory schema object (applied when the program commits) and emits
//! the code that writes the object's row into the master catalog table;
//! during schema recovery the same actions run in `initing` mode and
//! only register the objects.

use crate::api::connection::AuthAction;
use crate::error::Result;
use crate::executor::prepare::{p3_text, Parse};
use crate::executor::select::{compile_select, SelectDest};
use crate::parser::ast::{ColumnDef, QualName, Stmt, TableConstraint};
use crate::schema::{
    decl_type_class, Column, ConflictAction, ForeignKey, Index, SchemaChange, Table, Trigger,
    DB_MAIN, DB_TEMP,
};
use crate::storage::MASTER_ROOT;
use crate::types::DataType;
use crate::vdbe::aux::on_error;
use crate::vdbe::ops::P3;
use crate::vdbe::Opcode;

// ============================================================================
// Dispatch
// ============================================================================

pub fn compile_ddl(p: &mut Parse, stmt: &Stmt) -> Result<()> {
    match stmt {
        Stmt::CreateTable {
            temp,
            name,
            columns,
            constraints,
            as_select,
            sql,
        } => {
            start_table(p, name, *temp, false)?;
            for def in columns {
                add_column(p, def)?;
            }
            for c in constraints {
                add_table_constraint(p, c)?;
            }
            ending_create_table_paren(p, as_select.as_deref(), sql)?;
        }
        Stmt::CreateView {
            temp,
            name,
            select,
            sql,
        } => create_view(p, name, *temp, select, sql)?,
        Stmt::CreateIndex {
            unique,
            name,
            table,
            columns,
            sql,
        } => create_index(p, name, table, &columns.names, *unique, sql)?,
        Stmt::CreateTrigger {
            name,
            time,
            event,
            columns,
            table,
            sql,
        } => create_trigger(p, name, *time, *event, columns.clone(), table, sql)?,
        Stmt::DropTable(name) => drop_table(p, name, false)?,
        Stmt::DropView(name) => drop_table(p, name, true)?,
        Stmt::DropIndex(name) => drop_index(p, name)?,
        Stmt::DropTrigger(name) => drop_trigger(p, name)?,
        Stmt::Begin(on_err) => txn_begin(p, *on_err)?,
        Stmt::CommitTxn => txn_commit(p)?,
        Stmt::RollbackTxn => txn_abort(p)?,
        Stmt::Attach { filename, db_name } => {
            p.conn
                .authorize(AuthAction::Attach, &filename.token, "", "")?;
            if !filename.is_constant() {
                return Err(p.error("ATTACH filename must be a constant"));
            }
            let path = filename.token.clone();
            let name = db_name.clone();
            p.conn.attach_db(&name, &path)?;
        }
        Stmt::Detach(name) => {
            p.conn.authorize(AuthAction::Detach, name, "", "")?;
            p.conn.detach_db(name)?;
        }
        _ => return Err(p.error("unsupported statement")),
    }
    Ok(())
}

// ============================================================================
// CREATE TABLE Actions
// ============================================================================

/// Target database of a CREATE: an explicit qualifier, the temp slot,
/// or main; recovery pins it to the database being loaded.
fn create_target_db(p: &mut Parse, name: &QualName, temp: bool) -> Result<usize> {
    if p.initing {
        return Ok(p.init_db);
    }
    if temp {
        p.conn.ensure_temp_db()?;
        return Ok(DB_TEMP);
    }
    match name.database.as_deref() {
        Some(dbn) => p
            .conn
            .db_index(dbn)
            .ok_or_else(|| p.error(format!("unknown database: {}", dbn))),
        None => Ok(DB_MAIN),
    }
}

/// Begin assembling a new table (or view). The name must collide with
/// neither a table nor an index in the target database.
pub fn start_table(p: &mut Parse, name: &QualName, temp: bool, is_view: bool) -> Result<()> {
    let db_idx = create_target_db(p, name, temp)?;
    let db_name = p.conn.dbs[db_idx].name.clone();
    let action = match (temp, is_view) {
        (false, false) => AuthAction::CreateTable,
        (true, false) => AuthAction::CreateTempTable,
        (false, true) => AuthAction::CreateView,
        (true, true) => AuthAction::CreateTempView,
    };
    p.conn.authorize(action, &name.name, "", &db_name)?;

    if !p.initing {
        let db = &p.conn.dbs[db_idx];
        if db.tables.contains(&name.name) {
            return Err(p.error(format!("table {} already exists", name.name)));
        }
        if db.indices.contains(&name.name) {
            return Err(p.error(format!("there is already an index named {}", name.name)));
        }
        p.code_verify_schema(db_idx);
        p.code_begin_write(db_idx);
        // Stage the master-table cursor; the definition row is written
        // once the closing paren fixes the column list.
        let mcur = p.alloc_cursor();
        p.v
            .add_op_p3(Opcode::OpenWrite, mcur, MASTER_ROOT as i32, p3_text(db_name));
    } else {
        p.alloc_cursor();
    }
    p.new_table = Some(Table::new(&name.name, db_idx));
    Ok(())
}

/// Append one column definition to the table under construction.
pub fn add_column(p: &mut Parse, def: &ColumnDef) -> Result<()> {
    let dup = p
        .new_table
        .as_ref()
        .map(|t| t.column_index(&def.name).is_some())
        .unwrap_or(false);
    if dup {
        return Err(p.error(format!("duplicate column name: {}", def.name)));
    }
    if let Some(d) = &def.default_value {
        if !d.is_constant() {
            return Err(p.error("default value of column is not constant"));
        }
    }
    let table = p.new_table.as_mut().expect("start_table first");
    let mut col = Column::new(&def.name);
    col.decl_type = def.decl_type.clone();
    col.sort_class = def
        .collate
        .or_else(|| def.decl_type.as_deref().map(decl_type_class))
        .unwrap_or(DataType::Numeric);
    col.default_value = def.default_value.clone();
    col.not_null = def.not_null;
    col.primary_key = def.primary_key;
    table.columns.push(col);
    let ci = table.columns.len() - 1;

    if def.primary_key {
        add_primary_key(p, &[ci], def.pk_conflict)?;
    }
    if def.unique {
        let name = {
            let t = p.new_table.as_ref().expect("table");
            auto_index_name(&t.name, t.indices.len())
        };
        stage_auto_index(p, &name, &[ci], ConflictAction::Abort);
    }
    if let Some((to_table, to_cols)) = &def.references {
        let table = p.new_table.as_mut().expect("table");
        table.fkeys.push(ForeignKey {
            from_cols: vec![ci],
            to_table: to_table.clone(),
            to_cols: to_cols.names.clone(),
            on_delete: ConflictAction::Abort,
            on_update: ConflictAction::Abort,
            deferred: false,
        });
    }
    Ok(())
}

/// An INTEGER PRIMARY KEY column becomes the row id; any other primary
/// key materializes as an automatic UNIQUE index.
pub fn add_primary_key(p: &mut Parse, cols: &[usize], on_err: ConflictAction) -> Result<()> {
    {
        let table = p.new_table.as_mut().expect("table");
        if table.ipk.is_some() {
            let name = table.name.clone();
            return Err(p.error(format!("table {} has more than one primary key", name)));
        }
        if cols.len() == 1 {
            let is_integer = table.columns[cols[0]]
                .decl_type
                .as_deref()
                .map(|t| t.eq_ignore_ascii_case("integer"))
                .unwrap_or(false);
            if is_integer {
                table.ipk = Some(cols[0]);
                return Ok(());
            }
        }
    }
    let name = {
        let t = p.new_table.as_ref().expect("table");
        auto_index_name(&t.name, t.indices.len())
    };
    stage_auto_index(p, &name, cols, on_err);
    Ok(())
}

fn auto_index_name(table: &str, ordinal: usize) -> String {
    format!("{}__auto_index_{}", table, ordinal + 1)
}

/// Record an automatic (constraint-generated) index on the table being
/// built; its code and catalog row are emitted at the closing paren.
fn stage_auto_index(p: &mut Parse, name: &str, cols: &[usize], on_err: ConflictAction) {
    let table = p.new_table.as_mut().expect("table");
    table.indices.push(name.to_string());
    // Carried to ending_create_table_paren through the pending list.
    p.v.pending_schema.push(SchemaChange::AddIndex(Index {
        name: name.to_string(),
        table: table.name.clone(),
        db_idx: table.db_idx,
        columns: cols.to_vec(),
        on_error: Some(on_err),
        auto: true,
        tnum: 0,
        sql: String::new(),
    }));
}

fn add_table_constraint(p: &mut Parse, c: &TableConstraint) -> Result<()> {
    match c {
        TableConstraint::PrimaryKey(cols, on_err) => {
            let idxs = constraint_columns(p, &cols.names)?;
            for &ci in &idxs {
                if let Some(t) = p.new_table.as_mut() {
                    t.columns[ci].primary_key = true;
                }
            }
            add_primary_key(p, &idxs, *on_err)
        }
        TableConstraint::Unique(cols, on_err) => {
            let idxs = constraint_columns(p, &cols.names)?;
            let name = {
                let t = p.new_table.as_ref().expect("table");
                auto_index_name(&t.name, t.indices.len())
            };
            stage_auto_index(p, &name, &idxs, *on_err);
            Ok(())
        }
        TableConstraint::ForeignKey {
            columns,
            to_table,
            to_columns,
            on_delete,
            on_update,
            deferred,
        } => {
            let from = constraint_columns(p, &columns.names)?;
            create_foreign_key(
                p,
                &from,
                to_table,
                &to_columns.names,
                *on_delete,
                *on_update,
                *deferred,
            )
        }
    }
}

fn constraint_columns(p: &mut Parse, names: &[String]) -> Result<Vec<usize>> {
    let mut out = Vec::new();
    for n in names {
        let found = p
            .new_table
            .as_ref()
            .and_then(|t| t.column_index(n));
        match found {
            Some(ci) => out.push(ci),
            None => {
                return Err(p.error(format!("no such column: {}", n)));
            }
        }
    }
    Ok(out)
}

/// Attach a foreign key to the table being built. Referenced columns,
/// when named, must match the source count.
pub fn create_foreign_key(
    p: &mut Parse,
    from_cols: &[usize],
    to_table: &str,
    to_cols: &[String],
    on_delete: ConflictAction,
    on_update: ConflictAction,
    deferred: bool,
) -> Result<()> {
    if !to_cols.is_empty() && to_cols.len() != from_cols.len() {
        let n = from_cols.len();
        return Err(p.error(format!(
            "foreign key on {} columns references {} columns of table {}",
            n,
            to_cols.len(),
            to_table
        )));
    }
    let table = p.new_table.as_mut().expect("table");
    table.fkeys.push(ForeignKey {
        from_cols: from_cols.to_vec(),
        to_table: to_table.to_string(),
        to_cols: to_cols.to_vec(),
        on_delete,
        on_update,
        deferred,
    });
    Ok(())
}

/// The closing paren (or the end of AS SELECT): finish the Table
/// object, write the catalog rows, and stage the schema-cache change.
pub fn ending_create_table_paren(
    p: &mut Parse,
    as_select: Option<&crate::parser::ast::Select>,
    sql: &str,
) -> Result<()> {
    if let Some(sel) = as_select {
        // Column shape comes from the SELECT's result set.
        let mut sel = sel.clone();
        let tname = p.new_table.as_ref().expect("table").name.clone();
        let shape = crate::executor::select::select_result_shape_for(p, &tname, &mut sel)?;
        let table = p.new_table.as_mut().expect("table");
        table.columns = shape.columns;
    }
    let mut table = p.new_table.take().expect("start_table first");
    table.sql = sql.to_string();
    let db_idx = table.db_idx;
    let is_view = table.is_view();

    // Auto indices staged during column parsing ride in pending_schema;
    // pull them out so codegen can order catalog rows after the table's.
    let mut autos: Vec<Index> = Vec::new();
    p.v.pending_schema.retain(|c| match c {
        SchemaChange::AddIndex(ix) if ix.auto && ix.table == table.name => {
            autos.push(ix.clone());
            false
        }
        _ => true,
    });

    if p.initing {
        table.tnum = p.init_root;
        let name = table.name.clone();
        p.conn.dbs[db_idx].tables.insert(&name, table);
        return Ok(());
    }

    // start_table allocated cursor 0 for the master table.
    let mcur = 0;
    // The definition row: (type, name, tbl_name, rootpage, sql).
    p.v.add_op(Opcode::NewRecno, mcur, 0);
    p.v
        .add_op_p3(Opcode::String, 0, 0, P3::Static(if is_view { "view" } else { "table" }));
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(table.name.clone()));
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(table.name.clone()));
    let root_mem = p.alloc_mem();
    if is_view {
        p.v.add_op(Opcode::Integer, 0, 0);
    } else {
        p.v.add_op(Opcode::CreateTable, db_idx as i32, 0);
        p.v.add_op(Opcode::MemStore, root_mem, 0);
    }
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(sql.to_string()));
    p.v.add_op(Opcode::MakeRecord, 5, 0);
    p.v.add_op(Opcode::PutIntKey, mcur, 0);

    for ix in &autos {
        let idx_sql = synthesized_index_sql(ix, &table);
        p.v.add_op(Opcode::NewRecno, mcur, 0);
        p.v.add_op_p3(Opcode::String, 0, 0, P3::Static("index"));
        p.v.add_op_p3(Opcode::String, 0, 0, p3_text(ix.name.clone()));
        p.v.add_op_p3(Opcode::String, 0, 0, p3_text(table.name.clone()));
        p.v.add_op(Opcode::CreateIndex, db_idx as i32, 0);
        p.v.add_op_p3(Opcode::String, 0, 0, p3_text(idx_sql));
        p.v.add_op(Opcode::MakeRecord, 5, 0);
        p.v.add_op(Opcode::PutIntKey, mcur, 0);
    }

    p.change_schema_signature(db_idx);
    p.v.add_op(Opcode::Close, mcur, 0);

    // CREATE TABLE ... AS SELECT fills the fresh root.
    if let Some(sel) = as_select {
        let mut sel = sel.clone();
        let tcur = p.alloc_cursor();
        let db_name = p.conn.dbs[db_idx].name.clone();
        p.v.add_op(Opcode::MemLoad, root_mem, 0);
        p.v.add_op_p3(Opcode::OpenWrite, tcur, 0, p3_text(db_name));
        compile_select(p, &mut sel, SelectDest::Table(tcur))?;
        p.v.add_op(Opcode::Close, tcur, 0);
    }

    p.v.pending_schema.push(SchemaChange::AddTable(table));
    for ix in autos {
        p.v.pending_schema.push(SchemaChange::AddIndex(ix));
    }
    p.code_end_write();
    Ok(())
}

/// The replayable text of a constraint-generated index.
fn synthesized_index_sql(ix: &Index, table: &Table) -> String {
    let cols: Vec<String> = ix
        .columns
        .iter()
        .map(|&c| table.columns[c].name.clone())
        .collect();
    format!(
        "CREATE UNIQUE INDEX {} ON {}({})",
        ix.name,
        table.name,
        cols.join(", ")
    )
}

// ============================================================================
// Views
// ============================================================================

/// CREATE VIEW: a table whose SELECT supplies its (lazily computed)
/// columns. The definition text is copied because the parse buffer dies
/// with the statement.
pub fn create_view(
    p: &mut Parse,
    name: &QualName,
    temp: bool,
    select: &crate::parser::ast::Select,
    sql: &str,
) -> Result<()> {
    start_table(p, name, temp, true)?;
    {
        let table = p.new_table.as_mut().expect("table");
        table.select = Some(Box::new(select.clone()));
        table.view_cols_pending = true;
    }
    // Column shape derives from the defining SELECT right away; views
    // that survive a dependency change recompute on next use.
    let mut sub = select.clone();
    let tname = p.new_table.as_ref().expect("table").name.clone();
    if let Ok(shape) = crate::executor::select::select_result_shape_for(p, &tname, &mut sub) {
        let table = p.new_table.as_mut().expect("table");
        table.columns = shape.columns;
        table.view_cols_pending = false;
    }
    ending_create_table_paren(p, None, sql)
}

// ============================================================================
// DROP
// ============================================================================

fn drop_auth_action(db_idx: usize, is_view: bool) -> AuthAction {
    match (db_idx == DB_TEMP, is_view) {
        (false, false) => AuthAction::DropTable,
        (true, false) => AuthAction::DropTempTable,
        (false, true) => AuthAction::DropView,
        (true, true) => AuthAction::DropTempView,
    }
}

/// DROP TABLE / DROP VIEW: remove the catalog rows, destroy the storage
/// roots, and stage the cache removal.
pub fn drop_table(p: &mut Parse, name: &QualName, expect_view: bool) -> Result<()> {
    let (db_idx, table) = p.find_table(name.database.as_deref(), &name.name)?;
    if table.is_view() != expect_view {
        return Err(p.error(if expect_view {
            format!("use DROP TABLE to delete table {}", name.name)
        } else {
            format!("use DROP VIEW to delete view {}", name.name)
        }));
    }
    let db_name = p.conn.dbs[db_idx].name.clone();
    p.conn
        .authorize(drop_auth_action(db_idx, expect_view), &name.name, "", &db_name)?;

    p.code_verify_schema(db_idx);
    p.code_begin_write(db_idx);
    code_delete_master_rows(p, db_idx, 2, &table.name);

    if !table.is_view() {
        p.v.add_op(Opcode::Destroy, table.tnum as i32, db_idx as i32);
        let idx_roots: Vec<u32> = table
            .indices
            .iter()
            .filter_map(|n| p.conn.dbs[db_idx].indices.find(n).map(|ix| ix.tnum))
            .collect();
        for root in idx_roots {
            p.v.add_op(Opcode::Destroy, root as i32, db_idx as i32);
        }
    }
    p.change_schema_signature(db_idx);
    p.v.pending_schema.push(SchemaChange::DropTable {
        db: db_idx,
        name: table.name.clone(),
    });
    p.code_end_write();
    Ok(())
}

/// Emit a two-pass scan deleting every catalog row whose `field`
/// column (1 = object name, 2 = owning table name) matches `object`.
fn code_delete_master_rows(p: &mut Parse, db_idx: usize, field: i32, object: &str) {
    let db_name = p.conn.dbs[db_idx].name.clone();
    let mcur = p.alloc_cursor();
    p.v
        .add_op_p3(Opcode::OpenWrite, mcur, MASTER_ROOT as i32, p3_text(db_name));
    let done = p.v.make_label();
    p.v.add_op(Opcode::Rewind, mcur, done);
    let top = p.v.current_addr();
    let cont = p.v.make_label();
    p.v.add_op(Opcode::Column, mcur, field);
    p.v
        .add_op_p3(Opcode::String, 0, 0, p3_text(object.to_string()));
    p.v.add_op(Opcode::StrNe, 1, cont);
    p.v.add_op(Opcode::Recno, mcur, 0);
    p.v.add_op(Opcode::ListWrite, 0, 0);
    p.v.resolve_label(cont);
    p.v.add_op(Opcode::Next, mcur, top as i32);
    p.v.resolve_label(done);
    p.v.add_op(Opcode::ListRewind, 0, 0);
    let del_done = p.v.make_label();
    let del_top = p.v.current_addr();
    p.v.add_op(Opcode::ListRead, 0, del_done);
    p.v.add_op(Opcode::MoveTo, mcur, 0);
    p.v.add_op(Opcode::Delete, mcur, 0);
    p.v.add_op(Opcode::Goto, 0, del_top as i32);
    p.v.resolve_label(del_done);
    p.v.add_op(Opcode::ListReset, 0, 0);
    p.v.add_op(Opcode::Close, mcur, 0);
}

/// DROP INDEX.
pub fn drop_index(p: &mut Parse, name: &QualName) -> Result<()> {
    let (db_idx, index) = p.find_index(name.database.as_deref(), &name.name)?;
    if index.auto {
        return Err(p.error(format!(
            "index associated with UNIQUE or PRIMARY KEY constraint cannot be dropped: {}",
            name.name
        )));
    }
    let db_name = p.conn.dbs[db_idx].name.clone();
    let action = if db_idx == DB_TEMP {
        AuthAction::DropTempIndex
    } else {
        AuthAction::DropIndex
    };
    p.conn.authorize(action, &name.name, &index.table, &db_name)?;

    p.code_verify_schema(db_idx);
    p.code_begin_write(db_idx);
    code_delete_master_rows(p, db_idx, 1, &index.name);
    p.v.add_op(Opcode::Destroy, index.tnum as i32, db_idx as i32);
    p.change_schema_signature(db_idx);
    p.v.pending_schema.push(SchemaChange::DropIndex {
        db: db_idx,
        name: index.name.clone(),
    });
    p.code_end_write();
    Ok(())
}

// ============================================================================
// CREATE INDEX
// ============================================================================

/// CREATE [UNIQUE] INDEX: register the object, write its catalog row,
/// and fill it with a key for every existing row of the base table.
pub fn create_index(
    p: &mut Parse,
    name: &QualName,
    table_name: &str,
    columns: &[String],
    unique: Option<ConflictAction>,
    sql: &str,
) -> Result<()> {
    let (db_idx, table) = if p.initing {
        let db_idx = p.init_db;
        let t = p
            .conn
            .dbs[db_idx]
            .tables
            .find(table_name)
            .cloned()
            .ok_or_else(|| p.error(format!("no such table: {}", table_name)))?;
        (db_idx, t)
    } else {
        p.find_table(name.database.as_deref(), table_name)?
    };
    if table.is_view() {
        return Err(p.error("views may not be indexed"));
    }
    if !p.initing && db_idx > DB_TEMP {
        return Err(p.error("indices on attached databases may only be created by recovery"));
    }
    let db_name = p.conn.dbs[db_idx].name.clone();
    let action = if db_idx == DB_TEMP {
        AuthAction::CreateTempIndex
    } else {
        AuthAction::CreateIndex
    };
    p.conn.authorize(action, &name.name, table_name, &db_name)?;
    if !p.initing {
        if p.conn.dbs[db_idx].indices.contains(&name.name) {
            return Err(p.error(format!("index {} already exists", name.name)));
        }
        if p.conn.dbs[db_idx].tables.contains(&name.name) {
            return Err(p.error(format!("there is already a table named {}", name.name)));
        }
    }

    let mut cols = Vec::new();
    for c in columns {
        match table.column_index(c) {
            Some(ci) => cols.push(ci),
            None => {
                return Err(p.error(format!(
                    "table {} has no column named {}",
                    table_name, c
                )));
            }
        }
    }
    let index = Index {
        name: name.name.clone(),
        table: table.name.clone(),
        db_idx,
        columns: cols.clone(),
        on_error: unique,
        auto: false,
        tnum: 0,
        sql: sql.to_string(),
    };

    if p.initing {
        let mut index = index;
        index.tnum = p.init_root;
        let iname = index.name.clone();
        let tname = index.table.clone();
        p.conn.dbs[db_idx].indices.insert(&iname, index);
        if let Some(t) = p.conn.dbs[db_idx].tables.find_mut(&tname) {
            if !t.indices.iter().any(|n| n.eq_ignore_ascii_case(&iname)) {
                t.indices.push(iname);
            }
        }
        return Ok(());
    }

    p.code_verify_schema(db_idx);
    p.code_begin_write(db_idx);
    let mcur = p.alloc_cursor();
    p.v
        .add_op_p3(Opcode::OpenWrite, mcur, MASTER_ROOT as i32, p3_text(db_name.clone()));
    p.v.add_op(Opcode::NewRecno, mcur, 0);
    p.v.add_op_p3(Opcode::String, 0, 0, P3::Static("index"));
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(index.name.clone()));
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(table.name.clone()));
    let root_mem = p.alloc_mem();
    p.v.add_op(Opcode::CreateIndex, db_idx as i32, 0);
    p.v.add_op(Opcode::MemStore, root_mem, 0);
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(sql.to_string()));
    p.v.add_op(Opcode::MakeRecord, 5, 0);
    p.v.add_op(Opcode::PutIntKey, mcur, 0);
    p.v.add_op(Opcode::Close, mcur, 0);

    // Populate from existing rows.
    let tcur = p.alloc_cursor();
    let icur = p.alloc_cursor();
    p.v
        .add_op_p3(Opcode::OpenRead, tcur, table.tnum as i32, p3_text(db_name.clone()));
    p.v.add_op(Opcode::MemLoad, root_mem, 0);
    p.v.add_op_p3(Opcode::OpenWrite, icur, 0, p3_text(db_name));
    let empty = p.v.make_label();
    p.v.add_op(Opcode::Rewind, tcur, empty);
    let top = p.v.current_addr();
    p.v.add_op(Opcode::Recno, tcur, 0);
    let mask: String = cols
        .iter()
        .map(|&c| crate::executor::expr::type_mask(table.columns[c].sort_class))
        .collect();
    for &c in &cols {
        p.v.add_op(Opcode::Column, tcur, c as i32);
    }
    p.v
        .add_op_p3(Opcode::MakeIdxKey, cols.len() as i32, 0, p3_text(mask));
    p.v.add_op_p3(
        Opcode::IdxPut,
        icur,
        unique.is_some() as i32,
        p3_text(index.name.clone()),
    );
    p.v.add_op(Opcode::Next, tcur, top as i32);
    p.v.resolve_label(empty);
    p.v.add_op(Opcode::Close, tcur, 0);
    p.v.add_op(Opcode::Close, icur, 0);

    p.change_schema_signature(db_idx);
    p.v.pending_schema.push(SchemaChange::AddIndex(index));
    p.code_end_write();
    Ok(())
}

// ============================================================================
// Triggers
// ============================================================================

/// CREATE TRIGGER: the body stays as text in the catalog and the cache.
pub fn create_trigger(
    p: &mut Parse,
    name: &QualName,
    time: crate::schema::TriggerTime,
    event: crate::schema::TriggerEvent,
    columns: Option<crate::parser::ast::IdList>,
    table_name: &str,
    sql: &str,
) -> Result<()> {
    let (db_idx, table) = if p.initing {
        let db_idx = p.init_db;
        let t = p
            .conn
            .dbs[db_idx]
            .tables
            .find(table_name)
            .cloned()
            .ok_or_else(|| p.error(format!("no such table: {}", table_name)))?;
        (db_idx, t)
    } else {
        p.find_table(name.database.as_deref(), table_name)?
    };
    let db_name = p.conn.dbs[db_idx].name.clone();
    let action = if db_idx == DB_TEMP {
        AuthAction::CreateTempTrigger
    } else {
        AuthAction::CreateTrigger
    };
    p.conn.authorize(action, &name.name, table_name, &db_name)?;
    if table.is_view() {
        return Err(p.error("cannot create a trigger on a view"));
    }
    if !p.initing && p.conn.dbs[db_idx].triggers.contains(&name.name) {
        return Err(p.error(format!("trigger {} already exists", name.name)));
    }

    let trigger = Trigger {
        name: name.name.clone(),
        table: table.name.clone(),
        db_idx,
        time,
        event,
        columns,
        sql: sql.to_string(),
    };
    if p.initing {
        let tname = trigger.name.clone();
        p.conn.dbs[db_idx].triggers.insert(&tname, trigger);
        return Ok(());
    }

    p.code_verify_schema(db_idx);
    p.code_begin_write(db_idx);
    let mcur = p.alloc_cursor();
    p.v
        .add_op_p3(Opcode::OpenWrite, mcur, MASTER_ROOT as i32, p3_text(db_name));
    p.v.add_op(Opcode::NewRecno, mcur, 0);
    p.v.add_op_p3(Opcode::String, 0, 0, P3::Static("trigger"));
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(trigger.name.clone()));
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(table.name.clone()));
    p.v.add_op(Opcode::Integer, 0, 0);
    p.v.add_op_p3(Opcode::String, 0, 0, p3_text(sql.to_string()));
    p.v.add_op(Opcode::MakeRecord, 5, 0);
    p.v.add_op(Opcode::PutIntKey, mcur, 0);
    p.v.add_op(Opcode::Close, mcur, 0);
    p.change_schema_signature(db_idx);
    p.v.pending_schema.push(SchemaChange::AddTrigger(trigger));
    p.code_end_write();
    Ok(())
}

/// DROP TRIGGER.
pub fn drop_trigger(p: &mut Parse, name: &QualName) -> Result<()> {
    let mut found: Option<(usize, String)> = None;
    for (db_idx, db) in p.conn.dbs.iter().enumerate() {
        if let Some(tr) = db.triggers.find(&name.name) {
            found = Some((db_idx, tr.name.clone()));
            break;
        }
    }
    let (db_idx, tname) = match found {
        Some(f) => f,
        None => {
            return Err(p.error(format!("no such trigger: {}", name.name)));
        }
    };
    let db_name = p.conn.dbs[db_idx].name.clone();
    let action = if db_idx == DB_TEMP {
        AuthAction::DropTempTrigger
    } else {
        AuthAction::DropTrigger
    };
    p.conn.authorize(action, &tname, "", &db_name)?;

    p.code_verify_schema(db_idx);
    p.code_begin_write(db_idx);
    code_delete_master_rows(p, db_idx, 1, &tname);
    p.change_schema_signature(db_idx);
    p.v.pending_schema.push(SchemaChange::DropTrigger {
        db: db_idx,
        name: tname,
    });
    p.code_end_write();
    Ok(())
}

// ============================================================================
// Transactions
// ============================================================================

/// BEGIN [TRANSACTION] [ON CONFLICT action]: open a user transaction on
/// every attached database and install the default conflict policy.
pub fn txn_begin(p: &mut Parse, on_err: ConflictAction) -> Result<()> {
    p.conn.authorize(AuthAction::Transaction, "BEGIN", "", "")?;
    if p.conn.dbs.iter().any(|d| d.in_txn) {
        return Err(p.error("cannot start a transaction within a transaction"));
    }
    p.conn.default_conflict = on_err;
    for i in 0..p.conn.dbs.len() {
        if p.conn.dbs[i].handle.is_some() {
            p.v.add_op(Opcode::Transaction, i as i32, 0);
            p.conn.dbs[i].in_txn = true;
        }
    }
    Ok(())
}

/// COMMIT.
pub fn txn_commit(p: &mut Parse) -> Result<()> {
    p.conn.authorize(AuthAction::Transaction, "COMMIT", "", "")?;
    if !p.conn.dbs.iter().any(|d| d.in_txn) {
        return Err(p.error("cannot commit - no transaction is active"));
    }
    p.conn.default_conflict = ConflictAction::Abort;
    for i in 0..p.conn.dbs.len() {
        if p.conn.dbs[i].in_txn {
            p.conn.dbs[i].in_txn = false;
            p.v.add_op(Opcode::Commit, i as i32, 0);
        }
    }
    Ok(())
}

/// ROLLBACK.
pub fn txn_abort(p: &mut Parse) -> Result<()> {
    p.conn.authorize(AuthAction::Transaction, "ROLLBACK", "", "")?;
    if !p.conn.dbs.iter().any(|d| d.in_txn) {
        return Err(p.error("cannot rollback - no transaction is active"));
    }
    p.conn.default_conflict = ConflictAction::Abort;
    for i in 0..p.conn.dbs.len() {
        if p.conn.dbs[i].in_txn {
            p.conn.dbs[i].in_txn = false;
            p.v.add_op(Opcode::Rollback, i as i32, 0);
        }
    }
    Ok(())
}

// ============================================================================
// Halt helpers shared by the DML compilers
// ============================================================================

/// Map a conflict action onto a Halt error action.
pub fn conflict_halt_action(action: ConflictAction) -> i32 {
    match action {
        ConflictAction::Rollback => on_error::ROLLBACK,
        ConflictAction::Fail => on_error::FAIL,
        _ => on_error::ABORT,
    }
}
