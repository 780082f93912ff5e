//! Schema objects and the per-database schema cache
//!
//! Each attached database keeps in-memory hashes of its tables, indices,
//! and triggers, rebuilt on demand from the master catalog table. A
//! 32-bit schema signature guards prepared statements: every committed
//! DDL draws a fresh signature, and running statements compare theirs
//! against the storage manager's before touching data.

use crate::parser::ast::{Expr, IdList, Select};
use crate::storage::StorageHandle;
use crate::types::{DataType, PageNo};
use crate::util::hash::KeyedMap;

// ============================================================================
// Constants
// ============================================================================

/// Name of the catalog table of a persistent database.
pub const MASTER_NAME: &str = "DBSQL_MASTER";

/// Name of the catalog table of the temp database.
pub const TEMP_MASTER_NAME: &str = "DBSQL_TEMP_MASTER";

/// Columns of the master tables.
pub const MASTER_COLUMNS: [&str; 5] = ["type", "name", "tbl_name", "rootpage", "sql"];

/// Database slot of the main database.
pub const DB_MAIN: usize = 0;

/// Database slot of the temp database.
pub const DB_TEMP: usize = 1;

// ============================================================================
// Conflict Actions
// ============================================================================

/// Policy applied when a constraint would be violated (OE_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictAction {
    /// Back out the whole transaction
    Rollback,
    /// Back out this statement's changes and stop (the default)
    #[default]
    Abort,
    /// Stop, keeping prior changes of this statement
    Fail,
    /// Skip the offending row
    Ignore,
    /// Delete the pre-existing row
    Replace,
}

// ============================================================================
// Schema Objects
// ============================================================================

/// One column of a table.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    /// Declared type text, e.g. `VARCHAR(10)`
    pub decl_type: Option<String>,
    pub default_value: Option<Expr>,
    pub not_null: bool,
    pub primary_key: bool,
    /// Explicit collate class from a COLLATE clause, else derived from
    /// the declared type
    pub sort_class: DataType,
}

impl Column {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            decl_type: None,
            default_value: None,
            not_null: false,
            primary_key: false,
            sort_class: DataType::Numeric,
        }
    }
}

/// A table, view, or transient subquery result shape.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    /// Which attached database owns this table
    pub db_idx: usize,
    pub columns: Vec<Column>,
    /// Column that is INTEGER PRIMARY KEY (an alias for the row id)
    pub ipk: Option<usize>,
    /// Root page in the storage manager
    pub tnum: PageNo,
    /// The defining SELECT when this is a view
    pub select: Option<Box<Select>>,
    /// True for ephemeral tables describing a subquery's result shape
    pub is_transient: bool,
    /// True while a view's column list has not been computed yet
    pub view_cols_pending: bool,
    /// Names of indices on this table, in creation order
    pub indices: Vec<String>,
    /// Outgoing foreign keys
    pub fkeys: Vec<ForeignKey>,
    /// Text of the CREATE statement, as stored in the master table
    pub sql: String,
}

impl Table {
    pub fn new(name: &str, db_idx: usize) -> Self {
        Self {
            name: name.to_string(),
            db_idx,
            columns: Vec::new(),
            ipk: None,
            tnum: 0,
            select: None,
            is_transient: false,
            view_cols_pending: false,
            indices: Vec::new(),
            fkeys: Vec::new(),
            sql: String::new(),
        }
    }

    pub fn is_view(&self) -> bool {
        self.select.is_some()
    }

    /// Find a column by name, ignoring case.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// An index over a table.
#[derive(Debug, Clone)]
pub struct Index {
    pub name: String,
    pub table: String,
    pub db_idx: usize,
    /// Indices of the covered columns within the table
    pub columns: Vec<usize>,
    /// What a uniqueness violation does; `None` for non-unique indices
    pub on_error: Option<ConflictAction>,
    /// Created implicitly for a UNIQUE or PRIMARY KEY constraint
    pub auto: bool,
    pub tnum: PageNo,
    pub sql: String,
}

/// A foreign key constraint, owned by its source table.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    /// Source column positions in the owning table
    pub from_cols: Vec<usize>,
    pub to_table: String,
    /// Referenced columns; empty means the referenced primary key
    pub to_cols: Vec<String>,
    pub on_delete: ConflictAction,
    pub on_update: ConflictAction,
    pub deferred: bool,
}

/// Trigger timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTime {
    Before,
    After,
}

/// Trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Delete,
    Insert,
    Update,
}

/// A trigger definition. The body is kept as SQL text and recompiled
/// when needed, like every other schema object.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub name: String,
    pub table: String,
    pub db_idx: usize,
    pub time: TriggerTime,
    pub event: TriggerEvent,
    /// UPDATE OF column list
    pub columns: Option<IdList>,
    pub sql: String,
}

// ============================================================================
// Attached Database
// ============================================================================

bitflags::bitflags! {
    /// Per-database schema cache state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u8 {
        /// The schema hashes are populated
        const SCHEMA_LOADED = 0x01;
        /// The schema signature has been read this statement
        const COOKIE_READ   = 0x02;
        /// DDL against this database is temporarily forbidden
        const SCHEMA_LOCKED = 0x04;
        /// Some view column lists were invalidated and need recomputing
        const UNRESET_VIEWS = 0x08;
    }
}

/// One attached database: a storage handle plus its schema cache.
pub struct Db {
    /// "main", "temp", or the name given at ATTACH time
    pub name: String,
    pub handle: Option<Box<dyn StorageHandle>>,
    pub tables: KeyedMap<Table>,
    pub indices: KeyedMap<Index>,
    pub triggers: KeyedMap<Trigger>,
    /// Cached copy of the storage manager's schema signature
    pub schema_sig: u32,
    pub flags: DbFlags,
    /// A user transaction is open on this database
    pub in_txn: bool,
}

impl Db {
    pub fn new(name: &str, handle: Option<Box<dyn StorageHandle>>) -> Self {
        Self {
            name: name.to_string(),
            handle,
            tables: KeyedMap::new(),
            indices: KeyedMap::new(),
            triggers: KeyedMap::new(),
            schema_sig: 0,
            flags: DbFlags::empty(),
            in_txn: false,
        }
    }

    /// The catalog table name for this database slot.
    pub fn master_name(db_idx: usize) -> &'static str {
        if db_idx == DB_TEMP {
            TEMP_MASTER_NAME
        } else {
            MASTER_NAME
        }
    }

    /// Throw away the cached schema; it reloads lazily.
    pub fn reset_schema(&mut self) {
        self.tables.clear();
        self.indices.clear();
        self.triggers.clear();
        self.flags = DbFlags::empty();
    }

    /// Clear the computed column lists of views that may depend on a
    /// changed table. Column lists recompute on next use.
    pub fn unreset_views(&mut self) {
        let names = self.tables.keys();
        for name in names {
            if let Some(t) = self.tables.find_mut(&name) {
                if t.is_view() {
                    t.columns.clear();
                    t.view_cols_pending = true;
                }
            }
        }
        self.flags |= DbFlags::UNRESET_VIEWS;
    }
}

// ============================================================================
// Pending Schema Changes
// ============================================================================

/// A schema-cache mutation staged by DDL codegen and applied when the
/// generated program halts successfully. Root pages allocated at run
/// time are patched in from the program's creation log.
#[derive(Debug, Clone)]
pub enum SchemaChange {
    AddTable(Table),
    AddIndex(Index),
    AddTrigger(Trigger),
    DropTable { db: usize, name: String },
    DropIndex { db: usize, name: String },
    DropTrigger { db: usize, name: String },
}

// ============================================================================
// Type Classification
// ============================================================================

/// Classify a declared column type: a declaration containing `text`,
/// `char`, `clob`, or `blob` compares as text, everything else as
/// numeric.
pub fn decl_type_class(decl: &str) -> DataType {
    let lower = decl.to_ascii_lowercase();
    if lower.contains("text")
        || lower.contains("char")
        || lower.contains("clob")
        || lower.contains("blob")
    {
        DataType::Text
    } else {
        DataType::Numeric
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decl_type_class() {
        assert_eq!(decl_type_class("VARCHAR(10)"), DataType::Text);
        assert_eq!(decl_type_class("text"), DataType::Text);
        assert_eq!(decl_type_class("CLOB"), DataType::Text);
        assert_eq!(decl_type_class("BLOB"), DataType::Text);
        assert_eq!(decl_type_class("INTEGER"), DataType::Numeric);
        assert_eq!(decl_type_class("real"), DataType::Numeric);
        assert_eq!(decl_type_class(""), DataType::Numeric);
    }

    #[test]
    fn test_table_column_lookup() {
        let mut t = Table::new("t", DB_MAIN);
        t.columns.push(Column::new("Alpha"));
        t.columns.push(Column::new("beta"));
        assert_eq!(t.column_index("ALPHA"), Some(0));
        assert_eq!(t.column_index("Beta"), Some(1));
        assert_eq!(t.column_index("gamma"), None);
    }

    #[test]
    fn test_reset_schema_clears_everything() {
        let mut db = Db::new("main", None);
        db.tables.insert("t", Table::new("t", DB_MAIN));
        db.flags |= DbFlags::SCHEMA_LOADED;
        db.reset_schema();
        assert!(db.tables.is_empty());
        assert!(db.flags.is_empty());
    }

    #[test]
    fn test_unreset_views_clears_view_columns() {
        let mut db = Db::new("main", None);
        let mut t = Table::new("t", DB_MAIN);
        t.columns.push(Column::new("a"));
        db.tables.insert("t", t);
        let mut v = Table::new("v", DB_MAIN);
        v.columns.push(Column::new("a"));
        v.select = Some(Box::new(Select::new(
            crate::parser::ast::ExprList::new(),
            crate::parser::ast::SrcList::default(),
        )));
        db.tables.insert("v", v);

        db.unreset_views();
        assert_eq!(db.tables.find("t").unwrap().columns.len(), 1);
        assert!(db.tables.find("v").unwrap().columns.is_empty());
        assert!(db.tables.find("v").unwrap().view_cols_pending);
        assert!(db.flags.contains(DbFlags::UNRESET_VIEWS));
    }
}
