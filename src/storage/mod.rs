//! Storage manager interface and the in-memory reference engine
//!
//! The core consumes storage through the traits below: an ordered
//! key-value map per root page, with cursors, transactions, and a pair
//! of metadata words (schema signature, format version). Any engine
//! implementing [`StorageHandle`] / [`StorageCursor`] can sit underneath
//! the VDBE.
//!
//! The in-memory engine here is the reference implementation: each
//! environment is a set of `BTreeMap`s guarded by a mutex, shared
//! between connections that open the same path, with whole-state
//! snapshots backing transaction rollback and a single-writer lock that
//! surfaces `Busy` to colliding handles.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::error::{Error, ErrorCode, Result};
use crate::types::PageNo;

/// Root page of the catalog table in every environment.
pub const MASTER_ROOT: PageNo = 2;

// ============================================================================
// Consumed Interface
// ============================================================================

/// Result of positioning a cursor with [`StorageCursor::moveto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seek {
    /// Positioned on an entry exactly matching the key
    Found,
    /// Positioned on the largest entry smaller than the key
    Less,
    /// No smaller entry existed; positioned on the smallest entry
    /// greater than the key
    Greater,
    /// The table is empty; the cursor points at nothing
    Empty,
}

/// A cursor over one ordered key-value table.
pub trait StorageCursor: std::fmt::Debug {
    /// Move to the first entry. Returns false when the table is empty.
    fn first(&mut self) -> Result<bool>;
    /// Move to the last entry. Returns false when the table is empty.
    fn last(&mut self) -> Result<bool>;
    /// Advance; returns false when the cursor ran off the end.
    fn next(&mut self) -> Result<bool>;
    /// Step backwards; returns false when the cursor ran off the front.
    fn prev(&mut self) -> Result<bool>;
    /// Position at `key`, or at a neighbouring entry as described by
    /// [`Seek`].
    fn moveto(&mut self, key: &[u8]) -> Result<Seek>;
    /// True when the cursor is positioned on an entry.
    fn valid(&self) -> bool;
    /// Key of the current entry.
    fn key(&self) -> Result<Vec<u8>>;
    /// Data of the current entry.
    fn data(&self) -> Result<Vec<u8>>;
    fn key_size(&self) -> Result<usize>;
    fn data_size(&self) -> Result<usize>;
    /// Compare the current entry's key against `probe`, optionally
    /// ignoring the 4-byte row-id suffix of the *stored* key (index
    /// cursors append one to every key).
    fn key_compare(&self, probe: &[u8], ignore_rowid: bool) -> Result<std::cmp::Ordering>;
    /// Insert or replace an entry. The cursor is left on it.
    fn insert(&mut self, key: &[u8], data: &[u8]) -> Result<()>;
    /// Delete the current entry; the cursor is left between its
    /// neighbours so `next()` reaches the following entry.
    fn delete(&mut self) -> Result<()>;
}

/// One attached database inside a storage environment.
pub trait StorageHandle {
    fn begin_txn(&mut self) -> Result<()>;
    fn commit_txn(&mut self) -> Result<()>;
    fn abort_txn(&mut self) -> Result<()>;
    /// Flush/persist without ending the transaction.
    fn checkpoint(&mut self) -> Result<()>;
    /// Whether this handle currently holds a transaction.
    fn in_txn(&self) -> bool;
    /// Allocate a new table; returns its root page.
    fn create_table(&mut self) -> Result<PageNo>;
    /// Allocate a new index; returns its root page.
    fn create_index(&mut self) -> Result<PageNo>;
    /// Destroy a table or index entirely.
    fn drop_table(&mut self, root: PageNo) -> Result<()>;
    /// Remove every entry but keep the table.
    fn clear_table(&mut self, root: PageNo) -> Result<()>;
    /// Open a cursor on `root`.
    fn cursor(&mut self, root: PageNo, writable: bool) -> Result<Box<dyn StorageCursor>>;
    fn get_schema_sig(&self) -> Result<u32>;
    fn set_schema_sig(&mut self, sig: u32) -> Result<()>;
    fn get_format_version(&self) -> Result<u32>;
    fn set_format_version(&mut self, v: u32) -> Result<()>;
}

// ============================================================================
// In-memory Environment
// ============================================================================

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug)]
struct EnvState {
    tables: HashMap<PageNo, Table>,
    next_root: PageNo,
    schema_sig: u32,
    format_version: u32,
    /// Token of the handle holding the write transaction, if any.
    writer: Option<u64>,
}

/// A shared in-memory storage environment.
#[derive(Debug)]
pub struct MemoryEnv {
    state: Mutex<EnvState>,
}

impl MemoryEnv {
    fn new() -> Arc<Self> {
        let mut tables = HashMap::new();
        // The catalog root always exists.
        tables.insert(MASTER_ROOT, Table::new());
        Arc::new(Self {
            state: Mutex::new(EnvState {
                tables,
                next_root: MASTER_ROOT + 1,
                schema_sig: 0,
                format_version: 1,
                writer: None,
            }),
        })
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, Arc<MemoryEnv>>> = Mutex::new(HashMap::new());
    static ref TOKENS: AtomicU64 = AtomicU64::new(1);
}

/// Open a handle on the environment at `path`. `:memory:` (or an empty
/// path) yields a private environment; any other path is shared between
/// all handles opened on it, which is how separate connections observe
/// each other's committed schema changes.
pub fn open_env(path: &str, temporary: bool) -> Result<Box<dyn StorageHandle>> {
    let env = if temporary || path.is_empty() || path == ":memory:" {
        MemoryEnv::new()
    } else {
        let mut reg = REGISTRY
            .lock()
            .map_err(|_| Error::new(ErrorCode::Internal))?;
        reg.entry(path.to_string())
            .or_insert_with(MemoryEnv::new)
            .clone()
    };
    Ok(Box::new(MemoryHandle {
        env,
        token: TOKENS.fetch_add(1, AtomicOrdering::SeqCst),
        snapshot: None,
    }))
}

struct EnvSnapshot {
    tables: HashMap<PageNo, Table>,
    next_root: PageNo,
    schema_sig: u32,
    format_version: u32,
}

/// Handle over a [`MemoryEnv`].
pub struct MemoryHandle {
    env: Arc<MemoryEnv>,
    token: u64,
    snapshot: Option<EnvSnapshot>,
}

impl MemoryHandle {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, EnvState>> {
        self.env
            .state
            .lock()
            .map_err(|_| Error::new(ErrorCode::Internal))
    }

    /// Acquire the single-writer slot, or report Busy.
    fn acquire_writer(&mut self) -> Result<()> {
        let env = self.env.clone();
        let mut st = env.state.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        match st.writer {
            Some(t) if t != self.token => Err(Error::new(ErrorCode::Busy)),
            _ => {
                st.writer = Some(self.token);
                if self.snapshot.is_none() {
                    self.snapshot = Some(EnvSnapshot {
                        tables: st.tables.clone(),
                        next_root: st.next_root,
                        schema_sig: st.schema_sig,
                        format_version: st.format_version,
                    });
                }
                Ok(())
            }
        }
    }
}

impl StorageHandle for MemoryHandle {
    fn begin_txn(&mut self) -> Result<()> {
        self.acquire_writer()
    }

    fn commit_txn(&mut self) -> Result<()> {
        let env = self.env.clone();
        let mut st = env.state.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        if st.writer == Some(self.token) {
            st.writer = None;
        }
        drop(st);
        self.snapshot = None;
        Ok(())
    }

    fn abort_txn(&mut self) -> Result<()> {
        let env = self.env.clone();
        let mut st = env.state.lock().map_err(|_| Error::new(ErrorCode::Internal))?;
        let snap = self.snapshot.take();
        if let Some(snap) = snap {
            st.tables = snap.tables;
            st.next_root = snap.next_root;
            st.schema_sig = snap.schema_sig;
            st.format_version = snap.format_version;
        }
        if st.writer == Some(self.token) {
            st.writer = None;
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        // Nothing to flush for the in-memory engine.
        Ok(())
    }

    fn in_txn(&self) -> bool {
        self.snapshot.is_some()
    }

    fn create_table(&mut self) -> Result<PageNo> {
        self.acquire_writer()?;
        let mut st = self.lock()?;
        let root = st.next_root;
        st.next_root += 1;
        st.tables.insert(root, Table::new());
        Ok(root)
    }

    fn create_index(&mut self) -> Result<PageNo> {
        // Indices and tables share the allocation mechanism.
        self.create_table()
    }

    fn drop_table(&mut self, root: PageNo) -> Result<()> {
        self.acquire_writer()?;
        let mut st = self.lock()?;
        st.tables.remove(&root);
        Ok(())
    }

    fn clear_table(&mut self, root: PageNo) -> Result<()> {
        self.acquire_writer()?;
        let mut st = self.lock()?;
        match st.tables.get_mut(&root) {
            Some(t) => {
                t.clear();
                Ok(())
            }
            None => Err(Error::new(ErrorCode::NotFound)),
        }
    }

    fn cursor(&mut self, root: PageNo, writable: bool) -> Result<Box<dyn StorageCursor>> {
        if writable {
            self.acquire_writer()?;
        } else {
            let st = self.lock()?;
            // A read cursor collides with a writer elsewhere.
            if matches!(st.writer, Some(t) if t != self.token) {
                return Err(Error::new(ErrorCode::Busy));
            }
            if !st.tables.contains_key(&root) {
                return Err(Error::new(ErrorCode::NotFound));
            }
        }
        {
            let mut st = self.lock()?;
            if writable {
                st.tables.entry(root).or_default();
            }
        }
        Ok(Box::new(MemoryCursor {
            env: self.env.clone(),
            root,
            pos: Pos::Unset,
        }))
    }

    fn get_schema_sig(&self) -> Result<u32> {
        Ok(self.lock()?.schema_sig)
    }

    fn set_schema_sig(&mut self, sig: u32) -> Result<()> {
        self.acquire_writer()?;
        self.lock()?.schema_sig = sig;
        Ok(())
    }

    fn get_format_version(&self) -> Result<u32> {
        Ok(self.lock()?.format_version)
    }

    fn set_format_version(&mut self, v: u32) -> Result<()> {
        self.acquire_writer()?;
        self.lock()?.format_version = v;
        Ok(())
    }
}

// ============================================================================
// In-memory Cursor
// ============================================================================

#[derive(Clone, Debug)]
enum Pos {
    /// Not positioned anywhere yet.
    Unset,
    /// On the entry with this key.
    At(Vec<u8>),
    /// Between entries: before the first key greater than this one.
    /// This is where a cursor lands after deleting its entry.
    Between(Vec<u8>),
    /// Ran off the front; only next() can revive the cursor.
    BeforeStart,
    /// Ran off the end; only prev() can revive the cursor.
    AfterEnd,
}

#[derive(Debug)]
struct MemoryCursor {
    env: Arc<MemoryEnv>,
    root: PageNo,
    pos: Pos,
}

impl MemoryCursor {
    fn with_table<R>(&self, f: impl FnOnce(&Table) -> R) -> Result<R> {
        let st = self
            .env
            .state
            .lock()
            .map_err(|_| Error::new(ErrorCode::Internal))?;
        let t = st
            .tables
            .get(&self.root)
            .ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        Ok(f(t))
    }

    fn with_table_mut<R>(&self, f: impl FnOnce(&mut Table) -> R) -> Result<R> {
        let mut st = self
            .env
            .state
            .lock()
            .map_err(|_| Error::new(ErrorCode::Internal))?;
        let t = st
            .tables
            .get_mut(&self.root)
            .ok_or_else(|| Error::new(ErrorCode::NotFound))?;
        Ok(f(t))
    }

    fn current_key(&self) -> Option<&[u8]> {
        match &self.pos {
            Pos::At(k) => Some(k),
            _ => None,
        }
    }
}

impl StorageCursor for MemoryCursor {
    fn first(&mut self) -> Result<bool> {
        let k = self.with_table(|t| t.keys().next().cloned())?;
        match k {
            Some(k) => {
                self.pos = Pos::At(k);
                Ok(true)
            }
            None => {
                self.pos = Pos::AfterEnd;
                Ok(false)
            }
        }
    }

    fn last(&mut self) -> Result<bool> {
        let k = self.with_table(|t| t.keys().next_back().cloned())?;
        match k {
            Some(k) => {
                self.pos = Pos::At(k);
                Ok(true)
            }
            None => {
                self.pos = Pos::BeforeStart;
                Ok(false)
            }
        }
    }

    fn next(&mut self) -> Result<bool> {
        use std::ops::Bound;
        let anchor = match &self.pos {
            Pos::At(k) | Pos::Between(k) => k.clone(),
            Pos::Unset | Pos::BeforeStart => return self.first(),
            Pos::AfterEnd => return Ok(false),
        };
        let k = self.with_table(|t| {
            t.range((Bound::Excluded(anchor), Bound::<Vec<u8>>::Unbounded))
                .next()
                .map(|(k, _)| k.clone())
        })?;
        match k {
            Some(k) => {
                self.pos = Pos::At(k);
                Ok(true)
            }
            None => {
                self.pos = Pos::AfterEnd;
                Ok(false)
            }
        }
    }

    fn prev(&mut self) -> Result<bool> {
        use std::ops::Bound;
        let anchor = match &self.pos {
            Pos::At(k) => k.clone(),
            Pos::Between(k) => {
                // The deleted key itself may still have a predecessor,
                // and entries <= anchor are all predecessors.
                let k = k.clone();
                let found = self.with_table(|t| {
                    t.range((Bound::Unbounded, Bound::Included(k)))
                        .next_back()
                        .map(|(k, _)| k.clone())
                })?;
                return match found {
                    Some(k) => {
                        self.pos = Pos::At(k);
                        Ok(true)
                    }
                    None => {
                        self.pos = Pos::BeforeStart;
                        Ok(false)
                    }
                };
            }
            Pos::Unset | Pos::AfterEnd => return self.last(),
            Pos::BeforeStart => return Ok(false),
        };
        let k = self.with_table(|t| {
            t.range((Bound::Unbounded, Bound::Excluded(anchor)))
                .next_back()
                .map(|(k, _)| k.clone())
        })?;
        match k {
            Some(k) => {
                self.pos = Pos::At(k);
                Ok(true)
            }
            None => {
                self.pos = Pos::BeforeStart;
                Ok(false)
            }
        }
    }

    fn moveto(&mut self, key: &[u8]) -> Result<Seek> {
        use std::ops::Bound;
        let key_v = key.to_vec();
        let (exact, less, greater) = self.with_table(|t| {
            let exact = t.contains_key(&key_v);
            let less = t
                .range((Bound::Unbounded, Bound::Excluded(key_v.clone())))
                .next_back()
                .map(|(k, _)| k.clone());
            let greater = t
                .range((Bound::Excluded(key_v.clone()), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.clone());
            (exact, less, greater)
        })?;
        if exact {
            self.pos = Pos::At(key_v);
            return Ok(Seek::Found);
        }
        if let Some(k) = less {
            self.pos = Pos::At(k);
            return Ok(Seek::Less);
        }
        if let Some(k) = greater {
            self.pos = Pos::At(k);
            return Ok(Seek::Greater);
        }
        self.pos = Pos::Unset;
        Ok(Seek::Empty)
    }

    fn valid(&self) -> bool {
        matches!(self.pos, Pos::At(_))
    }

    fn key(&self) -> Result<Vec<u8>> {
        match self.current_key() {
            Some(k) => Ok(k.to_vec()),
            None => Err(Error::new(ErrorCode::Misuse)),
        }
    }

    fn data(&self) -> Result<Vec<u8>> {
        let k = match self.current_key() {
            Some(k) => k.to_vec(),
            None => return Err(Error::new(ErrorCode::Misuse)),
        };
        let data = self.with_table(|t| t.get(&k).cloned())?;
        data.ok_or_else(|| Error::new(ErrorCode::Corrupt))
    }

    fn key_size(&self) -> Result<usize> {
        Ok(self.key()?.len())
    }

    fn data_size(&self) -> Result<usize> {
        Ok(self.data()?.len())
    }

    fn key_compare(&self, probe: &[u8], ignore_rowid: bool) -> Result<std::cmp::Ordering> {
        let key = self.key()?;
        let stored: &[u8] = if ignore_rowid && key.len() >= 4 {
            &key[..key.len() - 4]
        } else {
            &key
        };
        Ok(stored.cmp(probe))
    }

    fn insert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        let key_v = key.to_vec();
        self.with_table_mut(|t| {
            t.insert(key_v.clone(), data.to_vec());
        })?;
        self.pos = Pos::At(key_v);
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        let k = match self.current_key() {
            Some(k) => k.to_vec(),
            None => return Err(Error::new(ErrorCode::Misuse)),
        };
        self.with_table_mut(|t| {
            t.remove(&k);
        })?;
        self.pos = Pos::Between(k);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_handle() -> Box<dyn StorageHandle> {
        open_env(":memory:", false).unwrap()
    }

    #[test]
    fn test_insert_and_scan() {
        let mut h = temp_handle();
        let root = h.create_table().unwrap();
        let mut c = h.cursor(root, true).unwrap();
        c.insert(b"b", b"2").unwrap();
        c.insert(b"a", b"1").unwrap();
        c.insert(b"c", b"3").unwrap();

        assert!(c.first().unwrap());
        assert_eq!(c.key().unwrap(), b"a");
        assert!(c.next().unwrap());
        assert_eq!(c.key().unwrap(), b"b");
        assert!(c.next().unwrap());
        assert_eq!(c.key().unwrap(), b"c");
        assert!(!c.next().unwrap());
    }

    #[test]
    fn test_moveto_variants() {
        let mut h = temp_handle();
        let root = h.create_table().unwrap();
        let mut c = h.cursor(root, true).unwrap();
        c.insert(b"b", b"").unwrap();
        c.insert(b"d", b"").unwrap();

        assert_eq!(c.moveto(b"b").unwrap(), Seek::Found);
        assert_eq!(c.moveto(b"c").unwrap(), Seek::Less);
        assert_eq!(c.key().unwrap(), b"b");
        assert_eq!(c.moveto(b"a").unwrap(), Seek::Greater);
        assert_eq!(c.key().unwrap(), b"b");
    }

    #[test]
    fn test_exhausted_cursor_stays_exhausted() {
        let mut h = temp_handle();
        let root = h.create_table().unwrap();
        let mut c = h.cursor(root, true).unwrap();
        c.insert(b"only", b"").unwrap();
        assert!(c.first().unwrap());
        assert!(!c.next().unwrap());
        // A scan that ran off the end must not restart.
        assert!(!c.next().unwrap());
        // But stepping back revives it.
        assert!(c.prev().unwrap());
        assert_eq!(c.key().unwrap(), b"only");
    }

    #[test]
    fn test_delete_then_next() {
        let mut h = temp_handle();
        let root = h.create_table().unwrap();
        let mut c = h.cursor(root, true).unwrap();
        for k in [b"a", b"b", b"c"] {
            c.insert(k, b"").unwrap();
        }
        c.moveto(b"b").unwrap();
        c.delete().unwrap();
        assert!(!c.valid());
        assert!(c.next().unwrap());
        assert_eq!(c.key().unwrap(), b"c");
    }

    #[test]
    fn test_txn_rollback_restores_state() {
        let mut h = temp_handle();
        let root = h.create_table().unwrap();
        {
            let mut c = h.cursor(root, true).unwrap();
            c.insert(b"k", b"v").unwrap();
        }
        h.commit_txn().unwrap();

        h.begin_txn().unwrap();
        {
            let mut c = h.cursor(root, true).unwrap();
            c.insert(b"k2", b"v2").unwrap();
            c.moveto(b"k").unwrap();
            c.delete().unwrap();
        }
        h.abort_txn().unwrap();

        let mut c = h.cursor(root, false).unwrap();
        assert_eq!(c.moveto(b"k").unwrap(), Seek::Found);
        assert_eq!(c.moveto(b"k2").unwrap(), Seek::Less);
    }

    #[test]
    fn test_shared_path_and_busy() {
        let path = format!("shared-env-{}", std::process::id());
        let mut h1 = open_env(&path, false).unwrap();
        let mut h2 = open_env(&path, false).unwrap();

        h1.begin_txn().unwrap();
        assert_eq!(h2.begin_txn().unwrap_err().code, ErrorCode::Busy);
        assert_eq!(
            h2.cursor(MASTER_ROOT, false).unwrap_err().code,
            ErrorCode::Busy
        );
        h1.commit_txn().unwrap();
        h2.begin_txn().unwrap();
        h2.commit_txn().unwrap();
    }

    #[test]
    fn test_schema_sig_shared_between_handles() {
        let path = format!("sig-env-{}", std::process::id());
        let mut h1 = open_env(&path, false).unwrap();
        let h2 = open_env(&path, false).unwrap();
        h1.set_schema_sig(0xabcd).unwrap();
        h1.commit_txn().unwrap();
        assert_eq!(h2.get_schema_sig().unwrap(), 0xabcd);
    }
}
