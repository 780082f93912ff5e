//! VDBE opcodes and instructions
//!
//! A program is a flat array of [`Instr`]: an opcode plus two integer
//! operands and one string-ish operand whose ownership is tracked by
//! [`P3`]. Numeric ordering of the comparison opcodes is normative: each
//! text comparison is exactly its numeric counterpart plus 6, and
//! codegen selects between them through [`Opcode::comparison`].

use std::fmt;
use std::rc::Rc;

use crate::func::FuncDef;
use crate::types::DataType;

// ============================================================================
// Opcodes
// ============================================================================

/// Operation code of one VDBE instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------
    /// Do nothing
    Noop = 0,
    /// Jump to P2
    Goto,
    /// Push the return address and jump to P2
    Gosub,
    /// Pop the return stack and jump there
    Return,
    /// Stop: P1 is the result code, P2 the on-error action, P3 a message
    Halt,
    /// Pop one value; jump to P2 when it is true
    If,
    /// Pop one value; jump to P2 when it is false
    IfNot,
    /// Jump to P2 when the top P1 values include a NULL (P1<0 peeks
    /// without popping)
    IsNull,
    /// Jump to P2 when none of the top P1 values is NULL
    NotNull,
    /// Fail with Mismatch unless the top of stack is an integer; when
    /// P2>0 jump there instead. P1!=0 pops the value
    MustBeInt,
    /// Coerce the top of stack to an integer (P1!=0 rounds up)
    ForceInt,

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------
    /// Push the integer P1 (P3 may carry its textual form)
    Integer,
    /// Push the string P3, or NULL when P3 is empty
    String,
    /// Push the value bound to variable P1 (1-based)
    Variable,
    /// Pop P1 values
    Pop,
    /// Push a copy of the value P1 deep (0 = top); P2!=0 shares string
    /// storage ephemerally
    Dup,
    /// Remove the value P1 deep and push it on top
    Pull,
    /// Overwrite the value P1 deep with the top value, then pop
    Push,
    /// Concatenate the top P1 values lowest-first with separator P3;
    /// NULL if any operand is NULL. P2==0 pops them
    Concat,

    // ------------------------------------------------------------------
    // Arithmetic / logic
    // ------------------------------------------------------------------
    /// Pop two, push their sum (integer fast path, else real)
    Add,
    /// Pop two, push (second - top)
    Subtract,
    /// Pop two, push their product
    Multiply,
    /// Pop two, push (second / top); NULL on divide-by-zero
    Divide,
    /// Pop two, push (second % top) as integers
    Remainder,
    /// Negate the top of stack numerically
    Negative,
    /// Absolute value of the top of stack
    AbsValue,
    /// Three-valued logical NOT
    Not,
    /// Bitwise complement (integer)
    BitNot,
    /// Pop two, push bitwise AND
    BitAnd,
    /// Pop two, push bitwise OR
    BitOr,
    /// Pop two, push (second << top)
    ShiftLeft,
    /// Pop two, push (second >> top)
    ShiftRight,
    /// Add the constant P1 to the integerized top of stack
    AddImm,
    /// Three-valued AND of the top two values
    And,
    /// Three-valued OR of the top two values
    Or,

    // ------------------------------------------------------------------
    // Comparison. The six Str* opcodes MUST stay exactly six past their
    // numeric counterparts.
    // ------------------------------------------------------------------
    /// Numeric equality: pop two; jump to P2, or push the boolean when
    /// P2==0. P1 carries the jump-if-null flag
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Text comparison forms of the six opcodes above
    StrEq,
    StrNe,
    StrLt,
    StrLe,
    StrGt,
    StrGe,

    // ------------------------------------------------------------------
    // Record and key building
    // ------------------------------------------------------------------
    /// Pop P1 values, push a self-describing record. P2!=0 appends a
    /// uniquifier when a field is NULL
    MakeRecord,
    /// Build a sortable key from the top P1 values; P3 is the per-field
    /// type mask ('n'/'t'). P2!=0 keeps the values beneath the key
    MakeKey,
    /// Like MakeKey but the value below the fields is a row id appended
    /// as the key suffix; jumps to P2 on a NULL field when P2>0
    MakeIdxKey,
    /// Increment the final byte of the key on top of the stack,
    /// producing the smallest strictly-greater prefix key
    IncrKey,

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------
    /// Open read cursor P1 on root page P2 of database P3
    OpenRead,
    /// Open write cursor P1 on root page P2 of database P3
    OpenWrite,
    /// Open cursor P1 on a new private table; P2!=0 marks it an index
    /// (keys only)
    OpenTemp,
    /// Open single-row pseudo cursor P1
    OpenPseudo,
    /// Close cursor P1
    Close,
    /// Pop a key; move cursor P1 to that entry or the first greater
    /// one; jump to P2 when past the end. Integer keys defer the move
    MoveTo,
    /// Pop a key; move cursor P1 to the largest entry strictly less;
    /// jump to P2 when none exists
    MoveLt,
    /// Move cursor P1 to its first entry; jump to P2 when empty
    Rewind,
    /// Move cursor P1 to its last entry; jump to P2 when empty
    Last,
    /// Advance cursor P1; jump to P2 while entries remain
    Next,
    /// Retreat cursor P1; jump to P2 while entries remain
    Prev,
    /// Pop a key; jump to P2 when cursor P1's table contains it
    Found,
    /// Pop a key; jump to P2 when cursor P1's table lacks it
    NotFound,
    /// Like NotFound but the key stays on the stack
    Distinct,
    /// Pop an integer key; jump to P2 when absent from cursor P1
    NotExists,
    /// Top is an index key, below it a row id R; jump to P2 when no
    /// entry matches the key's prefix with row id other than R, else
    /// push the conflicting row id
    IsUnique,
    /// Push an unused row id for cursor P1's table
    NewRecno,

    // ------------------------------------------------------------------
    // Row I/O
    // ------------------------------------------------------------------
    /// Push field P2 of cursor P1's current row
    Column,
    /// Push the integer key of cursor P1's current row
    Recno,
    /// Push the complete key bytes of cursor P1's current entry
    FullKey,
    /// Push the raw record of cursor P1's current row
    RowData,
    /// Push the raw key of cursor P1's current entry
    RowKey,
    /// Make cursor P1 report a row of NULLs until it moves again
    NullRow,
    /// Make Column on cursor P1 decode the key instead of the data
    /// (P2 = on/off)
    KeyAsData,
    /// Pop record then integer key; write through cursor P1. P2!=0
    /// records the key as the last-inserted row id
    PutIntKey,
    /// Pop record then string key; write through cursor P1
    PutStrKey,
    /// Delete cursor P1's current row; P2!=0 counts the change
    Delete,
    /// Pop a key; insert it into index cursor P1. P2!=0 enforces
    /// uniqueness of the key prefix (P3 names the index for the error)
    IdxPut,
    /// Pop a key; delete the matching entry from index cursor P1
    IdxDelete,
    /// Push the row id packed into the tail of index cursor P1's key
    IdxRecno,
    /// Pop a key; jump to P2 when index cursor P1's entry prefix is
    /// strictly greater than it
    IdxGT,
    /// As IdxGT but greater-or-equal
    IdxGE,
    /// As IdxGT but strictly less
    IdxLT,
    /// Jump to P2 when any of the first P1 fields of the key on top of
    /// the stack is NULL
    IdxIsNull,

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------
    /// Allocate a table root in database P1; push it and log it for
    /// schema patching
    CreateTable,
    /// Allocate an index root in database P1; push it and log it
    CreateIndex,
    /// Destroy root page P1 in database P2
    Destroy,
    /// Delete every row of root page P1 in database P2
    Clear,

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------
    /// Begin a transaction on database P1
    Transaction,
    /// Commit database P1's transaction
    Commit,
    /// Roll back database P1's transaction
    Rollback,
    /// Checkpoint database P1
    Checkpoint,
    /// Pop an integer; set database P1's format version
    SetFormatVersion,
    /// Set database P1's schema signature to P2
    SetSchemaSignature,
    /// Halt with Schema unless database P1's signature equals P2
    VerifySchemaSignature,

    // ------------------------------------------------------------------
    // Keylist (row-id buffer for two-pass DML)
    // ------------------------------------------------------------------
    /// Pop an integer row id and append it to the keylist
    ListWrite,
    /// Push the next buffered row id; jump to P2 when exhausted
    ListRead,
    /// Rewind the keylist (retained for program compatibility)
    ListRewind,
    /// Discard the keylist
    ListReset,
    /// Push the current keylist onto the keylist stack, start empty
    ListPush,
    /// Restore the keylist saved by the matching ListPush
    ListPop,

    // ------------------------------------------------------------------
    // Sorter
    // ------------------------------------------------------------------
    /// Pop a record then a key; add the pair to the sorter
    SortPut,
    /// Pop P1 values, push a sorter record holding them
    SortMakeRec,
    /// Build a sort key from the top P1 values; P3 holds per-field
    /// direction/type codes
    SortMakeKey,
    /// Merge-sort everything added since the last SortReset
    Sort,
    /// Push the next sorted record; jump to P2 when drained
    SortNext,
    /// Surface the sorter record on top of the stack as a result row of
    /// P1 columns
    SortCallback,
    /// Discard sorter contents
    SortReset,

    // ------------------------------------------------------------------
    // Aggregator
    // ------------------------------------------------------------------
    /// Empty the aggregator; groups created later carry P2 cells
    AggReset,
    /// Bind aggregate cell P2 to the function P3
    AggInit,
    /// Pop a cell index then P2 arguments; run the step function P3 on
    /// the focused group's cell
    AggFunc,
    /// Pop the group key; focus its group, jumping to P2 when the group
    /// already existed
    AggFocus,
    /// Pop a value into cell P2 of the focused group
    AggSet,
    /// Push cell P2 of the focused group
    AggGet,
    /// Focus the next group, running finalizers on its cells; jump to
    /// P2 when no groups remain
    AggNext,

    // ------------------------------------------------------------------
    // Sets (IN-list membership)
    // ------------------------------------------------------------------
    /// Insert P3 (or the popped top of stack when P3 is empty) into set
    /// P1
    SetInsert,
    /// Pop a value; jump to P2 when set P1 contains it
    SetFound,
    /// Pop a value; jump to P2 when set P1 lacks it
    SetNotFound,
    /// Position at the first element of set P1; jump to P2 when empty
    SetFirst,
    /// Push the next element of set P1; jump to P2 when exhausted
    SetNext,

    // ------------------------------------------------------------------
    // Memory cells
    // ------------------------------------------------------------------
    /// Store the top of stack in cell P1; P2!=0 pops it
    MemStore,
    /// Push a copy of cell P1
    MemLoad,
    /// Increment integer cell P1; jump to P2 when the result is
    /// positive
    MemIncr,

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------
    /// Surface the top P1 values as a result row (suspending with Row
    /// when no callback is installed)
    Callback,
    /// Surface column headers once even if no row is ever produced
    NullCallback,
    /// Record P3 as the name of result column P1; P2!=0 marks it the
    /// declared type slot
    ColumnName,

    // ------------------------------------------------------------------
    // Bulk load
    // ------------------------------------------------------------------
    /// Open the file named by P3 for COPY input
    FileOpen,
    /// Read one delimited line into P1 fields (delimiter P3); jump to
    /// P2 at end of file
    FileRead,
    /// Push field P1 of the current input line
    FileColumn,

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------
    /// Pop P1 arguments, invoke the scalar function P3, push the result
    Function,
}

impl Opcode {
    /// The interrupt flag and the progress handler are consulted at
    /// these loop-edge opcodes.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Goto
                | Opcode::Gosub
                | Opcode::Next
                | Opcode::Prev
                | Opcode::SortNext
                | Opcode::AggNext
                | Opcode::ListRead
                | Opcode::SetNext
                | Opcode::FileRead
        )
    }

    /// Select the comparison opcode for a data type. The text variants
    /// sit exactly six places past the numeric ones; this helper is the
    /// only place allowed to rely on that.
    pub fn comparison(base: Opcode, dt: DataType) -> Opcode {
        debug_assert!(matches!(
            base,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge
        ));
        match dt {
            DataType::Numeric => base,
            DataType::Text => match base {
                Opcode::Eq => Opcode::StrEq,
                Opcode::Ne => Opcode::StrNe,
                Opcode::Lt => Opcode::StrLt,
                Opcode::Le => Opcode::StrLe,
                Opcode::Gt => Opcode::StrGt,
                Opcode::Ge => Opcode::StrGe,
                _ => base,
            },
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// P3 Operand
// ============================================================================

/// The string-ish third operand, with ownership tracked in the type.
#[derive(Debug, Clone, Default)]
pub enum P3 {
    /// No operand
    #[default]
    None,
    /// Borrowed program literal; never freed
    Static(&'static str),
    /// Heap text owned by the instruction
    Dynamic(String),
    /// A resolved function definition (AggInit/AggFunc/Function)
    Func(Rc<FuncDef>),
}

impl P3 {
    pub fn is_none(&self) -> bool {
        matches!(self, P3::None)
    }

    /// Text payload, when the operand carries one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            P3::None => None,
            P3::Static(s) => Some(s),
            P3::Dynamic(s) => Some(s),
            P3::Func(_) => None,
        }
    }

    /// The function payload, when present.
    pub fn func(&self) -> Option<&Rc<FuncDef>> {
        match self {
            P3::Func(f) => Some(f),
            _ => None,
        }
    }
}

impl From<String> for P3 {
    fn from(s: String) -> Self {
        P3::Dynamic(s)
    }
}

impl From<&'static str> for P3 {
    fn from(s: &'static str) -> Self {
        P3::Static(s)
    }
}

// ============================================================================
// Instruction
// ============================================================================

/// One VDBE instruction.
#[derive(Debug, Clone, Default)]
pub struct Instr {
    pub opcode: Opcode,
    pub p1: i32,
    pub p2: i32,
    pub p3: P3,
}

impl Default for Opcode {
    fn default() -> Self {
        Opcode::Noop
    }
}

impl Instr {
    pub fn new(opcode: Opcode, p1: i32, p2: i32) -> Self {
        Self {
            opcode,
            p1,
            p2,
            p3: P3::None,
        }
    }

    pub fn with_p3(opcode: Opcode, p1: i32, p2: i32, p3: P3) -> Self {
        Self { opcode, p1, p2, p3 }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<14} {:>6} {:>6}",
            format!("{:?}", self.opcode),
            self.p1,
            self.p2
        )?;
        match &self.p3 {
            P3::None => Ok(()),
            P3::Func(func) => write!(f, "  func({})", func.name),
            other => {
                let s = other.as_str().unwrap_or("");
                if s.is_ascii() {
                    write!(f, "  {}", s)
                } else {
                    write!(f, "  x'{}'", hex::encode(s.as_bytes()))
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_comparison_opcodes_are_numeric_plus_six() {
        let pairs = [
            (Opcode::Eq, Opcode::StrEq),
            (Opcode::Ne, Opcode::StrNe),
            (Opcode::Lt, Opcode::StrLt),
            (Opcode::Le, Opcode::StrLe),
            (Opcode::Gt, Opcode::StrGt),
            (Opcode::Ge, Opcode::StrGe),
        ];
        for (num, txt) in pairs {
            assert_eq!(num as u8 + 6, txt as u8, "{:?} -> {:?}", num, txt);
            assert_eq!(Opcode::comparison(num, DataType::Text), txt);
            assert_eq!(Opcode::comparison(num, DataType::Numeric), num);
        }
    }

    #[test]
    fn test_jump_opcodes() {
        assert!(Opcode::Goto.is_jump());
        assert!(Opcode::Next.is_jump());
        assert!(Opcode::AggNext.is_jump());
        assert!(!Opcode::Integer.is_jump());
        assert!(!Opcode::Column.is_jump());
    }

    #[test]
    fn test_instr_display() {
        let i = Instr::with_p3(Opcode::String, 0, 0, P3::Static("hello"));
        let s = format!("{}", i);
        assert!(s.contains("String"));
        assert!(s.contains("hello"));
    }

    #[test]
    fn test_p3_accessors() {
        assert!(P3::None.is_none());
        assert_eq!(P3::Static("x").as_str(), Some("x"));
        assert_eq!(P3::Dynamic("y".into()).as_str(), Some("y"));
    }
}
